//! Command-line front end: resolve board/cable/part, open the probe and
//! run the requested programming flow.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use fpga_loader::config::{self, CableKind, CommMode};
use fpga_loader::devices::{self, DeviceOptions, FlashSector};
use fpga_loader::jtag::Jtag;
use fpga_loader::parser::dfu_file;
use fpga_loader::probe::{self, ProbeOptions};
use fpga_loader::progress::{Progress, ProgressEvent};
use fpga_loader::spi::SpiFlash;
use fpga_loader::xvc_server::XvcServer;

#[derive(Parser, Debug)]
#[command(name = "fpga-loader", version, about = "Programs FPGA/CPLD bitstreams over USB probes")]
struct Cli {
    /// Bitstream file (bit/jed/mcs/hex/pof/fs/cfg/svf/bin).
    bitstream: Option<PathBuf>,

    /// Probe name from the cable registry.
    #[arg(short, long)]
    cable: Option<String>,
    /// Board name; implies its cable and default part.
    #[arg(short, long)]
    board: Option<String>,
    /// Package-qualified FPGA part (used for the bridge bitstream).
    #[arg(long)]
    fpga_part: Option<String>,
    /// Device position in the JTAG chain (0 = nearest TDO).
    #[arg(long, default_value_t = 0)]
    index_chain: usize,
    /// USB vendor id override (hex accepted).
    #[arg(long, value_parser = parse_u16)]
    vid: Option<u16>,
    /// USB product id override (hex accepted).
    #[arg(long, value_parser = parse_u16)]
    pid: Option<u16>,

    /// Load the bitstream into volatile memory (default mode).
    #[arg(long, short = 'm')]
    write_sram: bool,
    /// Program the configuration flash.
    #[arg(long, short = 'f')]
    write_flash: bool,
    /// Dump flash content into the bitstream path.
    #[arg(long)]
    dump_flash: bool,
    /// Scan and print the JTAG chain.
    #[arg(long)]
    detect: bool,
    /// Reload the device from its configuration memory.
    #[arg(long, short = 'r')]
    reset: bool,
    /// Use the probe's direct SPI wiring instead of JTAG.
    #[arg(long)]
    spi: bool,
    /// Download through a USB DFU bootloader.
    #[arg(long)]
    dfu: bool,
    /// Serve the probe as a Xilinx Virtual Cable on this port.
    #[arg(long)]
    xvc: Option<u16>,

    /// Base offset for flash operations (hex accepted).
    #[arg(short, long, value_parser = parse_u32, default_value = "0")]
    offset: u32,
    /// Length for --dump-flash (hex accepted).
    #[arg(long, value_parser = parse_u32)]
    file_size: Option<u32>,
    /// Allow clearing flash block protection before writing.
    #[arg(long)]
    unprotect_flash: bool,
    /// Protect the first N bytes of flash, then exit.
    #[arg(long, value_parser = parse_u32)]
    protect_flash: Option<u32>,
    /// Target sector on split-flash parts (CFG0|CFG1|UFM0..3|FEA|PKEY).
    #[arg(long)]
    flash_sector: Option<String>,
    /// Use the external SPI flash on parts that default to internal.
    #[arg(long)]
    external_flash: bool,
    /// Skip the read-back compare after writing.
    #[arg(long)]
    no_verify: bool,

    /// TCK frequency, with optional k/M suffix (e.g. 10M).
    #[arg(long, value_parser = parse_freq)]
    freq: Option<u32>,
    /// FTDI serial-number filter.
    #[arg(long)]
    ftdi_serial: Option<String>,
    /// FTDI channel (0..=3 maps to interface A..D).
    #[arg(long)]
    ftdi_channel: Option<u8>,
    /// Probe firmware image (USB-Blaster II).
    #[arg(long)]
    probe_firmware: Option<String>,
    /// DFU interface altsetting.
    #[arg(long)]
    altsetting: Option<i16>,
    /// Bit-bang pin map as TDI:TDO:TCK:TMS.
    #[arg(long)]
    pins: Option<String>,
    /// Remote address for TCP cables (xvc-client, remote-bitbang).
    #[arg(long)]
    remote: Option<String>,

    /// More output (repeatable).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Verbosity level, overrides -v.
    #[arg(long)]
    verbose_level: Option<u8>,
    /// Progress bars and info suppressed.
    #[arg(long, short)]
    quiet: bool,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_u32(s).map(|v| v as u16)
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let result = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    result.map_err(|e| e.to_string())
}

fn parse_freq(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let (number, multiplier) = match s.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&s[..s.len() - 1], 1_000),
        Some(b'M') => (&s[..s.len() - 1], 1_000_000),
        _ => (s, 1),
    };
    number
        .parse::<u32>()
        .map(|v| v * multiplier)
        .map_err(|e| e.to_string())
}

fn parse_pins(s: &str) -> anyhow::Result<config::JtagPins> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 4 {
        bail!("--pins wants TDI:TDO:TCK:TMS");
    }
    let value = |i: usize| -> anyhow::Result<u8> {
        Ok(parts[i].parse::<u8>().context("bad pin number")?)
    };
    Ok(config::JtagPins {
        tdi: value(0)?,
        tdo: value(1)?,
        tck: value(2)?,
        tms: value(3)?,
    })
}

fn progress_bar(quiet: bool) -> Progress {
    if quiet {
        return Progress::silent();
    }
    let bar = std::cell::RefCell::new(None::<ProgressBar>);
    Progress::new(move |event| {
        let mut slot = bar.borrow_mut();
        match event {
            ProgressEvent::Started { operation, total } => {
                let pb = ProgressBar::new(total as u64);
                pb.set_style(
                    ProgressStyle::with_template(
                        "{msg:>10} [{bar:40}] {bytes}/{total_bytes}",
                    )
                    .unwrap()
                    .progress_chars("=> "),
                );
                pb.set_message(operation);
                *slot = Some(pb);
            }
            ProgressEvent::Progressed { position } => {
                if let Some(pb) = slot.as_ref() {
                    pb.set_position(position as u64);
                }
            }
            ProgressEvent::Finished => {
                if let Some(pb) = slot.take() {
                    pb.finish();
                }
            }
            ProgressEvent::Failed => {
                if let Some(pb) = slot.take() {
                    pb.abandon_with_message("failed");
                }
            }
        }
    })
}

fn main() {
    let cli = Cli::parse();

    let level = cli.verbose_level.unwrap_or(cli.verbose);
    let filter = if cli.quiet {
        "error"
    } else {
        match level {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let board = cli
        .board
        .as_deref()
        .map(|name| config::board_by_name(name).with_context(|| format!("unknown board {name}")))
        .transpose()?;

    let cable_name = cli
        .cable
        .as_deref()
        .or(board.map(|b| b.cable))
        .context("no cable given; use --cable or --board")?;
    let mut cable = *config::cable_by_name(cable_name)
        .with_context(|| format!("unknown cable {cable_name}"))?;
    if let Some(vid) = cli.vid {
        cable.vid = vid;
    }
    if let Some(pid) = cli.pid {
        cable.pid = pid;
    }

    let part_name = cli
        .fpga_part
        .clone()
        .or_else(|| board.map(|b| b.fpga_part.to_string()).filter(|p| !p.is_empty()));

    let options = DeviceOptions {
        verify: !cli.no_verify,
        unprotect_flash: cli.unprotect_flash,
        offset: cli.offset,
        part_name: part_name.clone(),
        skip_load_bridge: false,
        skip_reset: false,
        flash_sector: cli
            .flash_sector
            .as_deref()
            .map(|s| s.parse::<FlashSector>())
            .transpose()?,
        external_flash: cli.external_flash,
        rd_burst: 0,
        progress: progress_bar(cli.quiet),
    };

    // DFU path: no JTAG involved at all.
    if cli.dfu || cable.kind == CableKind::Dfu || board.is_some_and(|b| b.mode == CommMode::Dfu) {
        return run_dfu(&cli, board);
    }

    let probe_options = ProbeOptions {
        ftdi_serial: cli.ftdi_serial.clone(),
        ftdi_channel: cli.ftdi_channel,
        firmware_path: cli.probe_firmware.clone(),
        remote_addr: cli.remote.clone(),
        pins: cli.pins.as_deref().map(parse_pins).transpose()?,
    };

    // Direct-SPI path (iCE40, Efinix and GateMate boards wired to flash).
    if cli.spi || board.is_some_and(|b| b.mode == CommMode::Spi) {
        return run_spi(&cli, board, &cable, &probe_options, options);
    }

    let freq = cli.freq.or(board.map(|b| b.default_freq).filter(|f| *f != 0));
    let transport = probe::open_cable(&cable, board, freq.unwrap_or(0), &probe_options)?;

    if let Some(port) = cli.xvc {
        let mut server = XvcServer::bind(port, transport)?;
        println!("XVC server ready on port {port}; ^C stops it");
        return Ok(server.run()?);
    }

    let mut jtag = Jtag::new(transport);
    let found = jtag.detect_chain(5)?;
    if found == 0 {
        bail!("no device found on the JTAG chain");
    }

    if cli.detect || cli.bitstream.is_none() && !cli.reset && cli.protect_flash.is_none() {
        for (i, (idcode, irlen)) in jtag
            .devices()
            .iter()
            .zip(jtag.irlengths())
            .enumerate()
        {
            let name = config::fpga_by_idcode(*idcode)
                .map(|m| format!("{} {}", m.manufacturer, m.model))
                .unwrap_or_else(|| "unknown".to_string());
            println!("index {i}: idcode 0x{idcode:08x} irlength {irlen} {name}");
        }
        return Ok(());
    }

    jtag.device_select(cli.index_chain)?;
    let mut device = devices::open(&mut jtag, options)?;

    if cli.reset {
        device.reset()?;
        println!("reset: done");
        return Ok(());
    }

    let bitstream = cli.bitstream.as_deref();
    if cli.dump_flash {
        let output = bitstream.context("dump needs an output path")?;
        let len = cli.file_size.context("dump needs --file-size")?;
        device.dump_flash(output, cli.offset, len)?;
        println!("dump: done");
    } else if cli.write_flash {
        let path = bitstream.context("no bitstream given")?;
        device.write_flash(path)?;
        println!("write flash: done");
    } else if let Some(path) = bitstream {
        device.write_sram(path)?;
        println!("write sram: done");
    } else if cli.protect_flash.is_some() {
        bail!("flash protection needs --write-flash context on this build");
    }

    Ok(())
}

fn run_dfu(cli: &Cli, board: Option<&config::Board>) -> anyhow::Result<()> {
    let path = cli.bitstream.as_deref().context("no bitstream given")?;
    let file = dfu_file::parse_file(path)?;

    let (vid, pid) = match (cli.vid, cli.pid) {
        (Some(v), Some(p)) => (v, p),
        _ => {
            let suffix = file.suffix.filter(|s| s.id_vendor != 0xffff);
            match (suffix, board) {
                (Some(s), _) => (s.id_vendor, s.id_product),
                (None, Some(b)) if b.vid != 0 => (b.vid, b.pid),
                _ => bail!("no VID/PID for the DFU device; use --vid/--pid"),
            }
        }
    };
    let altsetting = cli
        .altsetting
        .or(board.map(|b| b.altsetting))
        .unwrap_or(-1);

    let device = fpga_loader::dfu::DfuDevice::open(vid, pid, altsetting)?;
    let mut core = device.into_core();
    core.download(&file.bitstream.data)?;
    println!("DFU download: done");
    Ok(())
}

fn run_spi(
    cli: &Cli,
    board: Option<&config::Board>,
    cable: &config::Cable,
    probe_options: &ProbeOptions,
    options: DeviceOptions,
) -> anyhow::Result<()> {
    use fpga_loader::devices::{colognechip::CologneChipSpi, efinix::EfinixSpi, ice40::Ice40, Device};
    use fpga_loader::probe::ftdi_spi::{FtdiSpi, SpiMode};

    let board = board.context("the SPI path needs --board for its pin map")?;
    let pins = board.spi_pins.context("board has no SPI pin map")?;
    let mut spi = FtdiSpi::open(cable, pins.cs as u8, SpiMode::Mode0, probe_options)?;
    if pins.holdn != 0 {
        spi.gpio_set_output(pins.holdn)?;
        spi.gpio_set(pins.holdn)?;
    }
    if pins.wpn != 0 {
        spi.gpio_set_output(pins.wpn)?;
        spi.gpio_set(pins.wpn)?;
    }
    if let Some(freq) = cli.freq {
        spi.set_clock(freq)?;
    }

    if let Some(len) = cli.protect_flash {
        let mut flash = SpiFlash::new(&mut spi, cli.unprotect_flash);
        flash.read_id()?;
        flash.enable_protection(len)?;
        println!("protect flash: done");
        return Ok(());
    }

    let part = options
        .part_name
        .clone()
        .unwrap_or_else(|| board.fpga_part.to_string());
    let mut device: Box<dyn Device> = if part.to_ascii_uppercase().starts_with("GM") {
        Box::new(CologneChipSpi::new(
            spi,
            board.reset_pin,
            board.done_pin,
            board.oe_pin,
            options,
        ))
    } else if part.starts_with('T') {
        Box::new(EfinixSpi::new(spi, board.reset_pin, board.done_pin, options)?)
    } else {
        Box::new(Ice40::new(spi, board.reset_pin, board.done_pin, options)?)
    };

    let bitstream = cli.bitstream.as_deref();
    if cli.dump_flash {
        let output = bitstream.context("dump needs an output path")?;
        let len = cli.file_size.context("dump needs --file-size")?;
        device.dump_flash(output, cli.offset, len)?;
    } else if cli.reset {
        device.reset()?;
    } else if cli.write_flash {
        device.write_flash(bitstream.context("no bitstream given")?)?;
    } else {
        device.write_sram(bitstream.context("no bitstream given")?)?;
    }
    println!("done");
    Ok(())
}
