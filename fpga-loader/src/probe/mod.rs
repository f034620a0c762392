//! Probe transports: bytes and bits on the wire.
//!
//! Every probe implements [`JtagTransport`]; the JTAG engine owns one as a
//! boxed trait object. Hot paths live inside the transports themselves
//! (opcode batching, FIFO chunking), so dynamic dispatch only happens at the
//! granularity of whole TMS/TDI buffers.

use crate::config::{Board, Cable, CableKind, JtagPins};
use crate::error::{Error, Result};

pub mod anlogic_cable;
pub mod ch347;
pub mod ch552;
pub mod cmsisdap;
pub mod dirty_jtag;
pub mod ftdi;
pub mod ftdi_bitbang;
pub mod ftdi_spi;
pub mod gpiod;
pub mod gwu2x;
pub mod mock;
pub mod mpsse;
pub mod remote_bitbang;
pub mod usb_blaster;
pub mod xvc_client;

pub use mock::MockTransport;

/// A probe able to clock a JTAG interface.
///
/// Bit ordering is LSB-first within every byte buffer, matching the order
/// bits appear on the wire.
pub trait JtagTransport {
    /// Requests a TCK frequency; returns the frequency actually configured.
    fn set_clock(&mut self, hz: u32) -> Result<u32>;

    /// Clocks `bits` TMS values out of `tms`, holding TDI constant.
    ///
    /// With `flush` the probe buffer is drained before returning.
    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()>;

    /// Shifts `bits` TDI values, optionally capturing TDO.
    ///
    /// With `end_is_tms`, the final bit is clocked with TMS high in the same
    /// cycle, leaving a SHIFT-xR state cleanly. Implementations that cannot
    /// combine TDI and TMS on one cycle must split the transfer and
    /// reconstruct the final bit themselves.
    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()>;

    /// Runs `cycles` TCK periods with constant TMS/TDI levels.
    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()>;

    /// Drains any buffered commands to the probe.
    fn flush(&mut self) -> Result<()>;

    /// Size of the probe-side command buffer in bytes.
    fn buffer_size(&self) -> usize;

    /// True when another queued command would overflow the probe buffer.
    fn is_full(&self) -> bool {
        false
    }

    /// Clocks per-cycle TMS and TDI vectors while capturing TDO.
    ///
    /// This is the XVC `shift:` primitive. The default implementation clocks
    /// one bit at a time; probes with a native combined mode should override.
    fn write_tms_tdi(
        &mut self,
        tms: &[u8],
        tdi: &[u8],
        tdo: &mut [u8],
        bits: usize,
    ) -> Result<()> {
        for i in 0..bits {
            let tms_bit = crate::util::bit_get(tms, i);
            let tdi_bit = crate::util::bit_get(tdi, i);
            let tx = [tdi_bit as u8];
            let mut rx = [0u8];
            self.write_tdi(Some(&tx), Some(&mut rx), 1, tms_bit)?;
            crate::util::bit_set(tdo, i, rx[0] & 1 != 0);
        }
        self.flush()
    }
}

/// Opens and claims a plain vendor-protocol USB device.
pub(crate) fn open_usb_device(
    vid: u16,
    pid: u16,
    interface: u8,
) -> Result<rusb::DeviceHandle<rusb::GlobalContext>> {
    for device in rusb::devices()?.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() == vid && desc.product_id() == pid {
            let handle = device.open()?;
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(interface)?;
            return Ok(handle);
        }
    }
    Err(Error::SoftFail(format!(
        "no device {vid:04x}:{pid:04x} found"
    )))
}

/// Options shared by [`open_cable`] callers, sourced from the CLI.
#[derive(Debug, Default, Clone)]
pub struct ProbeOptions {
    /// FTDI serial number filter.
    pub ftdi_serial: Option<String>,
    /// FTDI channel override (0..=3 maps to interface A..D).
    pub ftdi_channel: Option<u8>,
    /// Path to probe firmware (USB-Blaster II FX2 image).
    pub firmware_path: Option<String>,
    /// Remote address for TCP transports (`host:port`).
    pub remote_addr: Option<String>,
    /// Bit-bang pin override.
    pub pins: Option<JtagPins>,
}

/// Opens the transport described by `cable`, applying `freq` when non-zero.
pub fn open_cable(
    cable: &Cable,
    board: Option<&Board>,
    freq: u32,
    opts: &ProbeOptions,
) -> Result<Box<dyn JtagTransport>> {
    let pins = opts.pins.or_else(|| board.and_then(|b| b.jtag_pins));

    let mut transport: Box<dyn JtagTransport> = match cable.kind {
        CableKind::FtdiSerial => Box::new(mpsse::FtdiJtagMpsse::open(cable, opts)?),
        CableKind::FtdiBitbang => {
            let pins = pins.ok_or(Error::StateMachineMisuse(
                "bit-bang cable needs a JTAG pin map",
            ))?;
            Box::new(ftdi_bitbang::FtdiJtagBitbang::open(cable, pins, opts)?)
        }
        CableKind::Ch552Jtag => Box::new(ch552::Ch552Jtag::open(cable, opts)?),
        CableKind::Ch347 => Box::new(ch347::Ch347Jtag::open(cable)?),
        CableKind::DirtyJtag => Box::new(dirty_jtag::DirtyJtag::open(cable)?),
        CableKind::UsbBlasterI | CableKind::UsbBlasterII => {
            Box::new(usb_blaster::UsbBlaster::open(cable, opts)?)
        }
        CableKind::CmsisDap => Box::new(cmsisdap::CmsisDap::open(cable)?),
        CableKind::GwU2x => Box::new(gwu2x::GwU2x::open(cable)?),
        CableKind::AnlogicCable => Box::new(anlogic_cable::AnlogicCable::open(cable)?),
        CableKind::JetsonGpio | CableKind::LibgpiodGpio => {
            let pins = pins.ok_or(Error::StateMachineMisuse(
                "GPIO cable needs a JTAG pin map",
            ))?;
            Box::new(gpiod::GpioBitbang::open(pins)?)
        }
        CableKind::RemoteBitbang => {
            let addr = opts
                .remote_addr
                .as_deref()
                .ok_or(Error::StateMachineMisuse("remote-bitbang needs an address"))?;
            Box::new(remote_bitbang::RemoteBitbang::connect(addr)?)
        }
        CableKind::XvcClient => {
            let addr = opts
                .remote_addr
                .as_deref()
                .ok_or(Error::StateMachineMisuse("xvc-client needs an address"))?;
            Box::new(xvc_client::XvcClient::connect(addr)?)
        }
        CableKind::Dfu => {
            return Err(Error::StateMachineMisuse(
                "DFU cables have no JTAG transport; use the DFU download path",
            ))
        }
        CableKind::Bmp | CableKind::Jlink | CableKind::Esp => {
            return Err(Error::SoftFail(format!(
                "cable '{}' is recognized but not supported by this build",
                cable.name
            )))
        }
    };

    if freq != 0 {
        let actual = transport.set_clock(freq)?;
        tracing::debug!("requested {freq} Hz, probe configured {actual} Hz");
    }

    Ok(transport)
}
