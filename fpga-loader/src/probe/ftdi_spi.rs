//! Direct SPI over MPSSE, with a programmable chip-select pin and GPIO
//! side-band control for board resets and done pins.

use crate::config::Cable;
use crate::error::Result;
use crate::probe::ftdi::{BitMode, FtdiDevice};
use crate::probe::ProbeOptions;
use crate::spi::SpiInterface;

const MPSSE_WRITE_NEG: u8 = 0x01;
const MPSSE_READ_NEG: u8 = 0x04;
const MPSSE_DO_WRITE: u8 = 0x10;
const MPSSE_DO_READ: u8 = 0x20;

const SET_BITS_LOW: u8 = 0x80;
const GET_BITS_LOW: u8 = 0x81;
const SET_BITS_HIGH: u8 = 0x82;
const GET_BITS_HIGH: u8 = 0x83;
const LOOPBACK_END: u8 = 0x85;
const TCK_DIVISOR: u8 = 0x86;
const SEND_IMMEDIATE: u8 = 0x87;
const DISABLE_CLK_DIV5: u8 = 0x8a;

/// Writes above this size are split so the FTDI FIFO never stalls.
const WRITE_CHUNK: usize = 4096;

/// SPI clock modes (CPOL/CPHA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SpiMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

/// An MPSSE interface in SPI configuration.
pub struct FtdiSpi {
    device: FtdiDevice,
    /// Chip select bit in the ADBUS byte.
    cs_mask: u8,
    /// Current output values, ADBUS | ACBUS << 8.
    value: u16,
    /// Direction masks, 1 = output.
    direction: u16,
    mode: SpiMode,
    /// When false, the caller frames CS manually via [`FtdiSpi::set_cs`].
    auto_cs: bool,
}

impl FtdiSpi {
    /// Opens the cable in MPSSE-SPI configuration. `cs_mask` selects the
    /// ADBUS pin used for chip select (bit 3 on standard wiring).
    pub fn open(cable: &Cable, cs_mask: u8, mode: SpiMode, opts: &ProbeOptions) -> Result<Self> {
        let mut device = FtdiDevice::open(
            cable.vid,
            cable.pid,
            cable.mpsse.interface,
            opts.ftdi_serial.as_deref(),
        )?;
        device.usb_reset()?;
        device.set_bitmode(0, BitMode::Mpsse)?;
        device.set_latency_timer(1)?;
        device.purge_buffers()?;

        let mut spi = Self {
            device,
            cs_mask,
            value: (cable.mpsse.low_value as u16) | ((cable.mpsse.high_value as u16) << 8),
            direction: (cable.mpsse.low_dir as u16) | ((cable.mpsse.high_dir as u16) << 8),
            mode,
            auto_cs: true,
        };
        // CS idles high.
        spi.value |= cs_mask as u16;
        spi.direction |= cs_mask as u16;
        spi.apply_pins()?;
        spi.device.write_data(&[DISABLE_CLK_DIV5, LOOPBACK_END, SEND_IMMEDIATE])?;
        spi.set_clock(6_000_000)?;
        Ok(spi)
    }

    /// Configures the SPI clock.
    pub fn set_clock(&mut self, hz: u32) -> Result<u32> {
        let base = 30_000_000u32;
        let divisor = (base / hz.max(1)).saturating_sub(1).min(0xffff) as u16;
        self.device.write_data(&[
            TCK_DIVISOR,
            divisor as u8,
            (divisor >> 8) as u8,
            SEND_IMMEDIATE,
        ])?;
        Ok(base / (divisor as u32 + 1))
    }

    fn apply_pins(&mut self) -> Result<()> {
        self.device.write_data(&[
            SET_BITS_LOW,
            self.value as u8,
            self.direction as u8,
            SET_BITS_HIGH,
            (self.value >> 8) as u8,
            (self.direction >> 8) as u8,
            SEND_IMMEDIATE,
        ])
    }

    /// Write opcode for the configured mode: MSB-first, data launched on
    /// the falling edge for modes 0/3.
    fn write_op(&self, read: bool) -> u8 {
        let mut op = MPSSE_DO_WRITE;
        match self.mode {
            SpiMode::Mode0 | SpiMode::Mode3 => op |= MPSSE_WRITE_NEG,
            SpiMode::Mode1 | SpiMode::Mode2 => {}
        }
        if read {
            op |= MPSSE_DO_READ;
            // Reads sample on the opposite edge of writes.
            if op & MPSSE_WRITE_NEG == 0 {
                op |= MPSSE_READ_NEG;
            }
        }
        op
    }

    /// Drives CS manually; `level` true = deasserted (high).
    pub fn set_cs(&mut self, level: bool) -> Result<()> {
        if level {
            self.value |= self.cs_mask as u16;
        } else {
            self.value &= !(self.cs_mask as u16);
        }
        self.apply_pins()
    }

    /// Switches between automatic per-transfer CS framing and manual
    /// control.
    pub fn set_auto_cs(&mut self, auto: bool) {
        self.auto_cs = auto;
    }

    /// Marks a side-band pin (16-bit mask across ADBUS/ACBUS) as output.
    pub fn gpio_set_output(&mut self, mask: u16) -> Result<()> {
        self.direction |= mask;
        self.apply_pins()
    }

    /// Marks a side-band pin as input.
    pub fn gpio_set_input(&mut self, mask: u16) -> Result<()> {
        self.direction &= !mask;
        self.apply_pins()
    }

    /// Drives a side-band pin high.
    pub fn gpio_set(&mut self, mask: u16) -> Result<()> {
        self.value |= mask;
        self.apply_pins()
    }

    /// Drives a side-band pin low.
    pub fn gpio_clear(&mut self, mask: u16) -> Result<()> {
        self.value &= !mask;
        self.apply_pins()
    }

    /// Samples all sixteen pins.
    pub fn gpio_get(&mut self) -> Result<u16> {
        self.device
            .write_data(&[GET_BITS_LOW, GET_BITS_HIGH, SEND_IMMEDIATE])?;
        let mut rx = [0u8; 2];
        self.device.read_data(&mut rx)?;
        Ok((rx[0] as u16) | ((rx[1] as u16) << 8))
    }

    fn xfer(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let capture = rx.is_some();
        let op = self.write_op(capture);

        let mut collected = Vec::new();
        for chunk in tx.chunks(WRITE_CHUNK) {
            let len = (chunk.len() - 1) as u16;
            let mut packet = Vec::with_capacity(chunk.len() + 4);
            packet.extend_from_slice(&[op, len as u8, (len >> 8) as u8]);
            packet.extend_from_slice(chunk);
            packet.push(SEND_IMMEDIATE);
            self.device.write_data(&packet)?;
            if capture {
                let mut part = vec![0u8; chunk.len()];
                self.device.read_data(&mut part)?;
                collected.extend_from_slice(&part);
            }
        }
        if let Some(rx) = rx {
            let n = rx.len().min(collected.len());
            rx[..n].copy_from_slice(&collected[..n]);
        }
        Ok(())
    }
}

impl SpiInterface for FtdiSpi {
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let mut buf = Vec::with_capacity(len + 1);
        buf.push(cmd);
        match tx {
            Some(tx) => buf.extend_from_slice(tx),
            None => buf.resize(len + 1, 0),
        }

        if self.auto_cs {
            self.set_cs(false)?;
        }
        let result = match rx {
            Some(rx) => {
                let mut full = vec![0u8; buf.len()];
                let r = self.xfer(&buf, Some(&mut full));
                // The opcode slot produces no payload byte.
                let n = rx.len().min(full.len() - 1);
                rx[..n].copy_from_slice(&full[1..1 + n]);
                r
            }
            None => self.xfer(&buf, None),
        };
        if self.auto_cs {
            self.set_cs(true)?;
        }
        result
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        if self.auto_cs {
            self.set_cs(false)?;
        }
        let result = self.xfer(tx, rx);
        if self.auto_cs {
            self.set_cs(true)?;
        }
        result
    }
}

impl std::fmt::Debug for FtdiSpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtdiSpi")
            .field("mode", &self.mode)
            .field("cs_mask", &self.cs_mask)
            .finish_non_exhaustive()
    }
}
