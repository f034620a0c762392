//! Bit-banged JTAG on FT232R/FT231X parts without an MPSSE engine.
//!
//! Each TCK period costs two FIFO bytes (clock low with data, clock high).
//! Synchronous bit-bang is only engaged when TDO has to be sampled, since
//! it echoes every written byte back and halves throughput.

use crate::config::{Cable, JtagPins};
use crate::error::Result;
use crate::probe::ftdi::{BitMode, FtdiDevice};
use crate::probe::{JtagTransport, ProbeOptions};
use crate::util::bit_get;

/// JTAG over FTDI bit-bang.
pub struct FtdiJtagBitbang {
    device: FtdiDevice,
    pins: JtagPins,
    buffer: Vec<u8>,
    fifo_size: usize,
    /// Current output latch (TMS/TDI levels persist between operations).
    state: u8,
    sync_mode: bool,
    out_mask: u8,
}

impl FtdiJtagBitbang {
    /// Opens the cable and programs the pin directions.
    pub fn open(cable: &Cable, pins: JtagPins, opts: &ProbeOptions) -> Result<Self> {
        let mut device = FtdiDevice::open(
            cable.vid,
            cable.pid,
            cable.mpsse.interface,
            opts.ftdi_serial.as_deref(),
        )?;

        // FT232R keeps 128 bytes, FT231X 512.
        let fifo_size = if cable.pid == 0x6015 { 512 } else { 256 };

        let out_mask = pins.tck | pins.tdi | pins.tms;
        device.usb_reset()?;
        device.set_bitmode(out_mask, BitMode::Bitbang)?;
        device.set_latency_timer(1)?;
        // The bit-bang clock runs at 16x the baud rate.
        device.set_baudrate(0x0002)?;
        device.purge_buffers()?;

        Ok(Self {
            device,
            pins,
            buffer: Vec::with_capacity(fifo_size),
            fifo_size,
            state: 0,
            sync_mode: false,
            out_mask,
        })
    }

    fn set_mode(&mut self, sync: bool) -> Result<()> {
        if self.sync_mode == sync {
            return Ok(());
        }
        self.send()?;
        let mode = if sync { BitMode::SyncBb } else { BitMode::Bitbang };
        self.device.set_bitmode(self.out_mask, mode)?;
        self.device.purge_buffers()?;
        self.sync_mode = sync;
        Ok(())
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        if self.buffer.len() + 1 >= self.fifo_size {
            self.send()?;
        }
        self.buffer.push(byte);
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.device.write_data(&buffer)?;
        if self.sync_mode {
            // Synchronous mode echoes every byte; discard unless a caller
            // collects them explicitly through clock_bit_read.
            let mut echo = vec![0u8; buffer.len()];
            self.device.read_data(&mut echo)?;
        }
        Ok(())
    }

    /// One TCK period; returns the echoed sample of the high phase when
    /// in synchronous mode.
    fn clock_bit(&mut self, tms: bool, tdi: bool) -> Result<()> {
        let mut value = 0u8;
        if tms {
            value |= self.pins.tms;
        }
        if tdi {
            value |= self.pins.tdi;
        }
        self.state = value;
        self.push(value)?;
        self.push(value | self.pins.tck)?;
        Ok(())
    }

    fn clock_bit_read(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        self.set_mode(true)?;
        self.send()?;

        let mut value = 0u8;
        if tms {
            value |= self.pins.tms;
        }
        if tdi {
            value |= self.pins.tdi;
        }
        self.state = value;
        let out = [value, value | self.pins.tck, value | self.pins.tck];
        self.device.write_data(&out)?;
        let mut echo = [0u8; 3];
        self.device.read_data(&mut echo)?;
        Ok(echo[2] & self.pins.tdo != 0)
    }
}

impl JtagTransport for FtdiJtagBitbang {
    fn set_clock(&mut self, hz: u32) -> Result<u32> {
        // Baud 0x0002 fixes the byte clock near 1 MBd; each TCK period is
        // two bytes, so the effective ceiling sits around 500 kHz.
        let actual = hz.min(500_000);
        tracing::debug!("bit-bang TCK limited to {actual} Hz");
        Ok(actual)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, flush: bool) -> Result<()> {
        self.set_mode(false)?;
        let tdi = self.state & self.pins.tdi != 0;
        for i in 0..bits {
            self.clock_bit(bit_get(tms, i), tdi)?;
        }
        if flush {
            self.send()?;
        }
        Ok(())
    }

    fn write_tdi(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end_is_tms: bool,
    ) -> Result<()> {
        match rx {
            Some(rx) => {
                for i in 0..bits {
                    let tdi = tx.map(|t| bit_get(t, i)).unwrap_or(true);
                    let tms = end_is_tms && i == bits - 1;
                    let tdo = self.clock_bit_read(tms, tdi)?;
                    crate::util::bit_set(rx, i, tdo);
                }
            }
            None => {
                self.set_mode(false)?;
                for i in 0..bits {
                    let tdi = tx.map(|t| bit_get(t, i)).unwrap_or(true);
                    let tms = end_is_tms && i == bits - 1;
                    self.clock_bit(tms, tdi)?;
                }
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        self.set_mode(false)?;
        for _ in 0..cycles {
            self.clock_bit(tms, tdi)?;
        }
        self.send()
    }

    fn flush(&mut self) -> Result<()> {
        self.send()
    }

    fn buffer_size(&self) -> usize {
        self.fifo_size
    }

    fn is_full(&self) -> bool {
        self.buffer.len() + 2 >= self.fifo_size
    }
}
