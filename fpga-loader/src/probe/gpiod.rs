//! GPIO bit-bang through the kernel's sysfs interface, for the Jetson
//! Nano header and generic `libgpiod`-style boards.
//!
//! One value-file write per pin edge; slow, but dependency-free and
//! sufficient for recovery programming.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::JtagPins;
use crate::error::Result;
use crate::probe::JtagTransport;
use crate::util::{bit_get, bit_set};

const GPIO_ROOT: &str = "/sys/class/gpio";

struct GpioPin {
    value: File,
}

impl GpioPin {
    fn open(number: u8, output: bool) -> Result<Self> {
        let pin_dir = format!("{GPIO_ROOT}/gpio{number}");
        if !Path::new(&pin_dir).exists() {
            std::fs::write(format!("{GPIO_ROOT}/export"), number.to_string())?;
        }
        std::fs::write(
            format!("{pin_dir}/direction"),
            if output { "out" } else { "in" },
        )?;
        let value = OpenOptions::new()
            .read(true)
            .write(output)
            .open(format!("{pin_dir}/value"))?;
        Ok(Self { value })
    }

    fn set(&mut self, level: bool) -> Result<()> {
        self.value.seek(SeekFrom::Start(0))?;
        self.value.write_all(if level { b"1" } else { b"0" })?;
        Ok(())
    }

    fn get(&mut self) -> Result<bool> {
        self.value.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; 1];
        self.value.read_exact(&mut buf)?;
        Ok(buf[0] == b'1')
    }
}

/// Sysfs GPIO JTAG transport. The pin map carries GPIO numbers rather
/// than bit positions for this cable kind.
pub struct GpioBitbang {
    tck: GpioPin,
    tms: GpioPin,
    tdi: GpioPin,
    tdo: GpioPin,
    curr_tdi: bool,
}

impl GpioBitbang {
    /// Exports and configures the four signals.
    pub fn open(pins: JtagPins) -> Result<Self> {
        Ok(Self {
            tck: GpioPin::open(pins.tck, true)?,
            tms: GpioPin::open(pins.tms, true)?,
            tdi: GpioPin::open(pins.tdi, true)?,
            tdo: GpioPin::open(pins.tdo, false)?,
            curr_tdi: false,
        })
    }

    fn clock(&mut self, tms: bool, tdi: bool, read: bool) -> Result<bool> {
        self.tms.set(tms)?;
        self.tdi.set(tdi)?;
        self.curr_tdi = tdi;
        self.tck.set(false)?;
        self.tck.set(true)?;
        let sample = if read { self.tdo.get()? } else { false };
        Ok(sample)
    }
}

impl JtagTransport for GpioBitbang {
    fn set_clock(&mut self, _hz: u32) -> Result<u32> {
        // Sysfs writes dominate; the effective rate sits in the tens of
        // kilohertz regardless of the request.
        Ok(50_000)
    }

    fn write_tms(&mut self, tms: &[u8], bits: usize, _flush: bool) -> Result<()> {
        let tdi = self.curr_tdi;
        for i in 0..bits {
            self.clock(bit_get(tms, i), tdi, false)?;
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
        let mut rx = rx;
        for i in 0..bits {
            let tdi = tx.map(|t| bit_get(t, i)).unwrap_or(true);
            let tms = end_is_tms && i == bits - 1;
            let sample = self.clock(tms, tdi, rx.is_some())?;
            if let Some(rx) = rx.as_deref_mut() {
                bit_set(rx, i, sample);
            }
        }
        Ok(())
    }

    fn toggle_clk(&mut self, tms: bool, tdi: bool, cycles: u32) -> Result<()> {
        for _ in 0..cycles {
            self.clock(tms, tdi, false)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        1
    }
}
