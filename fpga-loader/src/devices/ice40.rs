//! Lattice iCE40: no JTAG at all. The probe holds CRESET low, either
//! slave-writes the bitstream straight into SRAM or programs the flash the
//! device boots from, then releases reset and waits for CDONE.

use std::path::Path;
use std::time::Duration;

use super::{Device, DeviceOptions};
use crate::error::{Error, Result};
use crate::parser::raw;
use crate::probe::ftdi_spi::FtdiSpi;
use crate::spi::{SpiFlash, SpiInterface};

/// Driver for iCE40 boards wired to the probe's SPI pins.
pub struct Ice40 {
    spi: FtdiSpi,
    options: DeviceOptions,
    rst_pin: u16,
    done_pin: u16,
}

impl Ice40 {
    /// Wraps a dedicated SPI probe with the board's CRESET/CDONE pins.
    pub fn new(spi: FtdiSpi, rst_pin: u16, done_pin: u16, options: DeviceOptions) -> Result<Self> {
        let mut this = Self {
            spi,
            options,
            rst_pin,
            done_pin,
        };
        this.spi.gpio_set_output(rst_pin)?;
        this.spi.gpio_set_input(done_pin)?;
        Ok(this)
    }

    fn wait_cdone(&mut self) -> Result<()> {
        for _ in 0..1000 {
            if self.spi.gpio_get()? & self.done_pin != 0 {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(Error::timeout("waiting for CDONE"))
    }
}

impl Device for Ice40 {
    /// Slave SPI configuration: reset with CS low selects slave mode, then
    /// the raw bitstream is clocked in followed by 49 dummy bits.
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        let data = raw::parse_file(path, false)?.data;

        self.spi.set_cs(false)?;
        self.spi.gpio_clear(self.rst_pin)?;
        std::thread::sleep(Duration::from_micros(200));
        self.spi.gpio_set(self.rst_pin)?;
        // tCR_SCLK: at least 1.2 ms for the device to clear its memory.
        std::thread::sleep(Duration::from_millis(2));

        self.spi.spi_put_raw(&data, None)?;
        // Datasheet asks for 49 clocks after the last bitstream bit.
        self.spi.spi_put_raw(&[0u8; 7], None)?;
        self.spi.set_cs(true)?;

        self.wait_cdone()
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let data = raw::parse_file(path, false)?.data;

        self.spi.gpio_clear(self.rst_pin)?;
        std::thread::sleep(Duration::from_millis(1));

        let offset = self.options.offset;
        let verify = self.options.verify;
        let rd_burst = self.options.rd_burst;
        let unprotect = self.options.unprotect_flash;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(&mut self.spi, unprotect);
            flash.power_up()?;
            flash.read_id()?;
            flash.erase_and_prog(offset, &data, &progress)?;
            if verify {
                flash.verify(offset, &data, rd_burst, &progress)?;
            }
            Ok(())
        })();
        self.options.progress = progress;
        result?;

        self.spi.gpio_set(self.rst_pin)?;
        self.wait_cdone()
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        self.spi.gpio_clear(self.rst_pin)?;
        let rd_burst = self.options.rd_burst;
        let unprotect = self.options.unprotect_flash;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(&mut self.spi, unprotect);
            flash.power_up()?;
            flash.read_id()?;
            flash.dump(output, offset, len, rd_burst, &progress)
        })();
        self.options.progress = progress;
        result?;
        self.spi.gpio_set(self.rst_pin)?;
        self.wait_cdone()
    }

    fn reset(&mut self) -> Result<()> {
        self.spi.gpio_clear(self.rst_pin)?;
        std::thread::sleep(Duration::from_millis(1));
        self.spi.gpio_set(self.rst_pin)?;
        self.wait_cdone()
    }
}
