//! Efinix Trion/Titanium driver.
//!
//! Two wirings exist: the probe drives the flash directly (mode-0 SPI with
//! the FPGA held in reset through side-band GPIOs), or it talks JTAG and a
//! `spiOverJtag_<part>.hex` bridge is loaded into SRAM first.

use std::path::Path;
use std::time::Duration;

use super::{bridge_bitstream, Device, DeviceOptions};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{efinix_hex, raw, FileKind};
use crate::probe::ftdi_spi::FtdiSpi;
use crate::spi::{SpiFlash, SpiInterface};
use crate::util::reverse_byte;

// 4-bit JTAG instructions (Trion programming flow).
const CMD_IDCODE: u8 = 0x3;
const CMD_PROGRAM: u8 = 0x4;
const CMD_ENTERUSER: u8 = 0x7;
const CMD_USER1: u8 = 0x8;

/// Driver for Trion/Titanium devices reached over JTAG.
pub struct Efinix<'a> {
    jtag: &'a mut Jtag,
    options: DeviceOptions,
}

impl<'a> Efinix<'a> {
    /// Prepares a driver for the selected chain device.
    pub fn new(
        jtag: &'a mut Jtag,
        _model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        Ok(Self { jtag, options })
    }

    /// Reads the IDCODE through the dedicated instruction.
    pub fn id_code(&mut self) -> Result<u32> {
        self.jtag
            .shift_ir(&[CMD_IDCODE], None, 4, TapState::RunTestIdle)?;
        let mut rx = [0u8; 4];
        self.jtag
            .shift_dr(Some(&[0u8; 4]), Some(&mut rx), 32, TapState::RunTestIdle)?;
        Ok(u32::from_le_bytes(rx))
    }

    /// SRAM load: PROGRAM opcode, stream the hex payload bit-reversed,
    /// then ENTERUSER to start the fabric.
    fn program_sram(&mut self, data: &[u8]) -> Result<()> {
        self.jtag.go_test_logic_reset()?;
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag
            .shift_ir(&[CMD_PROGRAM], None, 4, TapState::RunTestIdle)?;

        self.options.progress.started("Loading SRAM", data.len());
        let mut chunk = [0u8; 512];
        let mut sent = 0usize;
        while sent < data.len() {
            let size = 512.min(data.len() - sent);
            for (dst, src) in chunk[..size].iter_mut().zip(&data[sent..]) {
                *dst = reverse_byte(*src);
            }
            let end = if sent + size == data.len() {
                TapState::RunTestIdle
            } else {
                TapState::ShiftDr
            };
            self.jtag
                .shift_dr(Some(&chunk[..size]), None, size * 8, end)?;
            sent += size;
            self.options.progress.progressed(sent);
        }
        self.options.progress.finished();

        self.jtag.toggle_clk(100)?;
        self.jtag
            .shift_ir(&[CMD_ENTERUSER], None, 4, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(100)?;
        self.jtag.flush()
    }

    fn load_bridge(&mut self) -> Result<()> {
        if self.options.skip_load_bridge {
            return Ok(());
        }
        let part = self.options.part_name.clone().ok_or(Error::SoftFail(
            "external flash access needs --fpga-part to pick the bridge bitstream".into(),
        ))?;
        let path = bridge_bitstream(&part, "hex")?;
        tracing::info!("loading bridge {}", path.display());
        let bridge = efinix_hex::parse_file(&path)?;
        self.program_sram(&bridge.data)
    }

    fn write_external_flash(&mut self, data: &[u8]) -> Result<()> {
        self.load_bridge()?;
        let unprotect = self.options.unprotect_flash;
        let offset = self.options.offset;
        let verify = self.options.verify;
        let rd_burst = self.options.rd_burst;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(self, unprotect);
            flash.reset()?;
            flash.power_up()?;
            flash.read_id()?;
            flash.erase_and_prog(offset, data, &progress)?;
            if verify {
                flash.verify(offset, data, rd_burst, &progress)?;
            }
            Ok(())
        })();
        self.options.progress = progress;
        result
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(match FileKind::from_path(path) {
            FileKind::Hex => efinix_hex::parse_file(path)?.data,
            _ => raw::parse_file(path, false)?.data,
        })
    }
}

impl Device for Efinix<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        let data = self.load(path)?;
        self.program_sram(&data)
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let data = self.load(path)?;
        self.write_external_flash(&data)
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        self.load_bridge()?;
        let unprotect = self.options.unprotect_flash;
        let rd_burst = self.options.rd_burst;
        let progress = std::mem::take(&mut self.options.progress);
        let output = output.to_path_buf();
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(self, unprotect);
            flash.read_id()?;
            flash.dump(&output, offset, len, rd_burst, &progress)
        })();
        self.options.progress = progress;
        result
    }

    fn reset(&mut self) -> Result<()> {
        self.jtag.go_test_logic_reset()?;
        self.jtag
            .shift_ir(&[CMD_ENTERUSER], None, 4, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(100)?;
        self.jtag.flush()
    }
}

impl SpiInterface for Efinix<'_> {
    /// Same tunnel conventions as the other bscan bridges: `USER1`
    /// register, bit-reversed bytes, one-bit read pipeline.
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let has_rx = rx.is_some();
        let xfer_len = len + 1 + usize::from(has_rx);

        let mut jtx = vec![0u8; xfer_len];
        jtx[0] = reverse_byte(cmd);
        if let Some(tx) = tx {
            for (dst, src) in jtx[1..1 + tx.len()].iter_mut().zip(tx) {
                *dst = reverse_byte(*src);
            }
        }

        self.jtag
            .shift_ir(&[CMD_USER1], None, 4, TapState::RunTestIdle)?;
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * xfer_len, TapState::RunTestIdle)?;
            for i in 0..len {
                rx[i] = reverse_byte(jrx[i + 1] >> 1) | (jrx[i + 2] & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * xfer_len, TapState::RunTestIdle)?;
        }
        Ok(())
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        let has_rx = rx.is_some();
        let xfer_len = tx.len() + usize::from(has_rx);
        let mut jtx = vec![0u8; xfer_len];
        for (dst, src) in jtx.iter_mut().zip(tx) {
            *dst = reverse_byte(*src);
        }
        self.jtag
            .shift_ir(&[CMD_USER1], None, 4, TapState::RunTestIdle)?;
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * xfer_len, TapState::RunTestIdle)?;
            for i in 0..rx.len().min(tx.len()) {
                rx[i] = reverse_byte(jrx[i] >> 1) | (jrx[i + 1] & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * xfer_len, TapState::RunTestIdle)?;
        }
        Ok(())
    }
}

/// Trion wired straight to the probe's SPI pins.
pub struct EfinixSpi {
    spi: FtdiSpi,
    options: DeviceOptions,
    rst_pin: u16,
    done_pin: u16,
}

impl EfinixSpi {
    /// Wraps a dedicated SPI probe with the board's reset/done pins.
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
            std::thread::sleep(Duration::from_millis(12));
        }
        Err(Error::timeout("waiting for CDONE"))
    }
}

impl Device for EfinixSpi {
    fn write_sram(&mut self, _path: &Path) -> Result<()> {
        Err(Error::SoftFail(
            "the SPI wiring only reaches the flash; use JTAG for SRAM loads".into(),
        ))
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let data = match FileKind::from_path(path) {
            FileKind::Hex => efinix_hex::parse_file(path)?.data,
            _ => {
                if self.options.offset == 0 {
                    return Err(Error::SoftFail(
                        "raw data cannot land at offset 0; the header area is reserved".into(),
                    ));
                }
                raw::parse_file(path, false)?.data
            }
        };

        self.spi.gpio_clear(self.rst_pin)?;
        let offset = self.options.offset;
        let verify = self.options.verify;
        let rd_burst = self.options.rd_burst;
        let unprotect = self.options.unprotect_flash;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(&mut self.spi, unprotect);
            flash.reset()?;
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
        std::thread::sleep(Duration::from_millis(12));
        self.wait_cdone()
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        self.spi.gpio_clear(self.rst_pin)?;
        let rd_burst = self.options.rd_burst;
        let unprotect = self.options.unprotect_flash;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(&mut self.spi, unprotect);
            flash.reset()?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fpga_by_idcode;
    use crate::probe::mock::{MockHandle, MockTransport};

    fn engine() -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        jtag.insert_first(0x00210a79, 4);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    /// SRAM payload bytes are reversed into LSB-first wire order.
    #[test]
    fn sram_payload_is_bit_reversed() {
        let (mut jtag, mock) = engine();
        let model = fpga_by_idcode(0x00210a79).unwrap();
        let mut efinix = Efinix::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        efinix.program_sram(&[0x80, 0x01]).unwrap();

        let m = mock.borrow();
        let payload = m
            .tdi_log
            .iter()
            .find(|op| op.bits == 16)
            .expect("payload missing");
        assert_eq!(payload.tx.as_deref(), Some(&[0x01, 0x80][..]));
    }
}
