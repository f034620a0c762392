//! Cologne Chip GateMate driver: SRAM over `JTAG_CONFIGURE`, external
//! flash over `JTAG_SPI_BYPASS`, plus a direct-SPI path when the probe is
//! wired to the flash. Reset/done/output-enable run through the probe's
//! side-band GPIOs.

use std::path::Path;
use std::time::Duration;

use super::{Device, DeviceOptions};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{colognechip_cfg, raw, FileKind};
use crate::probe::ftdi_spi::FtdiSpi;
use crate::spi::{SpiFlash, SpiInterface};
use crate::util::reverse_byte;

const JTAG_CONFIGURE: u8 = 0x06;
const JTAG_SPI_BYPASS: u8 = 0x05;

/// Driver for the GateMate family on a JTAG chain.
pub struct CologneChip<'a> {
    jtag: &'a mut Jtag,
    options: DeviceOptions,
}

impl<'a> CologneChip<'a> {
    /// Prepares a driver for the selected chain device.
    pub fn new(
        jtag: &'a mut Jtag,
        _model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        Ok(Self { jtag, options })
    }

    /// SRAM configuration stream. When the device is not alone on the
    /// chain, the bypass registers ahead of it would inject stray bits, so
    /// `8 - (index % 8)` zero bits pre-align the first byte; zeros keep the
    /// stream a well-formed NOP for the configuration engine.
    fn program_sram(&mut self, data: &[u8]) -> Result<()> {
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag
            .shift_ir(&[JTAG_CONFIGURE], None, 6, TapState::SelectDrScan)?;

        if self.jtag.devices().len() > 1 {
            let bits_before = 8 - (self.jtag.selected_index() % 8);
            self.jtag.set_state(TapState::ShiftDr)?;
            let zeros = [0u8];
            self.jtag.read_write(Some(&zeros), None, bits_before, false)?;
        }

        self.options.progress.started("Loading SRAM", data.len());
        let mut sent = 0usize;
        while sent < data.len() {
            let size = 1024.min(data.len() - sent);
            let end = if sent + size == data.len() {
                TapState::RunTestIdle
            } else {
                TapState::ShiftDr
            };
            self.jtag
                .shift_dr(Some(&data[sent..sent + size]), None, size * 8, end)?;
            sent += size;
            self.options.progress.progressed(sent);
        }
        self.options.progress.finished();
        self.jtag.flush()
    }

    fn write_external_flash(&mut self, data: &[u8]) -> Result<()> {
        let unprotect = self.options.unprotect_flash;
        let offset = self.options.offset;
        let verify = self.options.verify;
        let rd_burst = self.options.rd_burst;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(self, unprotect);
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
            FileKind::ColognechipCfg => colognechip_cfg::parse_file(path)?.data,
            _ => raw::parse_file(path, false)?.data,
        })
    }
}

impl Device for CologneChip<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        let data = self.load(path)?;
        self.program_sram(&data)
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let data = self.load(path)?;
        self.write_external_flash(&data)
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
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
        self.jtag.flush()
    }
}

impl SpiInterface for CologneChip<'_> {
    /// The bypass register adds one cycle, so transfers clock one or two
    /// extra bits and the answer is rebuilt as
    /// `(rev(b[i+1]) << 1) | (rev(b[i+2]) >> 7)`.
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let xfer_len = len + 1;
        let mut jtx = vec![0u8; xfer_len + 2];
        jtx[0] = reverse_byte(cmd);
        if let Some(tx) = tx {
            for (dst, src) in jtx[1..1 + tx.len()].iter_mut().zip(tx) {
                *dst = reverse_byte(*src);
            }
        }

        self.jtag
            .shift_ir(&[JTAG_SPI_BYPASS], None, 6, TapState::SelectDrScan)?;

        let bits = if rx.is_some() {
            8 * xfer_len + 2
        } else {
            8 * xfer_len + 1
        };
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len + 2];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), bits, TapState::SelectDrScan)?;
            for i in 0..len {
                let b0 = reverse_byte(jrx[i + 1]);
                let b1 = reverse_byte(jrx[i + 2]);
                rx[i] = (b0 << 1) | ((b1 >> 7) & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, bits, TapState::SelectDrScan)?;
        }
        Ok(())
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        let xfer_len = tx.len();
        let mut jtx = vec![0u8; xfer_len + 2];
        for (dst, src) in jtx.iter_mut().zip(tx) {
            *dst = reverse_byte(*src);
        }

        self.jtag
            .shift_ir(&[JTAG_SPI_BYPASS], None, 6, TapState::SelectDrScan)?;
        let bits = if rx.is_some() {
            8 * xfer_len + 2
        } else {
            8 * xfer_len + 1
        };
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len + 2];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), bits, TapState::SelectDrScan)?;
            for i in 0..rx.len().min(xfer_len) {
                let b0 = reverse_byte(jrx[i]);
                let b1 = reverse_byte(jrx[i + 1]);
                rx[i] = (b0 << 1) | ((b1 >> 7) & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, bits, TapState::SelectDrScan)?;
        }
        Ok(())
    }

    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        let tx = [reverse_byte(cmd)];
        self.jtag
            .shift_ir(&[JTAG_SPI_BYPASS], None, 6, TapState::ShiftDr)?;
        self.jtag.read_write(Some(&tx), None, 8, false)?;

        let dummy = [0xffu8; 2];
        let mut status = 0u8;
        let mut ok = false;
        for _ in 0..timeout {
            let mut rx = [0u8; 2];
            self.jtag.read_write(Some(&dummy), Some(&mut rx), 16, false)?;
            let b0 = reverse_byte(rx[0]);
            let b1 = reverse_byte(rx[1]);
            status = (b0 << 1) | ((b1 >> 7) & 0x01);
            if status & mask == cond {
                ok = true;
                break;
            }
        }
        self.jtag.set_state(TapState::RunTestIdle)?;
        if ok {
            Ok(())
        } else {
            Err(Error::WipTimeout {
                last_status: status,
            })
        }
    }
}

/// GateMate wired straight to the probe's SPI pins; the FPGA is held in
/// reset while the flash is accessed, then released to configure itself.
pub struct CologneChipSpi {
    spi: FtdiSpi,
    options: DeviceOptions,
    rstn_pin: u16,
    done_pin: u16,
    oen_pin: u16,
}

impl CologneChipSpi {
    /// Wraps a dedicated SPI probe with the board's side-band pins.
    pub fn new(
        spi: FtdiSpi,
        rstn_pin: u16,
        done_pin: u16,
        oen_pin: u16,
        options: DeviceOptions,
    ) -> Self {
        Self {
            spi,
            options,
            rstn_pin,
            done_pin,
            oen_pin,
        }
    }

    fn hold_reset(&mut self) -> Result<()> {
        self.spi.gpio_clear(self.rstn_pin)?;
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn release_reset(&mut self) -> Result<()> {
        self.spi.gpio_set(self.rstn_pin)?;
        // Wait for the configuration-done pin.
        for _ in 0..1000 {
            if self.spi.gpio_get()? & self.done_pin != 0 {
                if self.oen_pin != 0 {
                    self.spi.gpio_set(self.oen_pin)?;
                }
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(12));
        }
        Err(Error::timeout("waiting for GateMate done pin"))
    }
}

impl Device for CologneChipSpi {
    fn write_sram(&mut self, _path: &Path) -> Result<()> {
        Err(Error::SoftFail(
            "SRAM load needs the JTAG wiring; the SPI path only reaches the flash".into(),
        ))
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let data = match FileKind::from_path(path) {
            FileKind::ColognechipCfg => colognechip_cfg::parse_file(path)?.data,
            _ => raw::parse_file(path, false)?.data,
        };

        self.hold_reset()?;
        let offset = self.options.offset;
        let verify = self.options.verify;
        let rd_burst = self.options.rd_burst;
        let unprotect = self.options.unprotect_flash;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(&mut self.spi, unprotect);
            flash.read_id()?;
            flash.erase_and_prog(offset, &data, &progress)?;
            if verify {
                flash.verify(offset, &data, rd_burst, &progress)?;
            }
            Ok(())
        })();
        self.options.progress = progress;
        result?;
        self.release_reset()
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        self.hold_reset()?;
        let rd_burst = self.options.rd_burst;
        let unprotect = self.options.unprotect_flash;
        let progress = std::mem::take(&mut self.options.progress);
        let result = (|| -> Result<()> {
            let mut flash = SpiFlash::new(&mut self.spi, unprotect);
            flash.read_id()?;
            flash.dump(output, offset, len, rd_burst, &progress)
        })();
        self.options.progress = progress;
        result?;
        self.release_reset()
    }

    fn reset(&mut self) -> Result<()> {
        self.hold_reset()?;
        self.release_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fpga_by_idcode;
    use crate::probe::mock::{MockHandle, MockTransport};

    fn engine_with_chain(n: usize, index: usize) -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        for _ in 0..n {
            jtag.insert_first(0x2000_0001, 6);
        }
        jtag.device_select(index).unwrap();
        (jtag, handle)
    }

    /// A lone device gets no alignment bits; a second chain position
    /// prepends `8 - index % 8` zeros.
    #[test]
    fn sram_stream_alignment_bits() {
        let model = fpga_by_idcode(0x2000_0001).unwrap();

        let (mut jtag, mock) = engine_with_chain(1, 0);
        let mut cc = CologneChip::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        cc.program_sram(&[0x11, 0x22]).unwrap();
        assert_eq!(mock.borrow().tdi_bits.len(), 6 + 16);

        let (mut jtag, mock) = engine_with_chain(2, 1);
        let mut cc = CologneChip::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        cc.program_sram(&[0x11, 0x22]).unwrap();
        // 6 IR bits + 6 bypass-ir bits for the neighbour, 7 alignment
        // zeros (8 - 1), 16 payload bits, one trailing bypass bit.
        let m = mock.borrow();
        let alignment = m
            .tdi_log
            .iter()
            .find(|op| op.bits == 7)
            .expect("alignment bits missing");
        assert_eq!(alignment.tx.as_deref(), Some(&[0x00][..]));
    }
}
