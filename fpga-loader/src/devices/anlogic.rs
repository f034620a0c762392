//! Anlogic Eagle driver: SRAM over `JTAG_PROGRAM`/`CFG_IN`, flash through
//! the SPI proxy where every transaction is prefixed with a `0x60` DR byte.

use std::path::Path;

use super::{Device, DeviceOptions};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{anlogic_bit, raw, svf, FileKind};
use crate::spi::{SpiFlash, SpiInterface};
use crate::svf::SvfPlayer;
use crate::util::reverse_byte;

const IRLENGTH: usize = 8;
const REFRESH: u8 = 0x01;
const JTAG_PROGRAM: u8 = 0x30;
const SPI_PROGRAM: u8 = 0x39;
const CFG_IN: u8 = 0x3b;
const JTAG_START: u8 = 0x3d;
const BYPASS: u8 = 0xff;
/// DR prefix putting the device into SPI-proxy mode for one transfer.
const SPI_PROXY: u8 = 0x60;

/// Driver for the Eagle S20 family.
pub struct Anlogic<'a> {
    jtag: &'a mut Jtag,
    options: DeviceOptions,
}

impl<'a> Anlogic<'a> {
    /// Prepares a driver for the selected chain device.
    pub fn new(
        jtag: &'a mut Jtag,
        _model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        Ok(Self { jtag, options })
    }

    fn shift_ir(&mut self, op: u8) -> Result<()> {
        self.jtag
            .shift_ir(&[op], None, IRLENGTH, TapState::RunTestIdle)
    }

    fn program_sram(&mut self, data: &[u8]) -> Result<()> {
        self.shift_ir(BYPASS)?;
        self.shift_ir(BYPASS)?;
        self.shift_ir(REFRESH)?;
        self.shift_ir(BYPASS)?;
        self.shift_ir(SPI_PROGRAM)?;
        self.jtag.toggle_clk(50_000)?;
        self.shift_ir(JTAG_PROGRAM)?;
        self.jtag.toggle_clk(15)?;
        self.shift_ir(CFG_IN)?;
        self.jtag.toggle_clk(15)?;

        self.options.progress.started("Loading SRAM", data.len());
        let mut sent = 0usize;
        while sent < data.len() {
            let size = 512.min(data.len() - sent);
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

        self.jtag.toggle_clk(100)?;
        self.shift_ir(JTAG_START)?;
        self.jtag.toggle_clk(15)?;
        self.shift_ir(BYPASS)?;
        self.jtag.toggle_clk(1000)?;
        // Undocumented status slot the vendor tool always pokes.
        self.shift_ir(0x31)?;
        self.jtag.toggle_clk(100)?;
        self.shift_ir(JTAG_START)?;
        self.jtag.toggle_clk(15)?;
        self.shift_ir(BYPASS)?;
        self.jtag.toggle_clk(15)?;
        self.jtag.flush()
    }

    fn write_external_flash(&mut self, data: &[u8]) -> Result<()> {
        self.shift_ir(SPI_PROGRAM)?;
        self.jtag.toggle_clk(50_000)?;

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
        result?;
        self.reset()
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(match FileKind::from_path(path) {
            FileKind::XilinxBit | FileKind::LatticeBit => anlogic_bit::parse_file(path)?.data,
            _ => raw::parse_file(path, false)?.data,
        })
    }
}

impl Device for Anlogic<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        if FileKind::from_path(path) == FileKind::Svf {
            let statements = svf::parse_file(path)?;
            return SvfPlayer::new(self.jtag).run(&statements);
        }
        let data = self.load(path)?;
        self.program_sram(&data)
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let data = self.load(path)?;
        self.write_external_flash(&data)
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        self.shift_ir(SPI_PROGRAM)?;
        self.jtag.toggle_clk(50_000)?;

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
        result?;
        self.reset()
    }

    fn reset(&mut self) -> Result<()> {
        self.shift_ir(REFRESH)?;
        self.jtag.toggle_clk(15)?;
        self.shift_ir(BYPASS)?;
        self.jtag.go_test_logic_reset()?;
        self.jtag.flush()
    }
}

impl SpiInterface for Anlogic<'_> {
    /// Every SPI transfer is announced by a `0x60` DR byte; responses come
    /// back with the usual one-bit delay.
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
            .shift_dr(Some(&[SPI_PROXY]), None, 8, TapState::RunTestIdle)?;
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
            .shift_dr(Some(&[SPI_PROXY]), None, 8, TapState::RunTestIdle)?;
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

    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        let mut tx = [0u8; 3];
        tx[0] = reverse_byte(cmd);

        let mut status = 0u8;
        for _ in 0..timeout {
            self.jtag
                .shift_dr(Some(&[SPI_PROXY]), None, 8, TapState::RunTestIdle)?;
            let mut rx = [0u8; 3];
            self.jtag
                .shift_dr(Some(&tx), Some(&mut rx), 24, TapState::RunTestIdle)?;
            status = reverse_byte(rx[1] >> 1) | (rx[2] & 0x01);
            if status & mask == cond {
                return Ok(());
            }
        }
        Err(Error::WipTimeout {
            last_status: status,
        })
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
        jtag.insert_first(0x0a014c35, 8);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    /// Every SPI transaction leads with the 0x60 proxy byte.
    #[test]
    fn proxy_prefix_precedes_transfers() {
        let (mut jtag, mock) = engine();
        let model = fpga_by_idcode(0x0a014c35).unwrap();
        let mut anlogic = Anlogic::new(&mut jtag, model, DeviceOptions::default()).unwrap();

        anlogic.spi_put(0x06, None, None).unwrap();

        let m = mock.borrow();
        let first = m.tdi_log.first().unwrap();
        assert_eq!(first.bits, 8);
        assert_eq!(first.tx.as_deref(), Some(&[SPI_PROXY][..]));
        // Command byte goes out reversed.
        let second = &m.tdi_log[1];
        assert_eq!(second.tx.as_deref(), Some(&[reverse_byte(0x06)][..]));
    }

    /// SRAM load issues the documented instruction ladder.
    #[test]
    fn sram_instruction_ladder() {
        let (mut jtag, mock) = engine();
        let model = fpga_by_idcode(0x0a014c35).unwrap();
        let mut anlogic = Anlogic::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        anlogic.program_sram(&[0u8; 8]).unwrap();

        let ops: Vec<u8> = mock
            .borrow()
            .tdi_log
            .iter()
            .filter(|op| op.bits == 8)
            .filter_map(|op| op.tx.as_ref().map(|t| t[0]))
            .collect();
        let expected = [SPI_PROGRAM, JTAG_PROGRAM, CFG_IN, JTAG_START];
        let mut it = ops.iter();
        assert!(
            expected.iter().all(|n| it.any(|h| h == n)),
            "ladder missing from {ops:02x?}"
        );
        assert!(mock.borrow().clk_log.contains(&(false, false, 50_000)));
    }
}
