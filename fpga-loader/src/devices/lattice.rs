//! Lattice drivers: MachXO2/XO3/XO3D internal flash, ECP5 and Nexus SRAM
//! plus external SPI flash through the bscan bridge.
//!
//! Every command is an 8-bit IR opcode followed by an optional DR operand;
//! busy is polled through `LSC_CHECK_BUSY` and the 32-bit status register
//! gates each phase.

use std::path::Path;

use super::{check_idcode, Device, DeviceOptions, FlashSector};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{jed, lattice_bit, raw, FileKind};
use crate::spi::{SpiFlash, SpiInterface};
use crate::util::reverse_byte;

const ISC_ENABLE: u8 = 0xc6;
const ISC_ENABLE_FLASH_MODE: u8 = 1 << 3;
const ISC_ENABLE_SRAM_MODE: u8 = 0;
const ISC_DISABLE: u8 = 0x26;
const ISC_ERASE: u8 = 0x0e;
const FLASH_ERASE_UFM: u32 = 1 << 3;
const FLASH_ERASE_CFG: u32 = 1 << 2;
const FLASH_ERASE_FEATURE: u32 = 1 << 1;
const FLASH_ERASE_SRAM: u32 = 1 << 0;
const LSC_INIT_ADDRESS: u8 = 0x46;
const LSC_BITSTREAM_BURST: u8 = 0x7a;
const LSC_PROG_INCR_NV: u8 = 0x70;
const LSC_CHECK_BUSY: u8 = 0xf0;
const LSC_READ_STATUS: u8 = 0x3c;
const LSC_REFRESH: u8 = 0x79;
const LSC_PRELOAD: u8 = 0x1c;
const PROG_FEATURE_ROW: u8 = 0xe4;
const PROG_FEABITS: u8 = 0xf8;
const ISC_PROGRAM_DONE: u8 = 0x5e;
const READ_USERCODE: u8 = 0xc0;
const BYPASS: u8 = 0xff;
/// Undocumented bscan-SPI hook, preceded by `0xFE 0x68` in DR.
const SPI_MODE: u8 = 0x3a;

const STATUS_DONE: u32 = 1 << 8;
const STATUS_ISC_EN: u32 = 1 << 9;
const STATUS_FAIL: u32 = 1 << 13;
/// Configuration check-code field (BSE error) positions differ between
/// the MachXO2/ECP5 layout and the MachXO3D one.
const STATUS_CNF_CHK_MASK: u32 = 0x0f << 23;
const XO3D_STATUS_CNF_CHK_MASK: u32 = 0x0f << 25;

// MachXO3D per-sector erase bits, packed into the 24-bit ISC_ERASE operand.
const XO3D_SEC_CFG0: u32 = 1 << 8;
const XO3D_SEC_CFG1: u32 = 1 << 9;
const XO3D_SEC_UFM0: u32 = 1 << 10;
const XO3D_SEC_UFM1: u32 = 1 << 11;
const XO3D_SEC_UFM2: u32 = 1 << 12;
const XO3D_SEC_UFM3: u32 = 1 << 13;
const XO3D_SEC_FEA: u32 = 1 << 14;
const XO3D_SEC_PKEY: u32 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    MachXo2,
    MachXo3d,
    Ecp5,
}

/// Driver for MachXO2/XO3/XO3D, ECP5, Crosslink-NX and Certus-NX.
pub struct Lattice<'a> {
    jtag: &'a mut Jtag,
    family: Family,
    options: DeviceOptions,
}

impl<'a> Lattice<'a> {
    /// Prepares a driver for the selected chain device.
    pub fn new(
        jtag: &'a mut Jtag,
        model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        let family = match model.family {
            "MachXO2" | "MachXO3LF" => Family::MachXo2,
            "MachXO3D" => Family::MachXo3d,
            _ => Family::Ecp5,
        };
        tracing::debug!("lattice driver for {} ({})", model.model, model.family);
        Ok(Self {
            jtag,
            family,
            options,
        })
    }

    fn selected_idcode(&self) -> u32 {
        self.jtag.devices()[self.jtag.selected_index()]
    }

    /// Command frame: 8-bit opcode, optional DR operand, both parked in
    /// the pause states so a follow-up poll can run.
    fn wr_rd(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        self.jtag
            .shift_ir(&[cmd], None, 8, TapState::PauseIr)?;
        if tx.is_some() || rx.is_some() {
            let len = tx
                .map(|t| t.len())
                .max(rx.as_ref().map(|r| r.len()))
                .unwrap_or(0);
            let mut buf = vec![0u8; len];
            if let Some(tx) = tx {
                buf[..tx.len()].copy_from_slice(tx);
            }
            self.jtag
                .shift_dr(Some(&buf), rx, len * 8, TapState::PauseDr)?;
        }
        Ok(())
    }

    fn idle(&mut self, cycles: u32) -> Result<()> {
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(cycles)
    }

    /// `LSC_CHECK_BUSY` returns a byte whose bit 7 mirrors the internal
    /// busy flag; poll until the whole byte clears.
    fn poll_busy(&mut self) -> Result<()> {
        for _ in 0..100_000 {
            let mut rx = [0u8];
            self.wr_rd(LSC_CHECK_BUSY, None, Some(&mut rx))?;
            self.idle(1000)?;
            if rx[0] == 0 {
                return Ok(());
            }
        }
        Err(Error::JtagBusy {
            operation: "LSC_CHECK_BUSY",
        })
    }

    fn read_status(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(LSC_READ_STATUS, Some(&[0u8; 4]), Some(&mut rx))?;
        self.idle(1000)?;
        Ok(u32::from_le_bytes(rx))
    }

    fn check_status(&mut self, value: u32, mask: u32) -> Result<()> {
        let status = self.read_status()?;
        if status & mask != value {
            self.display_status(status);
            return Err(Error::JtagBusy {
                operation: "status register check",
            });
        }
        Ok(())
    }

    /// Per-family status decode at debug level; XO3D moved the
    /// configuration-check field.
    fn display_status(&self, status: u32) {
        let chk = match self.family {
            Family::MachXo3d => (status & XO3D_STATUS_CNF_CHK_MASK) >> 25,
            _ => (status & STATUS_CNF_CHK_MASK) >> 23,
        };
        tracing::debug!(
            "status 0x{status:08x}: done={} isc_en={} fail={} cfg_check={chk}",
            status & STATUS_DONE != 0,
            status & STATUS_ISC_EN != 0,
            status & STATUS_FAIL != 0,
        );
    }

    fn enable_isc(&mut self, mode: u8) -> Result<()> {
        self.wr_rd(ISC_ENABLE, Some(&[mode]), None)?;
        self.idle(1000)?;
        self.poll_busy()?;
        self.check_status(STATUS_ISC_EN, STATUS_ISC_EN)
    }

    fn disable_isc(&mut self) -> Result<()> {
        self.wr_rd(ISC_DISABLE, None, None)?;
        self.idle(1000)?;
        self.poll_busy()?;
        self.check_status(0, STATUS_ISC_EN)
    }

    /// ISC_ERASE; MachXO3D selects sectors through a wider operand.
    fn flash_erase(&mut self, mask: u32) -> Result<()> {
        if self.family == Family::MachXo3d {
            let tx = [(mask >> 8) as u8, (mask >> 16) as u8];
            self.wr_rd(ISC_ERASE, Some(&tx), None)?;
        } else {
            self.wr_rd(ISC_ERASE, Some(&[mask as u8]), None)?;
        }
        self.idle(1000)?;
        self.poll_busy()?;
        self.check_status(0, STATUS_FAIL)
    }

    fn clear_sram(&mut self) -> Result<()> {
        let preload = [0xffu8; 26];
        self.wr_rd(LSC_PRELOAD, Some(&preload), None)?;
        self.wr_rd(BYPASS, None, None)?;
        self.enable_isc(ISC_ENABLE_SRAM_MODE)?;
        let mask = if self.family == Family::MachXo3d {
            0
        } else {
            FLASH_ERASE_SRAM
        };
        self.flash_erase(mask)
    }

    /// SRAM load: erase, init address, then the burst opcode followed by
    /// the whole image with every byte bit-reversed.
    fn program_mem(&mut self, data: &[u8]) -> Result<()> {
        self.clear_sram()?;

        self.wr_rd(LSC_INIT_ADDRESS, None, None)?;
        self.idle(1000)?;

        self.wr_rd(LSC_BITSTREAM_BURST, None, None)?;
        self.idle(2)?;

        self.options.progress.started("Loading", data.len());
        let mut chunk = [0u8; 1024];
        let mut sent = 0usize;
        while sent < data.len() {
            let size = 1024.min(data.len() - sent);
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

        let chk_mask = match self.family {
            Family::MachXo3d => XO3D_STATUS_CNF_CHK_MASK,
            _ => STATUS_CNF_CHK_MASK,
        };
        self.check_status(0, chk_mask)?;

        self.wr_rd(BYPASS, None, None)?;
        self.disable_isc()?;
        self.wr_rd(BYPASS, None, None)?;
        self.jtag.go_test_logic_reset()
    }

    /// Internal flash from a JED image: erase changed sections, stream the
    /// 128-bit fuse frames, then feabits, done bit and refresh.
    fn program_int_flash(&mut self, jed: &jed::JedFile) -> Result<()> {
        self.wr_rd(BYPASS, None, None)?;
        self.enable_isc(ISC_ENABLE_FLASH_MODE)?;

        let has_features = jed.features_row != 0 || jed.feabits != 0 || !jed.sections.is_empty();
        let erase_mask = if self.family == Family::MachXo3d {
            // Split flash: erase the selected sector, or the primary
            // configuration sector plus the feature area by default.
            match self.options.flash_sector {
                Some(sector) => self.sector_erase_mask(sector),
                None => XO3D_SEC_CFG0 | XO3D_SEC_FEA,
            }
        } else {
            let mut mask = FLASH_ERASE_CFG;
            if has_features {
                mask |= FLASH_ERASE_FEATURE;
            }
            if jed.sections.len() > 1 {
                mask |= FLASH_ERASE_UFM;
            }
            mask
        };
        self.flash_erase(erase_mask)?;

        self.wr_rd(LSC_INIT_ADDRESS, None, None)?;
        self.idle(1000)?;

        // Configuration frames are 16 bytes; the JED fuse data is already
        // packed in transmission order.
        let cfg = &jed.sections[0];
        let frames = cfg.data.chunks(16);
        self.options.progress.started("Writing flash", cfg.data.len() / 16);
        for (i, frame) in frames.enumerate() {
            let mut tx = [0u8; 16];
            tx[..frame.len()].copy_from_slice(frame);
            self.wr_rd(LSC_PROG_INCR_NV, Some(&tx), None)?;
            self.idle(1000)?;
            self.poll_busy()?;
            self.options.progress.progressed(i + 1);
        }
        self.options.progress.finished();

        if has_features {
            self.write_features_row(jed.features_row)?;
            self.write_feabits(jed.feabits)?;
        }
        self.write_program_done()?;
        self.disable_isc()?;
        self.load_configuration()
    }

    fn write_features_row(&mut self, features: u64) -> Result<()> {
        let tx = features.to_le_bytes();
        self.wr_rd(PROG_FEATURE_ROW, Some(&tx), None)?;
        self.idle(1000)?;
        self.poll_busy()
    }

    fn write_feabits(&mut self, feabits: u16) -> Result<()> {
        self.wr_rd(PROG_FEABITS, Some(&feabits.to_le_bytes()), None)?;
        self.idle(1000)?;
        self.poll_busy()
    }

    fn write_program_done(&mut self) -> Result<()> {
        self.wr_rd(ISC_PROGRAM_DONE, None, None)?;
        self.idle(1000)?;
        self.poll_busy()?;
        self.check_status(STATUS_DONE, STATUS_DONE)
    }

    /// `LSC_REFRESH`: reload the fabric from flash.
    fn load_configuration(&mut self) -> Result<()> {
        self.wr_rd(LSC_REFRESH, None, None)?;
        self.idle(1000)?;
        self.poll_busy()?;
        self.check_status(STATUS_DONE, STATUS_DONE)
    }

    /// Reads the 32-bit usercode.
    pub fn user_code(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(READ_USERCODE, None, Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    /// Puts the bscan SPI bridge on the chain: SRAM must be cleared first,
    /// then the magic preamble selects pass-through mode.
    fn prepare_flash_access(&mut self) -> Result<()> {
        self.clear_sram()?;
        self.jtag
            .shift_ir(&[SPI_MODE], None, 8, TapState::Exit1Ir)?;
        self.jtag
            .shift_dr(Some(&[0xfe, 0x68]), None, 16, TapState::RunTestIdle)?;
        Ok(())
    }

    fn post_flash_access(&mut self) -> Result<()> {
        self.load_configuration()?;
        self.wr_rd(BYPASS, None, None)?;
        self.jtag.go_test_logic_reset()
    }

    fn sector_erase_mask(&self, sector: FlashSector) -> u32 {
        match sector {
            FlashSector::Cfg0 => XO3D_SEC_CFG0,
            FlashSector::Cfg1 => XO3D_SEC_CFG1,
            FlashSector::Ufm0 => XO3D_SEC_UFM0,
            FlashSector::Ufm1 => XO3D_SEC_UFM1,
            FlashSector::Ufm2 => XO3D_SEC_UFM2,
            FlashSector::Ufm3 => XO3D_SEC_UFM3,
            FlashSector::Fea => XO3D_SEC_FEA,
            FlashSector::Pkey => XO3D_SEC_PKEY,
        }
    }

    fn write_external_flash(&mut self, data: &[u8]) -> Result<()> {
        self.prepare_flash_access()?;

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

        self.post_flash_access()
    }
}

impl Device for Lattice<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        let options = lattice_bit::LatticeBitOptions {
            machxo2: false,
            ecp3: false,
        };
        let bit = lattice_bit::parse_file(path, options)?;
        check_idcode(bit.bitstream.idcode(), self.selected_idcode())?;
        self.program_mem(&bit.bitstream.data)
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        match (self.family, FileKind::from_path(path)) {
            (Family::MachXo2 | Family::MachXo3d, FileKind::Jed) => {
                let jed = jed::parse_file(path)?;
                self.clear_sram()?;
                let result = self.program_int_flash(&jed);
                self.post_flash_access()?;
                result
            }
            (Family::MachXo2 | Family::MachXo3d, _) => Err(Error::SoftFail(
                "internal flash programming expects a JED file".into(),
            )),
            (Family::Ecp5, kind) => {
                // What lands in flash is the file byte stream itself.
                let data = match kind {
                    FileKind::XilinxBit | FileKind::LatticeBit => {
                        let options = lattice_bit::LatticeBitOptions::default();
                        lattice_bit::parse_file(path, options)?.bitstream.data
                    }
                    _ => raw::parse_file(path, false)?.data,
                };
                self.write_external_flash(&data)
            }
        }
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        if self.family != Family::Ecp5 {
            return Err(Error::SoftFail(
                "flash dump is only wired for the external-flash families".into(),
            ));
        }
        self.prepare_flash_access()?;
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
        self.post_flash_access()
    }

    fn reset(&mut self) -> Result<()> {
        self.load_configuration()?;
        self.jtag.go_test_logic_reset()
    }
}

impl SpiInterface for Lattice<'_> {
    /// The Lattice pass-through keeps byte alignment: bytes are reversed
    /// but the response is only offset by the command byte, with no extra
    /// bit of pipeline.
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let xfer_len = len + 1;
        let mut jtx = vec![0u8; xfer_len];
        jtx[0] = reverse_byte(cmd);
        if let Some(tx) = tx {
            for (dst, src) in jtx[1..].iter_mut().zip(tx) {
                *dst = reverse_byte(*src);
            }
        }

        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * xfer_len, TapState::RunTestIdle)?;
            for (i, byte) in rx.iter_mut().enumerate() {
                *byte = reverse_byte(jrx[i + 1]);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * xfer_len, TapState::RunTestIdle)?;
        }
        Ok(())
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        let mut jtx: Vec<u8> = tx.iter().map(|b| reverse_byte(*b)).collect();
        if jtx.is_empty() {
            jtx.push(0);
        }
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; jtx.len()];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * jtx.len(), TapState::RunTestIdle)?;
            for (i, byte) in rx.iter_mut().enumerate() {
                *byte = reverse_byte(jrx[i]);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * jtx.len(), TapState::RunTestIdle)?;
        }
        Ok(())
    }

    /// Chip select stays asserted while the TAP sits in Shift-DR, so the
    /// whole poll runs inside one DR scan.
    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        let tx = [reverse_byte(cmd)];
        self.jtag.shift_dr(Some(&tx), None, 8, TapState::ShiftDr)?;

        let mut status = 0u8;
        let mut ok = false;
        let dummy = [0u8];
        for _ in 0..timeout {
            let mut rx = [0u8];
            self.jtag
                .shift_dr(Some(&dummy), Some(&mut rx), 8, TapState::ShiftDr)?;
            status = reverse_byte(rx[0]);
            if status & mask == cond {
                ok = true;
                break;
            }
        }
        let mut rx = [0u8];
        self.jtag
            .shift_dr(Some(&dummy), Some(&mut rx), 8, TapState::RunTestIdle)?;
        if ok {
            Ok(())
        } else {
            Err(Error::WipTimeout {
                last_status: status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fpga_by_idcode;
    use crate::probe::mock::{MockHandle, MockTransport};

    fn machxo2_engine() -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        jtag.insert_first(0x012ba043, 8);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    /// All 8-bit single-byte DR/IR writes, in order; commands show up here.
    fn bytes_written(handle: &MockHandle) -> Vec<u8> {
        handle
            .borrow()
            .tdi_log
            .iter()
            .filter(|op| op.bits == 8)
            .filter_map(|op| op.tx.as_ref().map(|t| t[0]))
            .collect()
    }

    fn contains_ordered(haystack: &[u8], needle: &[u8]) -> bool {
        let mut it = haystack.iter();
        needle.iter().all(|n| it.any(|h| h == n))
    }

    /// A MachXO2 JED program issues the canonical command sequence:
    /// enable, erase, init address, frame writes, feabits, done, disable,
    /// refresh.
    #[test]
    fn machxo2_jed_program_trace() {
        let (mut jtag, mock) = machxo2_engine();
        let model = fpga_by_idcode(0x012ba043).unwrap();

        // 640 bytes of fuse data = 40 16-byte frames.
        let rows: Vec<String> = (0..640).map(|_| "10101010".to_string()).collect();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let raw = jed::build_fixture(&row_refs, "0000000000", true);
        let jed = jed::parse(&raw).unwrap();
        assert_eq!(jed.sections[0].data.len(), 640);

        {
            // Seed every captured read the flow performs, in order:
            // enable(busy + status with ISC_EN), erase(busy + status),
            // 40 frame busy polls, feabits busy, done(busy + status DONE),
            // disable(busy + status), refresh(busy + status DONE).
            let mut m = mock.borrow_mut();
            let isc_en = (STATUS_ISC_EN).to_le_bytes();
            let done = (STATUS_DONE).to_le_bytes();
            let zero = 0u32.to_le_bytes();
            m.queue_read(&[0x00]);
            m.queue_read(&isc_en);
            m.queue_read(&[0x00]);
            m.queue_read(&zero);
            for _ in 0..40 {
                m.queue_read(&[0x00]);
            }
            m.queue_read(&[0x00]); // feature row busy
            m.queue_read(&[0x00]); // feabits busy
            m.queue_read(&[0x00]);
            m.queue_read(&done);
            m.queue_read(&[0x00]);
            m.queue_read(&zero);
            m.queue_read(&[0x00]);
            m.queue_read(&done);
        }

        let mut lattice = Lattice::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        lattice.program_int_flash(&jed).unwrap();

        let written = bytes_written(&mock);
        assert!(
            contains_ordered(
                &written,
                &[
                    ISC_ENABLE,
                    ISC_ENABLE_FLASH_MODE,
                    ISC_ERASE,
                    LSC_INIT_ADDRESS,
                    LSC_PROG_INCR_NV,
                    PROG_FEABITS,
                    ISC_PROGRAM_DONE,
                    ISC_DISABLE,
                    LSC_REFRESH,
                ]
            ),
            "command order wrong: {written:02x?}"
        );
        assert_eq!(
            written.iter().filter(|b| **b == LSC_PROG_INCR_NV).count(),
            40
        );
    }

    /// SRAM bursts reverse every byte before transmission.
    #[test]
    fn sram_load_reverses_bytes() {
        let (mut jtag, mock) = machxo2_engine();
        let model = fpga_by_idcode(0x012ba043).unwrap();
        {
            let mut m = mock.borrow_mut();
            let isc_en = (STATUS_ISC_EN).to_le_bytes();
            let zero = 0u32.to_le_bytes();
            m.queue_read(&[0x00]); // enable busy
            m.queue_read(&isc_en); // enable status
            m.queue_read(&[0x00]); // erase busy
            m.queue_read(&zero); // erase status
            m.queue_read(&zero); // cfg check status
            m.queue_read(&[0x00]); // disable busy
            m.queue_read(&zero); // disable status
        }

        let mut lattice = Lattice::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        lattice.program_mem(&[0x01, 0x02, 0x80]).unwrap();

        let m = mock.borrow();
        let burst = m
            .tdi_log
            .iter()
            .find(|op| op.bits == 24)
            .expect("payload burst missing");
        assert_eq!(burst.tx.as_deref(), Some(&[0x80, 0x40, 0x01][..]));
    }

    /// The bscan SPI tunnel reverses bytes and offsets the response by
    /// one byte, with no bit-level pipeline shift.
    #[test]
    fn spi_tunnel_byte_alignment() {
        let (mut jtag, mock) = machxo2_engine();
        let model = fpga_by_idcode(0x012ba043).unwrap();
        let mut lattice = Lattice::new(&mut jtag, model, DeviceOptions::default()).unwrap();

        // Tunnel answers 0x9f with three reversed ID bytes after the
        // command slot.
        let response = [0x00, reverse_byte(0xef), reverse_byte(0x40), reverse_byte(0x17)];
        mock.borrow_mut().queue_read(&response);

        let mut rx = [0u8; 3];
        lattice.spi_put(0x9f, None, Some(&mut rx)).unwrap();
        assert_eq!(rx, [0xef, 0x40, 0x17]);
    }
}
