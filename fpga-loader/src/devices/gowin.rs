//! Gowin GW1N/GW2A driver: SRAM, embedded flash, and external SPI flash
//! bit-banged through the boundary-scan register.
//!
//! Every instruction is followed by six idle clocks before its DR operand
//! (TN653). The GW1N-1 needs longer embedded-flash timings than its
//! siblings; GW2A parts route external flash through a dedicated `0x16`
//! pass-through instead of the bit-banged bscan pins.

use std::path::Path;

use bitflags::bitflags;

use super::{check_idcode, Device, DeviceOptions};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{gowin_fs, raw, FileKind};
use crate::spi::{SpiFlash, SpiInterface};
use crate::util::reverse_byte;

const NOOP: u8 = 0x02;
const ERASE_SRAM: u8 = 0x05;
const XFER_DONE: u8 = 0x09;
const READ_IDCODE: u8 = 0x11;
const CONFIG_ENABLE: u8 = 0x15;
const XFER_WRITE: u8 = 0x17;
const CONFIG_DISABLE: u8 = 0x3a;
const RELOAD: u8 = 0x3c;
const STATUS_REGISTER: u8 = 0x41;
const EF_PROGRAM: u8 = 0x71;
const EFLASH_ERASE: u8 = 0x75;
const SWITCH_TO_MCU_JTAG: u8 = 0x7a;
/// GW2A external-flash pass-through.
const GW2A_SPI_XFER: u8 = 0x16;

bitflags! {
    /// 32-bit status register (TN653 table 2.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GowinStatus: u32 {
        /// Bitstream CRC failed.
        const CRC_ERROR = 1 << 0;
        /// Unknown command in the stream.
        const BAD_COMMAND = 1 << 1;
        /// Embedded IDCODE check failed.
        const ID_VERIFY_FAILED = 1 << 2;
        /// Internal timeout.
        const TIMEOUT = 1 << 3;
        /// SRAM erase done.
        const MEMORY_ERASE = 1 << 5;
        /// Preamble seen.
        const PREAMBLE = 1 << 6;
        /// Configuration interface open.
        const SYSTEM_EDIT_MODE = 1 << 7;
        /// Direct SPI programming active.
        const PRG_SPIFLASH_DIRECT = 1 << 8;
        /// Non-JTAG configuration source active.
        const NON_JTAG_CNF_ACTIVE = 1 << 10;
        /// Bypass active.
        const BYPASS = 1 << 11;
        /// Gowin valid marker.
        const GOWIN_VLD = 1 << 12;
        /// Configuration finished.
        const DONE_FINAL = 1 << 13;
        /// Security bit set.
        const SECURITY_FINAL = 1 << 14;
        /// Device ready.
        const READY = 1 << 15;
        /// Power-on-reset pending.
        const POR = 1 << 16;
        /// Embedded flash locked.
        const FLASH_LOCK = 1 << 17;
    }
}

/// Bscan bit positions of the SPI flash pins; GW1NSR-4C wires them in the
/// opposite order.
#[derive(Debug, Clone, Copy)]
struct BscanPins {
    sck: u8,
    cs: u8,
    di: u8,
    do_: u8,
    msk: u8,
}

const BSCAN_DEFAULT: BscanPins = BscanPins {
    sck: 1 << 1,
    cs: 1 << 3,
    di: 1 << 5,
    do_: 1 << 7,
    msk: 1 << 6,
};

const BSCAN_GW1NSR_4C: BscanPins = BscanPins {
    sck: 1 << 7,
    cs: 1 << 5,
    di: 1 << 3,
    do_: 1 << 1,
    msk: 1 << 0,
};

/// Driver for GW1N/GW1NS/GW2A devices.
pub struct Gowin<'a> {
    jtag: &'a mut Jtag,
    options: DeviceOptions,
    is_gw1n1: bool,
    is_gw2a: bool,
    pins: BscanPins,
}

impl<'a> Gowin<'a> {
    /// Prepares a driver for the selected chain device; the IDCODE picks
    /// the per-part quirks.
    pub fn new(
        jtag: &'a mut Jtag,
        model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        let idcode = model.idcode;
        Ok(Self {
            jtag,
            options,
            is_gw1n1: idcode == 0x0900281b,
            is_gw2a: model.family == "GW2A",
            pins: if idcode == 0x0100981b {
                BSCAN_GW1NSR_4C
            } else {
                BSCAN_DEFAULT
            },
        })
    }

    fn selected_idcode(&self) -> u32 {
        self.jtag.devices()[self.jtag.selected_index()]
    }

    /// Instruction, six idle clocks, optional operand, six more.
    fn wr_rd(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        self.jtag.shift_ir_u8(cmd, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(6)?;
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
                .shift_dr(Some(&buf), rx, len * 8, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(6)?;
            self.jtag.flush()?;
        }
        Ok(())
    }

    fn read_status(&mut self) -> Result<GowinStatus> {
        let mut rx = [0u8; 4];
        self.wr_rd(STATUS_REGISTER, Some(&[0u8; 4]), Some(&mut rx))?;
        Ok(GowinStatus::from_bits_truncate(u32::from_le_bytes(rx)))
    }

    fn poll_flag(&mut self, mask: GowinStatus, value: GowinStatus) -> Result<()> {
        for _ in 0..100_000 {
            let status = self.read_status()?;
            if status & mask == value {
                return Ok(());
            }
        }
        Err(Error::JtagBusy {
            operation: "Gowin status poll",
        })
    }

    /// Reads the device IDCODE through the configuration port.
    pub fn id_code(&mut self) -> Result<u32> {
        let mut rx = [0u8; 4];
        self.wr_rd(READ_IDCODE, Some(&[0u8; 4]), Some(&mut rx))?;
        Ok(u32::from_le_bytes(rx))
    }

    fn enable_cfg(&mut self) -> Result<()> {
        self.wr_rd(CONFIG_ENABLE, None, None)?;
        self.poll_flag(GowinStatus::SYSTEM_EDIT_MODE, GowinStatus::SYSTEM_EDIT_MODE)
    }

    fn disable_cfg(&mut self) -> Result<()> {
        self.wr_rd(CONFIG_DISABLE, None, None)?;
        self.wr_rd(NOOP, None, None)?;
        self.poll_flag(GowinStatus::SYSTEM_EDIT_MODE, GowinStatus::empty())
    }

    fn erase_sram(&mut self) -> Result<()> {
        self.wr_rd(ERASE_SRAM, None, None)?;
        self.wr_rd(NOOP, None, None)?;
        // MEMORY_ERASE rises once the array is cleared.
        self.poll_flag(GowinStatus::MEMORY_ERASE, GowinStatus::MEMORY_ERASE)
    }

    /// Embedded flash erase. The GW1N-1 wants 65 all-zero words where the
    /// rest of the family needs one; completion is timed, not flagged.
    fn erase_flash(&mut self) -> Result<()> {
        self.wr_rd(EFLASH_ERASE, None, None)?;
        self.jtag.set_state(TapState::RunTestIdle)?;

        let words = if self.is_gw1n1 { 65 } else { 1 };
        let zeros = [0u8; 4];
        for _ in 0..words {
            self.jtag
                .shift_dr(Some(&zeros), None, 32, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(6)?;
        }
        self.jtag.toggle_clk(37_500 * 8)
    }

    /// SRAM load per TN653 2.2.6: XFER_WRITE then the raw stream, with the
    /// fs payload bit-reversed into LSB-first wire order.
    fn program_sram(&mut self, data: &[u8]) -> Result<()> {
        self.enable_cfg()?;
        self.erase_sram()?;

        self.wr_rd(XFER_WRITE, None, None)?;

        self.options.progress.started("Loading SRAM", data.len());
        let mut chunk = [0u8; 256];
        let mut sent = 0usize;
        while sent < data.len() {
            let size = 256.min(data.len() - sent);
            for (dst, src) in chunk[..size].iter_mut().zip(&data[sent..]) {
                *dst = reverse_byte(*src);
            }
            let end = if sent + size == data.len() {
                TapState::Exit1Dr
            } else {
                TapState::ShiftDr
            };
            self.jtag.shift_dr(Some(&chunk[..size]), None, size * 8, end)?;
            sent += size;
            self.options.progress.progressed(sent);
        }
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.options.progress.finished();

        self.wr_rd(XFER_DONE, None, None)?;
        self.poll_flag(GowinStatus::DONE_FINAL, GowinStatus::DONE_FINAL)?;
        self.disable_cfg()
    }

    /// Embedded flash programming: 256-byte pages of sixteen-four-byte
    /// words. Inter-word pacing is 40 clocks except on the GW1N-1, which
    /// instead idles 6008 clocks after each page.
    fn program_embedded_flash(&mut self, data: &[u8]) -> Result<()> {
        self.enable_cfg()?;
        self.erase_flash()?;

        let page_count = data.len().div_ceil(256);
        self.options.progress.started("Writing flash", page_count * 256);

        for page in 0..page_count {
            self.wr_rd(CONFIG_ENABLE, None, None)?;
            self.wr_rd(EF_PROGRAM, None, None)?;
            if page != 0 {
                self.jtag.toggle_clk(312)?;
            }
            let addr = (page as u32) << 6;
            self.jtag
                .shift_dr(Some(&addr.to_le_bytes()), None, 32, TapState::RunTestIdle)?;
            self.jtag.toggle_clk(312)?;

            let base = page * 256;
            let page_len = 256.min(data.len() - base);
            for word in 0..page_len.div_ceil(4) {
                let mut tx = [0xffu8; 4];
                for (i, byte) in tx.iter_mut().enumerate() {
                    if let Some(src) = data.get(base + word * 4 + i) {
                        // Embedded flash wants each 32-bit word sent
                        // most-significant byte first, bits LSB-first.
                        *byte = reverse_byte(*src);
                    }
                }
                tx.reverse();
                self.jtag
                    .shift_dr(Some(&tx), None, 32, TapState::RunTestIdle)?;
                if !self.is_gw1n1 {
                    self.jtag.toggle_clk(40)?;
                }
            }
            if self.is_gw1n1 {
                self.jtag.toggle_clk(6008)?;
            }
            self.options.progress.progressed((page + 1) * 256);
        }
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.options.progress.finished();

        self.disable_cfg()?;
        self.reload()
    }

    /// Hands the JTAG pins to the hard MCU (GW1NS parts).
    pub fn connect_jtag_to_mcu(&mut self) -> Result<()> {
        self.wr_rd(SWITCH_TO_MCU_JTAG, None, None)
    }

    fn reload(&mut self) -> Result<()> {
        self.wr_rd(RELOAD, None, None)?;
        self.wr_rd(NOOP, None, None)?;
        self.jtag.flush()
    }

    // Bit-banged bscan SPI: one DR byte per pin-state change, six idle
    // clocks after each.
    fn bscan_write(&mut self, value: u8, capture: Option<&mut u8>) -> Result<()> {
        let tx = [value];
        match capture {
            Some(slot) => {
                let mut rx = [0u8];
                self.jtag
                    .shift_dr(Some(&tx), Some(&mut rx), 8, TapState::RunTestIdle)?;
                *slot = rx[0];
            }
            None => {
                self.jtag.shift_dr(Some(&tx), None, 8, TapState::RunTestIdle)?;
            }
        }
        self.jtag.toggle_clk(6)
    }

    fn bscan_spi_xfer(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>, len: usize) -> Result<()> {
        let pins = self.pins;

        // CS low, SCK low, DI low.
        let mut t = pins.msk | pins.do_;
        t &= !pins.cs;
        self.bscan_write(t, None)?;
        self.jtag.flush()?;

        let mut rx = rx;
        for bit in 0..len * 8 {
            let mut t = pins.msk | pins.do_;
            if let Some(tx) = tx {
                if tx[bit >> 3] & (1 << (7 - (bit & 7))) != 0 {
                    t |= pins.di;
                }
            }
            self.bscan_write(t, None)?;
            t |= pins.sck;
            let mut sample = 0u8;
            let want_read = rx.is_some();
            self.bscan_write(t, want_read.then_some(&mut sample))?;
            self.jtag.flush()?;
            if let Some(rx) = rx.as_deref_mut() {
                if sample & pins.do_ != 0 {
                    rx[bit >> 3] |= 1 << (7 - (bit & 7));
                } else {
                    rx[bit >> 3] &= !(1 << (7 - (bit & 7)));
                }
            }
        }

        // Deselect, clock parked low.
        let mut t = pins.msk | pins.do_;
        t &= !pins.sck;
        t |= pins.cs;
        self.bscan_write(t, None)?;
        self.jtag.flush()
    }

    fn gw2a_spi_xfer(&mut self, tx: &[u8], rx: Option<&mut [u8]>, len: usize) -> Result<()> {
        let capture = rx.is_some();
        let xfer = if capture { len + 1 } else { len };
        let mut jtx = vec![0u8; xfer];
        for (dst, src) in jtx.iter_mut().zip(tx) {
            *dst = reverse_byte(*src);
        }
        self.wr_rd(GW2A_SPI_XFER, None, None)?;
        self.jtag.set_state(TapState::Exit2Dr)?;
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer];
            self.jtag
                .shift_dr(Some(&jtx), Some(&mut jrx), 8 * xfer, TapState::RunTestIdle)?;
            for i in 0..len {
                rx[i] = reverse_byte(jrx[i] >> 1) | (jrx[i + 1] & 0x01);
            }
        } else {
            self.jtag
                .shift_dr(Some(&jtx), None, 8 * xfer, TapState::RunTestIdle)?;
        }
        Ok(())
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
        result?;
        self.reload()
    }

    fn load(&mut self, path: &Path) -> Result<gowin_fs::FsFile> {
        match FileKind::from_path(path) {
            FileKind::GowinFs => gowin_fs::parse_file(path, self.is_gw2a),
            _ => Ok(gowin_fs::FsFile {
                bitstream: raw::parse_file(path, false)?,
                computed_checksum: 0,
            }),
        }
    }
}

impl Device for Gowin<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        let fs = self.load(path)?;
        let idcode = fs
            .bitstream
            .header_val("IDCODE")
            .and_then(|v| u32::from_str_radix(v.trim_start_matches("0x"), 16).ok());
        check_idcode(idcode, self.selected_idcode())?;
        self.program_sram(&fs.bitstream.data)
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        let fs = self.load(path)?;
        if self.options.external_flash || self.is_gw2a {
            let data: Vec<u8> = fs.bitstream.data.clone();
            self.write_external_flash(&data)
        } else {
            self.erase_sram()?;
            self.program_embedded_flash(&fs.bitstream.data)
        }
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        if !(self.options.external_flash || self.is_gw2a) {
            return Err(Error::SoftFail(
                "embedded flash readback is not exposed by the configuration port".into(),
            ));
        }
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
        self.reload()
    }

    fn reset(&mut self) -> Result<()> {
        self.reload()
    }
}

impl SpiInterface for Gowin<'_> {
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let mut jtx = vec![0u8; len + 1];
        jtx[0] = cmd;
        if let Some(tx) = tx {
            jtx[1..1 + tx.len()].copy_from_slice(tx);
        }
        match rx {
            Some(rx) => {
                let mut jrx = vec![0u8; len + 1];
                self.spi_put_raw(&jtx, Some(&mut jrx))?;
                rx[..len].copy_from_slice(&jrx[1..1 + len]);
            }
            None => self.spi_put_raw(&jtx, None)?,
        }
        Ok(())
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        if self.is_gw2a {
            self.gw2a_spi_xfer(tx, rx, tx.len())
        } else {
            self.bscan_spi_xfer(Some(tx), rx, tx.len())
        }
    }

    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        let mut last = 0u8;
        for _ in 0..timeout {
            let mut rx = [0u8; 1];
            self.spi_put(cmd, None, Some(&mut rx))?;
            last = rx[0];
            if last & mask == cond {
                return Ok(());
            }
        }
        Err(Error::WipTimeout { last_status: last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fpga_by_idcode;
    use crate::probe::mock::{MockHandle, MockTransport};

    fn engine_for(idcode: u32) -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        jtag.insert_first(idcode, 8);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    /// The GW1N-1 erase clocks 65 all-zero words then idles 37500 bytes
    /// worth of cycles.
    #[test]
    fn gw1n1_erase_timing() {
        let (mut jtag, mock) = engine_for(0x0900281b);
        let model = fpga_by_idcode(0x0900281b).unwrap();
        let mut gowin = Gowin::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        assert!(gowin.is_gw1n1);

        gowin.erase_flash().unwrap();

        let m = mock.borrow();
        let erase_words = m
            .tdi_log
            .iter()
            .filter(|op| op.bits == 32 && op.tx.as_deref() == Some(&[0, 0, 0, 0]))
            .count();
        assert_eq!(erase_words, 65);
        assert!(m.clk_log.contains(&(false, false, 37_500 * 8)));
    }

    #[test]
    fn gw1n4_erase_uses_single_word() {
        let (mut jtag, mock) = engine_for(0x0100381b);
        let model = fpga_by_idcode(0x0100381b).unwrap();
        let mut gowin = Gowin::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        assert!(!gowin.is_gw1n1);

        gowin.erase_flash().unwrap();
        let m = mock.borrow();
        let erase_words = m
            .tdi_log
            .iter()
            .filter(|op| op.bits == 32 && op.tx.as_deref() == Some(&[0, 0, 0, 0]))
            .count();
        assert_eq!(erase_words, 1);
    }

    /// Page pacing: GW1N-1 idles 6008 cycles per page instead of 40 per
    /// word.
    #[test]
    fn gw1n1_page_idle() {
        let (mut jtag, mock) = engine_for(0x0900281b);
        let model = fpga_by_idcode(0x0900281b).unwrap();
        {
            // enable_cfg polls the status register once.
            let mut m = mock.borrow_mut();
            m.queue_read(&GowinStatus::SYSTEM_EDIT_MODE.bits().to_le_bytes());
            // disable_cfg poll.
        }
        let mut gowin = Gowin::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        gowin.enable_cfg().unwrap();
        // Bypass the status-driven wrappers and drive one page directly.
        gowin.wr_rd(EF_PROGRAM, None, None).unwrap();
        let data = [0x12u8; 256];
        let base = 0usize;
        for word in 0..64 {
            let mut tx = [0u8; 4];
            for (i, byte) in tx.iter_mut().enumerate() {
                *byte = reverse_byte(data[base + word * 4 + i]);
            }
            tx.reverse();
            gowin
                .jtag
                .shift_dr(Some(&tx), None, 32, TapState::RunTestIdle)
                .unwrap();
        }
        gowin.jtag.toggle_clk(6008).unwrap();
        assert!(mock.borrow().clk_log.contains(&(false, false, 6008)));
    }

    #[test]
    fn gw1nsr4c_uses_alternate_bscan_pins() {
        let (mut jtag, _mock) = engine_for(0x0100981b);
        let model = fpga_by_idcode(0x0100981b).unwrap();
        let gowin = Gowin::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        assert_eq!(gowin.pins.sck, 1 << 7);
        assert_eq!(gowin.pins.do_, 1 << 1);
    }

    /// GW2A tunnel applies the shift-right-one realignment.
    #[test]
    fn gw2a_read_realignment() {
        let (mut jtag, mock) = engine_for(0x0000081b);
        let model = fpga_by_idcode(0x0000081b).unwrap();
        let mut gowin = Gowin::new(&mut jtag, model, DeviceOptions::default()).unwrap();
        assert!(gowin.is_gw2a);

        // One response byte 0xa5 MSB-first, one bit of pipeline delay:
        // wire bits = [0] ++ [1,0,1,0,0,1,0,1] packed LSB-first.
        let mut wire = [0u8; 2];
        for (j, bit) in [1u8, 0, 1, 0, 0, 1, 0, 1].iter().enumerate() {
            if *bit != 0 {
                crate::util::bit_set(&mut wire, 1 + j, true);
            }
        }
        mock.borrow_mut().queue_read(&wire);

        let mut rx = [0u8; 1];
        gowin.gw2a_spi_xfer(&[0x00], Some(&mut rx), 1).unwrap();
        assert_eq!(rx[0], 0xa5);
    }
}
