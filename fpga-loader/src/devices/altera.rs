//! Intel/Altera driver: Cyclone SRAM load, external flash through the
//! virtual-JTAG serial-flash loader, and MAX10 on-chip CFM/UFM from POF
//! images.
//!
//! Virtual JTAG indirection: `USER1` updates a virtual IR (address plus
//! opcode), `USER0` moves virtual DR data. Reads carry the usual one-bit
//! bscan pipeline, corrected by shifting right and borrowing the next
//! byte's LSB.

use std::path::Path;

use super::{Device, DeviceOptions};
use crate::config::FpgaModel;
use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::{pof, raw, svf, FileKind};
use crate::spi::{SpiFlash, SpiInterface};
use crate::svf::SvfPlayer;
use crate::util::reverse_byte;

const IRLENGTH: usize = 10;
// 10-bit instructions, low byte first on the wire.
const PULSE_NCONFIG: u16 = 0x001;
const CONFIG: u16 = 0x002;
const STARTUP: u16 = 0x004;
const USER0: u16 = 0x00c;
const USER1: u16 = 0x00e;

// MAX10 in-system configuration opcodes (DSM flow).
const ISC_ENABLE: u16 = 0x2cc;
const ISC_DISABLE: u16 = 0x201;
const ISC_PROGRAM: u16 = 0x2f4;
const ISC_ERASE: u16 = 0x2f2;
const ISC_ADDRESS_SHIFT: u16 = 0x203;
const ISC_READ: u16 = 0x205;

/// Driver for Cyclone and MAX10 devices.
pub struct Altera<'a> {
    jtag: &'a mut Jtag,
    model: &'static FpgaModel,
    options: DeviceOptions,
    /// Virtual IR address of the serial-flash-loader slave.
    vir_addr: u32,
    /// Virtual IR length in bits.
    vir_length: usize,
}

impl<'a> Altera<'a> {
    /// Prepares a driver for the selected chain device.
    pub fn new(
        jtag: &'a mut Jtag,
        model: &'static FpgaModel,
        options: DeviceOptions,
    ) -> Result<Self> {
        Ok(Self {
            jtag,
            model,
            options,
            vir_addr: 0x1000,
            vir_length: 14,
        })
    }

    fn is_max10(&self) -> bool {
        self.model.family.starts_with("MAX 10")
    }

    fn shift_ir16(&mut self, op: u16, end: TapState) -> Result<()> {
        let tx = op.to_le_bytes();
        self.jtag.shift_ir(&tx, None, IRLENGTH, end)
    }

    /// One millisecond worth of idle clocks at the current TCK rate.
    fn idle_ns(&mut self, ns: u64) -> Result<()> {
        let cycles = ((self.jtag.clock_frequency() as u64 * ns) / 1_000_000_000).max(1);
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.jtag.toggle_clk(cycles as u32)
    }

    /// Loads SRAM through CONFIG/STARTUP, streaming the raw image.
    fn program_mem(&mut self, data: &[u8]) -> Result<()> {
        self.shift_ir16(CONFIG, TapState::PauseIr)?;
        self.idle_ns(1_000_000)?;

        self.options.progress.started("Loading SRAM", data.len());
        let mut sent = 0usize;
        while sent < data.len() {
            let size = 512.min(data.len() - sent);
            let end = if sent + size == data.len() {
                TapState::Exit1Dr
            } else {
                TapState::ShiftDr
            };
            self.jtag
                .shift_dr(Some(&data[sent..sent + size]), None, size * 8, end)?;
            sent += size;
            self.options.progress.progressed(sent);
        }
        self.options.progress.finished();

        self.shift_ir16(STARTUP, TapState::PauseIr)?;
        self.idle_ns(5_000)?;
        self.jtag.go_test_logic_reset()
    }

    /// Updates the virtual IR: the slave address ORed over the masked
    /// opcode, shifted through `USER1`.
    fn shift_vir(&mut self, reg: u32) -> Result<()> {
        let mask = (1u32 << self.vir_length) - 1;
        let value = (reg & mask) | self.vir_addr;
        let tx = value.to_le_bytes();
        self.jtag.set_state(TapState::RunTestIdle)?;
        self.shift_ir16(USER1, TapState::UpdateIr)?;
        self.jtag
            .shift_dr(Some(&tx), None, self.vir_length, TapState::UpdateDr)
    }

    /// Moves virtual DR data through `USER0`.
    fn shift_vdr(
        &mut self,
        tx: Option<&[u8]>,
        rx: Option<&mut [u8]>,
        bits: usize,
        end: TapState,
    ) -> Result<()> {
        self.shift_ir16(USER0, TapState::UpdateIr)?;
        self.jtag.shift_dr(tx, rx, bits, end)
    }

    // -- MAX10 on-chip flash ----------------------------------------------

    fn max10_enable(&mut self) -> Result<()> {
        self.shift_ir16(ISC_ENABLE, TapState::RunTestIdle)?;
        self.idle_ns(1_000_000)
    }

    fn max10_disable(&mut self) -> Result<()> {
        self.shift_ir16(ISC_DISABLE, TapState::RunTestIdle)?;
        self.idle_ns(1_000_000)?;
        self.jtag.go_test_logic_reset()
    }

    fn max10_set_address(&mut self, addr: u32) -> Result<()> {
        self.shift_ir16(ISC_ADDRESS_SHIFT, TapState::RunTestIdle)?;
        self.jtag
            .shift_dr(Some(&addr.to_le_bytes()), None, 23, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)
    }

    /// Erases the sectors covering the sections we are about to write.
    fn max10_erase(&mut self, addresses: &[u32]) -> Result<()> {
        for addr in addresses {
            self.max10_set_address(*addr)?;
            self.shift_ir16(ISC_ERASE, TapState::RunTestIdle)?;
            // tERASE for a CFM sector is up to 350 ms.
            self.idle_ns(350_000_000)?;
        }
        Ok(())
    }

    /// Writes one section word by word; MAX10 programs in 32-bit units.
    fn max10_program_section(&mut self, base_word: u32, data: &[u8]) -> Result<()> {
        self.max10_set_address(base_word)?;
        for word in data.chunks(4) {
            let mut tx = [0xffu8; 4];
            tx[..word.len()].copy_from_slice(word);
            self.shift_ir16(ISC_PROGRAM, TapState::RunTestIdle)?;
            self.jtag
                .shift_dr(Some(&tx), None, 32, TapState::RunTestIdle)?;
            self.idle_ns(350_000)?;
        }
        Ok(())
    }

    fn max10_verify_section(&mut self, base_word: u32, data: &[u8]) -> Result<()> {
        self.max10_set_address(base_word)?;
        self.shift_ir16(ISC_READ, TapState::RunTestIdle)?;
        for (i, word) in data.chunks(4).enumerate() {
            let mut rx = [0u8; 4];
            self.jtag
                .shift_dr(None, Some(&mut rx), 32, TapState::RunTestIdle)?;
            for (j, byte) in word.iter().enumerate() {
                if rx[j] != *byte {
                    return Err(Error::VerifyMismatch {
                        offset: base_word * 4 + (i * 4 + j) as u32,
                        expected: *byte,
                        actual: rx[j],
                    });
                }
            }
        }
        Ok(())
    }

    /// CFM/UFM programming driven by the POF section map.
    fn max10_program(&mut self, pof: &pof::PofFile) -> Result<()> {
        if pof.sections.is_empty() {
            return Err(Error::Parse("POF carries no section map".into()));
        }

        self.max10_enable()?;

        let bases: Vec<u32> = pof
            .sections
            .values()
            .map(|s| (s.bit_offset / 32) as u32)
            .collect();
        self.max10_erase(&bases)?;

        let total: usize = pof
            .sections
            .values()
            .map(|s| (s.bit_length as usize) / 8)
            .sum();
        self.options.progress.started("Writing CFM/UFM", total);

        let mut written = 0usize;
        let names: Vec<String> = pof.sections.keys().cloned().collect();
        for name in names {
            let section = pof.sections[&name];
            let Some(data) = pof.section_data(&name).map(|d| d.to_vec()) else {
                continue;
            };
            tracing::info!("section {name}: {} bytes", data.len());
            let base_word = (section.bit_offset / 32) as u32;
            self.max10_program_section(base_word, &data)?;
            if self.options.verify {
                self.max10_verify_section(base_word, &data)?;
            }
            written += data.len();
            self.options.progress.progressed(written);
        }
        self.options.progress.finished();

        self.max10_disable()
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
        self.reset()
    }
}

impl Device for Altera<'_> {
    fn write_sram(&mut self, path: &Path) -> Result<()> {
        match FileKind::from_path(path) {
            FileKind::Svf => {
                let statements = svf::parse_file(path)?;
                SvfPlayer::new(self.jtag).run(&statements)
            }
            _ => {
                let bit = raw::parse_file(path, false)?;
                self.program_mem(&bit.data)
            }
        }
    }

    fn write_flash(&mut self, path: &Path) -> Result<()> {
        if self.is_max10() {
            let pof = pof::parse_file(path)?;
            if let Some(part) = pof.bitstream.header_val("part") {
                if !part
                    .to_ascii_uppercase()
                    .starts_with(&self.model.model.to_ascii_uppercase())
                {
                    tracing::warn!("POF built for {part}, chain reports {}", self.model.model);
                }
            }
            return self.max10_program(&pof);
        }
        // rbf/rpd images are LSB-first on disk.
        let reverse = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "rbf" | "rpd"));
        let bit = raw::parse_file(path, reverse)?;
        self.write_external_flash(&bit.data)
    }

    fn dump_flash(&mut self, output: &Path, offset: u32, len: u32) -> Result<()> {
        if self.is_max10() {
            return Err(Error::SoftFail(
                "MAX10 CFM/UFM readback is not supported".into(),
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
        self.reset()
    }

    /// `PULSE_NCONFIG` restarts configuration from the active source.
    fn reset(&mut self) -> Result<()> {
        self.jtag.set_state(TapState::TestLogicReset)?;
        self.shift_ir16(PULSE_NCONFIG, TapState::RunTestIdle)?;
        self.jtag.toggle_clk(1)?;
        self.jtag.set_state(TapState::TestLogicReset)?;
        self.jtag.flush()
    }
}

impl SpiInterface for Altera<'_> {
    /// The flash opcode travels in the virtual IR; payload bytes are
    /// bit-reversed through the virtual DR with one response byte of
    /// pipeline slack.
    fn spi_put(&mut self, cmd: u8, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<()> {
        let len = tx.map(|t| t.len()).or(rx.as_ref().map(|r| r.len())).unwrap_or(0);
        let has_rx = rx.is_some();
        let xfer_len = len + 1 + usize::from(has_rx);

        let mut jtx = vec![0u8; xfer_len];
        if let Some(tx) = tx {
            for (dst, src) in jtx.iter_mut().zip(tx) {
                *dst = reverse_byte(*src);
            }
        }

        self.shift_vir(reverse_byte(cmd) as u32)?;
        if let Some(rx) = rx {
            let mut jrx = vec![0u8; xfer_len];
            self.shift_vdr(Some(&jtx), Some(&mut jrx), 8 * xfer_len, TapState::RunTestIdle)?;
            for i in 0..len {
                rx[i] = reverse_byte(jrx[i + 1] >> 1) | (jrx[i + 2] & 0x01);
            }
        } else {
            self.shift_vdr(Some(&jtx), None, 8 * xfer_len, TapState::RunTestIdle)?;
        }
        Ok(())
    }

    fn spi_put_raw(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        match rx {
            Some(rx) => {
                let mut tail = vec![0u8; rx.len()];
                self.spi_put(tx[0], Some(&tx[1..]), Some(&mut tail))?;
                rx.copy_from_slice(&tail);
                Ok(())
            }
            None => self.spi_put(tx[0], Some(&tx[1..]), None),
        }
    }

    /// Status polling stays inside one virtual DR scan, sampling 16 bits
    /// per iteration after the initial 24-bit priming read.
    fn spi_wait(&mut self, cmd: u8, mask: u8, cond: u8, timeout: u32) -> Result<()> {
        self.shift_vir(reverse_byte(cmd) as u32)?;

        let mut status;
        let mut rx = [0u8; 3];
        self.shift_vdr(None, Some(&mut rx), 24, TapState::ShiftDr)?;
        status = reverse_byte(rx[1] >> 1) | (rx[2] & 0x01);

        let mut ok = status & mask == cond;
        let mut iterations = 0u32;
        while !ok && iterations < timeout {
            let mut rx2 = [0u8; 2];
            self.jtag
                .shift_dr(None, Some(&mut rx2), 16, TapState::ShiftDr)?;
            status = reverse_byte(rx2[0] >> 1) | (rx2[1] & 0x01);
            ok = status & mask == cond;
            iterations += 1;
        }
        self.jtag.set_state(TapState::UpdateDr)?;

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

    fn engine() -> (Jtag, MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        jtag.insert_first(0x020f30dd, 10);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    /// VIR update packs the slave address over the masked opcode.
    #[test]
    fn vir_packs_address_and_opcode() {
        let (mut jtag, mock) = engine();
        let model = fpga_by_idcode(0x020f30dd).unwrap();
        let mut altera = Altera::new(&mut jtag, model, DeviceOptions::default()).unwrap();

        altera.shift_vir(0x05).unwrap();

        let m = mock.borrow();
        // The last 14-bit DR write carries 0x1000 | 0x05.
        let vir = m
            .tdi_log
            .iter()
            .rev()
            .find(|op| op.bits == 14)
            .expect("VIR write missing");
        let bytes = vir.tx.as_ref().unwrap();
        let value = u16::from_le_bytes([bytes[0], bytes[1]]) & 0x3fff;
        assert_eq!(value, 0x1005);
    }

    /// The virtual-JTAG read realignment recovers MSB-first bytes.
    #[test]
    fn vdr_read_realignment() {
        let (mut jtag, mock) = engine();
        let model = fpga_by_idcode(0x020f30dd).unwrap();
        let mut altera = Altera::new(&mut jtag, model, DeviceOptions::default()).unwrap();

        // Response 0x3b with the one-bit delay: wire bits 9..16 hold the
        // byte MSB-first inside a 3-byte transfer (cmd + data + slack).
        let mut wire = [0u8; 3];
        for (j, bit) in [0u8, 0, 1, 1, 1, 0, 1, 1].iter().enumerate() {
            if *bit != 0 {
                crate::util::bit_set(&mut wire, 8 + 1 + j, true);
            }
        }
        mock.borrow_mut().queue_read(&wire);

        let mut rx = [0u8; 1];
        altera.spi_put(0xab, None, Some(&mut rx)).unwrap();
        assert_eq!(rx[0], 0x3b);
    }
}
