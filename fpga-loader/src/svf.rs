//! SVF player: executes parsed statements against the JTAG engine.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::jtag::{Jtag, TapState};
use crate::parser::svf::{SvfShift, SvfStatement};
use crate::util::{bit_get, bit_set};

/// Player state: end-state defaults and header/trailer paddings carried
/// between statements.
pub struct SvfPlayer<'a> {
    jtag: &'a mut Jtag,
    end_dr: TapState,
    end_ir: TapState,
    hdr: SvfShift,
    hir: SvfShift,
    tdr: SvfShift,
    tir: SvfShift,
}

fn append_bits(dst: &mut Vec<u8>, dst_bits: &mut usize, src: Option<&[u8]>, bits: usize, fill: bool) {
    dst.resize((*dst_bits + bits).div_ceil(8), 0);
    for i in 0..bits {
        let bit = match src {
            Some(src) => bit_get(src, i),
            None => fill,
        };
        bit_set(dst, *dst_bits + i, bit);
        *dst_bits += 1;
    }
}

impl<'a> SvfPlayer<'a> {
    /// Creates a player over an engine whose chain is already configured.
    pub fn new(jtag: &'a mut Jtag) -> Self {
        Self {
            jtag,
            end_dr: TapState::RunTestIdle,
            end_ir: TapState::RunTestIdle,
            hdr: SvfShift::default(),
            hir: SvfShift::default(),
            tdr: SvfShift::default(),
            tir: SvfShift::default(),
        }
    }

    /// Executes a full statement list.
    pub fn run(&mut self, statements: &[SvfStatement]) -> Result<()> {
        for statement in statements {
            self.execute(statement)?;
        }
        self.jtag.flush()
    }

    /// Executes one statement.
    pub fn execute(&mut self, statement: &SvfStatement) -> Result<()> {
        match statement {
            SvfStatement::Frequency(hz) => {
                if let Some(hz) = hz {
                    self.jtag.set_clock(*hz as u32)?;
                }
            }
            SvfStatement::Trst(mode) => {
                if mode != "OFF" && mode != "ABSENT" && mode != "Z" {
                    return Err(Error::SoftFail(format!("TRST {mode} not driven")));
                }
            }
            SvfStatement::EndDr(state) => self.end_dr = *state,
            SvfStatement::EndIr(state) => self.end_ir = *state,
            SvfStatement::Hdr(shift) => self.hdr = shift.clone(),
            SvfStatement::Hir(shift) => self.hir = shift.clone(),
            SvfStatement::Tdr(shift) => self.tdr = shift.clone(),
            SvfStatement::Tir(shift) => self.tir = shift.clone(),
            SvfStatement::State(states) => {
                for state in states {
                    if *state == TapState::TestLogicReset {
                        self.jtag.go_test_logic_reset()?;
                    } else {
                        self.jtag.set_state(*state)?;
                    }
                }
            }
            SvfStatement::RunTest {
                run_count,
                min_time,
                end_state,
            } => {
                if let Some(count) = run_count {
                    let mut remaining = *count;
                    while remaining > 0 {
                        let chunk = remaining.min(u32::MAX as u64) as u32;
                        self.jtag.toggle_clk(chunk)?;
                        remaining -= chunk as u64;
                    }
                }
                if let Some(seconds) = min_time {
                    self.jtag.flush()?;
                    std::thread::sleep(Duration::from_secs_f64(*seconds));
                }
                if let Some(state) = end_state {
                    self.jtag.set_state(*state)?;
                }
            }
            SvfStatement::Sir(shift) => {
                let (header, trailer) = (self.hir.clone(), self.tir.clone());
                self.scan(shift, &header, &trailer, true)?;
            }
            SvfStatement::Sdr(shift) => {
                let (header, trailer) = (self.hdr.clone(), self.tdr.clone());
                self.scan(shift, &header, &trailer, false)?;
            }
        }
        Ok(())
    }

    fn scan(
        &mut self,
        shift: &SvfShift,
        header: &SvfShift,
        trailer: &SvfShift,
        is_ir: bool,
    ) -> Result<()> {
        let mut tx = Vec::new();
        let mut bits = 0usize;
        // Header bits are transmitted first and land nearest TDO; padding
        // defaults to all-ones (BYPASS-friendly).
        append_bits(&mut tx, &mut bits, header.tdi.as_deref(), header.bits, true);
        let payload_start = bits;
        append_bits(&mut tx, &mut bits, shift.tdi.as_deref(), shift.bits, true);
        append_bits(&mut tx, &mut bits, trailer.tdi.as_deref(), trailer.bits, true);

        let capture = shift.tdo.is_some();
        let mut rx = vec![0u8; tx.len()];

        if is_ir {
            self.jtag
                .shift_ir(&tx, capture.then_some(rx.as_mut_slice()), bits, self.end_ir)?;
        } else {
            self.jtag.shift_dr(
                Some(&tx),
                capture.then_some(rx.as_mut_slice()),
                bits,
                self.end_dr,
            )?;
        }

        if let Some(expected) = &shift.tdo {
            for i in 0..shift.bits {
                let care = shift
                    .mask
                    .as_deref()
                    .map(|m| bit_get(m, i))
                    .unwrap_or(true);
                if !care {
                    continue;
                }
                let got = bit_get(&rx, payload_start + i);
                let want = bit_get(expected, i);
                if got != want {
                    return Err(Error::VerifyMismatch {
                        offset: (i / 8) as u32,
                        expected: expected[i / 8],
                        actual: rx[(payload_start + i) / 8],
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::svf;
    use crate::probe::mock::MockTransport;

    fn single_device_engine() -> (Jtag, crate::probe::mock::MockHandle) {
        let probe = MockTransport::new();
        let handle = probe.handle();
        let mut jtag = Jtag::new(Box::new(probe));
        jtag.insert_first(0x1, 10);
        jtag.device_select(0).unwrap();
        (jtag, handle)
    }

    #[test]
    fn plays_ir_shift_and_runtest() {
        let (mut jtag, mock) = single_device_engine();
        let statements = svf::parse(
            b"ENDIR IDLE;\nSIR 10 TDI (002);\nRUNTEST IDLE 100 TCK ENDSTATE IDLE;\n",
        )
        .unwrap();
        SvfPlayer::new(&mut jtag).run(&statements).unwrap();

        let m = mock.borrow();
        // 10 IR bits on the wire, value 0x002 LSB-first: bit 1 set.
        assert_eq!(m.tdi_bits.len(), 10);
        assert!(m.tdi_bits[1]);
        assert!(!m.tdi_bits[0]);
        assert_eq!(m.clk_log, vec![(false, false, 100)]);
    }

    #[test]
    fn tdo_mismatch_is_fatal() {
        let (mut jtag, mock) = single_device_engine();
        // Engine will read zeros from the mock queue.
        mock.borrow_mut().queue_read(&[0x00]);
        let statements = svf::parse(b"SDR 8 TDI (00) TDO (55) MASK (FF);\n").unwrap();
        let err = SvfPlayer::new(&mut jtag).run(&statements).unwrap_err();
        assert!(matches!(err, Error::VerifyMismatch { .. }));
    }

    #[test]
    fn masked_tdo_compare_passes() {
        let (mut jtag, _mock) = single_device_engine();
        let statements = svf::parse(b"SDR 8 TDI (00) TDO (55) MASK (00);\n").unwrap();
        SvfPlayer::new(&mut jtag).run(&statements).unwrap();
    }
}
