//! SVF statement parser.
//!
//! Statements are `;`-terminated, with `!` and `//` line comments.
//! Shift arguments carry parenthesized hex, MSB-first at the character
//! level; they decode to LSB-first byte buffers ready for the engine.

use std::path::Path;

use super::parse_err;
use crate::error::Result;
use crate::jtag::TapState;
use crate::util::read_maybe_gz;

/// Payload of an `SIR`/`SDR`/header/trailer statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SvfShift {
    /// Vector length in bits.
    pub bits: usize,
    /// Bits to shift in.
    pub tdi: Option<Vec<u8>>,
    /// Expected capture.
    pub tdo: Option<Vec<u8>>,
    /// Care mask applied to `tdo`.
    pub mask: Option<Vec<u8>>,
    /// Care mask applied to `tdi` (unused by the player, kept for fidelity).
    pub smask: Option<Vec<u8>>,
}

/// One parsed SVF statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SvfStatement {
    /// Shift instruction register.
    Sir(SvfShift),
    /// Shift data register.
    Sdr(SvfShift),
    /// Header/trailer paddings.
    Hdr(SvfShift),
    /// Header IR padding.
    Hir(SvfShift),
    /// Trailer DR padding.
    Tdr(SvfShift),
    /// Trailer IR padding.
    Tir(SvfShift),
    /// Clock activity: `RUNTEST [run_state] run_count TCK [min_time SEC] [ENDSTATE state]`.
    RunTest {
        /// TCK cycles to run, when given.
        run_count: Option<u64>,
        /// Minimum wall time in seconds, when given.
        min_time: Option<f64>,
        /// State to finish in.
        end_state: Option<TapState>,
    },
    /// Walk through the listed stable states.
    State(Vec<TapState>),
    /// Default end state for DR shifts.
    EndDr(TapState),
    /// Default end state for IR shifts.
    EndIr(TapState),
    /// TCK frequency in Hz (absent = unconstrained).
    Frequency(Option<f64>),
    /// TRST line control; only `OFF`/`ABSENT` are accepted.
    Trst(String),
}

fn state_by_name(name: &str) -> Result<TapState> {
    Ok(match name.to_ascii_uppercase().as_str() {
        "RESET" => TapState::TestLogicReset,
        "IDLE" => TapState::RunTestIdle,
        "DRSELECT" => TapState::SelectDrScan,
        "DRCAPTURE" => TapState::CaptureDr,
        "DRSHIFT" => TapState::ShiftDr,
        "DREXIT1" => TapState::Exit1Dr,
        "DRPAUSE" => TapState::PauseDr,
        "DREXIT2" => TapState::Exit2Dr,
        "DRUPDATE" => TapState::UpdateDr,
        "IRSELECT" => TapState::SelectIrScan,
        "IRCAPTURE" => TapState::CaptureIr,
        "IRSHIFT" => TapState::ShiftIr,
        "IREXIT1" => TapState::Exit1Ir,
        "IRPAUSE" => TapState::PauseIr,
        "IREXIT2" => TapState::Exit2Ir,
        "IRUPDATE" => TapState::UpdateIr,
        other => return Err(parse_err(format!("unknown SVF state {other:?}"))),
    })
}

/// Decodes MSB-first hex characters into an LSB-first byte buffer sized
/// for `bits`.
fn parse_hex(hex: &str, bits: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; bits.div_ceil(8)];
    let digits: Vec<u8> = hex
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    for (i, digit) in digits.iter().rev().enumerate() {
        let nibble = match digit {
            b'0'..=b'9' => digit - b'0',
            b'a'..=b'f' => digit - b'a' + 10,
            b'A'..=b'F' => digit - b'A' + 10,
            other => return Err(parse_err(format!("bad hex digit {:?}", *other as char))),
        };
        let bit_base = 4 * i;
        if bit_base >= bits {
            if nibble != 0 {
                return Err(parse_err("hex value wider than the declared bit count"));
            }
            continue;
        }
        let avail = bits - bit_base;
        if avail < 4 && (nibble >> avail) != 0 {
            return Err(parse_err("hex value wider than the declared bit count"));
        }
        out[i / 2] |= nibble << (4 * (i & 1));
    }
    Ok(out)
}

fn parse_shift(args: &str) -> Result<SvfShift> {
    let mut shift = SvfShift::default();
    let mut rest = args.trim();

    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    shift.bits = rest[..end]
        .parse()
        .map_err(|_| parse_err("missing SVF vector length"))?;
    rest = rest[end..].trim_start();

    while !rest.is_empty() {
        let open = rest
            .find('(')
            .ok_or_else(|| parse_err("expected '(' in SVF argument"))?;
        let keyword = rest[..open].trim().to_ascii_uppercase();
        let close = rest
            .find(')')
            .ok_or_else(|| parse_err("unterminated SVF argument"))?;
        let value = parse_hex(&rest[open + 1..close], shift.bits)?;
        match keyword.as_str() {
            "TDI" => shift.tdi = Some(value),
            "TDO" => shift.tdo = Some(value),
            "MASK" => shift.mask = Some(value),
            "SMASK" => shift.smask = Some(value),
            other => return Err(parse_err(format!("unknown SVF argument {other:?}"))),
        }
        rest = rest[close + 1..].trim_start();
    }
    Ok(shift)
}

fn parse_runtest(args: &str) -> Result<SvfStatement> {
    let words: Vec<&str> = args.split_whitespace().collect();
    let mut run_count = None;
    let mut min_time = None;
    let mut end_state = None;

    let mut i = 0;
    while i < words.len() {
        let word = words[i].to_ascii_uppercase();
        match word.as_str() {
            "TCK" | "SCK" => i += 1,
            "SEC" => i += 1,
            "ENDSTATE" => {
                let state = words
                    .get(i + 1)
                    .ok_or_else(|| parse_err("RUNTEST ENDSTATE needs a state"))?;
                end_state = Some(state_by_name(state)?);
                i += 2;
            }
            "MAXIMUM" => i += 2,
            _ => {
                if let Ok(n) = words[i].parse::<u64>() {
                    // A count followed by TCK, or a time followed by SEC.
                    if words
                        .get(i + 1)
                        .is_some_and(|w| w.eq_ignore_ascii_case("SEC"))
                    {
                        min_time = Some(n as f64);
                    } else {
                        run_count = Some(n);
                    }
                } else if let Ok(t) = words[i].parse::<f64>() {
                    min_time = Some(t);
                } else {
                    // A leading run state name.
                    state_by_name(words[i])?;
                }
                i += 1;
            }
        }
    }
    Ok(SvfStatement::RunTest {
        run_count,
        min_time,
        end_state,
    })
}

/// Parses an SVF text into statements.
pub fn parse(raw: &[u8]) -> Result<Vec<SvfStatement>> {
    let text = String::from_utf8_lossy(raw);
    // Strip comments line by line, then split on ';'.
    let mut clean = String::with_capacity(text.len());
    for line in text.lines() {
        let line = match (line.find('!'), line.find("//")) {
            (Some(a), Some(b)) => &line[..a.min(b)],
            (Some(a), None) => &line[..a],
            (None, Some(b)) => &line[..b],
            (None, None) => line,
        };
        clean.push_str(line);
        clean.push('\n');
    }

    let mut statements = Vec::new();
    for stmt in clean.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        let (keyword, args) = stmt.split_once(char::is_whitespace).unwrap_or((stmt, ""));
        let statement = match keyword.to_ascii_uppercase().as_str() {
            "SIR" => SvfStatement::Sir(parse_shift(args)?),
            "SDR" => SvfStatement::Sdr(parse_shift(args)?),
            "HDR" => SvfStatement::Hdr(parse_shift(args)?),
            "HIR" => SvfStatement::Hir(parse_shift(args)?),
            "TDR" => SvfStatement::Tdr(parse_shift(args)?),
            "TIR" => SvfStatement::Tir(parse_shift(args)?),
            "RUNTEST" => parse_runtest(args)?,
            "STATE" => SvfStatement::State(
                args.split_whitespace()
                    .map(state_by_name)
                    .collect::<Result<_>>()?,
            ),
            "ENDDR" => SvfStatement::EndDr(state_by_name(args.trim())?),
            "ENDIR" => SvfStatement::EndIr(state_by_name(args.trim())?),
            "FREQUENCY" => {
                let hz = args
                    .split_whitespace()
                    .next()
                    .map(|w| {
                        w.parse::<f64>()
                            .map_err(|_| parse_err("bad FREQUENCY value"))
                    })
                    .transpose()?;
                SvfStatement::Frequency(hz)
            }
            "TRST" => SvfStatement::Trst(args.trim().to_ascii_uppercase()),
            other => return Err(parse_err(format!("unknown SVF statement {other:?}"))),
        };
        statements.push(statement);
    }
    Ok(statements)
}

/// Loads and parses an `.svf` file.
pub fn parse_file(path: &Path) -> Result<Vec<SvfStatement>> {
    parse(&read_maybe_gz(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sir_with_hex_arguments() {
        let svf = b"! comment\nSIR 10 TDI (002) SMASK (3FF);\n";
        let statements = parse(svf).unwrap();
        assert_eq!(statements.len(), 1);
        match &statements[0] {
            SvfStatement::Sir(shift) => {
                assert_eq!(shift.bits, 10);
                assert_eq!(shift.tdi.as_deref(), Some(&[0x02, 0x00][..]));
                assert_eq!(shift.smask.as_deref(), Some(&[0xff, 0x03][..]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runtest_forms() {
        let statements =
            parse(b"RUNTEST IDLE 12000 TCK ENDSTATE IDLE;\nRUNTEST 1E-2 SEC;\n").unwrap();
        assert_eq!(
            statements[0],
            SvfStatement::RunTest {
                run_count: Some(12000),
                min_time: None,
                end_state: Some(TapState::RunTestIdle),
            }
        );
        match statements[1] {
            SvfStatement::RunTest { min_time, .. } => assert_eq!(min_time, Some(0.01)),
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn state_and_end_statements() {
        let statements = parse(b"STATE RESET IDLE;\nENDDR DRPAUSE;\nENDIR IRPAUSE;\n").unwrap();
        assert_eq!(
            statements[0],
            SvfStatement::State(vec![TapState::TestLogicReset, TapState::RunTestIdle])
        );
        assert_eq!(statements[1], SvfStatement::EndDr(TapState::PauseDr));
        assert_eq!(statements[2], SvfStatement::EndIr(TapState::PauseIr));
    }

    #[test]
    fn hex_wider_than_bits_is_rejected() {
        assert!(parse(b"SDR 4 TDI (FF);").is_err());
    }
}
