//! Lattice `.bit` decoder (ECP5, Nexus, MachXO2/3 and ECP3 variants).
//!
//! Layout: optional `LSCC` magic, a `0xff 0x00` comment marker, NUL
//! terminated `key: value` header lines, then the preamble (`0xff 0xff`
//! dummy bits plus key `0xbd/0xbf/0xbe` and `0xb3`) followed by the
//! configuration command stream. The target IDCODE is carried inside the
//! command stream by `VERIFY_ID` (0xE2), or byte-reversed by the ECP3-era
//! 0x47 instruction.

use std::path::Path;

use super::{parse_err, Bitstream};
use crate::error::Result;
use crate::util::{read_maybe_gz, reverse_byte};

const LSC_WRITE_COMP_DIC: u8 = 0x02;
const LSC_PROG_CNTRL0: u8 = 0x22;
const LSC_RESET_CRC: u8 = 0x3b;
const LSC_INIT_ADDRESS: u8 = 0x46;
const LSC_SPI_MODE: u8 = 0x79;
const LSC_PROG_INCR_CMP: u8 = 0xb8;
const LSC_PROG_INCR_RTI: u8 = 0x82;
const VERIFY_ID: u8 = 0xe2;
const ECP3_VERIFY_ID: u8 = 0x47;
const BYPASS: u8 = 0xff;

/// Which family conventions to apply while decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatticeBitOptions {
    /// MachXO2/XO3 flash mode: payload re-cut into bit-reversed 16-byte
    /// flash frames.
    pub machxo2: bool,
    /// ECP3 wants 112 bits of one-padding ahead of the preamble.
    pub ecp3: bool,
}

/// A decoded Lattice bitstream; `frames` is populated in MachXO2 mode.
#[derive(Debug, Default)]
pub struct LatticeBit {
    /// Common container; `data` holds the raw stream in non-XO2 modes.
    pub bitstream: Bitstream,
    /// 16-byte bit-reversed flash frames (MachXO2/XO3 internal flash).
    pub frames: Vec<[u8; 16]>,
}

fn find(raw: &[u8], from: usize, byte: u8) -> Option<usize> {
    raw[from..].iter().position(|b| *b == byte).map(|p| p + from)
}

/// Parses a Lattice `.bit` image.
pub fn parse(raw: &[u8], options: LatticeBitOptions) -> Result<LatticeBit> {
    let mut out = LatticeBit::default();
    let mut pos = 0usize;

    if raw.first() == Some(&b'L') {
        if raw.get(..4) != Some(b"LSCC".as_slice()) {
            return Err(parse_err("bad LSCC magic"));
        }
        pos += 4;
    }
    if raw.get(pos) != Some(&0xff) || raw.get(pos + 1) != Some(&0x00) {
        return Err(parse_err("missing comment marker"));
    }
    let comment_start = pos + 2;

    // The preamble key sits right before the 0xb3 byte that follows the
    // padding run; MachXO3D images carry extra 0xff bytes first.
    let after_comments =
        find(raw, comment_start, 0xff).ok_or_else(|| parse_err("preamble not found"))?;
    let key_pos = find(raw, after_comments, 0xb3).ok_or_else(|| parse_err("preamble key not found"))?;
    let key = raw
        .get(key_pos.wrapping_sub(1))
        .copied()
        .ok_or_else(|| parse_err("truncated preamble"))?;
    if !matches!(key, 0xbd | 0xbf | 0xbe) {
        return Err(parse_err(format!("wrong preamble key 0x{key:02x}")));
    }
    // Header ends at the two dummy bytes preceding the key.
    let end_header = key_pos - 3;

    for line in raw[comment_start..end_header.saturating_sub(1)].split(|b| *b == 0) {
        let line = String::from_utf8_lossy(line);
        if let Some((key, val)) = line.split_once(':') {
            out.bitstream
                .header
                .insert(key.trim().to_string(), val.trim().to_string());
        }
    }

    if key == 0xbd {
        parse_cfg_commands(raw, end_header + 4, &mut out, options)?;
    } else if options.machxo2 {
        return Err(parse_err("encrypted bitstream not supported for MachXO2"));
    }

    if options.machxo2 {
        // Re-cut into 16-byte frames, every byte bit-reversed for the
        // LSB-first flash programming port.
        for chunk in raw[end_header..].chunks(16) {
            let mut frame = [0xffu8; 16];
            for (dst, src) in frame.iter_mut().zip(chunk) {
                *dst = reverse_byte(*src);
            }
            out.frames.push(frame);
        }
        out.bitstream.bit_length = out.frames.len() * 16 * 8;
    } else {
        let padding = if options.ecp3 { 14 } else { 0 };
        let mut data = vec![0xffu8; padding];
        data.extend_from_slice(&raw[end_header..]);
        out.bitstream.bit_length = data.len() * 8;
        out.bitstream.data = data;
    }

    Ok(out)
}

fn parse_cfg_commands(
    raw: &[u8],
    mut pos: usize,
    out: &mut LatticeBit,
    options: LatticeBitOptions,
) -> Result<()> {
    while pos < raw.len() {
        let cmd = raw[pos];
        pos += 1;
        match cmd {
            BYPASS => {}
            LSC_RESET_CRC | LSC_INIT_ADDRESS | LSC_SPI_MODE => pos += 3,
            LSC_PROG_CNTRL0 => pos += 7,
            LSC_WRITE_COMP_DIC => pos += 11,
            VERIFY_ID => {
                let id = raw
                    .get(pos + 3..pos + 7)
                    .ok_or_else(|| parse_err("truncated VERIFY_ID"))?;
                let idcode = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
                out.bitstream
                    .header
                    .insert("idcode".into(), format!("{idcode:08x}"));
                pos += 7;
                if !options.machxo2 {
                    return Ok(());
                }
            }
            ECP3_VERIFY_ID => {
                let id = raw
                    .get(pos + 3..pos + 7)
                    .ok_or_else(|| parse_err("truncated VERIFY_ID"))?;
                let idcode = u32::from_be_bytes([
                    reverse_byte(id[3]),
                    reverse_byte(id[2]),
                    reverse_byte(id[1]),
                    reverse_byte(id[0]),
                ]);
                out.bitstream
                    .header
                    .insert("idcode".into(), format!("{idcode:08x}"));
                pos += 7;
                if !options.machxo2 {
                    return Ok(());
                }
            }
            LSC_PROG_INCR_CMP => return Ok(()),
            LSC_PROG_INCR_RTI => {
                return Err(parse_err("bitstream is not compressed, not writable"))
            }
            unknown => {
                return Err(parse_err(format!(
                    "unknown configuration command 0x{unknown:02x}"
                )))
            }
        }
    }
    Ok(())
}

/// Loads a Lattice `.bit` from disk.
pub fn parse_file(path: &Path, options: LatticeBitOptions) -> Result<LatticeBit> {
    parse(&read_maybe_gz(path)?, options)
}

#[cfg(test)]
pub(crate) fn build_fixture(idcode: u32, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&[0xff, 0x00]);
    raw.extend_from_slice(b"Part: LFE5U-25F-6BG256C\0");
    // Two dummy bytes, preamble key, 0xb3.
    raw.extend_from_slice(&[0xff, 0xff, 0xbd, 0xb3]);
    // VERIFY_ID command: 3 bytes of zero then the big-endian idcode,
    // followed by LSC_PROG_INCR_CMP opening the fuse data.
    raw.push(0xe2);
    raw.extend_from_slice(&[0, 0, 0]);
    raw.extend_from_slice(&idcode.to_be_bytes());
    raw.push(0xb8);
    raw.extend_from_slice(payload);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_header_and_idcode() {
        let raw = build_fixture(0x41111043, &[0x10, 0x20]);
        let bit = parse(&raw, LatticeBitOptions::default()).unwrap();
        assert_eq!(bit.bitstream.header_val("Part"), Some("LFE5U-25F-6BG256C"));
        assert_eq!(bit.bitstream.idcode(), Some(0x41111043));
        // Payload starts at the dummy bytes preceding the preamble.
        assert_eq!(&bit.bitstream.data[..4], &[0xff, 0xff, 0xbd, 0xb3]);
    }

    #[test]
    fn machxo2_mode_builds_reversed_frames() {
        let raw = build_fixture(0x012ba043, &[0x01; 12]);
        let bit = parse(
            &raw,
            LatticeBitOptions {
                machxo2: true,
                ecp3: false,
            },
        )
        .unwrap();
        assert!(!bit.frames.is_empty());
        // 0xff dummy byte reverses to itself; 0x01 payload reverses to 0x80.
        assert_eq!(bit.frames[0][0], 0xff);
        assert!(bit.frames.iter().flatten().any(|b| *b == 0x80));
        assert_eq!(bit.bitstream.bit_length % 128, 0);
    }

    #[test]
    fn ecp3_padding_is_prepended() {
        let raw = build_fixture(0x41111043, &[]);
        let bit = parse(
            &raw,
            LatticeBitOptions {
                machxo2: false,
                ecp3: true,
            },
        )
        .unwrap();
        assert!(bit.bitstream.data[..14].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn rejects_missing_preamble_key() {
        let raw = vec![0xff, 0x00, b'x', 0x00, 0xff, 0xff, 0x00, 0x00];
        assert!(parse(&raw, LatticeBitOptions::default()).is_err());
    }
}
