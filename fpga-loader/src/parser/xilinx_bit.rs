//! Xilinx `.bit` decoder.
//!
//! Layout: a 16-bit big-endian length plus that many bytes of misc header,
//! then typed records `a`..`d` (16-bit BE length + ASCII payload) and
//! finally `e` carrying a 32-bit BE data length followed by the raw
//! configuration stream.

use std::path::Path;

use super::{parse_err, Bitstream};
use crate::config::fpga_by_part_name;
use crate::error::Result;
use crate::util::{read_maybe_gz, reverse_byte};

fn read_u16(raw: &[u8], pos: usize) -> Result<u16> {
    let bytes = raw
        .get(pos..pos + 2)
        .ok_or_else(|| parse_err("bit file truncated in header"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Parses a `.bit` image. With `reverse_order` every payload byte is
/// bit-reversed at parse time (SPI flash flows want the stream MSB-first).
pub fn parse(raw: &[u8], reverse_order: bool) -> Result<Bitstream> {
    let mut bs = Bitstream::default();
    let mut pos = 0usize;

    // Field 1: misc header, skipped.
    let misc_len = read_u16(raw, pos)? as usize;
    pos += 2 + misc_len;
    // Field 2 length precedes the first typed record.
    let _ = read_u16(raw, pos)?;
    pos += 2;

    loop {
        let ty = *raw
            .get(pos)
            .ok_or_else(|| parse_err("bit file ends before data record"))?;
        pos += 1;

        if ty == b'e' {
            let len = raw
                .get(pos..pos + 4)
                .ok_or_else(|| parse_err("bit file truncated in data length"))?;
            let data_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
            pos += 4;

            let data = raw
                .get(pos..)
                .filter(|d| d.len() >= data_len)
                .ok_or_else(|| parse_err("bit file data shorter than declared"))?;
            bs.data = if reverse_order {
                data.iter().map(|b| reverse_byte(*b)).collect()
            } else {
                data.to_vec()
            };
            bs.bit_length = bs.data.len() * 8;
            break;
        }

        let len = read_u16(raw, pos)? as usize;
        pos += 2;
        let field = raw
            .get(pos..pos + len)
            .ok_or_else(|| parse_err("bit file truncated in record"))?;
        pos += len;
        let text = String::from_utf8_lossy(field)
            .trim_end_matches('\0')
            .to_string();

        match ty {
            b'a' => {
                // design name;UserID=0x...;tool version
                let mut parts = text.split(';');
                if let Some(design) = parts.next() {
                    bs.header.insert("design_name".into(), design.to_string());
                }
                for part in parts {
                    if let Some(v) = part.strip_prefix("UserID=") {
                        bs.header.insert("userID".into(), v.to_string());
                    } else if let Some((_, v)) = part.split_once('=') {
                        bs.header.insert("toolVersion".into(), v.to_string());
                    }
                }
            }
            b'b' => {
                bs.header.insert("part_name".into(), text.clone());
                if let Some(model) = fpga_by_part_name(&text) {
                    bs.header
                        .insert("idcode".into(), format!("{:08x}", model.idcode));
                }
            }
            b'c' => {
                bs.header.insert("date".into(), text);
            }
            b'd' => {
                bs.header.insert("hour".into(), text);
            }
            unknown => {
                return Err(parse_err(format!(
                    "unknown bit record type 0x{unknown:02x}"
                )))
            }
        }
    }

    Ok(bs)
}

/// Loads a `.bit` (or `.bit.gz`) from disk.
pub fn parse_file(path: &Path, reverse_order: bool) -> Result<Bitstream> {
    parse(&read_maybe_gz(path)?, reverse_order)
}

#[cfg(test)]
pub(crate) fn build_fixture(part: &str, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::new();
    // misc header
    raw.extend_from_slice(&9u16.to_be_bytes());
    raw.extend_from_slice(&[0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x00]);
    raw.extend_from_slice(&1u16.to_be_bytes());
    let mut record = |ty: u8, body: &[u8]| {
        raw.push(ty);
        raw.extend_from_slice(&(body.len() as u16).to_be_bytes());
        raw.extend_from_slice(body);
    };
    record(b'a', b"top;UserID=0XFFFFFFFF;Version=2023.2");
    record(b'b', part.as_bytes());
    record(b'c', b"2023/11/02");
    record(b'd', b"10:33:41");
    raw.push(b'e');
    raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_payload() {
        let payload = [0xaa, 0x99, 0x55, 0x66, 0x01, 0x02];
        let raw = build_fixture("7a50tcsg324", &payload);
        let bs = parse(&raw, false).unwrap();
        assert_eq!(bs.data, payload);
        assert_eq!(bs.bit_length, 48);
        assert_eq!(bs.header_val("design_name"), Some("top"));
        assert_eq!(bs.header_val("part_name"), Some("7a50tcsg324"));
        assert_eq!(bs.header_val("date"), Some("2023/11/02"));
    }

    #[test]
    fn part_name_resolves_idcode() {
        let raw = build_fixture("xc7a50tcsg324", &[0u8; 4]);
        let bs = parse(&raw, false).unwrap();
        assert_eq!(bs.idcode(), Some(0x0362c093));
    }

    #[test]
    fn reverse_order_flips_bits_per_byte() {
        let raw = build_fixture("xc7a50tcsg324", &[0x80, 0x01]);
        let bs = parse(&raw, true).unwrap();
        assert_eq!(bs.data, vec![0x01, 0x80]);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let raw = build_fixture("xc7a50tcsg324", &[0u8; 16]);
        assert!(parse(&raw[..raw.len() - 8], false).is_err());
    }
}
