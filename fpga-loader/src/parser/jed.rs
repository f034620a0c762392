//! JEDEC fuse file decoder, Lattice conventions.
//!
//! A JED file is an STX byte, `*`-terminated fields, then ETX. `L` fields
//! open fuse data at a bit offset, `E` carries the feature row and feabits,
//! `QF`/`QP` are fuse/pin counts, `C` the 16-bit fuse checksum and `U` the
//! usercode.

use std::path::Path;

use super::{parse_err, Bitstream};
use crate::error::{Error, Result};
use crate::util::read_maybe_gz;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// One `L` field: fuse data starting at a bit offset.
#[derive(Debug, Clone)]
pub struct JedSection {
    /// Starting fuse index.
    pub offset: usize,
    /// Packed fuse bytes, LSB-first within each byte.
    pub data: Vec<u8>,
    /// Number of fuses in this section.
    pub bit_len: usize,
}

/// A decoded JED file.
#[derive(Debug, Default)]
pub struct JedFile {
    /// Fuse sections in file order.
    pub sections: Vec<JedSection>,
    /// `QF` declared fuse count.
    pub fuse_count: usize,
    /// `QP` declared pin count.
    pub pin_count: usize,
    /// Feature row (first `E` line), LSB-first.
    pub features_row: u64,
    /// Feabits (second `E` line).
    pub feabits: u16,
    /// `U` usercode.
    pub usercode: u32,
    /// `G` security fuse requested.
    pub security: bool,
    /// `F` default fuse state.
    pub default_fuse: u8,
    /// Common container with all sections flattened.
    pub bitstream: Bitstream,
}

impl JedFile {
    /// Total byte length of the flattened fuse data.
    pub fn data_len(&self) -> usize {
        self.sections.iter().map(|s| s.data.len()).sum()
    }
}

fn pack_ascii_bits(bits: &str) -> Result<Vec<u8>> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, c) in bits.chars().enumerate() {
        match c {
            '1' => out[i >> 3] |= 1 << (i & 7),
            '0' => {}
            other => return Err(parse_err(format!("invalid fuse character {other:?}"))),
        }
    }
    Ok(out)
}

/// Parses a JED image and validates the `C` checksum as the 16-bit sum of
/// packed fuse bytes.
pub fn parse(raw: &[u8]) -> Result<JedFile> {
    let start = raw
        .iter()
        .position(|b| *b == STX)
        .ok_or_else(|| parse_err("missing STX"))?;
    let end = raw
        .iter()
        .position(|b| *b == ETX)
        .unwrap_or(raw.len());
    let body = String::from_utf8_lossy(&raw[start + 1..end]);

    let mut jed = JedFile::default();
    let mut file_checksum: Option<u16> = None;

    for field in body.split('*') {
        let field = field.trim_matches(|c: char| c.is_whitespace());
        if field.is_empty() {
            continue;
        }
        let mut lines = field.lines().map(str::trim);
        let first = lines.next().unwrap_or("");

        match first.as_bytes()[0] {
            b'Q' => match first.as_bytes().get(1) {
                Some(b'F') => {
                    jed.fuse_count = first[2..]
                        .parse()
                        .map_err(|_| parse_err("bad QF count"))?
                }
                Some(b'P') => {
                    jed.pin_count = first[2..]
                        .parse()
                        .map_err(|_| parse_err("bad QP count"))?
                }
                _ => {}
            },
            b'L' => {
                let offset: usize = first[1..]
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .parse()
                    .map_err(|_| parse_err("bad L offset"))?;
                // Fuse characters may start on the L line or span the
                // following lines.
                let mut bits = String::new();
                if let Some(rest) = first[1..].split_once(char::is_whitespace) {
                    bits.push_str(rest.1.trim());
                }
                for line in lines {
                    bits.push_str(line);
                }
                let bit_len = bits.len();
                jed.sections.push(JedSection {
                    offset,
                    data: pack_ascii_bits(&bits)?,
                    bit_len,
                });
            }
            b'E' => {
                for (i, c) in first[1..].chars().enumerate() {
                    if c == '1' {
                        jed.features_row |= 1 << i;
                    }
                }
                if let Some(second) = lines.next() {
                    for (i, c) in second.chars().enumerate() {
                        if c == '1' {
                            jed.feabits |= 1 << i;
                        }
                    }
                }
            }
            b'C' => {
                file_checksum = Some(
                    u16::from_str_radix(first[1..].trim(), 16)
                        .map_err(|_| parse_err("bad checksum field"))?,
                );
            }
            b'U' => {
                let v = first[1..].trim();
                jed.usercode = match v.as_bytes().first() {
                    Some(b'H') => u32::from_str_radix(&v[1..], 16)
                        .map_err(|_| parse_err("bad usercode"))?,
                    _ => u32::from_str_radix(v, 16).unwrap_or(0),
                };
            }
            b'G' => jed.security = first[1..].trim() == "1",
            b'F' => jed.default_fuse = if first[1..].trim() == "1" { 1 } else { 0 },
            b'N' => {} // note
            _ => {
                tracing::debug!("ignoring JED field {first:?}");
            }
        }
    }

    let computed: u16 = jed
        .sections
        .iter()
        .flat_map(|s| s.data.iter())
        .fold(0u16, |acc, b| acc.wrapping_add(*b as u16));
    if let Some(expected) = file_checksum {
        if computed != expected {
            return Err(Error::ChecksumMismatch {
                computed: computed as u32,
                expected: expected as u32,
            });
        }
    }

    let mut flat = Vec::with_capacity(jed.data_len());
    for section in &jed.sections {
        flat.extend_from_slice(&section.data);
    }
    jed.bitstream = Bitstream::from_data(flat);

    Ok(jed)
}

/// Loads a `.jed` file from disk.
pub fn parse_file(path: &Path) -> Result<JedFile> {
    parse(&read_maybe_gz(path)?)
}

#[cfg(test)]
pub(crate) fn build_fixture(rows: &[&str], feabits: &str, with_checksum: bool) -> Vec<u8> {
    let mut body = String::new();
    body.push('\x02');
    let fuse_count: usize = rows.iter().map(|r| r.len()).sum();
    body.push_str(&format!("QF{fuse_count}*\n"));
    body.push_str("QP32*\n");
    body.push_str("L00000\n");
    for row in rows {
        body.push_str(row);
        body.push('\n');
    }
    body.push_str("*\n");
    body.push_str(&format!("E00000000\n{feabits}*\n"));
    if with_checksum {
        let packed: u16 = rows
            .iter()
            .flat_map(|r| pack_ascii_bits(r).unwrap())
            .fold(0u16, |acc, b| acc.wrapping_add(b as u16));
        body.push_str(&format!("C{packed:04X}*\n"));
    }
    body.push_str("UH00000000*\n");
    body.push('\x03');
    body.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_counts() {
        let raw = build_fixture(&["10101010", "11110000"], "0000000000", true);
        let jed = parse(&raw).unwrap();
        assert_eq!(jed.fuse_count, 16);
        assert_eq!(jed.pin_count, 32);
        assert_eq!(jed.sections.len(), 1);
        assert_eq!(jed.sections[0].bit_len, 16);
        // "10101010" packs LSB-first to 0x55.
        assert_eq!(jed.sections[0].data, vec![0x55, 0x0f]);
        assert_eq!(jed.bitstream.data.len(), 2);
    }

    #[test]
    fn feabits_are_lsb_first() {
        let raw = build_fixture(&["00000000"], "0100000000", true);
        let jed = parse(&raw).unwrap();
        assert_eq!(jed.feabits, 0x0002);
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut raw = build_fixture(&["10101010"], "0000000000", true);
        // Corrupt one fuse character inside the L field (flip a 0 to 1).
        let pos = raw
            .windows(8)
            .position(|w| w == b"10101010")
            .unwrap();
        raw[pos + 1] = b'1';
        match parse(&raw) {
            Err(Error::ChecksumMismatch { .. }) => {}
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_stx_is_rejected() {
        assert!(parse(b"QF8*").is_err());
    }
}
