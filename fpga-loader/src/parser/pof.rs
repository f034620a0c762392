//! Intel `.pof` decoder (MAX10 and serial configuration devices).
//!
//! Layout: `POF\0` magic, a 32-bit offset to the first packet and a 32-bit
//! packet count, then packets of `{u16 flag, u32 size, payload}`
//! (little-endian). Packet `0x1A` maps the configuration data packet into
//! named sections (CFM/UFM/ICB) with bit-granular offsets.

use std::collections::BTreeMap;
use std::path::Path;

use super::{parse_err, Bitstream};
use crate::error::Result;
use crate::util::read_maybe_gz;

/// Packet flags of interest.
pub mod flag {
    /// Creating tool string.
    pub const TOOL: u16 = 0x01;
    /// Device part string.
    pub const PART: u16 = 0x02;
    /// Design name.
    pub const DESIGN: u16 = 0x03;
    /// CRC trailer.
    pub const CRC: u16 = 0x08;
    /// Raw configuration data.
    pub const CFG_DATA: u16 = 0x11;
    /// Section map over the configuration data.
    pub const SECTION_MAP: u16 = 0x1a;
}

/// One packet.
#[derive(Debug, Clone)]
pub struct PofPacket {
    /// Packet flag.
    pub flag: u16,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// A named slice of the configuration data, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PofSection {
    /// Bit offset into the `0x11` packet payload.
    pub bit_offset: u64,
    /// Length in bits.
    pub bit_length: u64,
}

/// A decoded POF file.
#[derive(Debug, Default)]
pub struct PofFile {
    /// All packets in file order.
    pub packets: Vec<PofPacket>,
    /// Section map keyed by name (`CFM0`, `UFM`, `ICB`, ...).
    pub sections: BTreeMap<String, PofSection>,
    /// Common container; `data` is the `0x11` configuration payload.
    pub bitstream: Bitstream,
}

impl PofFile {
    /// The raw payload of the first packet carrying `flag`.
    pub fn packet(&self, flag: u16) -> Option<&[u8]> {
        self.packets
            .iter()
            .find(|p| p.flag == flag)
            .map(|p| p.payload.as_slice())
    }

    /// Extracts a named section as bytes (section boundaries are
    /// byte-aligned in practice).
    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        let section = self.sections.get(name)?;
        let start = (section.bit_offset / 8) as usize;
        let len = (section.bit_length as usize).div_ceil(8);
        self.bitstream.data.get(start..start + len)
    }
}

fn parse_section_map(payload: &[u8], sections: &mut BTreeMap<String, PofSection>) {
    // 12-byte header, then `;`-separated `<id><name> <hex_off> <hex_len>`.
    let Some(text) = payload.get(12..) else {
        return;
    };
    let text = String::from_utf8_lossy(text);
    for entry in text.trim_end_matches('\0').split(';') {
        let mut words = entry.split_whitespace();
        let (Some(name), Some(off), Some(len)) = (words.next(), words.next(), words.next())
        else {
            continue;
        };
        // Leading character is a one-letter section id.
        let name = name.get(1..).unwrap_or(name);
        let (Ok(bit_offset), Ok(bit_length)) = (
            u64::from_str_radix(off, 16),
            u64::from_str_radix(len, 16),
        ) else {
            continue;
        };
        sections.insert(
            name.to_string(),
            PofSection {
                bit_offset,
                bit_length,
            },
        );
    }
}

/// Parses a `.pof` image.
pub fn parse(raw: &[u8]) -> Result<PofFile> {
    if raw.get(..4) != Some(b"POF\0".as_slice()) {
        return Err(parse_err("bad POF magic"));
    }
    let header = raw
        .get(4..12)
        .ok_or_else(|| parse_err("POF truncated in header"))?;
    let _first_offset = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let packet_count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut pof = PofFile::default();
    let mut pos = 12usize;
    for _ in 0..packet_count {
        let head = raw
            .get(pos..pos + 6)
            .ok_or_else(|| parse_err("POF truncated in packet header"))?;
        let flag = u16::from_le_bytes([head[0], head[1]]);
        let size = u32::from_le_bytes([head[2], head[3], head[4], head[5]]) as usize;
        pos += 6;
        let payload = raw
            .get(pos..pos + size)
            .ok_or_else(|| parse_err("POF truncated in packet payload"))?;
        pos += size;

        match flag {
            flag::TOOL | flag::PART | flag::DESIGN => {
                let key = match flag {
                    flag::TOOL => "tool",
                    flag::PART => "part",
                    _ => "design",
                };
                let text = String::from_utf8_lossy(payload)
                    .trim_end_matches('\0')
                    .to_string();
                pof.bitstream.header.insert(key.into(), text);
            }
            flag::CFG_DATA => {
                pof.bitstream.data = payload.to_vec();
                pof.bitstream.bit_length = payload.len() * 8;
            }
            flag::SECTION_MAP => parse_section_map(payload, &mut pof.sections),
            _ => {}
        }
        pof.packets.push(PofPacket {
            flag,
            payload: payload.to_vec(),
        });
    }

    Ok(pof)
}

/// Loads a `.pof` from disk.
pub fn parse_file(path: &Path) -> Result<PofFile> {
    parse(&read_maybe_gz(path)?)
}

#[cfg(test)]
pub(crate) fn build_fixture(part: &str, cfg: &[u8], map: &str) -> Vec<u8> {
    let mut packets: Vec<(u16, Vec<u8>)> = vec![
        (flag::TOOL, b"Quartus Prime\0".to_vec()),
        (flag::PART, format!("{part}\0").into_bytes()),
        (flag::CFG_DATA, cfg.to_vec()),
    ];
    if !map.is_empty() {
        let mut payload = vec![0u8; 12];
        payload.extend_from_slice(map.as_bytes());
        packets.push((flag::SECTION_MAP, payload));
    }

    let mut raw = Vec::new();
    raw.extend_from_slice(b"POF\0");
    raw.extend_from_slice(&12u32.to_le_bytes());
    raw.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    for (flag, payload) in packets {
        raw.extend_from_slice(&flag.to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&payload);
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_and_metadata() {
        let raw = build_fixture("10M08SAE144", &[1, 2, 3, 4], "");
        let pof = parse(&raw).unwrap();
        assert_eq!(pof.bitstream.header_val("part"), Some("10M08SAE144"));
        assert_eq!(pof.bitstream.data, vec![1, 2, 3, 4]);
        assert!(pof.packet(flag::TOOL).is_some());
    }

    #[test]
    fn section_map_entries() {
        let cfg: Vec<u8> = (0..64).collect();
        let raw = build_fixture("10M08SA", &cfg, "PCFM0 0 100;PUFM 100 80");
        let pof = parse(&raw).unwrap();
        assert_eq!(
            pof.sections.get("CFM0"),
            Some(&PofSection {
                bit_offset: 0,
                bit_length: 0x100
            })
        );
        // CFM0 covers the first 0x100 bits = 32 bytes.
        assert_eq!(pof.section_data("CFM0").unwrap(), &cfg[..32]);
        let ufm = pof.sections.get("UFM").unwrap();
        assert_eq!(ufm.bit_offset, 0x100);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(parse(b"NOPE").is_err());
    }
}
