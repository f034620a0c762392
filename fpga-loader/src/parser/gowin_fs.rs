//! Gowin `.fs` decoder: `//`-prefixed key/value lines followed by one ASCII
//! `0`/`1` character per configuration bit.

use std::path::Path;

use super::{parse_err, Bitstream};
use crate::error::{Error, Result};
use crate::util::read_maybe_gz;

/// A decoded `.fs` image.
#[derive(Debug, Default)]
pub struct FsFile {
    /// Common container; data bytes are packed MSB-first, matching the
    /// transmission order of the configuration port.
    pub bitstream: Bitstream,
    /// Additive checksum over the packed payload.
    pub computed_checksum: u32,
}

/// Parses a `.fs` image.
///
/// When the header carries a `CheckSum` value it is compared against the
/// recomputed one unless `skip_checksum` is set (GW2A images are not
/// verified; the vendor field is unreliable on those parts).
pub fn parse(raw: &[u8], skip_checksum: bool) -> Result<FsFile> {
    let text = String::from_utf8_lossy(raw);
    let mut fs = FsFile::default();
    let mut bits: Vec<u8> = Vec::new();
    let mut bit_count = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix("//") {
            if let Some((key, val)) = comment.split_once(':') {
                fs.bitstream
                    .header
                    .insert(key.trim().to_string(), val.trim().to_string());
            }
            continue;
        }
        // One row of configuration bits, MSB-first. Rows pack
        // independently so a non-multiple-of-8 row ends its final byte.
        let mut byte = 0u8;
        let mut in_byte = 0usize;
        for c in line.chars() {
            match c {
                '1' => byte |= 0x80 >> in_byte,
                '0' => {}
                other => {
                    return Err(parse_err(format!("invalid fs character {other:?}")))
                }
            }
            bit_count += 1;
            in_byte += 1;
            if in_byte == 8 {
                bits.push(byte);
                byte = 0;
                in_byte = 0;
            }
        }
        if in_byte != 0 {
            bits.push(byte);
        }
    }

    if bits.is_empty() {
        return Err(parse_err("fs file carries no configuration rows"));
    }

    fs.computed_checksum = bits.iter().map(|b| *b as u32).sum();

    if !skip_checksum {
        if let Some(stated) = fs
            .bitstream
            .header
            .get("CheckSum")
            .and_then(|v| v.strip_prefix("0x"))
            .and_then(|v| u32::from_str_radix(v, 16).ok())
        {
            if stated != fs.computed_checksum {
                return Err(Error::ChecksumMismatch {
                    computed: fs.computed_checksum,
                    expected: stated,
                });
            }
        }
    }

    fs.bitstream.data = bits;
    fs.bitstream.bit_length = bit_count;
    Ok(fs)
}

/// Loads an `.fs` file from disk.
pub fn parse_file(path: &Path, skip_checksum: bool) -> Result<FsFile> {
    parse(&read_maybe_gz(path)?, skip_checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(checksum: Option<u32>) -> String {
        let mut text = String::from("//Part Number: GW1NR-LV9QN88PC6/I5\n");
        if let Some(sum) = checksum {
            text.push_str(&format!("//CheckSum: 0x{sum:08x}\n"));
        }
        text.push_str("10000000\n01111111\n");
        text
    }

    #[test]
    fn rows_pack_msb_first() {
        let fs = parse(fixture(None).as_bytes(), false).unwrap();
        assert_eq!(fs.bitstream.data, vec![0x80, 0x7f]);
        assert_eq!(fs.bitstream.bit_length, 16);
        assert_eq!(
            fs.bitstream.header_val("Part Number"),
            Some("GW1NR-LV9QN88PC6/I5")
        );
    }

    #[test]
    fn checksum_is_verified_when_present() {
        let good = parse(fixture(Some(0x80 + 0x7f)).as_bytes(), false);
        assert!(good.is_ok());
        let bad = parse(fixture(Some(0x1234)).as_bytes(), false);
        assert!(matches!(bad, Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn gw2a_skips_checksum() {
        // Wrong stated checksum is accepted when skipping.
        let fs = parse(fixture(Some(0x1234)).as_bytes(), true).unwrap();
        assert_eq!(fs.computed_checksum, 0x80 + 0x7f);
    }
}
