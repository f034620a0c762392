//! Efinix `.hex` decoder: one ASCII hex byte per line, with a pseudo-header
//! of `Mode:`/`Width:`/`Device:` annotations interleaved near the top.

use std::path::Path;

use super::{parse_err, Bitstream};
use crate::error::Result;
use crate::util::read_maybe_gz;

/// Parses an Efinix hex image.
pub fn parse(raw: &[u8]) -> Result<Bitstream> {
    let text = String::from_utf8_lossy(raw);
    let mut bs = Bitstream::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, val)) = line.split_once(':') {
            // Header annotations sit on their own lines: `Mode: active`.
            if matches!(key.trim(), "Mode" | "Width" | "Device") {
                bs.header
                    .insert(key.trim().to_string(), val.trim().to_string());
                continue;
            }
        }
        let byte = u8::from_str_radix(line, 16)
            .map_err(|_| parse_err(format!("invalid hex line {line:?}")))?;
        bs.data.push(byte);
    }

    if bs.data.is_empty() {
        return Err(parse_err("hex file carries no data"));
    }
    bs.bit_length = bs.data.len() * 8;
    Ok(bs)
}

/// Loads an Efinix `.hex` from disk.
pub fn parse_file(path: &Path) -> Result<Bitstream> {
    parse(&read_maybe_gz(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lines_and_bytes() {
        let text = "Mode: active\nWidth: 1\nDevice: T8F81\nA5\n5A\nFF\n00\n";
        let bs = parse(text.as_bytes()).unwrap();
        assert_eq!(bs.data, vec![0xa5, 0x5a, 0xff, 0x00]);
        assert_eq!(bs.header_val("Device"), Some("T8F81"));
        assert_eq!(bs.bit_length, 32);
    }

    #[test]
    fn garbage_line_is_rejected() {
        assert!(parse(b"A5\nZZ\n").is_err());
    }
}
