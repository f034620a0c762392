//! Cologne Chip `.cfg` decoder: ASCII lines of two-hex-digit bytes with
//! `//` comments.

use std::path::Path;

use super::{parse_err, Bitstream};
use crate::error::Result;
use crate::util::read_maybe_gz;

/// Parses a GateMate `.cfg` image.
pub fn parse(raw: &[u8]) -> Result<Bitstream> {
    let text = String::from_utf8_lossy(raw);
    let mut data = Vec::new();

    for line in text.lines() {
        let line = match line.find("//") {
            Some(pos) => &line[..pos],
            None => line,
        };
        for word in line.split_whitespace() {
            let byte = u8::from_str_radix(word, 16)
                .map_err(|_| parse_err(format!("invalid cfg byte {word:?}")))?;
            data.push(byte);
        }
    }

    if data.is_empty() {
        return Err(parse_err("cfg file carries no data"));
    }
    Ok(Bitstream::from_data(data))
}

/// Loads a `.cfg` from disk.
pub fn parse_file(path: &Path) -> Result<Bitstream> {
    parse(&read_maybe_gz(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_and_comments() {
        let text = "// GateMate configuration\nC7 4E 00 FF // preamble\n12 34\n";
        let bs = parse(text.as_bytes()).unwrap();
        assert_eq!(bs.data, vec![0xc7, 0x4e, 0x00, 0xff, 0x12, 0x34]);
    }

    #[test]
    fn invalid_byte_is_rejected() {
        assert!(parse(b"C7 XY").is_err());
    }
}
