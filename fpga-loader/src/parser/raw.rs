//! Raw loader for `.bin` and unknown extensions.

use std::path::Path;

use super::Bitstream;
use crate::error::Result;
use crate::util::{read_maybe_gz, reverse_byte};

/// Loads a file verbatim, optionally bit-reversing every byte.
pub fn parse(raw: &[u8], reverse_order: bool) -> Bitstream {
    let data = if reverse_order {
        raw.iter().map(|b| reverse_byte(*b)).collect()
    } else {
        raw.to_vec()
    };
    Bitstream::from_data(data)
}

/// Loads a raw file (transparently inflating `.gz`) from disk.
pub fn parse_file(path: &Path, reverse_order: bool) -> Result<Bitstream> {
    Ok(parse(&read_maybe_gz(path)?, reverse_order))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_and_reversed() {
        assert_eq!(parse(&[0x80, 0xff], false).data, vec![0x80, 0xff]);
        assert_eq!(parse(&[0x80, 0xff], true).data, vec![0x01, 0xff]);
        assert_eq!(parse(&[0u8; 3], false).bit_length, 24);
    }
}
