//! `.mcs` PROM images: Intel HEX with optional per-byte bit reversal.

use std::path::Path;

use super::{intel_hex, Bitstream};
use crate::error::Result;
use crate::util::{read_maybe_gz, reverse_byte};

/// Parses an `.mcs` image. `reverse_order` bit-reverses every data byte,
/// as the Xilinx flash flows expect.
pub fn parse(text: &str, reverse_order: bool) -> Result<Bitstream> {
    let (mut data, start) = intel_hex::parse(text)?;
    if reverse_order {
        for byte in &mut data {
            *byte = reverse_byte(*byte);
        }
    }
    let mut bs = Bitstream::from_data(data);
    bs.header.insert("start_address".into(), format!("{start:08x}"));
    Ok(bs)
}

/// Loads an `.mcs` file from disk.
pub fn parse_file(path: &Path, reverse_order: bool) -> Result<Bitstream> {
    let raw = read_maybe_gz(path)?;
    parse(&String::from_utf8_lossy(&raw), reverse_order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_order_applies_per_byte() {
        let text = ":0200000080017D\n:00000001FF\n";
        let plain = parse(text, false).unwrap();
        assert_eq!(plain.data, vec![0x80, 0x01]);
        let reversed = parse(text, true).unwrap();
        assert_eq!(reversed.data, vec![0x01, 0x80]);
    }
}
