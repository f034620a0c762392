//! Generic Intel HEX decoding, shared by `.mcs` images, Efinix/Intel
//! `.hex` firmware and the FX2 probe firmware loader.

use std::path::Path;

use ihex::Record;

use super::{parse_err, Bitstream};
use crate::error::Result;
use crate::util::read_maybe_gz;

/// Decodes Intel HEX records into a flat image.
///
/// Data records are placed at `base + offset`; gaps are filled with `0xff`
/// (erased-flash polarity). Returns the image and the lowest address seen.
pub fn parse(text: &str) -> Result<(Vec<u8>, u32)> {
    let mut image: Vec<u8> = Vec::new();
    let mut base = 0u32;
    let mut start: Option<u32> = None;

    for record in ihex::Reader::new(text) {
        let record = record.map_err(|e| parse_err(format!("ihex: {e}")))?;
        match record {
            Record::Data { offset, value } => {
                let addr = base + offset as u32;
                let start = *start.get_or_insert(addr);
                let rel = (addr - start) as usize;
                if image.len() < rel + value.len() {
                    image.resize(rel + value.len(), 0xff);
                }
                image[rel..rel + value.len()].copy_from_slice(&value);
            }
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
            Record::EndOfFile => break,
            other => {
                tracing::debug!("ignoring ihex record {other:?}");
            }
        }
    }

    match start {
        Some(start) => Ok((image, start)),
        None => Err(parse_err("ihex: no data records")),
    }
}

/// Loads a `.hex` Intel HEX file as a [`Bitstream`].
pub fn parse_file(path: &Path) -> Result<Bitstream> {
    let raw = read_maybe_gz(path)?;
    let text = String::from_utf8_lossy(&raw);
    let (data, start) = parse(&text)?;
    let mut bs = Bitstream::from_data(data);
    bs.header.insert("start_address".into(), format!("{start:08x}"));
    Ok(bs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_and_eof() {
        let text = ":0400000001020304F2\n:00000001FF\n";
        let (data, start) = parse(text).unwrap();
        assert_eq!(start, 0);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn extended_linear_addressing() {
        let text = ":020000040001F9\n:02000000AABB99\n:00000001FF\n";
        let (data, start) = parse(text).unwrap();
        assert_eq!(start, 0x0001_0000);
        assert_eq!(data, vec![0xaa, 0xbb]);
    }

    #[test]
    fn gap_fill_is_erased_polarity() {
        let text = ":0100000011EE\n:0100040022D9\n:00000001FF\n";
        let (data, _) = parse(text).unwrap();
        assert_eq!(data, vec![0x11, 0xff, 0xff, 0xff, 0x22]);
    }
}
