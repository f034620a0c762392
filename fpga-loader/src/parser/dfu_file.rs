//! DFU file suffix handling (DFU 1.1 appendix B).
//!
//! A DFU file is an arbitrary payload followed by a 16-byte suffix read
//! backwards from the end: `dwCRC`, `bLength`, `"UFD"`, `bcdDFU`,
//! `idVendor`, `idProduct`, `bcdDevice`. The CRC-32 covers everything but
//! the `dwCRC` field itself.

use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};

use super::{parse_err, Bitstream};
use crate::error::{Error, Result};
use crate::util::read_maybe_gz;

const SUFFIX_LEN: usize = 16;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The decoded suffix of a DFU file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuSuffix {
    /// DFU specification release.
    pub bcd_dfu: u16,
    /// Target vendor id, `0xffff` = any.
    pub id_vendor: u16,
    /// Target product id, `0xffff` = any.
    pub id_product: u16,
    /// Firmware release number.
    pub bcd_device: u16,
}

/// A DFU file: payload plus validated suffix.
#[derive(Debug)]
pub struct DfuFile {
    /// Common container holding the payload.
    pub bitstream: Bitstream,
    /// Suffix fields, when the file carries one.
    pub suffix: Option<DfuSuffix>,
}

/// Parses a DFU image, validating the suffix CRC when present.
///
/// Files without a valid `"UFD"` signature are accepted verbatim, since
/// raw payloads are legal DFU downloads.
pub fn parse(raw: &[u8]) -> Result<DfuFile> {
    if raw.len() < SUFFIX_LEN || &raw[raw.len() - 8..raw.len() - 5] != b"UFD" {
        return Ok(DfuFile {
            bitstream: Bitstream::from_data(raw.to_vec()),
            suffix: None,
        });
    }

    let tail = &raw[raw.len() - SUFFIX_LEN..];
    let suffix_len = tail[11] as usize;
    if suffix_len < SUFFIX_LEN {
        return Err(parse_err("DFU suffix declares a bad length"));
    }

    let stated_crc = u32::from_le_bytes([tail[12], tail[13], tail[14], tail[15]]);
    let computed = CRC32.checksum(&raw[..raw.len() - 4]);
    if computed != stated_crc {
        return Err(Error::ChecksumMismatch {
            computed,
            expected: stated_crc,
        });
    }

    let suffix = DfuSuffix {
        bcd_device: u16::from_le_bytes([tail[0], tail[1]]),
        id_product: u16::from_le_bytes([tail[2], tail[3]]),
        id_vendor: u16::from_le_bytes([tail[4], tail[5]]),
        bcd_dfu: u16::from_le_bytes([tail[6], tail[7]]),
    };

    let payload = raw[..raw.len() - suffix_len.max(SUFFIX_LEN)].to_vec();
    Ok(DfuFile {
        bitstream: Bitstream::from_data(payload),
        suffix: Some(suffix),
    })
}

/// Loads a DFU file from disk.
pub fn parse_file(path: &Path) -> Result<DfuFile> {
    parse(&read_maybe_gz(path)?)
}

/// Appends a valid suffix to `payload`; used by tests and kept with the
/// format definition.
#[cfg(test)]
pub(crate) fn append_suffix(payload: &[u8], vid: u16, pid: u16) -> Vec<u8> {
    let mut raw = payload.to_vec();
    raw.extend_from_slice(&0x0100u16.to_le_bytes()); // bcdDevice
    raw.extend_from_slice(&pid.to_le_bytes());
    raw.extend_from_slice(&vid.to_le_bytes());
    raw.extend_from_slice(&0x0110u16.to_le_bytes()); // bcdDFU
    raw.extend_from_slice(b"UFD");
    raw.push(SUFFIX_LEN as u8);
    let crc = CRC32.checksum(&raw);
    raw.extend_from_slice(&crc.to_le_bytes());
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_roundtrip() {
        let raw = append_suffix(&[1, 2, 3, 4], 0x1209, 0x5af0);
        let file = parse(&raw).unwrap();
        assert_eq!(file.bitstream.data, vec![1, 2, 3, 4]);
        let suffix = file.suffix.unwrap();
        assert_eq!(suffix.id_vendor, 0x1209);
        assert_eq!(suffix.id_product, 0x5af0);
        assert_eq!(suffix.bcd_dfu, 0x0110);
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let mut raw = append_suffix(&[1, 2, 3, 4], 0x1209, 0x5af0);
        raw[0] ^= 0xff;
        assert!(matches!(parse(&raw), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn raw_payload_without_suffix_is_accepted() {
        let file = parse(&[9u8, 8, 7]).unwrap();
        assert!(file.suffix.is_none());
        assert_eq!(file.bitstream.data, vec![9, 8, 7]);
    }
}
