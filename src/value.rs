use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Encode an integer the way `INTEGERKEY` and `INTEGERDUP` databases expect:
/// native byte order, fixed width.
pub fn to_bin(value: u64) -> [u8; 8] {
    value.to_ne_bytes()
}

/// Four byte variant of [`to_bin`].
pub fn to_bin32(value: u32) -> [u8; 4] {
    value.to_ne_bytes()
}

/// Decode an integer key or value written with [`to_bin`] or [`to_bin32`].
pub fn from_bin(bytes: &[u8]) -> Result<u64> {
    match bytes.len() {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Ok(u64::from(u32::from_ne_bytes(buf)))
        }
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(u64::from_ne_bytes(buf))
        }
        _ => Err(Error::BadValSize),
    }
}

/// Whether `bytes` has a width usable as an integer key.
pub(crate) fn is_int_width(bytes: &[u8]) -> bool {
    matches!(bytes.len(), 4 | 8)
}

/// Numeric comparison of two native-endian integers.
///
/// Values of unexpected width fall back to byte order so a damaged record
/// never breaks the ordering of a page.
pub(crate) fn cmp_int(a: &[u8], b: &[u8]) -> Ordering {
    match (from_bin(a), from_bin(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
