//! NUL-terminated output buffers
//!
//! Every buffer-filling operation leaves its output NUL-terminated, on the
//! error path too, and reports an oversize payload instead of truncating
//! silently.

use crate::error::{BridgeError, BridgeResult};

/// Reset `out` to the empty string.
pub fn clear(out: &mut [u8]) {
    if let Some(first) = out.first_mut() {
        *first = 0;
    }
}

/// Copy `value` into `out` followed by a NUL.
///
/// If it does not fit, `out` receives the longest prefix that does (still
/// NUL-terminated) and `BufferTooSmall` is returned.
pub fn write_cstr(out: &mut [u8], what: &'static str, value: &str) -> BridgeResult<()> {
    let bytes = value.as_bytes();
    let needed = bytes.len() + 1;
    if out.is_empty() {
        return Err(BridgeError::BufferTooSmall { what, needed, capacity: 0 });
    }
    if needed > out.len() {
        let n = out.len() - 1;
        out[..n].copy_from_slice(&bytes[..n]);
        out[n] = 0;
        return Err(BridgeError::BufferTooSmall {
            what,
            needed,
            capacity: out.len(),
        });
    }
    out[..bytes.len()].copy_from_slice(bytes);
    out[bytes.len()] = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_exactly() {
        let mut out = [0xffu8; 6];
        write_cstr(&mut out, "value", "hello").unwrap();
        assert_eq!(&out, b"hello\0");
    }

    #[test]
    fn test_too_small_still_terminated() {
        let mut out = [0xffu8; 1];
        let err = write_cstr(&mut out, "value", "hello").unwrap_err();
        assert_eq!(out[0], 0);
        assert!(matches!(
            err,
            BridgeError::BufferTooSmall { needed: 6, capacity: 1, .. }
        ));
    }

    #[test]
    fn test_too_small_keeps_prefix() {
        let mut out = [0xffu8; 4];
        assert!(write_cstr(&mut out, "value", "hello").is_err());
        assert_eq!(&out, b"hel\0");
    }

    #[test]
    fn test_empty_value() {
        let mut out = [0xffu8; 1];
        write_cstr(&mut out, "value", "").unwrap();
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_clear() {
        let mut out = *b"stale";
        clear(&mut out);
        assert_eq!(out[0], 0);
        clear(&mut []);
    }
}
