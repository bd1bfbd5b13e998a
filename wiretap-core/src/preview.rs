//! A noise pretty-printer-free byte/string duality for logging and diagnostics:
//! payload bytes stay raw `Bytes` everywhere they're matched or stored, but render as a
//! printable-ASCII-spans-with-escapes string wherever they're displayed.

use std::fmt::{self, Write as _};

/// Borrows a byte slice and renders it as printable ASCII runs with everything else
/// escaped `\xHH`, the way a hex dump's "printable" column would but inline.
pub struct BytePreview<'a>(pub &'a [u8]);

impl fmt::Display for BytePreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            if (0x20..=0x7e).contains(&b) {
                f.write_char(b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_printable_ascii_verbatim() {
        assert_eq!(BytePreview(b"hello").to_string(), "hello");
    }

    #[test]
    fn escapes_non_printable_bytes() {
        assert_eq!(BytePreview(&[0x00, b'a', 0xff]).to_string(), "\\x00a\\xff");
    }

    #[test]
    fn mixed_spans_interleave_correctly() {
        assert_eq!(BytePreview(b"ab\ncd").to_string(), "ab\\x0acd");
    }
}
