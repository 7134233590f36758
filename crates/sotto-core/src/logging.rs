//! Logging helpers that keep key material out of log output.

use std::fmt;

/// Display a byte slice as its length only.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Display a hex string as its first and last four characters.
pub struct RedactedHex<'a>(pub &'a str);

impl fmt::Display for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED]")
        }
    }
}

impl fmt::Debug for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_bytes() {
        assert_eq!(format!("{}", RedactedBytes(&[1, 2, 3])), "[3 bytes]");
    }

    #[test]
    fn test_redacted_hex() {
        let long = "0123456789abcdef";
        assert_eq!(format!("{}", RedactedHex(long)), "0123...cdef");
        assert_eq!(format!("{}", RedactedHex("short")), "[REDACTED]");
    }
}
