//! Node software identification carried in the message envelope.

/// Four opaque version bytes: two ASCII letters naming the implementation
/// followed by a big-endian minor/major pair.
pub const VERSION_BYTES: [u8; 4] = [b'B', b'N', 0, 1];

/// Human-readable rendering of a peer's version field.
pub fn format_version(version: Option<[u8; 4]>) -> String {
    match version {
        Some([a, b, major, minor])
            if (a as char).is_ascii_alphabetic() && (b as char).is_ascii_alphabetic() =>
        {
            format!("{}{}/{}.{}", a as char, b as char, major, minor)
        }
        Some(bytes) => hex::encode(bytes),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(Some(VERSION_BYTES)), "BN/0.1");
        assert_eq!(format_version(Some([1, 2, 3, 4])), "01020304");
        assert_eq!(format_version(None), "unknown");
    }
}
