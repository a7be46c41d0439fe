use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::extractor::truncate_chars;

/// Number of leading text characters folded into a fingerprint
pub const FINGERPRINT_PREFIX_CHARS: usize = 256;

/// Coarse identity key for fetched content: `<status>-<bytes>-<base64 text prefix>`.
///
/// Pages with the same status, size and opening text share a fingerprint.
/// This is not a hash and makes no uniqueness promise.
pub fn fingerprint(status: u16, bytes: usize, text: &str) -> String {
    let prefix = truncate_chars(text, FINGERPRINT_PREFIX_CHARS);
    format!("{}-{}-{}", status, bytes, BASE64.encode(prefix.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(fingerprint(200, 16, "A"), "200-16-QQ==");
        assert_eq!(fingerprint(404, 0, ""), "404-0-");
    }

    #[test]
    fn test_only_prefix_matters() {
        let base = "x".repeat(FINGERPRINT_PREFIX_CHARS);
        let a = format!("{}tail one", base);
        let b = format!("{}another tail", base);
        assert_eq!(fingerprint(200, 999, &a), fingerprint(200, 999, &b));
    }

    #[test]
    fn test_each_input_changes_the_key() {
        let key = fingerprint(200, 10, "hello");
        assert_ne!(key, fingerprint(201, 10, "hello"));
        assert_ne!(key, fingerprint(200, 11, "hello"));
        assert_ne!(key, fingerprint(200, 10, "hellp"));
    }

    #[test]
    fn test_prefix_is_reversible() {
        let key = fingerprint(200, 5, "héllo");
        let encoded = key.splitn(3, '-').nth(2).unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "héllo");
    }
}
