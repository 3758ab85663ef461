//! Filename transcoding for clipboard file transfer
//!
//! Filenames cross three encodings on their way through the engine:
//!
//! ```text
//! paste buffer (RFC 3986 %xx escapes) -> UTF-8 path -> 260-word UTF-16LE wire field
//! ```
//!
//! The wire field is fixed size. A name that does not fit (including its
//! terminator) is sent as an empty name, never truncated.

use bytes::BufMut;
use percent_encoding::percent_decode;

use crate::clipboard::error::{ClipboardError, Result};

/// Number of UTF-16 words in the CLIPRDR_FILEDESCRIPTOR `cFileName` field
pub const FILENAME_FIELD_WORDS: usize = 260;

/// Size in bytes of the `cFileName` field
pub const FILENAME_FIELD_BYTES: usize = FILENAME_FIELD_WORDS * 2;

/// Decode RFC 3986 `%xx` escapes
///
/// A `%` that is not followed by two hex digits is copied through as-is.
/// Output length never exceeds input length.
pub fn decode_percent_encoded(input: &[u8]) -> Vec<u8> {
    percent_decode(input).collect()
}

/// Number of UTF-16 code units needed to represent `utf8`
///
/// Surrogate pairs count as two units. A NUL included in the input counts
/// as one unit, so callers sizing a terminated field pass the terminator
/// along with the name.
pub fn utf16_word_count(utf8: &[u8]) -> usize {
    String::from_utf8_lossy(utf8)
        .chars()
        .map(char::len_utf16)
        .sum()
}

/// Encode a string as UTF-16LE, without terminator
pub fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Write `name` into a fixed 260-word filename field
///
/// Always writes exactly [`FILENAME_FIELD_BYTES`] bytes so neighbouring
/// fields stay aligned. On overflow the field is left empty and
/// [`ClipboardError::FilenameOverflow`] is returned for the caller to log.
pub fn put_filename_field<B: BufMut>(dst: &mut B, name: &str) -> Result<()> {
    let words = name.encode_utf16().count() + 1;
    if words > FILENAME_FIELD_WORDS {
        dst.put_bytes(0, FILENAME_FIELD_BYTES);
        return Err(ClipboardError::FilenameOverflow(words));
    }

    for word in name.encode_utf16() {
        dst.put_u16_le(word);
    }
    dst.put_bytes(0, (FILENAME_FIELD_WORDS - words + 1) * 2);
    Ok(())
}

/// Result of decoding a NUL-terminated UTF-16LE name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedName {
    /// Decoded name, unpaired surrogates replaced with U+FFFD
    pub name: String,
    /// Source bytes consumed, terminator included
    pub consumed: usize,
    /// Whether a terminator was found within the allowed span
    pub terminated: bool,
}

/// Decode a NUL-terminated UTF-16LE string into UTF-8
///
/// Reads at most `max_bytes` (and never past `wire`). A trailing odd byte
/// is not consumed.
pub fn decode_utf16le_as_utf8(wire: &[u8], max_bytes: usize) -> DecodedName {
    let span = &wire[..wire.len().min(max_bytes)];

    let mut units = Vec::with_capacity(span.len() / 2);
    let mut consumed = 0;
    let mut terminated = false;

    for pair in span.chunks_exact(2) {
        consumed += 2;
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            terminated = true;
            break;
        }
        units.push(unit);
    }

    DecodedName {
        name: String::from_utf16_lossy(&units),
        consumed,
        terminated,
    }
}

/// Split a local absolute path into directory and file name
///
/// The split is at the last `/`. No separator, or a separator in first
/// position, puts the file in `/`.
pub fn split_local_path(full: &str) -> (String, String) {
    match full.rfind('/') {
        None => ("/".to_string(), full.to_string()),
        Some(0) => ("/".to_string(), full[1..].to_string()),
        Some(sep) => (full[..sep].to_string(), full[sep + 1..].to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode_space_and_utf8() {
        assert_eq!(decode_percent_encoded(b"/tmp/a%20b.txt"), b"/tmp/a b.txt");
        assert_eq!(
            decode_percent_encoded(b"/tmp/%E6%97%A5.txt"),
            "/tmp/\u{65e5}.txt".as_bytes()
        );
    }

    #[test]
    fn test_percent_decode_malformed_passes_through() {
        assert_eq!(decode_percent_encoded(b"100%"), b"100%");
        assert_eq!(decode_percent_encoded(b"%zz"), b"%zz");
        assert_eq!(decode_percent_encoded(b"%4"), b"%4");
        assert_eq!(decode_percent_encoded(b"%%41"), b"%A");
    }

    #[test]
    fn test_utf16_word_count() {
        assert_eq!(utf16_word_count(b"abc"), 3);
        assert_eq!(utf16_word_count(b"abc\0"), 4);
        // U+1F600 needs a surrogate pair
        assert_eq!(utf16_word_count("\u{1F600}".as_bytes()), 2);
        assert_eq!(utf16_word_count("\u{65e5}".as_bytes()), 1);
    }

    #[test]
    fn test_encode_utf16le() {
        assert_eq!(encode_utf16le("Ab"), vec![0x41, 0x00, 0x62, 0x00]);
        assert!(encode_utf16le("").is_empty());
    }

    #[test]
    fn test_filename_field_is_fixed_size() {
        let mut buf = Vec::new();
        put_filename_field(&mut buf, "report.pdf").unwrap();
        assert_eq!(buf.len(), FILENAME_FIELD_BYTES);
        assert_eq!(&buf[..4], &[b'r', 0, b'e', 0]);
        assert!(buf[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_filename_field_longest_fit() {
        let name = "x".repeat(FILENAME_FIELD_WORDS - 1);
        let mut buf = Vec::new();
        put_filename_field(&mut buf, &name).unwrap();
        assert_eq!(buf.len(), FILENAME_FIELD_BYTES);
        assert_eq!(&buf[FILENAME_FIELD_BYTES - 2..], &[0, 0]);
    }

    #[test]
    fn test_filename_field_overflow_emits_empty_name() {
        let name = "x".repeat(FILENAME_FIELD_WORDS);
        let mut buf = Vec::new();
        let err = put_filename_field(&mut buf, &name).unwrap_err();
        assert!(matches!(err, ClipboardError::FilenameOverflow(261)));
        assert_eq!(buf.len(), FILENAME_FIELD_BYTES);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_utf16_stops_at_terminator() {
        let mut wire = encode_utf16le("a.txt");
        wire.extend_from_slice(&[0, 0, b'z', 0]);
        let decoded = decode_utf16le_as_utf8(&wire, FILENAME_FIELD_BYTES);
        assert_eq!(decoded.name, "a.txt");
        assert_eq!(decoded.consumed, 12);
        assert!(decoded.terminated);
    }

    #[test]
    fn test_decode_utf16_respects_max_bytes() {
        let wire = encode_utf16le("abcdef");
        let decoded = decode_utf16le_as_utf8(&wire, 4);
        assert_eq!(decoded.name, "ab");
        assert_eq!(decoded.consumed, 4);
        assert!(!decoded.terminated);
    }

    #[test]
    fn test_decode_utf16_lone_surrogate_is_replaced() {
        let wire = [0x00, 0xd8, 0x41, 0x00, 0x00, 0x00];
        let decoded = decode_utf16le_as_utf8(&wire, FILENAME_FIELD_BYTES);
        assert_eq!(decoded.name, "\u{FFFD}A");
        assert!(decoded.terminated);
    }

    #[test]
    fn test_split_local_path() {
        assert_eq!(
            split_local_path("/tmp/dir/a.txt"),
            ("/tmp/dir".to_string(), "a.txt".to_string())
        );
        assert_eq!(
            split_local_path("/a.txt"),
            ("/".to_string(), "a.txt".to_string())
        );
        assert_eq!(
            split_local_path("a.txt"),
            ("/".to_string(), "a.txt".to_string())
        );
    }
}
