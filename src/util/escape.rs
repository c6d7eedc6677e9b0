//! Key escaping for the local backend's filesystem-based object namespace.
//!
//! `=`, `/` and `#` are reserved (path separator and our own escape marker),
//! so they're mapped to a three-character escape sequence before a key is
//! turned into a path component. The mapping must be stable and reversible
//! byte-for-byte: `unescape(escape(s)) == s` for every byte string.

/// Escape `=`, `/` and `#` in a backend key so it is safe to use as a path
/// component.
pub fn escape(s: &str) -> String {
    // Order matters: '=' must be escaped first, otherwise the '=3D'/'=2F'/'=23'
    // sequences we just introduced for '/' and '#' would themselves get
    // re-escaped.
    s.replace('=', "=3D")
        .replace('/', "=2F")
        .replace('#', "=23")
}

/// Inverse of [`escape`].
pub fn unescape(s: &str) -> String {
    s.replace("=2F", "/").replace("=23", "#").replace("=3D", "=")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_reserved_characters() {
        let cases = ["plain", "a/b", "a=b", "a#b", "s3ql_data_=2F#", "==//##"];
        for s in cases {
            assert_eq!(unescape(&escape(s)), s, "failed to round-trip {s:?}");
        }
    }

    #[test]
    fn escape_contains_no_raw_reserved_bytes() {
        let escaped = escape("weird/key=name#here");
        assert!(!escaped.contains('/'));
        assert!(!escaped.contains('#'));
        // '=' only appears as part of an escape triplet, never bare.
        for window in escaped.as_bytes().windows(3) {
            if window[0] == b'=' {
                assert!(matches!(&window[1..3], b"3D" | b"2F" | b"23"));
            }
        }
    }

    #[test]
    fn is_an_involution_on_arbitrary_strings() {
        // Property check over a small deterministic corpus (no proptest
        // randomness needed here since the alphabet is tiny).
        let alphabet = ['a', '=', '/', '#', '3', 'D', '2', 'F'];
        for a in alphabet {
            for b in alphabet {
                for c in alphabet {
                    let s: String = [a, b, c].iter().collect();
                    assert_eq!(unescape(&escape(&s)), s);
                }
            }
        }
    }
}
