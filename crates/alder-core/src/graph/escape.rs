//! Reversible escaping for property keys and labels.
//!
//! Backends store property keys and edge labels that may contain characters
//! their storage layer reserves (`:`, `,`, `;`, space, `%`, `=`, `.`).
//! Every backend escapes with the same scheme on write and reverses it on
//! read, so callers see identical behavior regardless of the backend.
//!
//! The scheme is percent-encoding limited to the reserved set. `%` itself is
//! part of the set, which makes the mapping unambiguous in both directions.

const RESERVED: &[char] = &['%', ':', ',', ';', ' ', '=', '.'];

/// Escape reserved characters in a key or label.
pub fn escape(raw: &str) -> String {
    if !raw.chars().any(|c| RESERVED.contains(&c)) {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        if RESERVED.contains(&c) {
            out.push('%');
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("{:02X}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse [`escape`]. Input that was never escaped passes through unchanged.
pub fn unescape(stored: &str) -> String {
    if !stored.contains('%') {
        return stored.to_string();
    }
    let bytes = stored.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stored.get(i + 1..i + 3);
            match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'%');
                    i += 1;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| stored.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_keys_pass_through() {
        assert_eq!(escape("children"), "children");
        assert_eq!(unescape("children"), "children");
    }

    #[test]
    fn reserved_characters_round_trip() {
        let raw = "ns.uri:Type, slot;x = y%z";
        let stored = escape(raw);
        assert!(!stored.contains(' '));
        assert!(!stored.contains(':'));
        assert!(!stored.contains('='));
        assert_eq!(unescape(&stored), raw);
    }

    #[test]
    fn percent_is_escaped_first() {
        // A raw '%' must not collide with the escape markers it produces.
        assert_eq!(unescape(&escape("100%.done")), "100%.done");
        assert_eq!(escape("%"), "%25");
    }

    #[test]
    fn dotted_names_round_trip() {
        let raw = "org.example.metamodel";
        assert_ne!(escape(raw), raw);
        assert_eq!(unescape(&escape(raw)), raw);
    }

    #[test]
    fn truncated_escape_is_left_alone() {
        assert_eq!(unescape("abc%2"), "abc%2");
        assert_eq!(unescape("abc%"), "abc%");
    }
}
