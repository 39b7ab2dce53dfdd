//! Depot path helpers: the wire encoding for reserved characters and the
//! case-folding comparisons used when one side of the transfer is a
//! case-insensitive server.
//!
//! The server family reserves `@`, `#`, `*` and `%` in command arguments, so
//! any of those appearing in a real file name must travel percent-encoded.
//! Local filesystem operations always use the decoded name.

use crate::errors::RelayError;

/// Encode a depot path for use as a server command argument.
///
/// Only the four reserved characters are escaped; `%` first so already
/// encoded input is not double-escaped on the other three.
pub fn encode_wire(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => out.push_str("%25"),
            '@' => out.push_str("%40"),
            '#' => out.push_str("%23"),
            '*' => out.push_str("%2A"),
            _ => out.push(c),
        }
    }
    out
}

/// Decode a wire path back to its local form.
///
/// Unrecognized escapes are left untouched; the server never emits them.
pub fn decode_wire(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = match &bytes[i + 1..i + 3] {
                b"25" => Some('%'),
                b"40" => Some('@'),
                b"23" => Some('#'),
                b"2A" | b"2a" => Some('*'),
                _ => None,
            };
            if let Some(c) = decoded {
                out.push(c);
                i += 3;
                continue;
            }
        }
        // Safe: iterating char boundaries via bytes only for the ASCII '%'.
        let ch = path[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Validate the `//depot/...` shape of a depot path.
pub fn check_depot_path(path: &str) -> Result<(), RelayError> {
    if !path.starts_with("//") || path.len() <= 2 || path[2..].starts_with('/') {
        return Err(RelayError::InvalidDepotPath(path.to_string()));
    }
    Ok(())
}

/// Compare two depot paths under the configured case rule.
pub fn paths_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.eq_ignore_ascii_case(b)
    }
}

/// Fold a path for use as a map key under the configured case rule.
pub fn fold_case(path: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        path.to_string()
    } else {
        path.to_ascii_lowercase()
    }
}
