//! Content digests as the target server computes them.
//!
//! Revisions carry a 128-bit MD5 digest of their content, hex-encoded
//! uppercase. For text files with a keyword-expansion modifier the server
//! digests the *canonical* form, in which every expanded `$Keyword: ... $`
//! collapses back to `$Keyword$`. Comparing digests without that
//! canonicalization flags every keyworded file as dirty.

use std::sync::OnceLock;

use md5::{Digest, Md5};
use regex::bytes::Regex;

/// RCS keywords the server family expands.
const KEYWORDS: &str = "Id|Header|Author|Date|DateTime|Change|File|Revision";

fn keyword_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"\$({KEYWORDS}):[^$\n]*\$")).expect("keyword pattern is valid")
    })
}

/// Collapse expanded keywords to their canonical `$Keyword$` form.
///
/// Unexpanded keywords are already canonical and pass through, as does all
/// non-keyword content.
pub fn canonicalize_keywords(content: &[u8]) -> Vec<u8> {
    // Fast path: no `$` at all means no keyword can be present.
    if memchr::memchr(b'$', content).is_none() {
        return content.to_vec();
    }
    keyword_pattern()
        .replace_all(content, &b"$$$1$$"[..])
        .into_owned()
}

/// Uppercase hex MD5 of raw bytes.
pub fn md5_digest(content: &[u8]) -> String {
    hex::encode_upper(Md5::digest(content))
}

/// Digest and byte size of a file as the server would record them.
///
/// `keyword_expansion` selects the canonical form for keyword-carrying text
/// types; binary, symlink and utf16 content always hashes raw.
pub fn canonical_digest(content: &[u8], keyword_expansion: bool) -> (String, u64) {
    if keyword_expansion {
        let canonical = canonicalize_keywords(content);
        (md5_digest(&canonical), canonical.len() as u64)
    } else {
        (md5_digest(content), content.len() as u64)
    }
}

/// Compare workspace content against a recorded digest under the file's
/// keyword rule. Absent digests (purged or ancient revisions) never match.
pub fn content_matches(content: &[u8], digest: Option<&str>, keyword_expansion: bool) -> bool {
    match digest {
        Some(expected) => canonical_digest(content, keyword_expansion).0 == expected,
        None => false,
    }
}
