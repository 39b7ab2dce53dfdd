//! The view mapper: translates the configured source→target path mappings
//! into a scope filter and a bidirectional path translator.
//!
//! Two construction modes exist. Classical views map arbitrary depot paths
//! with `...` and `*` wildcards and support exclusion lines (leading `-`).
//! Stream views map whole stream subtrees; each `{src, targ}` pair scopes
//! `<src>/...` onto `<targ>/...`.
//!
//! Mapping semantics are the server family's: rules apply left to right and
//! a later rule overrides an earlier one for the paths it covers. All paths
//! passing through the mapper are in decoded (local) form; the session layer
//! applies the wire encoding of `paths::encode_wire` when talking to a
//! server.

use regex::Regex;

use crate::config::{StreamViewEntry, ViewEntry};
use crate::errors::RelayError;

/// Wildcard tokens a mapping side may carry, in order of appearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wildcard {
    /// `...` matches across directory separators.
    Subtree,
    /// `*` matches within one path segment.
    Segment,
}

/// One side of a mapping, compiled for matching and substitution.
#[derive(Debug, Clone)]
struct Pattern {
    text: String,
    regex: Regex,
    wildcards: Vec<Wildcard>,
}

impl Pattern {
    fn compile(text: &str, case_sensitive: bool) -> Result<Pattern, RelayError> {
        let mut regex = String::from("^");
        if !case_sensitive {
            regex.insert_str(0, "(?i)");
        }
        let mut wildcards = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix("...") {
                regex.push_str("(.*)");
                wildcards.push(Wildcard::Subtree);
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('*') {
                regex.push_str("([^/]*)");
                wildcards.push(Wildcard::Segment);
                rest = stripped;
            } else {
                let next = rest
                    .char_indices()
                    .find(|&(i, c)| c == '*' || rest[i..].starts_with("..."))
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                regex.push_str(&regex::escape(&rest[..next]));
                rest = &rest[next..];
            }
        }
        regex.push('$');
        let regex = Regex::new(&regex)
            .map_err(|e| RelayError::InvalidView(format!("`{text}`: {e}")))?;
        Ok(Pattern {
            text: text.to_string(),
            regex,
            wildcards,
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Substitute this side's captures of `path` into `other`.
    fn translate(&self, other: &Pattern, path: &str) -> Option<String> {
        let captures = self.regex.captures(path)?;
        let mut out = String::with_capacity(path.len());
        let mut capture = 1;
        let mut rest = other.text.as_str();
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix("...") {
                out.push_str(captures.get(capture)?.as_str());
                capture += 1;
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('*') {
                out.push_str(captures.get(capture)?.as_str());
                capture += 1;
                rest = stripped;
            } else {
                let next = rest
                    .char_indices()
                    .find(|&(i, c)| c == '*' || rest[i..].starts_with("..."))
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                out.push_str(&rest[..next]);
                rest = &rest[next..];
            }
        }
        Some(out)
    }
}

#[derive(Debug, Clone)]
struct Rule {
    exclude: bool,
    src: Pattern,
    targ: Pattern,
}

/// The compiled view: scope filter plus bidirectional translator.
///
/// Case sensitivity is an immutable property of the map, set at
/// construction from the configuration.
#[derive(Debug, Clone)]
pub struct ViewMap {
    rules: Vec<Rule>,
    case_sensitive: bool,
}

impl ViewMap {
    /// Build from classical `{src, targ}` mappings.
    pub fn classical(entries: &[ViewEntry], case_sensitive: bool) -> Result<ViewMap, RelayError> {
        if entries.is_empty() {
            return Err(RelayError::InvalidView("no view entries".to_string()));
        }
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            let (exclude, src_text) = match entry.src.strip_prefix('-') {
                Some(stripped) => (true, stripped),
                None => (false, entry.src.as_str()),
            };
            let targ_text = entry.targ.strip_prefix('-').unwrap_or(&entry.targ);
            let src = Pattern::compile(src_text, case_sensitive)?;
            let targ = Pattern::compile(targ_text, case_sensitive)?;
            if src.wildcards != targ.wildcards {
                return Err(RelayError::InvalidView(format!(
                    "wildcards must pair up between `{}` and `{}`",
                    entry.src, entry.targ
                )));
            }
            rules.push(Rule { exclude, src, targ });
        }
        Ok(ViewMap {
            rules,
            case_sensitive,
        })
    }

    /// Build from stream mappings: each entry scopes the whole subtree of
    /// the named streams.
    pub fn streams(
        entries: &[StreamViewEntry],
        case_sensitive: bool,
    ) -> Result<ViewMap, RelayError> {
        let view_entries: Vec<ViewEntry> = entries
            .iter()
            .map(|e| ViewEntry {
                src: format!("{}/...", e.src),
                targ: format!("{}/...", e.targ),
            })
            .collect();
        ViewMap::classical(&view_entries, case_sensitive)
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Index of the rule that decides `path` on the source side, if any.
    fn winning_rule(&self, path: &str) -> Option<&Rule> {
        self.rules.iter().rev().find(|rule| rule.src.matches(path))
    }

    fn winning_rule_target(&self, path: &str) -> Option<&Rule> {
        self.rules.iter().rev().find(|rule| rule.targ.matches(path))
    }

    /// Is this source depot path inside the configured projection?
    pub fn in_scope(&self, path: &str) -> bool {
        self.winning_rule(path).is_some_and(|rule| !rule.exclude)
    }

    /// Translate a source path to its target counterpart.
    pub fn to_target(&self, path: &str) -> Option<String> {
        let rule = self.winning_rule(path)?;
        if rule.exclude {
            return None;
        }
        rule.src.translate(&rule.targ, path)
    }

    /// Translate a target path back to its source counterpart.
    pub fn to_source(&self, path: &str) -> Option<String> {
        let rule = self.winning_rule_target(path)?;
        if rule.exclude {
            return None;
        }
        rule.targ.translate(&rule.src, path)
    }

    /// The view lines to install in the source workspace spec, mapping
    /// depot syntax to client syntax under `client_name`.
    pub fn source_client_view(&self, client_name: &str) -> Vec<String> {
        self.client_view(client_name, |rule| &rule.src)
    }

    /// The view lines to install in the target workspace spec.
    pub fn target_client_view(&self, client_name: &str) -> Vec<String> {
        self.client_view(client_name, |rule| &rule.targ)
    }

    fn client_view(&self, client_name: &str, side: impl Fn(&Rule) -> &Pattern) -> Vec<String> {
        self.rules
            .iter()
            .map(|rule| {
                let depot = &side(rule).text;
                let relative = depot.trim_start_matches('/');
                let prefix = if rule.exclude { "-" } else { "" };
                format!("{prefix}{depot} //{client_name}/{relative}")
            })
            .collect()
    }
}

/// Translate one wildcard name (e.g. a stream matched by `//src/rel*`)
/// through a `{src, targ}` pattern pair. Used by stream provisioning.
pub fn wildcard_translate(
    src: &str,
    targ: &str,
    name: &str,
    case_sensitive: bool,
) -> Result<Option<String>, RelayError> {
    let src = Pattern::compile(src, case_sensitive)?;
    let targ = Pattern::compile(targ, case_sensitive)?;
    if src.wildcards != targ.wildcards {
        return Err(RelayError::InvalidView(format!(
            "wildcards must pair up between `{}` and `{}`",
            src.text, targ.text
        )));
    }
    Ok(src.translate(&targ, name))
}
