//! Transfer configuration: the YAML file handed to `-c`, its serde model,
//! and the validation performed before any server is contacted.
//!
//! Integer-valued options accept arithmetic expressions (`"10 * 5"`), so
//! they deserialize as strings and are evaluated on access.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::RelayError;

/// Stream types the target side may declare.
pub const STREAM_TYPES: [&str; 5] = ["mainline", "release", "development", "virtual", "task"];

/// Connection settings for one server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub p4port: String,
    pub p4user: String,
    pub p4client: String,
}

/// One classical view mapping line. A leading `-` on `src` marks an
/// exclusion; the same prefix must then appear on `targ`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ViewEntry {
    pub src: String,
    pub targ: String,
}

/// One stream view mapping. The target side is realized as streams of the
/// declared type and parent during setup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamViewEntry {
    pub src: String,
    pub targ: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub parent: String,
}

/// The full transfer configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub source: ServerConfig,
    pub target: ServerConfig,

    pub workspace_root: PathBuf,
    #[serde(default = "default_transfer_client")]
    pub transfer_client: String,
    #[serde(default)]
    pub logfile: Option<PathBuf>,
    #[serde(default = "default_counter_name")]
    pub counter_name: String,

    #[serde(default)]
    pub views: Vec<ViewEntry>,
    #[serde(default)]
    pub stream_views: Vec<StreamViewEntry>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub transfer_target_stream: Option<String>,

    #[serde(default)]
    pub historical_start_change: Option<u64>,
    #[serde(default = "default_batch_size", deserialize_with = "string_or_int")]
    pub change_batch_size: String,
    #[serde(default)]
    pub change_description_format: Option<String>,
    #[serde(default)]
    pub change_map_file: Option<String>,
    #[serde(default)]
    pub ignore_files: Vec<String>,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    #[serde(default, deserialize_with = "opt_string_or_int")]
    pub poll_interval: Option<String>,
    #[serde(default = "default_report_interval", deserialize_with = "string_or_int")]
    pub report_interval: String,
    #[serde(default = "default_retries", deserialize_with = "string_or_int")]
    pub retries: String,
    #[serde(default = "default_superuser")]
    pub superuser: String,
    #[serde(default, deserialize_with = "opt_string_or_int")]
    pub reset_connection: Option<String>,
    #[serde(default)]
    pub end_datetime: Option<String>,
}

fn default_transfer_client() -> String {
    "transfer".to_string()
}

fn default_counter_name() -> String {
    "depot_relay".to_string()
}

fn default_batch_size() -> String {
    "1000".to_string()
}

fn default_report_interval() -> String {
    "30".to_string()
}

fn default_retries() -> String {
    "3".to_string()
}

fn default_superuser() -> String {
    "y".to_string()
}

fn default_true() -> bool {
    true
}

fn string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(i64),
    }

    Ok(match StringOrInt::deserialize(deserializer)? {
        StringOrInt::String(v) => v,
        StringOrInt::Int(v) => v.to_string(),
    })
}

fn opt_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(i64),
    }

    Ok(Option::<StringOrInt>::deserialize(deserializer)?.map(|v| match v {
        StringOrInt::String(s) => s,
        StringOrInt::Int(i) => i.to_string(),
    }))
}

/// `transfer_target_stream` is written both as a bare string and as a
/// single-element list in the wild; accept either.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        String(String),
        Seq(Vec<String>),
    }

    Ok(match Option::<StringOrSeq>::deserialize(deserializer)? {
        None => None,
        Some(StringOrSeq::String(s)) => Some(s),
        Some(StringOrSeq::Seq(v)) => v.into_iter().next(),
    })
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Config, RelayError> {
        let text = fs::read_to_string(path)
            .map_err(|e| RelayError::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&text).map_err(RelayError::config)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate option combinations before any server is contacted.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.views.is_empty() && self.stream_views.is_empty() {
            return Err(RelayError::config(
                "One of options views/stream_views must be specified",
            ));
        }
        if !self.stream_views.is_empty() && self.transfer_target_stream.is_none() {
            return Err(RelayError::config(
                "Option transfer_target_stream must be specified if streams are being used",
            ));
        }
        if self.workspace_root.as_os_str().is_empty() {
            return Err(RelayError::config("Option workspace_root must not be blank"));
        }
        for entry in &self.stream_views {
            if !STREAM_TYPES.contains(&entry.stream_type.as_str()) {
                return Err(RelayError::config(format!(
                    "Stream type `{}` is not one of {}",
                    entry.stream_type,
                    STREAM_TYPES.join("/")
                )));
            }
            let src_wild = entry.src.matches('*').count();
            let targ_wild = entry.targ.matches('*').count();
            if src_wild != targ_wild {
                return Err(RelayError::config(format!(
                    "Wildcards must match between src `{}` and targ `{}`",
                    entry.src, entry.targ
                )));
            }
        }
        if self.superuser != "y" && self.superuser != "n" {
            return Err(RelayError::config("Option superuser must be y or n"));
        }
        // Evaluate every integer expression once so a typo fails at startup.
        self.change_batch_size()?;
        self.report_interval()?;
        self.retries()?;
        self.poll_interval()?;
        self.reset_connection()?;
        self.end_datetime()?;
        for pattern in &self.ignore_files {
            regex::Regex::new(pattern).map_err(|e| {
                RelayError::config(format!("ignore_files pattern `{pattern}`: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn change_batch_size(&self) -> Result<u64, RelayError> {
        eval_int_option("change_batch_size", &self.change_batch_size)
    }

    pub fn report_interval(&self) -> Result<u64, RelayError> {
        eval_int_option("report_interval", &self.report_interval)
    }

    pub fn retries(&self) -> Result<u64, RelayError> {
        eval_int_option("retries", &self.retries)
    }

    pub fn poll_interval(&self) -> Result<Option<u64>, RelayError> {
        self.poll_interval
            .as_deref()
            .map(|s| eval_int_option("poll_interval", s))
            .transpose()
    }

    pub fn reset_connection(&self) -> Result<Option<u64>, RelayError> {
        self.reset_connection
            .as_deref()
            .map(|s| eval_int_option("reset_connection", s))
            .transpose()
    }

    /// Wall-clock cutoff, `YYYY/M/D HH:MM` with single digits accepted.
    pub fn end_datetime(&self) -> Result<Option<NaiveDateTime>, RelayError> {
        self.end_datetime
            .as_deref()
            .map(parse_end_datetime)
            .transpose()
    }

    pub fn is_superuser(&self) -> bool {
        self.superuser == "y"
    }

    /// Compiled `ignore_files` patterns. Validation has already checked
    /// each one, so compilation here cannot fail.
    pub fn ignore_filters(&self) -> Vec<regex::Regex> {
        self.ignore_files
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect()
    }
}

/// Parse `YYYY/M/D HH:MM` into a naive local timestamp.
pub fn parse_end_datetime(text: &str) -> Result<NaiveDateTime, RelayError> {
    NaiveDateTime::parse_from_str(text.trim(), "%Y/%m/%d %H:%M")
        .map_err(|e| RelayError::config(format!("end_datetime `{text}`: {e}")))
}

/// Evaluate an integer option that may be an arithmetic expression.
fn eval_int_option(name: &str, text: &str) -> Result<u64, RelayError> {
    let value = eval_expr(text)
        .ok_or_else(|| RelayError::config(format!("Option {name}: `{text}` is not an integer expression")))?;
    u64::try_from(value)
        .map_err(|_| RelayError::config(format!("Option {name}: `{text}` must not be negative")))
}

/// Tiny expression grammar: integers, `+ - * /`, parentheses.
fn eval_expr(text: &str) -> Option<i64> {
    let tokens = tokenize(text)?;
    let mut pos = 0;
    let value = parse_sum(&tokens, &mut pos)?;
    if pos == tokens.len() { Some(value) } else { None }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(i64),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(text: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '0'..='9' => {
                let mut value = 0i64;
                while let Some(&d) = chars.peek() {
                    if let Some(digit) = d.to_digit(10) {
                        value = value.checked_mul(10)?.checked_add(digit as i64)?;
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Num(value));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

fn parse_sum(tokens: &[Token], pos: &mut usize) -> Option<i64> {
    let mut value = parse_product(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        match op {
            Token::Plus => {
                *pos += 1;
                value = value.checked_add(parse_product(tokens, pos)?)?;
            }
            Token::Minus => {
                *pos += 1;
                value = value.checked_sub(parse_product(tokens, pos)?)?;
            }
            _ => break,
        }
    }
    Some(value)
}

fn parse_product(tokens: &[Token], pos: &mut usize) -> Option<i64> {
    let mut value = parse_atom(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        match op {
            Token::Star => {
                *pos += 1;
                value = value.checked_mul(parse_atom(tokens, pos)?)?;
            }
            Token::Slash => {
                *pos += 1;
                let rhs = parse_atom(tokens, pos)?;
                if rhs == 0 {
                    return None;
                }
                value = value.checked_div(rhs)?;
            }
            _ => break,
        }
    }
    Some(value)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Option<i64> {
    match tokens.get(*pos)? {
        Token::Num(n) => {
            *pos += 1;
            Some(*n)
        }
        Token::Minus => {
            *pos += 1;
            Some(-parse_atom(tokens, pos)?)
        }
        Token::Open => {
            *pos += 1;
            let value = parse_sum(tokens, pos)?;
            if tokens.get(*pos) == Some(&Token::Close) {
                *pos += 1;
                Some(value)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn minimal_yaml() -> &'static str {
        indoc! {"
            source:
              p4port: src:1666
              p4user: transfer
              p4client: transfer
            target:
              p4port: targ:1666
              p4user: transfer
              p4client: transfer
            workspace_root: /tmp/transfer
            views:
              - src: '//depot/inside/...'
                targ: '//depot/import/...'
        "}
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.counter_name, "depot_relay");
        assert_eq!(config.change_batch_size().unwrap(), 1000);
        assert!(config.case_sensitive);
        assert!(config.is_superuser());
        assert!(config.poll_interval().unwrap().is_none());
    }

    /// Integer options may be written as arithmetic expressions.
    #[test]
    fn integer_expressions_evaluate() {
        let yaml = format!("{}change_batch_size: 10 * 5\n", minimal_yaml());
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.change_batch_size().unwrap(), 50);

        assert_eq!(eval_expr("2 + 3 * 4"), Some(14));
        assert_eq!(eval_expr("(2 + 3) * 4"), Some(20));
        assert_eq!(eval_expr("100 / 4 - 5"), Some(20));
        assert_eq!(eval_expr("7 seconds"), None);
        assert_eq!(eval_expr("10 / 0"), None);
    }

    /// Validation requires at least one of views / stream_views.
    #[test]
    fn missing_views_is_rejected() {
        let yaml = indoc! {"
            source: {p4port: 's:1666', p4user: u, p4client: c}
            target: {p4port: 't:1666', p4user: u, p4client: c}
            workspace_root: /tmp/transfer
        "};
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(
            err.contains("One of options views/stream_views must be specified"),
            "unexpected message: {err}"
        );
    }

    /// Streams require a transfer target stream placeholder.
    #[test]
    fn streams_require_target_stream() {
        let yaml = indoc! {"
            source:
              p4port: src:1666
              p4user: transfer
              p4client: transfer
            target:
              p4port: targ:1666
              p4user: transfer
              p4client: transfer
            workspace_root: /tmp/transfer
            stream_views:
              - src: '//src_streams/rel*'
                targ: '//targ_streams/rel*'
                type: development
                parent: '//targ_streams/main'
        "};
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(
            err.contains("Option transfer_target_stream must be specified"),
            "unexpected message: {err}"
        );

        let yaml = format!("{yaml}transfer_target_stream: '//targ_streams/transfer'\n");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        config.validate().unwrap();
    }

    /// Stream wildcard counts must pair up and the type must be known.
    #[test]
    fn stream_entry_validation() {
        let yaml = indoc! {"
            source:
              p4port: src:1666
              p4user: transfer
              p4client: transfer
            target:
              p4port: targ:1666
              p4user: transfer
              p4client: transfer
            workspace_root: /tmp/transfer
            transfer_target_stream: '//targ_streams/transfer'
            stream_views:
              - src: '//src_streams/*rel*'
                targ: '//targ_streams/rel*'
                type: development
                parent: '//targ_streams/main'
        "};
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Wildcards must match"), "unexpected: {err}");

        let yaml = yaml.replace("type: development", "type: trunk");
        let yaml = yaml.replace("*rel*", "rel*");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Stream type"), "unexpected: {err}");
    }

    /// transfer_target_stream accepts both a string and a one-element list.
    #[test]
    fn target_stream_string_or_list() {
        let base = indoc! {"
            source: {p4port: 's:1666', p4user: u, p4client: c}
            target: {p4port: 't:1666', p4user: u, p4client: c}
            workspace_root: /tmp/transfer
            views: [{src: '//a/...', targ: '//b/...'}]
        "};
        let as_string = format!("{base}transfer_target_stream: '//x/y'\n");
        let as_list = format!("{base}transfer_target_stream: ['//x/y']\n");
        let a: Config = serde_yaml::from_str(&as_string).unwrap();
        let b: Config = serde_yaml::from_str(&as_list).unwrap();
        assert_eq!(a.transfer_target_stream.as_deref(), Some("//x/y"));
        assert_eq!(b.transfer_target_stream.as_deref(), Some("//x/y"));
    }

    #[test]
    fn end_datetime_accepts_single_digits() {
        let parsed = parse_end_datetime("2026/3/5 09:30").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d %H:%M").to_string(), "2026-03-05 09:30");
        assert!(parse_end_datetime("next tuesday").is_err());
    }

    #[test]
    fn bad_ignore_pattern_is_a_config_error() {
        let yaml = format!("{}ignore_files: ['[unclosed']\n", minimal_yaml());
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
