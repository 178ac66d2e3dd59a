//! SQL normalization and fingerprinting.
//!
//! [`normalize_sql`] lexically rewrites SQL text into a canonical template:
//! literals, numbers and bind markers become `?`, comments and quoted
//! identifiers disappear, case and whitespace are folded, and list-shaped
//! constructs (`IN (...)`, `ANY(ARRAY[...])`, multi-row `VALUES`) collapse to a
//! single placeholder. [`sql_fingerprint`] hashes that template.
//!
//! The scanner is a single forward pass over the input with one character of
//! lookahead. It never fails: unterminated strings or comments simply swallow
//! the rest of the input.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Placeholder emitted for every literal and bind marker.
const PLACEHOLDER: char = '?';

static RE_MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static RE_SPACE_BEFORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([,)\];])").expect("valid regex"));
static RE_SPACE_AFTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"([(\[])\s+").expect("valid regex"));
static RE_CAST_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*::\s*").expect("valid regex"));
static RE_IN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bin\s*\(\s*(?:\?,\s*)*\?\s*\)").expect("valid regex"));
static RE_ANY_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bany\s*\(\s*array\s*\[\s*(?:\?,\s*)*\?\s*\]\s*\)").expect("valid regex")
});
static RE_VALUES_MULTI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bvalues\s*\(\s*[^)]*?\s*\)(?:\s*,\s*\(\s*[^)]*?\s*\))+")
        .expect("valid regex")
});

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    /// `'...'`, also used for `B'...'` and `X'...'`
    SingleQuoteString,
    /// `E'...'` where `\'` escapes a quote
    EscapedSingleQuoteString,
    /// `"identifier"`
    DoubleQuotedIdentifier,
    /// `$tag$...$tag$`
    DollarQuotedString,
    /// `/* ... */`, nestable
    BlockComment,
    /// `-- ...` up to the end of the line
    LineComment,
}

/// Compute the fingerprint of a SQL statement: lowercase hex SHA-256 of its
/// normalized template.
pub fn sql_fingerprint(sql: &str) -> String {
    hash_template(&normalize_sql(sql))
}

/// Hash an already normalized template.
pub fn hash_template(template: &str) -> String {
    let digest = Sha256::digest(template.as_bytes());
    hex::encode(digest)
}

/// Trim a template and cut it to at most `max` characters, marking the cut
/// with an ellipsis.
pub fn safe_template(template: &str, max: usize) -> String {
    let trimmed = template.trim();
    match trimmed.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Build the normalized, literal-free template of a SQL statement.
pub fn normalize_sql(sql: &str) -> String {
    let scanned = scan(sql);

    let out = RE_MULTI_SPACE.replace_all(&scanned, " ");
    let out = out.trim();
    let out = RE_SPACE_BEFORE.replace_all(out, "$1");
    let out = RE_SPACE_AFTER.replace_all(&out, "$1");
    let out = RE_CAST_SPACE.replace_all(&out, "::");

    let out = RE_IN_LIST.replace_all(&out, "in (?)");
    let out = RE_ANY_ARRAY.replace_all(&out, "any(array[?])");
    let out = RE_VALUES_MULTI.replace_all(&out, "values (?)");

    out.into_owned()
}

/// Lexical pass: replace literals, drop comments and quoted identifiers, fold case.
fn scan(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(sql.len());

    let mut state = State::Normal;
    let mut tag_start = 0usize;
    let mut tag_len = 0usize;
    let mut depth = 0usize;
    let mut i = 0usize;

    while i < len {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match state {
            State::Normal => {
                if ch == '-' && next == Some('-') {
                    state = State::LineComment;
                    i += 2;
                    continue;
                }
                if ch == '/' && next == Some('*') {
                    state = State::BlockComment;
                    depth = 1;
                    i += 2;
                    continue;
                }

                let boundary = !out.chars().next_back().is_some_and(is_ident_char);

                if ch == '$' {
                    if boundary {
                        if let Some(n) = dollar_tag_len(&chars, i) {
                            out.push(PLACEHOLDER);
                            state = State::DollarQuotedString;
                            tag_start = i + 1;
                            tag_len = n;
                            i += n + 2;
                            continue;
                        }
                    }
                    if next.is_some_and(|c| c.is_ascii_digit()) {
                        out.push(PLACEHOLDER);
                        i += 1;
                        while i < len && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                        continue;
                    }
                    out.push('$');
                    i += 1;
                    continue;
                }

                if ch == '\'' {
                    out.push(PLACEHOLDER);
                    state = State::SingleQuoteString;
                    i += 1;
                    continue;
                }
                if boundary && next == Some('\'') {
                    match ch {
                        'e' | 'E' => {
                            out.push(PLACEHOLDER);
                            state = State::EscapedSingleQuoteString;
                            i += 2;
                            continue;
                        }
                        'b' | 'B' | 'x' | 'X' => {
                            out.push(PLACEHOLDER);
                            state = State::SingleQuoteString;
                            i += 2;
                            continue;
                        }
                        _ => {}
                    }
                }

                if ch == '"' {
                    state = State::DoubleQuotedIdentifier;
                    i += 1;
                    continue;
                }

                let starts_number = ch.is_ascii_digit()
                    || (ch == '.' && next.is_some_and(|c| c.is_ascii_digit()));
                if boundary && starts_number {
                    out.push(PLACEHOLDER);
                    i = skip_number(&chars, i);
                    continue;
                }

                if ch.is_whitespace() {
                    out.push(' ');
                } else {
                    out.extend(ch.to_lowercase());
                }
                i += 1;
            }

            State::LineComment => {
                if ch == '\n' || ch == '\r' {
                    state = State::Normal;
                    out.push(' ');
                }
                i += 1;
            }

            State::BlockComment => {
                if ch == '/' && next == Some('*') {
                    depth += 1;
                    i += 2;
                    continue;
                }
                if ch == '*' && next == Some('/') {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        state = State::Normal;
                        out.push(' ');
                    }
                    continue;
                }
                i += 1;
            }

            State::SingleQuoteString => {
                if ch == '\'' {
                    if next == Some('\'') {
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
                i += 1;
            }

            State::EscapedSingleQuoteString => {
                if ch == '\\' && next.is_some() {
                    i += 2;
                    continue;
                }
                if ch == '\'' {
                    if next == Some('\'') {
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
                i += 1;
            }

            State::DoubleQuotedIdentifier => {
                if ch == '"' {
                    if next == Some('"') {
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                    out.push(' ');
                }
                i += 1;
            }

            State::DollarQuotedString => {
                if ch == '$' && closes_dollar_tag(&chars, i, tag_start, tag_len) {
                    state = State::Normal;
                    i += tag_len + 2;
                    continue;
                }
                i += 1;
            }
        }
    }

    out
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Length of the tag of a `$tag$` opener at `i`, or `None` when `i` does not
/// start one. The tag may be empty and must not begin with a digit.
fn dollar_tag_len(chars: &[char], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while let Some(&c) = chars.get(j) {
        if c == '$' {
            return Some(j - i - 1);
        }
        let valid = c == '_' || c.is_alphabetic() || (j > i + 1 && c.is_ascii_digit());
        if !valid {
            return None;
        }
        j += 1;
    }
    None
}

fn closes_dollar_tag(chars: &[char], i: usize, tag_start: usize, tag_len: usize) -> bool {
    let end = i + tag_len + 1;
    if end >= chars.len() || chars[end] != '$' {
        return false;
    }
    chars[i + 1..end] == chars[tag_start..tag_start + tag_len]
}

/// Index just past a numeric literal starting at `i`: digits, one decimal
/// point and an optional exponent.
fn skip_number(chars: &[char], i: usize) -> usize {
    let digit_at = |j: usize| chars.get(j).is_some_and(|c| c.is_ascii_digit());

    let mut j = i;
    let mut seen_dot = false;
    while let Some(&c) = chars.get(j) {
        if c.is_ascii_digit() {
            j += 1;
        } else if c == '.' && !seen_dot {
            seen_dot = true;
            j += 1;
        } else if matches!(c, 'e' | 'E')
            && (digit_at(j + 1)
                || (matches!(chars.get(j + 1), Some('+' | '-')) && digit_at(j + 2)))
        {
            j += 2;
            while digit_at(j) {
                j += 1;
            }
            break;
        } else {
            break;
        }
    }
    j
}
