//! Defensive decoding of model output into a skill list.
//!
//! Model text is untrusted: the JSON payload may be wrapped in prose or code
//! fences, cut off mid-token, or carry trailing commas. [`parse`] locates
//! candidate payloads, tries a strict decode, then one bounded repair pass
//! (bracket balancing plus truncation back-off) before giving up.
//!
//! Output is deterministic: skills come out in first-seen order, de-duplicated
//! case-insensitively, keeping the casing of the first occurrence.

use std::collections::HashSet;

use serde_json::Value;

/// Longest skill name kept. Anything longer is prose, not a skill.
pub const MAX_SKILL_LEN: usize = 100;

/// Payload start positions tried before giving up.
const MAX_CANDIDATES: usize = 8;

/// Element boundaries the truncation repair backs off through.
const MAX_REPAIR_CUTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("empty model output")]
    Empty,

    #[error("no structured payload in model output")]
    NoPayload,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload has no skills list")]
    MissingSkills,
}

/// Parse raw model text into an ordered, de-duplicated list of skills.
///
/// Accepts a bare JSON array or an object with a `skills` array. Array
/// entries may be strings or objects carrying a `name`/`skill` string;
/// anything else in the array is dropped.
/// A legitimately empty list is `Ok(vec![])`.
pub fn parse(raw: &str) -> Result<Vec<String>, ParseFailure> {
    let text = raw.replace("```json", "").replace("```", "");
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let mut failure = ParseFailure::NoPayload;
    for start in candidate_starts(text).take(MAX_CANDIDATES) {
        match decode_at(&text[start..]) {
            Ok(value) => match extract_entries(&value) {
                Some(entries) => return Ok(normalize(entries)),
                None => failure = ParseFailure::MissingSkills,
            },
            Err(e) => {
                if failure != ParseFailure::MissingSkills {
                    failure = e;
                }
            }
        }
    }
    Err(failure)
}

fn candidate_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    text.char_indices()
        .filter(|(_, c)| matches!(c, '[' | '{'))
        .map(|(i, _)| i)
}

/// Strict decode of the balanced payload at the head of `rest`, falling back
/// to the repair pass.
fn decode_at(rest: &str) -> Result<Value, ParseFailure> {
    match balanced_end(rest) {
        Some(end) => {
            let slice = &rest[..end];
            match serde_json::from_str(slice) {
                Ok(value) => Ok(value),
                Err(strict) => repair(slice).ok_or_else(|| ParseFailure::Malformed(strict.to_string())),
            }
        }
        None => repair(rest)
            .ok_or_else(|| ParseFailure::Malformed("unterminated payload".to_string())),
    }
}

/// Byte offset just past the bracket closing the one at `s[0]`, if any.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// The single repair pass: normalize single quotes when no double quotes are
/// present, close open brackets, and on failure back off to earlier element
/// boundaries (dropping a truncated tail element).
fn repair(fragment: &str) -> Option<Value> {
    let fragment = if fragment.contains('"') {
        fragment.to_string()
    } else {
        fragment.replace('\'', "\"")
    };

    if let Some(value) = close_and_decode(&fragment) {
        return Some(value);
    }
    element_boundaries(&fragment)
        .into_iter()
        .rev()
        .take(MAX_REPAIR_CUTS)
        .find_map(|cut| close_and_decode(&fragment[..cut]))
}

/// Append the closers `fragment` is missing and decode. Rejects fragments
/// that end inside a string: a cut-off string is a partial value.
fn close_and_decode(fragment: &str) -> Option<Value> {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in fragment.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => closers.push(']'),
            '{' => closers.push('}'),
            ']' | '}' => {
                if closers.pop() != Some(c) {
                    return None;
                }
            }
            _ => {}
        }
    }
    if in_string {
        return None;
    }

    let mut out = fragment.trim_end().to_string();
    while out.ends_with(',') || out.ends_with(':') {
        out.pop();
        out.truncate(out.trim_end().len());
    }
    out.extend(closers.iter().rev());
    serde_json::from_str(&strip_trailing_commas(&out)).ok()
}

/// Byte offsets of commas outside strings.
fn element_boundaries(s: &str) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ',' => cuts.push(i),
            _ => {}
        }
    }
    cuts
}

/// Drop commas that directly precede a closing bracket (`["a", "b",]`).
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Pull raw skill entries out of a decoded payload. `None` when there is no
/// skill array at all; entries that carry no name are dropped.
fn extract_entries(value: &Value) -> Option<Vec<&str>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("skills"))
            .and_then(|(_, v)| v.as_array())?,
        _ => return None,
    };
    Some(items.iter().filter_map(entry_name).collect())
}

fn entry_name(item: &Value) -> Option<&str> {
    match item {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("name") || k.eq_ignore_ascii_case("skill"))
            .and_then(|(_, v)| v.as_str()),
        _ => None,
    }
}

fn normalize(entries: Vec<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.chars().count() <= MAX_SKILL_LEN)
        .filter(|s| seen.insert(s.to_lowercase()))
        .map(str::to_string)
        .collect()
}
