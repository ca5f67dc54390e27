//! Directive scanning
//!
//! A directive looks like `[ACTION:name|key:value|key:value]`. The scanner
//! walks the text left to right and never backtracks, so spans never
//! overlap.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::NaiveDateTime;

use super::date::{format_date, parse_date};
use crate::error::ActionError;

/// Opening marker of a directive
pub const DIRECTIVE_OPEN: &str = "[ACTION:";

const DIRECTIVE_CLOSE: char = ']';

/// A parsed directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDirective {
    /// Action name
    pub name: String,
    /// Parameters in key order
    pub parameters: BTreeMap<String, String>,
    /// Structured form of the `date` parameter, when it parsed
    pub date: Option<NaiveDateTime>,
}

impl ActionDirective {
    /// Look up a parameter
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// One directive occurrence in a text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveSpan {
    /// Byte range of the whole `[ACTION:...]` token
    pub range: Range<usize>,
    /// The parsed directive, or why it could not be parsed
    pub directive: Result<ActionDirective, ActionError>,
}

/// Find every directive in `text`, in order
#[must_use]
pub fn scan(text: &str) -> Vec<DirectiveSpan> {
    scan_at(text, chrono::Local::now().naive_local())
}

/// Like [`scan`], resolving relative dates against `now`
#[must_use]
pub fn scan_at(text: &str, now: NaiveDateTime) -> Vec<DirectiveSpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(DIRECTIVE_OPEN) {
        let start = cursor + offset;
        let body_start = start + DIRECTIVE_OPEN.len();

        // An unterminated directive is left in the text as-is
        let Some(close) = text[body_start..].find(DIRECTIVE_CLOSE) else {
            break;
        };
        let end = body_start + close + DIRECTIVE_CLOSE.len_utf8();

        spans.push(DirectiveSpan {
            range: start..end,
            directive: parse_body(&text[body_start..body_start + close], now),
        });
        cursor = end;
    }

    spans
}

/// Parse the text between `[ACTION:` and `]`
///
/// # Errors
///
/// Returns `MissingName` when the name segment is empty
pub fn parse_body(body: &str, now: NaiveDateTime) -> Result<ActionDirective, ActionError> {
    let mut segments = body.split('|');
    let name = segments.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(ActionError::MissingName);
    }

    let mut parameters = BTreeMap::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment.split_once(':').unwrap_or((segment, ""));
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        parameters.insert(key.to_string(), value.trim().to_string());
    }

    let date = parameters
        .get("date")
        .and_then(|value| parse_date(value, now));
    if let Some(at) = date {
        parameters.insert("date".to_string(), format_date(at));
    }

    Ok(ActionDirective {
        name: name.to_string(),
        parameters,
        date,
    })
}
