//! Action directives embedded in model replies
//!
//! Replies may carry `[ACTION:name|key:value]` tokens. [`resolve`] finds
//! them, dispatches each one and splices the results back into the text.

mod date;
mod directive;
mod executor;

pub use date::{format_date, parse_date};
pub use directive::{ActionDirective, DIRECTIVE_OPEN, DirectiveSpan, parse_body, scan, scan_at};
pub use executor::{Action, ActionExecutor, BuiltinExecutor, ChainExecutor, ScriptExecutor};

use chrono::NaiveDateTime;
use futures::future::join_all;

use crate::error::ActionError;

/// Replacement for a directive without a name
pub const INVALID_ACTION_MARKER: &str = "[invalid action]";

/// Replacement for a directive whose dispatch failed
#[must_use]
pub fn failure_marker(name: &str) -> String {
    format!("[action failed: {name}]")
}

/// Resolve every directive in `text`
///
/// Dispatches run concurrently; results are spliced back in text order and
/// everything outside the directive spans is kept verbatim.
pub async fn resolve<E>(text: &str, executor: &E) -> String
where
    E: ActionExecutor + ?Sized,
{
    resolve_spans(text, scan(text), executor).await
}

/// Like [`resolve`], resolving relative dates against `now`
pub async fn resolve_at<E>(text: &str, now: NaiveDateTime, executor: &E) -> String
where
    E: ActionExecutor + ?Sized,
{
    resolve_spans(text, scan_at(text, now), executor).await
}

async fn resolve_spans<E>(text: &str, spans: Vec<DirectiveSpan>, executor: &E) -> String
where
    E: ActionExecutor + ?Sized,
{
    if spans.is_empty() {
        return text.to_string();
    }

    let replacements = join_all(spans.iter().map(|span| dispatch(span, executor))).await;

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, replacement) in spans.iter().zip(replacements) {
        out.push_str(&text[cursor..span.range.start]);
        out.push_str(&replacement);
        cursor = span.range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

async fn dispatch<E>(span: &DirectiveSpan, executor: &E) -> String
where
    E: ActionExecutor + ?Sized,
{
    let directive = match &span.directive {
        Ok(directive) => directive,
        Err(ActionError::MissingName) => {
            tracing::warn!("action directive without a name");
            return INVALID_ACTION_MARKER.to_string();
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed action directive");
            return INVALID_ACTION_MARKER.to_string();
        }
    };

    match executor.execute(directive).await {
        Ok(result) => {
            tracing::debug!(action = %directive.name, "action resolved");
            result
        }
        Err(e) => {
            tracing::warn!(action = %directive.name, error = %e, "action failed");
            failure_marker(&directive.name)
        }
    }
}
