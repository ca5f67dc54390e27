//! Light text normalization before synthesis
//!
//! Chat replies arrive as loosely formatted text. TTS engines read
//! markdown marks aloud and run list items together, so replies are
//! reshaped into plain sentences with a few pause hints.

/// Words that get a short pause when they open a sentence
const CONNECTIVES: &[&str] = &[
    "so", "well", "however", "also", "actually", "anyway", "okay", "now", "then", "first",
    "finally", "alright",
];

const TERMINAL: &[char] = &['.', '!', '?'];

/// Reshape `text` into plain sentences suitable for speech
#[must_use]
pub fn normalize_for_speech(text: &str) -> String {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let line = strip_markup(line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.ends_with(|c: char| TERMINAL.contains(&c) || c == ':' || c == ';' || c == ',') {
            sentences.push(line.to_string());
        } else {
            sentences.push(format!("{line}."));
        }
    }

    let words: Vec<&str> = sentences.iter().flat_map(|s| s.split_whitespace()).collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut sentence_start = true;

    for (i, word) in words.iter().enumerate() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);

        let has_next = i + 1 < words.len();
        if sentence_start && has_next && CONNECTIVES.contains(&word.to_lowercase().as_str()) {
            out.push(',');
        }
        sentence_start = word.ends_with(TERMINAL);
    }

    if !out.is_empty() && !out.ends_with(TERMINAL) {
        // A dangling ':' ';' or ',' becomes a full stop
        if out.ends_with([':', ';', ',']) {
            out.pop();
        }
        out.push('.');
    }

    out
}

/// Remove markdown emphasis, code, heading, and bullet marks from one line
fn strip_markup(line: &str) -> String {
    let trimmed = line.trim_start();
    let trimmed = trimmed.trim_start_matches('#');
    let trimmed = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
        .or_else(|| trimmed.strip_prefix("> "))
        .unwrap_or(trimmed);

    trimmed
        .replace("**", "")
        .replace("__", "")
        .chars()
        .filter(|c| !matches!(c, '*' | '`'))
        .collect()
}
