//! Text normalization for "same entry, different keystrokes" comparisons
//!
//! Two locally entered strings that differ only in whitespace runs or
//! invisible characters are considered the same entry.

use regex::Regex;
use std::sync::OnceLock;

static WHITESPACE: OnceLock<Regex> = OnceLock::new();
static INVISIBLE: OnceLock<Regex> = OnceLock::new();

fn whitespace() -> &'static Regex {
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

fn invisible() -> &'static Regex {
    // zero-width space/joiners and BOM
    INVISIBLE.get_or_init(|| {
        Regex::new(r"[\u{200B}\u{200C}\u{200D}\u{2060}\u{FEFF}]").expect("invisible pattern is valid")
    })
}

/// Strip invisible characters, collapse whitespace runs and trim.
pub fn normalize_text(text: &str) -> String {
    let visible = invisible().replace_all(text, "");
    whitespace().replace_all(&visible, " ").trim().to_string()
}

pub fn trivially_equal(a: &str, b: &str) -> bool {
    normalize_text(a) == normalize_text(b)
}
