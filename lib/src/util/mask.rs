//! Redaction of secrets embedded in command lines before they are logged.

use regex::Regex;

/// Replacement for every masked span.
pub const MASK: &str = "<*masked*>";

/// Replaces each capture group matched by `pattern` with [`MASK`].
///
/// A pattern without capture groups masks its whole match. Nested groups are
/// masked by their outermost span.
#[must_use]
pub fn mask(text: &str, pattern: &Regex) -> String {
    let mut masked = String::with_capacity(text.len());
    let mut cursor = 0;

    for captures in pattern.captures_iter(text) {
        let spans: Vec<_> = if captures.len() > 1 {
            captures.iter().skip(1).flatten().collect()
        } else {
            captures.get(0).into_iter().collect()
        };
        for span in spans {
            if span.start() < cursor {
                continue;
            }
            masked.push_str(&text[cursor..span.start()]);
            masked.push_str(MASK);
            cursor = span.end();
        }
    }

    masked.push_str(&text[cursor..]);
    masked
}

/// Applies every pattern in turn.
#[must_use]
pub fn mask_all<'a>(text: &str, patterns: impl IntoIterator<Item = &'a Regex>) -> String {
    patterns
        .into_iter()
        .fold(text.to_owned(), |text, pattern| mask(&text, pattern))
}

// Tests ----------------------------------------------------------------------
