//! Line-oriented scanning of snap assertion documents.
//!
//! Assertions are the textual wire format of the snap signing authority: a
//! sequence of `field: value` lines where continuation lines begin with a
//! space and belong to the previous field. The chain installer only ever
//! needs single scalar fields out of a document, so this is deliberately a
//! minimal scanner, not a general parser.

/// Returns the value of the first top-level `field:` line in `text`.
///
/// Continuation lines (leading space) never match. The value is everything
/// after the first colon, trimmed.
pub fn scan_field<'a>(text: &'a str, field: &str) -> Option<&'a str> {
    let prefix = format!("{}:", field);
    for line in text.lines() {
        if line.starts_with(' ') {
            continue;
        }
        if let Some(value) = line.strip_prefix(&prefix) {
            return Some(value.trim());
        }
    }
    None
}
