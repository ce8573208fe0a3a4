//! Reconciliation of streamed assistant text with the terminal result text.
//!
//! Claude Code's `result` event only carries the text of the last assistant
//! turn. Anything streamed before a tool invocation would be lost if the
//! final field were used verbatim, so both are merged.

/// Merge the cumulative streamed text with the final result text.
///
/// The return value is always one of `streamed`, `final_text`, or
/// `streamed + "\n" + final_text`, and `merge_final_text(s, s) == s`.
#[must_use]
pub fn merge_final_text(streamed: &str, final_text: &str) -> String {
    if final_text.is_empty() {
        return streamed.to_string();
    }
    if streamed.is_empty() {
        return final_text.to_string();
    }
    if streamed.ends_with(final_text) {
        return streamed.to_string();
    }
    if final_text.ends_with(streamed) {
        return final_text.to_string();
    }
    format!("{streamed}\n{final_text}")
}
