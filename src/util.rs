use anyhow::anyhow;
use std::any::Any;

/// Maximum number of characters stored in a job run's input or output snippet.
pub(crate) const SNIPPET_CHARS: usize = 500;

/// Returns at most `max_chars` characters of `text`, cut on a character boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text.get(..end).unwrap_or(text),
        None => text,
    }
}

pub(crate) fn snippet(text: &str) -> &str {
    truncate_chars(text, SNIPPET_CHARS)
}

/// Turns a caught panic payload into an error that can be logged.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
