use std::borrow::Cow;

/// Maximum length (in characters) of a stored folder name.
pub const MAX_FOLDER_NAME_CHARS: usize = 100;

/// Maximum length (in characters) of a stored feed title.
pub const MAX_TITLE_CHARS: usize = 300;

/// Removes control characters from text that came from a remote feed or an
/// import file.
///
/// Strips C0 controls (except tab, newline and carriage return), DEL and the
/// C1 range. Clean input is returned borrowed without allocating.
///
/// # Examples
///
/// ```
/// use feedgate::util::strip_control_chars;
///
/// assert_eq!(strip_control_chars("Evil\x1b[31m Feed"), "Evil[31m Feed");
/// assert_eq!(strip_control_chars("plain"), "plain");
/// ```
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !is_stripped(*c)).collect())
}

fn is_stripped(c: char) -> bool {
    c.is_control() && c != '\t' && c != '\n' && c != '\r'
}

/// Sanitizes a single-line label: strips control characters, collapses
/// whitespace runs to one space, trims, and truncates to `max_chars`.
///
/// Returns `None` when nothing printable remains.
pub fn clean_label(s: &str, max_chars: usize) -> Option<String> {
    let stripped = strip_control_chars(s);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(max_chars).collect())
}

/// Case-insensitive lookup key for a folder name.
///
/// Two requested names that produce the same key refer to the same folder.
pub fn folder_key(name: &str) -> String {
    clean_label(name, MAX_FOLDER_NAME_CHARS)
        .unwrap_or_default()
        .to_lowercase()
}
