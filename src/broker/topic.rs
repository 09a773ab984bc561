//! Topic routing-key matching.
//!
//! Keys and patterns are `.`-separated words. In a pattern `*` matches
//! exactly one word and `#` matches zero or more words.

/// Returns `true` if `routing_key` matches the binding `pattern`.
///
/// # Examples
///
/// ```
/// use aide::broker::topic::matches;
///
/// assert!(matches("log.#", "log.worker.worker.kin"));
/// assert!(matches("task.*.facade.worker.kin", "task.echo.facade.worker.kin"));
/// assert!(!matches("task.*.kin", "task.echo.facade.worker.kin"));
/// ```
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key
            .split_first()
            .is_some_and(|(head, tail)| head == word && match_words(rest, tail)),
    }
}
