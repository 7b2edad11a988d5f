//! Pulls a function name out of a raw `debug` string and formats it for display.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ID_FUNCTION_CALL: Regex =
        Regex::new(r"^\s*\[?[\w-]+\]?\s*:?\s*Function Call\s*:\s*([A-Za-z_][\w.-]*)").unwrap();
    static ref ID_CALL_RESPONSE: Regex =
        Regex::new(r"^\s*\[?[\w-]+\]?\s*:?\s*Call Response\s*:\s*([A-Za-z_][\w.-]*)").unwrap();
    static ref FUNCTION_CALL: Regex =
        Regex::new(r"Function Call\s*:\s*([A-Za-z_][\w.-]*)").unwrap();
    static ref CALL_RESPONSE: Regex =
        Regex::new(r"Call Response\s*:\s*([A-Za-z_][\w.-]*)").unwrap();
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Tries, in order: `<id> Function Call : name`, `<id> Call Response : name`,
/// the same two without an id, and finally the whole trimmed string when it is a
/// bare identifier.
pub fn extract_function_name(debug: &str) -> Option<String> {
    for pattern in [
        &*ID_FUNCTION_CALL,
        &*ID_CALL_RESPONSE,
        &*FUNCTION_CALL,
        &*CALL_RESPONSE,
    ] {
        if let Some(name) = pattern.captures(debug).and_then(|c| c.get(1)) {
            return Some(name.as_str().to_string());
        }
    }

    let trimmed = debug.trim();
    if IDENTIFIER.is_match(trimmed) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// `get_destinations` -> `Get Destinations`, `searchFlights` -> `Search Flights`.
pub fn humanize(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == '.' || ch.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.push(ch);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_prefixed_patterns() {
        assert_eq!(
            extract_function_name("[call_12] Function Call : get_weather").as_deref(),
            Some("get_weather")
        );
        assert_eq!(
            extract_function_name("abc123 Call Response : get_weather\n{\"temp\":3}").as_deref(),
            Some("get_weather")
        );
    }

    #[test]
    fn test_plain_patterns() {
        assert_eq!(
            extract_function_name("Function Call : search_flights").as_deref(),
            Some("search_flights")
        );
        assert_eq!(
            extract_function_name("Call Response: book_hotel").as_deref(),
            Some("book_hotel")
        );
    }

    #[test]
    fn test_bare_identifier_fallback() {
        assert_eq!(
            extract_function_name("  get_destinations \n").as_deref(),
            Some("get_destinations")
        );
        assert_eq!(extract_function_name("Thinking about it"), None);
        assert_eq!(extract_function_name("9lives"), None);
        assert_eq!(extract_function_name(""), None);
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("get_destinations"), "Get Destinations");
        assert_eq!(humanize("searchFlights"), "Search Flights");
        assert_eq!(humanize("APIStatus"), "APIStatus");
        assert_eq!(humanize("x"), "X");
    }
}
