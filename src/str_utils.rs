/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Splits `s` into consecutive slices of at most `size` characters, never
/// cutting through a UTF-8 sequence. The last slice may be shorter.
pub fn chunk_chars(s: &str, size: usize) -> Vec<&str> {
    if size == 0 || s.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::with_capacity(s.len() / size + 1);
    let mut start = 0;
    for (count, (idx, _)) in s.char_indices().enumerate() {
        if count > 0 && count % size == 0 {
            chunks.push(&s[start..idx]);
            start = idx;
        }
    }
    chunks.push(&s[start..]);
    chunks
}

/// Removes one layer of matching single or double quotes.
pub fn strip_quotes(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return &s[1..s.len() - 1];
        }
    }
    s
}
