//! Splits the chat response body into `StreamEvent`s.
//!
//! The server writes JSON objects back to back with no separator, so object
//! boundaries are recovered from the literal `}{` sequence. A string value that
//! itself contains `}{` will be cut in two; both halves then fail to parse and
//! are skipped.

use crate::types::StreamEvent;

/// Upper bound on the unparsed tail carried between reads.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// Splits concatenated objects on `}{` and restores the braces the split removed:
/// every fragment but the first lost a `{`, every fragment but the last lost a
/// `}`. Empty fragments are dropped; the result is not validated as JSON.
pub fn split_fragments(input: &str) -> Vec<String> {
    if input.trim().is_empty() {
        return Vec::new();
    }

    let parts: Vec<&str> = input.split("}{").collect();
    let last = parts.len() - 1;

    parts
        .iter()
        .enumerate()
        .filter_map(|(i, part)| {
            let mut fragment = String::with_capacity(part.len() + 2);
            if i > 0 {
                fragment.push('{');
            }
            fragment.push_str(part);
            if i < last {
                fragment.push('}');
            }
            let trimmed = fragment.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Parses one fragment, giving up quietly on anything that is not a complete
/// JSON object.
pub fn try_parse(fragment: &str) -> Option<StreamEvent> {
    let fragment = fragment.trim();
    if !(fragment.starts_with('{') && fragment.ends_with('}')) {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(fragment) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::trace!("Skipping unparseable fragment ({} bytes): {}", fragment.len(), e);
            None
        }
    }
}

/// Splits and parses `input`, keeping only the fragments that parse.
pub fn decode_events(input: &str) -> Vec<StreamEvent> {
    split_fragments(input)
        .iter()
        .filter_map(|f| try_parse(f))
        .collect()
}

/// Incremental decoder for a body that arrives in arbitrary pieces.
///
/// An unparseable trailing fragment that opens an object is kept and retried
/// once more bytes arrive; any other unparseable fragment is dropped.
#[derive(Debug, Default)]
pub struct FragmentDecoder {
    pending: String,
}

impl FragmentDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.pending.push_str(chunk);

        let fragments = split_fragments(&self.pending);
        let last = fragments.len().saturating_sub(1);
        let mut events = Vec::with_capacity(fragments.len());
        let mut carry = String::new();

        for (i, fragment) in fragments.into_iter().enumerate() {
            match try_parse(&fragment) {
                Some(event) => events.push(event),
                None if i == last && fragment.starts_with('{') => carry = fragment,
                None => tracing::debug!("Dropping malformed fragment ({} bytes)", fragment.len()),
            }
        }

        if carry.len() > MAX_PENDING_BYTES {
            tracing::warn!("Discarding {} bytes of unparseable stream tail", carry.len());
            carry.clear();
        }
        self.pending = carry;
        events
    }

    /// Bytes still waiting for the rest of their object.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Ends the stream. Whatever is still pending is incomplete and is discarded.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let tail = std::mem::take(&mut self.pending);
        match try_parse(&tail) {
            Some(event) => vec![event],
            None => {
                if !tail.trim().is_empty() {
                    tracing::debug!("Stream ended with {} bytes of incomplete data", tail.len());
                }
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_two_objects() {
        let input = r#"{"content":"Hel"}{"content":"lo"}"#;
        assert_eq!(
            split_fragments(input),
            vec![r#"{"content":"Hel"}"#, r#"{"content":"lo"}"#]
        );
        let events = decode_events(input);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content.as_deref(), Some("Hel"));
        assert_eq!(events[1].content.as_deref(), Some("lo"));
    }

    #[test]
    fn test_joined_objects_come_back_in_order() {
        let objects = vec![
            json!({"debug": "step one"}),
            json!({"status_message": "Searching"}),
            json!({"function_call": {"name": "lookup", "arguments": {"q": "x"}}}),
            json!({"content": "done"}),
            json!({"error": "bad", "isError": true, "errorType": "agent"}),
        ];
        let joined: String = objects.iter().map(|o| o.to_string()).collect();

        let decoded: Vec<serde_json::Value> = decode_events(&joined)
            .iter()
            .map(|e| serde_json::to_value(e).unwrap())
            .collect();
        assert_eq!(decoded, objects);
    }

    #[test]
    fn test_nested_objects_keep_their_closing_braces() {
        let tool = json!({
            "debug": "Function Call : get_destinations",
            "function_call": {"name": "get_destinations", "arguments": {"region": "EU"}}
        });
        let block = json!({"block": {"props": {"file": "a.py"}, "code": "print(1)\n", "done": true}});
        let joined = format!("{}{}{}", tool, block, json!({"content": "hi"}));

        let events = decode_events(&joined);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].function_name(), Some("get_destinations"));
        assert_eq!(
            events[0].function_call.as_ref().unwrap().arguments,
            json!({"region": "EU"})
        );
        assert!(events[1].block.as_ref().unwrap().done);
        assert_eq!(events[2].content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(split_fragments("").is_empty());
        assert!(decode_events("  \n ").is_empty());
    }

    #[test]
    fn test_partial_trailing_fragment_is_skipped() {
        let events = decode_events(r#"{"content":"a"}{"content":"partial"#);
        assert_eq!(events, vec![StreamEvent::content("a")]);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let input = r#"{"debug":"x"}{"content":"y"}garbage"#;
        assert_eq!(decode_events(input), decode_events(input));
    }

    #[test]
    fn test_decoder_reassembles_split_object() {
        let mut decoder = FragmentDecoder::new();
        assert!(decoder.push(r#"{"content":"partial"#).is_empty());
        assert_eq!(decoder.pending(), r#"{"content":"partial"#);

        let events = decoder.push(r#" done"}{"content":"next"}"#);
        assert_eq!(
            events,
            vec![
                StreamEvent::content("partial done"),
                StreamEvent::content("next")
            ]
        );
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_split_at_boundary() {
        let mut decoder = FragmentDecoder::new();
        let first = decoder.push(r#"{"content":"a"}{"con"#);
        assert_eq!(first, vec![StreamEvent::content("a")]);
        let second = decoder.push(r#"tent":"b"}"#);
        assert_eq!(second, vec![StreamEvent::content("b")]);
    }

    #[test]
    fn test_decoder_discards_stray_tail() {
        let mut decoder = FragmentDecoder::new();
        assert!(decoder.push("xx").is_empty());
        assert!(decoder.pending().is_empty());
        assert_eq!(
            decoder.push(r#"{"content":"b"}"#),
            vec![StreamEvent::content("b")]
        );
        assert_eq!(
            decoder.push(r#"{"content":"c"}"#),
            vec![StreamEvent::content("c")]
        );
    }

    #[test]
    fn test_decoder_reassembles_nested_object() {
        let mut decoder = FragmentDecoder::new();
        let first = decoder.push(r#"{"function_call":{"name":"lookup","arguments":{"q":"x"}}}{"blo"#);
        assert_eq!(first[0].function_name(), Some("lookup"));
        let second = decoder.push(r#"ck":{"props":{},"code":"x
","done":true}}"#);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].block.as_ref().unwrap().code, "x\n");
    }

    #[test]
    fn test_decoder_drops_malformed_middle() {
        let mut decoder = FragmentDecoder::new();
        let events = decoder.push(r#"{"content":"a"}{not json}{"content":"b"}"#);
        assert_eq!(
            events,
            vec![StreamEvent::content("a"), StreamEvent::content("b")]
        );
        assert!(decoder.finish().is_empty());
    }
}
