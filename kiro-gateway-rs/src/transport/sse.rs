//! Frames the Kiro `generateAssistantResponse` body.
//!
//! The upstream response is neither JSON nor text-based SSE: it is a raw
//! byte stream in which self-delimited JSON objects appear concatenated
//! with no separators between them. Objects are identified by one of a
//! small set of known leading key patterns; once a candidate start is
//! found, brace depth is tracked (with string/escape awareness) to find
//! the matching close brace.

use crate::models::kiro::KiroStreamEvent;

/// Leading patterns that identify the start of a recognized object.
const PREFIXES: &[&str] = &[
    r#"{"content":"#,
    r#"{"name":"#,
    r#"{"followupPrompt":"#,
    r#"{"input":"#,
    r#"{"stop":"#,
    r#"{"contextUsagePercentage":"#,
];

/// Longest prefix, in bytes - how much trailing noise is safe to keep
/// around in case a prefix is still arriving.
fn max_prefix_len() -> usize {
    PREFIXES.iter().map(|p| p.len()).max().unwrap_or(0)
}

/// Drain as many complete objects as currently available from `buffer`,
/// consuming their bytes (and any skipped noise before them) and returning
/// the decoded events in order. Anything left in `buffer` afterwards is
/// either unrecognized noise within `max_prefix_len` of the tail, or the
/// head of an object still awaiting more bytes.
pub fn drain_events(buffer: &mut String) -> Vec<KiroStreamEvent> {
    let mut events = Vec::new();

    loop {
        let Some(start) = find_prefix_start(buffer, 0) else {
            let keep_from = buffer.len().saturating_sub(max_prefix_len());
            if keep_from > 0 {
                buffer.drain(..keep_from);
            }
            break;
        };

        let rest = &buffer[start..];
        let prefix_fully_present = PREFIXES.iter().any(|p| rest.starts_with(p));
        if !prefix_fully_present {
            // The prefix itself is still arriving; wait for more bytes.
            if start > 0 {
                buffer.drain(..start);
            }
            break;
        }

        match find_matching_brace(buffer, start) {
            Some(end) => {
                let object = buffer[start..end].to_string();
                events.extend(parse_event_object(&object));
                buffer.drain(..end);
            }
            None => {
                // Object body incomplete; drop leading noise, keep the rest.
                if start > 0 {
                    buffer.drain(..start);
                }
                break;
            }
        }
    }

    events
}

/// One-shot helper for tests and non-streaming callers: frame a complete
/// body in one call.
pub fn parse_chunk(chunk: &str) -> Vec<KiroStreamEvent> {
    let mut buffer = chunk.to_string();
    drain_events(&mut buffer)
}

fn find_prefix_start(s: &str, from: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let rest = &s[i..];
            if PREFIXES
                .iter()
                .any(|p| rest.starts_with(p) || p.starts_with(rest))
            {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Find the index just past the brace matching the `{` at `start`, tracking
/// quoted-string and backslash-escape state so that braces inside string
/// literals are ignored.
fn find_matching_brace(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn parse_event_object(object: &str) -> Vec<KiroStreamEvent> {
    let Ok(data) = serde_json::from_str::<serde_json::Value>(object) else {
        return Vec::new();
    };
    let mut events = Vec::new();

    if let Some(content) = data.get("content").and_then(|v| v.as_str()) {
        events.push(KiroStreamEvent::Content(content.to_string()));
        return events;
    }

    if let Some(name) = data.get("name").and_then(|v| v.as_str()) {
        let tool_use_id = data
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let input = match data.get("input") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        events.push(KiroStreamEvent::ToolStart {
            name: name.to_string(),
            tool_use_id,
            input,
        });
        if data.get("stop").and_then(|v| v.as_bool()) == Some(true) {
            events.push(KiroStreamEvent::ToolStop);
        }
        return events;
    }

    // `{"input": <str>}` without a `name` is a continuation of the open tool call.
    if let Some(input) = data.get("input").and_then(|v| v.as_str()) {
        events.push(KiroStreamEvent::ToolInput(input.to_string()));
        return events;
    }

    if data.get("stop").and_then(|v| v.as_bool()) == Some(true) {
        events.push(KiroStreamEvent::ToolStop);
        return events;
    }

    if let Some(pct) = data.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
        events.push(KiroStreamEvent::ContextUsage(pct));
        return events;
    }

    // `{"followupPrompt": ...}` carries no client-visible event; swallow it.
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_concatenated_objects_with_no_separators() {
        let body = concat!(
            r#"{"content":"<thinking>hello</thinking>\n\nHi"}"#,
            r#"{"name":"search","toolUseId":"t1","input":"{"}"#,
            r#"{"input":"\"q\":\"x\"}"}"#,
            r#"{"stop":true}"#,
        );
        let events = parse_chunk(body);
        assert_eq!(events.len(), 4);
        match &events[0] {
            KiroStreamEvent::Content(t) => assert!(t.contains("<thinking>")),
            other => panic!("unexpected: {other:?}"),
        }
        match &events[1] {
            KiroStreamEvent::ToolStart { name, tool_use_id, input } => {
                assert_eq!(name, "search");
                assert_eq!(tool_use_id, "t1");
                assert_eq!(input, "{");
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &events[2] {
            KiroStreamEvent::ToolInput(s) => assert_eq!(s, "\"q\":\"x\"}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(events[3], KiroStreamEvent::ToolStop));
    }

    #[test]
    fn ignores_braces_inside_quoted_strings() {
        let body = r#"{"content":"a { b } c \"d}\" e"}"#;
        let events = parse_chunk(body);
        assert_eq!(events.len(), 1);
        match &events[0] {
            KiroStreamEvent::Content(t) => assert_eq!(t, "a { b } c \"d}\" e"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incomplete_object_is_held_for_more_data() {
        let mut buffer = String::from(r#"{"content":"partial"#);
        let events = drain_events(&mut buffer);
        assert!(events.is_empty());
        assert!(!buffer.is_empty());

        buffer.push_str("\"}");
        let events = drain_events(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn context_usage_and_followup_prompt() {
        let events = parse_chunk(r#"{"contextUsagePercentage":42.5}"#);
        assert_eq!(events.len(), 1);
        match &events[0] {
            KiroStreamEvent::ContextUsage(pct) => assert!((pct - 42.5).abs() < f64::EPSILON),
            other => panic!("unexpected: {other:?}"),
        }

        let events = parse_chunk(r#"{"followupPrompt":{"content":"next?"}}"#);
        assert!(events.is_empty());
    }
}
