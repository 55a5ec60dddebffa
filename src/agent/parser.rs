//! Parsing model replies in the ReAct loop.
//!
//! Replies are tried as plain JSON, then as a fenced code block, then as
//! the widest `{...}` span, and finally scanned for a final-answer keyword.

use std::sync::LazyLock;

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde_json::Value;

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid regex")
});

static ANY_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

static FINAL_KEYWORDS: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(["final_answer", "final answer", "最终答案"])
        .expect("valid patterns")
});

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// What a reply asks the loop to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedReply {
    /// One or more tool calls. Several calls in one reply may run in parallel.
    ToolCalls { thought: String, calls: Vec<ToolCall> },
    FinalAnswer { thought: String, answer: String },
    Invalid { reason: String },
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn arguments(raw: Option<&Value>) -> Value {
    match raw {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| serde_json::json!({ "input": s })),
        Some(other) => other.clone(),
    }
}

fn call_from(obj: &serde_json::Map<String, Value>) -> Option<ToolCall> {
    let name = obj
        .get("action")
        .or_else(|| obj.get("tool"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())?;
    Some(ToolCall {
        name: name.to_string(),
        arguments: arguments(obj.get("action_input").or_else(|| obj.get("arguments"))),
    })
}

/// Interpret a parsed JSON value.
fn interpret(value: &Value) -> ParsedReply {
    let Some(obj) = value.as_object() else {
        return ParsedReply::Invalid {
            reason: "reply is not a JSON object".to_string(),
        };
    };
    let thought = obj.get("thought").map(as_text).unwrap_or_default();

    if let Some(answer) = obj.get("final_answer").map(as_text)
        && !answer.trim().is_empty()
    {
        return ParsedReply::FinalAnswer { thought, answer };
    }

    if let Some(Value::Array(items)) = obj.get("actions") {
        let calls: Vec<ToolCall> = items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(call_from)
            .collect();
        if !calls.is_empty() {
            return ParsedReply::ToolCalls { thought, calls };
        }
    }

    match call_from(obj) {
        Some(call) => ParsedReply::ToolCalls {
            thought,
            calls: vec![call],
        },
        None => ParsedReply::Invalid {
            reason: "reply has neither an action nor a final_answer".to_string(),
        },
    }
}

fn keyword_answer(reply: &str) -> Option<String> {
    let m = FINAL_KEYWORDS.find(reply)?;
    let rest = reply[m.end()..]
        .trim_start_matches(|c: char| c == '"' || c == ':' || c == '：' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '"' || c == '}' || c.is_whitespace());
    if rest.is_empty() {
        Some(reply.trim().to_string())
    } else {
        Some(rest.to_string())
    }
}

pub fn parse_reply(reply: &str) -> ParsedReply {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return interpret(&value);
    }
    if let Some(caps) = FENCED.captures(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(&caps[1])
    {
        return interpret(&value);
    }
    if let Some(m) = ANY_OBJECT.find(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(m.as_str())
    {
        return interpret(&value);
    }
    if let Some(answer) = keyword_answer(trimmed) {
        return ParsedReply::FinalAnswer {
            thought: crate::agent::truncate_chars(trimmed, 200),
            answer,
        };
    }
    ParsedReply::Invalid {
        reason: format!(
            "could not parse reply: {}",
            crate::agent::truncate_chars(trimmed, 200)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_plain_json_tool_call() {
        let parsed = parse_reply(
            r#"{"thought": "look it up", "action": "search_videos", "action_input": {"query": "rust"}}"#,
        );
        assert_eq!(
            parsed,
            ParsedReply::ToolCalls {
                thought: "look it up".into(),
                calls: vec![ToolCall {
                    name: "search_videos".into(),
                    arguments: json!({"query": "rust"}),
                }],
            }
        );
    }

    #[test]
    fn test_fenced_final_answer() {
        let parsed = parse_reply("Here you go:\n```json\n{\"thought\": \"ok\", \"final_answer\": \"42\"}\n```");
        assert_eq!(
            parsed,
            ParsedReply::FinalAnswer {
                thought: "ok".into(),
                answer: "42".into()
            }
        );
    }

    #[test]
    fn test_embedded_object_and_string_arguments() {
        let parsed = parse_reply(
            r#"I will call a tool {"action": "echo", "action_input": "{\"message\": \"hi\"}"} now"#,
        );
        let ParsedReply::ToolCalls { calls, .. } = parsed else {
            panic!("expected tool call");
        };
        assert_eq!(calls[0].arguments, json!({"message": "hi"}));
    }

    #[test]
    fn test_parallel_actions() {
        let parsed = parse_reply(
            r#"{"thought": "both", "actions": [{"action": "current_time"}, {"action": "echo", "action_input": {"message": "x"}}]}"#,
        );
        let ParsedReply::ToolCalls { calls, .. } = parsed else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn test_keyword_heuristic() {
        let parsed = parse_reply("Final Answer: the talk covers ownership");
        assert_eq!(
            parsed,
            ParsedReply::FinalAnswer {
                thought: "Final Answer: the talk covers ownership".into(),
                answer: "the talk covers ownership".into()
            }
        );
    }

    #[test]
    fn test_unparseable() {
        assert!(matches!(parse_reply("hmm, not sure"), ParsedReply::Invalid { .. }));
        assert!(matches!(parse_reply(r#"{"thought": "x"}"#), ParsedReply::Invalid { .. }));
    }
}
