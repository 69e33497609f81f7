//! Parsing of the `claude` CLI `stream-json` output format.

use serde::Deserialize;
use serde_json::Value;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<Usage>,
    },

    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Token usage reported in the final result event.
#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" | "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "*".to_string());
            format!("Searching: {}", pattern)
        }
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis, respecting char boundaries.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar.rs"},"id":"123"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();

        if let StreamEvent::Assistant {
            message,
            session_id,
        } = event
        {
            assert_eq!(session_id, "abc");
            assert_eq!(message.content.len(), 1);
            if let ContentBlock::ToolUse { name, input, .. } = &message.content[0] {
                assert_eq!(name, "Read");
                assert_eq!(
                    input.get("file_path").unwrap().as_str().unwrap(),
                    "/foo/bar.rs"
                );
            } else {
                panic!("Expected ToolUse");
            }
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_parse_unknown_content_block() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        if let StreamEvent::Assistant { message, .. } = event {
            assert!(matches!(message.content[0], ContentBlock::Other));
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_parse_result_with_cost_and_usage() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","session_id":"s-1","total_cost_usd":0.42,"usage":{"input_tokens":100,"output_tokens":20}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();

        match event {
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                session_id,
                total_cost_usd,
                usage,
            } => {
                assert_eq!(subtype, "success");
                assert_eq!(result.as_deref(), Some("done"));
                assert!(!is_error);
                assert_eq!(session_id.as_deref(), Some("s-1"));
                assert_eq!(total_cost_usd, Some(0.42));
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.output_tokens, 20);
            }
            _ => panic!("Expected Result event"),
        }
    }

    #[test]
    fn test_parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc-123","tools":[]}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::System {
                subtype,
                session_id,
            } => {
                assert_eq!(subtype, "init");
                assert_eq!(session_id.as_deref(), Some("abc-123"));
            }
            _ => panic!("Expected System event"),
        }
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(
            describe_tool_use("Bash", &input),
            "Running: cargo test --release"
        );
    }

    #[test]
    fn test_truncate_str_handles_multibyte() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("ééééééééééé", 6), "ééé...");
    }
}
