use serde_json::Value;

/// One event line emitted by the in-sandbox agent runner.
///
/// Every streamed line is expected (not guaranteed) to be a JSON object with
/// a `type` discriminator. Unknown kinds are preserved verbatim in `Other` so
/// upstream schema additions flow through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Assistant turn — `message.content` holds the SDK content blocks.
    Assistant { message: Value },
    /// Terminal result of a run.
    Result {
        subtype: Option<String>,
        num_turns: Option<u64>,
        cost_usd: Option<f64>,
        model: Option<String>,
        structured_output: Option<Value>,
    },
    /// Terminal error reported by the runner (or injected by the host when a
    /// failure happens after streaming already began).
    Error { error: String },
    /// Runner lifecycle event (`subtype == "init"` carries the model name).
    System {
        subtype: Option<String>,
        model: Option<String>,
    },
    /// Diagnostic output wrapped by the host-side stream bridge.
    Stderr { data: String },
    /// Host-side warning (e.g. output buffer overflow).
    Warning { message: String },
    /// Echo of a user turn; logged server-side, never rendered.
    User,
    /// Unrecognized event kind, passed through verbatim.
    Other(Value),
}

impl AgentEvent {
    /// Parses one streamed line. Returns `None` for lines that are not a JSON
    /// object — callers decide whether to drop or forward those raw.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let obj = value.as_object()?;

        let event = match obj.get("type").and_then(Value::as_str) {
            Some("assistant") => AgentEvent::Assistant {
                message: obj.get("message").cloned().unwrap_or(Value::Null),
            },
            Some("result") => AgentEvent::Result {
                subtype: str_field(obj, "subtype"),
                num_turns: obj.get("num_turns").and_then(Value::as_u64),
                // Newer runners report total_cost_usd, older ones cost_usd
                cost_usd: obj
                    .get("total_cost_usd")
                    .or_else(|| obj.get("cost_usd"))
                    .and_then(Value::as_f64),
                model: str_field(obj, "model"),
                structured_output: obj.get("structured_output").cloned(),
            },
            Some("error") => AgentEvent::Error {
                error: str_field(obj, "error").unwrap_or_else(|| "unknown error".to_string()),
            },
            Some("system") => AgentEvent::System {
                subtype: str_field(obj, "subtype"),
                model: str_field(obj, "model"),
            },
            Some("stderr") => AgentEvent::Stderr {
                data: str_field(obj, "data").unwrap_or_default(),
            },
            Some("warning") => AgentEvent::Warning {
                message: str_field(obj, "message").unwrap_or_default(),
            },
            Some("user") => AgentEvent::User,
            _ => AgentEvent::Other(value.clone()),
        };
        Some(event)
    }

    /// True for the terminal error event — the signal that a reused sandbox
    /// should be treated as dead by the pool.
    pub fn is_error(&self) -> bool {
        matches!(self, AgentEvent::Error { .. })
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assistant() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        match AgentEvent::parse(line) {
            Some(AgentEvent::Assistant { message }) => {
                assert_eq!(message["content"][0]["text"], "hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_result_prefers_total_cost() {
        let line = r#"{"type":"result","subtype":"success","num_turns":3,"total_cost_usd":0.12,"cost_usd":9.9}"#;
        match AgentEvent::parse(line) {
            Some(AgentEvent::Result {
                num_turns, cost_usd, ..
            }) => {
                assert_eq!(num_turns, Some(3));
                assert_eq!(cost_usd, Some(0.12));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_result_legacy_cost_field() {
        let line = r#"{"type":"result","cost_usd":0.05}"#;
        match AgentEvent::parse(line) {
            Some(AgentEvent::Result { cost_usd, .. }) => assert_eq!(cost_usd, Some(0.05)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_and_is_error() {
        let event = AgentEvent::parse(r#"{"type":"error","error":"boom"}"#).unwrap();
        assert!(event.is_error());
        assert_eq!(
            event,
            AgentEvent::Error {
                error: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_kind_passes_through_verbatim() {
        let line = r#"{"type":"telemetry","spans":[1,2,3]}"#;
        match AgentEvent::parse(line) {
            Some(AgentEvent::Other(value)) => {
                assert_eq!(value, json!({"type":"telemetry","spans":[1,2,3]}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_missing_type_is_other() {
        match AgentEvent::parse(r#"{"data":1}"#) {
            Some(AgentEvent::Other(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_non_json_is_none() {
        assert!(AgentEvent::parse("plain text").is_none());
        assert!(AgentEvent::parse("[1,2]").is_none());
    }
}
