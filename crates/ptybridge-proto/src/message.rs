//! Wire types for the bridge's newline-delimited JSON protocol.
//!
//! Inbound lines decode into [`ControlMessage`]; everything the bridge writes
//! is a [`BridgeEvent`]. Both are internally tagged on the `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec;

/// A control message sent by the orchestrating process.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Bytes to write to the terminal.
    Input {
        #[serde(default)]
        data: Option<String>,
        /// `"base64"` for binary payloads; anything else is UTF-8 text.
        #[serde(default)]
        encoding: Option<String>,
    },
    /// Live geometry update. Absent or zero dimensions are ignored.
    Resize {
        #[serde(default)]
        rows: Option<i64>,
        #[serde(default)]
        cols: Option<i64>,
    },
    /// Request delivery of a signal to the child.
    Terminate {
        #[serde(default)]
        signal: Option<SignalSpec>,
    },
    /// Liveness check; `ts` is echoed back untouched.
    Ping {
        #[serde(default)]
        ts: Value,
    },
}

impl ControlMessage {
    /// Bytes carried by an `input` message, decoded per its `encoding`.
    ///
    /// Returns `Ok(None)` for anything that is not an `input` message.
    pub fn input_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        match self {
            ControlMessage::Input { data, encoding } => {
                let data = data.as_deref().unwrap_or_default();
                let bytes = match encoding.as_deref() {
                    Some("base64") => codec::decode_payload(data)?,
                    _ => data.as_bytes().to_vec(),
                };
                Ok(Some(bytes))
            }
            _ => Ok(None),
        }
    }
}

/// How a `terminate` message names its signal.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum SignalSpec {
    Name(String),
    Number(i64),
    /// Any other JSON value; resolves to the default signal.
    Other(Value),
}

/// An event written by the bridge to its controller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeEvent {
    /// The child was spawned. Always the first event of a session.
    Ready { pid: i32 },
    /// Terminal output, base64 encoded.
    Output { data: String },
    /// Reply to a `ping`.
    Pong { ts: Value },
    /// Fatal setup failure.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// The session is over. Always the last event.
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

impl BridgeEvent {
    /// Build an `output` event from raw terminal bytes.
    pub fn output(bytes: &[u8]) -> Self {
        BridgeEvent::Output {
            data: codec::encode_payload(bytes),
        }
    }

    /// Build an `error` event with a machine-readable code.
    pub fn error(message: impl Into<String>, code: &str) -> Self {
        BridgeEvent::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    /// Decoded payload of an `output` event.
    pub fn output_bytes(&self) -> Option<Vec<u8>> {
        match self {
            BridgeEvent::Output { data } => codec::decode_payload(data).ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_exit_event_field_names() {
        let event = BridgeEvent::Exit {
            exit_code: Some(0),
            signal: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "exit", "exitCode": 0, "signal": null}));
    }

    #[test]
    fn test_error_event_omits_missing_code() {
        let event = BridgeEvent::Error {
            message: "boom".into(),
            code: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "boom"}));

        let value = serde_json::to_value(BridgeEvent::error("openpty failed", "openpty_failed")).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "message": "openpty failed", "code": "openpty_failed"})
        );
    }

    #[test]
    fn test_output_event_is_base64() {
        let value = serde_json::to_value(BridgeEvent::output(b"hi\r\n")).unwrap();
        assert_eq!(value, json!({"type": "output", "data": "aGkNCg=="}));
    }

    #[test]
    fn test_empty_output_encodes_to_empty_string() {
        let event = BridgeEvent::output(b"");
        assert_eq!(event, BridgeEvent::Output { data: String::new() });
        assert_eq!(event.output_bytes(), Some(Vec::new()));
    }

    #[test]
    fn test_input_bytes_text_and_base64() {
        let text: ControlMessage =
            serde_json::from_value(json!({"type": "input", "data": "ls\n"})).unwrap();
        assert_eq!(text.input_bytes().unwrap(), Some(b"ls\n".to_vec()));

        let binary: ControlMessage = serde_json::from_value(
            json!({"type": "input", "data": "AP8KGw==", "encoding": "base64"}),
        )
        .unwrap();
        assert_eq!(binary.input_bytes().unwrap(), Some(vec![0x00, 0xff, 0x0a, 0x1b]));
    }

    #[test]
    fn test_input_bytes_rejects_bad_base64() {
        let msg: ControlMessage = serde_json::from_value(
            json!({"type": "input", "data": "not base64!", "encoding": "base64"}),
        )
        .unwrap();
        assert!(msg.input_bytes().is_err());
    }

    #[test]
    fn test_input_without_data_is_empty() {
        let msg: ControlMessage = serde_json::from_value(json!({"type": "input"})).unwrap();
        assert_eq!(msg.input_bytes().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_signal_spec_variants() {
        let by_name: ControlMessage =
            serde_json::from_value(json!({"type": "terminate", "signal": "SIGKILL"})).unwrap();
        assert_eq!(
            by_name,
            ControlMessage::Terminate {
                signal: Some(SignalSpec::Name("SIGKILL".into()))
            }
        );

        let by_number: ControlMessage =
            serde_json::from_value(json!({"type": "terminate", "signal": 9})).unwrap();
        assert_eq!(
            by_number,
            ControlMessage::Terminate {
                signal: Some(SignalSpec::Number(9))
            }
        );

        let absent: ControlMessage =
            serde_json::from_value(json!({"type": "terminate"})).unwrap();
        assert_eq!(absent, ControlMessage::Terminate { signal: None });
    }
}
