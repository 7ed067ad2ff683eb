//! Just enough of the JSON-RPC envelope to route calls: the coordinator needs
//! the method name (to spot `initialize`) and the id (to answer). Everything
//! else in the message is handed to the operation layer untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INITIALIZE_METHOD: &str = "initialize";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Message {
    /// A call expects an answer; a notification (no id) does not.
    pub fn is_call(&self) -> bool { self.method.is_some() && self.id.is_some() }

    pub fn is_initialize(&self) -> bool { self.method.as_deref() == Some(INITIALIZE_METHOD) }
}

/// A request body: one message or a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub messages: Vec<Message>,
    pub batch: bool,
}

impl Envelope {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        match value {
            Value::Array(items) => {
                let messages = items.into_iter().map(serde_json::from_value).collect::<Result<Vec<Message>, _>>()?;
                Ok(Self { messages, batch: true })
            }
            other => Ok(Self { messages: vec![serde_json::from_value(other)?], batch: false }),
        }
    }

    pub fn is_initialize(&self) -> bool { self.messages.iter().any(Message::is_initialize) }

    pub fn is_empty(&self) -> bool { self.messages.is_empty() }
}

pub fn result(id: Value, result: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn error(id: Value, code: i64, message: &str) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({"jsonrpc": "2.0", "method": method, "params": params})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_batch() {
        let env = Envelope::parse(br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#).unwrap();
        assert!(!env.batch);
        assert!(env.is_initialize());
        assert!(env.messages[0].is_call());

        let env = Envelope::parse(br#"[{"jsonrpc":"2.0","method":"notifications/initialized"},{"jsonrpc":"2.0","id":"a","method":"ping"}]"#).unwrap();
        assert!(env.batch);
        assert!(!env.is_initialize());
        assert!(!env.messages[0].is_call());
        assert!(env.messages[1].is_call());
    }

    #[test]
    fn rejects_non_json() {
        assert!(Envelope::parse(b"{not json").is_err());
        assert!(Envelope::parse(b"42").is_err());
    }

    #[test]
    fn builders_shape_messages() {
        assert_eq!(result(serde_json::json!(7), serde_json::json!({}))["id"], 7);
        assert_eq!(error(Value::Null, METHOD_NOT_FOUND, "nope")["error"]["code"], METHOD_NOT_FOUND);
        assert!(notification("notifications/message", serde_json::json!({})).get("id").is_none());
    }
}
