//! JSON-RPC 2.0 message shapes (§3) and the synthetic error codes payments
//! and authorization emit back to clients (§6, §7).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code used for every synthesized error this crate emits.
/// The spec reserves this single code for all CEP-8 / authorization
/// synthetic errors; distinguishing them is done by `message`, not by code.
pub const SYNTHETIC_ERROR_CODE: i64 = -32000;

pub const MSG_UNAUTHORIZED: &str = "Unauthorized";
pub const MSG_PAYMENT_DECLINED_BY_CLIENT_HANDLER: &str = "Payment declined by client handler";
pub const MSG_PAYMENT_DECLINED_BY_CLIENT_POLICY: &str = "Payment declined by client policy";
pub const MSG_PAYMENT_DECLINED_BY_SERVER_POLICY: &str = "Payment declined by server policy";
pub const MSG_PAYMENT_REJECTED: &str = "Payment rejected";

/// A JSON-RPC 2.0 message in one of its three shapes. Requests carry an id;
/// notifications must not; responses carry either `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: Value,
    #[serde(flatten)]
    pub payload: JsonRpcResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponsePayload {
    Result { result: Value },
    Error { error: JsonRpcError },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The literal string `"2.0"`. A dedicated type (rather than `String`) so a
/// malformed version field fails to deserialize instead of being silently
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "2.0")]
pub struct JsonRpcVersion;

impl JsonRpcMessage {
    /// Parse raw event content into a JSON-RPC message, rejecting shapes
    /// that don't match any of the three variants (e.g. a request missing
    /// `method`, or a response with neither `result` nor `error`).
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn to_content(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            JsonRpcMessage::Request(r) => r.params.as_ref(),
            JsonRpcMessage::Notification(n) => n.params.as_ref(),
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// `params._meta.progressToken`, preserved across wrapping per §3.
    pub fn progress_token(&self) -> Option<String> {
        self.params()?
            .get("_meta")?
            .get("progressToken")
            .map(value_as_token_string)?
    }
}

fn value_as_token_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn synthetic_error_response(id: Value, message: impl Into<String>, data: Option<Value>) -> JsonRpcMessage {
    JsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: JsonRpcVersion,
        id,
        payload: JsonRpcResponsePayload::Error {
            error: JsonRpcError {
                code: SYNTHETIC_ERROR_CODE,
                message: message.into(),
                data,
            },
        },
    })
}

pub fn notification(method: impl Into<String>, params: Value) -> JsonRpcMessage {
    JsonRpcMessage::Notification(JsonRpcNotification {
        jsonrpc: JsonRpcVersion,
        method: method.into(),
        params: Some(params),
    })
}

/// Identify a priced capability the way §4.A exclusions and §4.P pricing do:
/// `tool:<name>` | `prompt:<name>` | `resource:<uri>`.
pub fn capability_identifier(method: &str, params: Option<&Value>) -> Option<String> {
    let name = params
        .and_then(|p| p.get("name").or_else(|| p.get("uri")))
        .and_then(|v| v.as_str());
    match method {
        "tools/call" => name.map(|n| format!("tool:{n}")),
        "prompts/get" => name.map(|n| format!("prompt:{n}")),
        "resources/read" => name.map(|n| format!("resource:{n}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request() {
        let msg = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"add"}}"#).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some("tools/call"));
    }

    #[test]
    fn parses_notification_without_id() {
        let msg = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(msg.is_notification());
    }

    #[test]
    fn rejects_malformed_response() {
        // Neither `result` nor `error` present.
        let err = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn progress_token_round_trips() {
        let msg = JsonRpcMessage::parse(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"_meta":{"progressToken":"tok-1"}}}"#,
        )
        .unwrap();
        assert_eq!(msg.progress_token(), Some("tok-1".to_string()));
    }

    #[test]
    fn capability_identifier_formats() {
        assert_eq!(
            capability_identifier("tools/call", Some(&json!({"name": "add"}))),
            Some("tool:add".to_string())
        );
        assert_eq!(
            capability_identifier("resources/read", Some(&json!({"uri": "file:///a"}))),
            Some("resource:file:///a".to_string())
        );
        assert_eq!(capability_identifier("initialize", None), None);
    }
}
