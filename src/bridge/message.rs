//! The protocol envelope: `{ "type", "requestId", "payload" }`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Negotiate,
    ListTools,
    CallTool,
    ReadResource,
    GetPrompt,
    Shutdown,
    Error,
}

/// Caller-chosen correlation id, echoed on the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: MessageType, request_id: Option<RequestId>, payload: Value) -> Self {
        Self {
            kind,
            request_id,
            payload,
        }
    }

    /// Decode one frame. On failure, returns whatever request id could be
    /// salvaged so the error can still be correlated.
    pub fn parse(body: &[u8]) -> Result<Self, (Option<RequestId>, AppError)> {
        serde_json::from_slice::<Message>(body).map_err(|e| {
            let request_id = serde_json::from_slice::<Value>(body)
                .ok()
                .and_then(|v| v.get("requestId").cloned())
                .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
            (
                request_id,
                AppError::MalformedMessage {
                    message: e.to_string(),
                },
            )
        })
    }

    /// Success response: same type as the request, same id.
    pub fn reply(request: &Message, payload: Value) -> Self {
        Self::new(request.kind, request.request_id.clone(), payload)
    }

    /// Error response. The payload carries the structured error plus a
    /// human-readable `message`.
    pub fn error(request_id: Option<RequestId>, error: &AppError) -> Self {
        let mut payload = serde_json::to_value(error).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut payload {
            map.insert("message".into(), Value::String(error.to_string()));
            map.insert("class".into(), json!(error.class()));
        }
        Self::new(MessageType::Error, request_id, payload)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|e| AppError::Transport {
            message: format!("cannot encode message: {e}"),
        })
    }

    /// A string field of the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
