//! Bidirectional wire protocol for client connections.
//!
//! Every frame is a self-describing envelope tagged by `type`. Request ids
//! are client-chosen and echoed on replies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Code context accompanying a completion request.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CodeContext {
    pub prefix: String,
    pub suffix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
}

/// Editor-state telemetry captured at request time.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ContextualTelemetry {
    pub version_id: i32,
    pub trigger_type_id: i32,
    pub language_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caret_line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_char_length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_document_position: Option<f64>,
}

/// User-behavior telemetry captured at request time.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct BehavioralTelemetry {
    /// Milliseconds since a completion was last shown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_since_last_shown: Option<i64>,
    /// Milliseconds since a completion was last accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_since_last_accepted: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_speed: Option<f64>,
}

/// One message in a chat history.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Per-model reply payload.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ModelReply {
    pub model_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    /// Confidence in [0, 1], absent when the model errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logprobs: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Machine-readable error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    RateLimited,
    InvalidRequest,
    Busy,
    Timeout,
    Internal,
}

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
#[ts(export)]
pub enum ClientFrame {
    #[serde(rename = "completion.request")]
    CompletionRequest {
        request_id: String,
        model_ids: Vec<i32>,
        context: CodeContext,
        contextual_telemetry: ContextualTelemetry,
        behavioral_telemetry: BehavioralTelemetry,
        /// Multi-file context change indices this request depends on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        change_indices: Option<Vec<u64>>,
    },
    #[serde(rename = "completion.feedback")]
    CompletionFeedback {
        /// Request id of the original completion request.
        request_id: String,
        model_id: i32,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        shown_at: Vec<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ground_truth: Option<String>,
    },
    #[serde(rename = "chat.request")]
    ChatRequest {
        request_id: String,
        chat_id: String,
        model_id: i32,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "context.update")]
    ContextUpdate {
        request_id: String,
        file_path: String,
        content: String,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
#[ts(export)]
pub enum ServerFrame {
    #[serde(rename = "completion.partial")]
    CompletionPartial {
        request_id: String,
        reply: ModelReply,
    },
    #[serde(rename = "completion.final")]
    CompletionFinal {
        request_id: String,
        /// Models that produced a reply (success or error) before the seal.
        received: Vec<i32>,
        /// Models still outstanding when the deadline fired.
        timed_out: Vec<i32>,
        timeout: bool,
    },
    #[serde(rename = "chat.partial")]
    ChatPartial {
        request_id: String,
        chat_id: String,
        model_id: i32,
        delta: String,
    },
    #[serde(rename = "chat.final")]
    ChatFinal {
        request_id: String,
        chat_id: String,
        model_id: i32,
        timeout: bool,
    },
    /// Ack to the originator of a `context.update`, echoing its request id.
    #[serde(rename = "context.update")]
    ContextAck {
        request_id: String,
        change_index: u64,
        file_path: String,
        digest: String,
    },
    #[serde(rename = "context.broadcast")]
    ContextBroadcast {
        project_token: String,
        change_index: u64,
        file_path: String,
        digest: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorKind,
        message: String,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(request_id: Option<String>, code: ErrorKind, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            request_id,
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_deserialize_by_dotted_type() {
        let raw = r#"{
            "type": "completion.request",
            "requestId": "r-1",
            "modelIds": [1, 2],
            "context": {"prefix": "def add(a, b):\n  ", "suffix": ""},
            "contextualTelemetry": {"versionId": 3, "triggerTypeId": 1, "languageId": 7},
            "behavioralTelemetry": {"typingSpeed": 41.5}
        }"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        let ClientFrame::CompletionRequest {
            request_id,
            model_ids,
            ..
        } = frame
        else {
            panic!("expected completion.request");
        };
        assert_eq!(request_id, "r-1");
        assert_eq!(model_ids, vec![1, 2]);
    }

    #[test]
    fn server_frames_serialize_with_dotted_type() {
        let frame = ServerFrame::CompletionFinal {
            request_id: "r-1".into(),
            received: vec![1],
            timed_out: vec![2],
            timeout: true,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "completion.final");
        assert_eq!(value["timedOut"], serde_json::json!([2]));
    }
}
