//! JSON request decoding and reply generation.
//!
//! Client requests carry a `type` tag:
//! - `AUTHENTICATE` (alias `AUTHENTICATION`): username, password
//! - `REGISTER`: username, password
//! - `MESSAGE`: session_id, receiver (default `BROADCAST`), message
//! - `LOGOUT`: session_id
//!
//! Replies always carry an explicit `status`; see [`Reply`].

use crate::error::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Receiver value addressing every authenticated connection.
pub const BROADCAST: &str = "BROADCAST";

/// Request type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Authenticate,
    Register,
    Message,
    Logout,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Authenticate => "AUTHENTICATE",
            RequestKind::Register => "REGISTER",
            RequestKind::Message => "MESSAGE",
            RequestKind::Logout => "LOGOUT",
        }
    }

    /// Map a wire tag to a kind, accepting legacy spellings.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "AUTHENTICATE" | "AUTHENTICATION" => Some(RequestKind::Authenticate),
            "REGISTER" => Some(RequestKind::Register),
            "MESSAGE" => Some(RequestKind::Message),
            "LOGOUT" => Some(RequestKind::Logout),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed client request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Authenticate {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
    },
    Message {
        session_id: String,
        #[serde(default = "default_receiver")]
        receiver: String,
        message: String,
    },
    Logout {
        session_id: String,
    },
}

fn default_receiver() -> String {
    BROADCAST.to_string()
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Authenticate { .. } => RequestKind::Authenticate,
            Request::Register { .. } => RequestKind::Register,
            Request::Message { .. } => RequestKind::Message,
            Request::Logout { .. } => RequestKind::Logout,
        }
    }
}

// Passwords and session ids stay out of logs.
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Authenticate { username, .. } | Request::Register { username, .. } => f
                .debug_struct(self.kind().as_str())
                .field("username", username)
                .finish_non_exhaustive(),
            Request::Message {
                receiver, message, ..
            } => f
                .debug_struct("MESSAGE")
                .field("receiver", receiver)
                .field("len", &message.len())
                .finish_non_exhaustive(),
            Request::Logout { .. } => f.debug_struct("LOGOUT").finish_non_exhaustive(),
        }
    }
}

/// Frame decoding errors. None of these close the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string 'type' field")]
    MissingType,
    #[error("unknown request type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} request: {source}")]
    Fields {
        kind: RequestKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one frame into a request.
pub fn decode(frame: &[u8]) -> Result<Request, DecodeError> {
    let text = std::str::from_utf8(frame)?;
    let mut value: Value = serde_json::from_str(text)?;
    let object = value.as_object_mut().ok_or(DecodeError::NotAnObject)?;

    let kind = match object.get("type") {
        Some(Value::String(tag)) => {
            RequestKind::from_tag(tag).ok_or_else(|| DecodeError::UnknownType(tag.clone()))?
        }
        _ => return Err(DecodeError::MissingType),
    };
    object.insert("type".to_string(), Value::from(kind.as_str()));

    serde_json::from_value(value).map_err(|source| DecodeError::Fields { kind, source })
}

/// Reply `type` tag. `SUCCESS` is what clients test for after `REGISTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyType {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Error,
}

/// Reply sent to the connection that issued a request.
///
/// `session_id` is only present on a successful authentication, and
/// `reason` only on failure, so older clients that test for field
/// presence keep working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    pub status: Status,
    pub request: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Reply {
    pub fn ok(request: RequestKind) -> Self {
        Self {
            reply_type: ReplyType::Success,
            status: Status::Ok,
            request,
            session_id: None,
            reason: None,
        }
    }

    pub fn authenticated(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::ok(RequestKind::Authenticate)
        }
    }

    pub fn error(request: RequestKind, err: &ChatError) -> Self {
        Self {
            reply_type: ReplyType::Error,
            status: Status::Error,
            request,
            session_id: None,
            reason: Some(err.to_string()),
        }
    }

    /// Build a reply from a handler outcome carrying an optional session id.
    pub fn from_result(request: RequestKind, result: Result<Option<String>, ChatError>) -> Self {
        match result {
            Ok(Some(session_id)) => Self {
                session_id: Some(session_id),
                ..Self::ok(request)
            },
            Ok(None) => Self::ok(request),
            Err(e) => Self::error(request, &e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// A chat message as forwarded to its recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub sender: String,
    pub receiver: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(sender: &str, receiver: &str, message: String) -> Self {
        Self {
            kind: RequestKind::Message,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            message,
            sent_at: Utc::now(),
        }
    }
}
