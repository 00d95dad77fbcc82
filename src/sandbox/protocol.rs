/// Wire protocol between a sandboxed document and its runner.
///
/// The document posts plain JSON objects to its parent:
///
/// ```text
/// { "channelId": "...", "type": "console", "level": "log", "payload": "hello" }
/// { "channelId": "...", "type": "error", "payload": "boom", "stack": "..." }
/// { "channelId": "...", "type": "status", "payload": "completed" }
/// ```
///
/// They are decoded once into [`SandboxEvent`] at the runner boundary;
/// nothing downstream branches on string fields.
use std::fmt;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-run token used to tell a run's messages apart from everyone else's.
///
/// Format: `chan_<unix millis>_<64 random bits, hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let nonce: u64 = rand::thread_rng().gen();
        Self(format!("chan_{millis}_{nonce:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Console level carried by `console` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

/// Raw message as posted by the document.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Console {
        level: ConsoleLevel,
        payload: String,
    },
    Error {
        payload: String,
        #[serde(default)]
        stack: Option<String>,
    },
    Status {
        payload: String,
    },
}

/// Decoded event from inside an isolation context.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    Console { level: ConsoleLevel, text: String },
    UncaughtError { message: String, stack: Option<String> },
    Completed,
}

impl SandboxEvent {
    /// Decodes a posted message for `channel`.
    ///
    /// Returns `None` for anything that is not a well-formed message on
    /// that channel: foreign frames, other runs, extensions, garbage.
    pub fn decode(data: &Value, channel: &ChannelId) -> Option<Self> {
        if data.get("channelId").and_then(Value::as_str) != Some(channel.as_str()) {
            return None;
        }

        match serde_json::from_value::<WireMessage>(data.clone()).ok()? {
            WireMessage::Console { level, payload } => Some(SandboxEvent::Console {
                level,
                text: payload,
            }),
            WireMessage::Error { payload, stack } => Some(SandboxEvent::UncaughtError {
                message: payload,
                stack,
            }),
            WireMessage::Status { payload } if payload == "completed" => {
                Some(SandboxEvent::Completed)
            }
            WireMessage::Status { .. } => None,
        }
    }
}

/// Kind badge of a reported message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Log,
    Warn,
    Error,
    Status,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Log => "log",
            MessageKind::Warn => "warn",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
        }
    }
}

impl From<ConsoleLevel> for MessageKind {
    fn from(level: ConsoleLevel) -> Self {
        match level {
            ConsoleLevel::Log => MessageKind::Log,
            ConsoleLevel::Warn => MessageKind::Warn,
            ConsoleLevel::Error => MessageKind::Error,
        }
    }
}

/// Message handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedMessage {
    pub kind: MessageKind,
    pub text: String,
    /// ISO-8601, UTC, millisecond precision (`2024-05-01T12:00:00.000Z`).
    pub timestamp: String,
}

impl ReportedMessage {
    /// Stamps a message with the current time.
    pub fn now(kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::now(MessageKind::Status, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::now(MessageKind::Error, text)
    }
}
