//! Interactive channel wire protocol
//!
//! Control frames are JSON text messages tagged by `type`. Raw terminal
//! input travels as binary messages so the two never need content sniffing.

use serde::{Deserialize, Deserializer, Serialize};

/// Frames received from the panel
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session established; `lines` replays the buffered screen
    Init {
        #[serde(default)]
        lines: Vec<String>,
        #[serde(default, deserialize_with = "lenient_string")]
        session_id: Option<String>,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        reused: bool,
    },
    /// One line of incremental output
    Line { line: String },
    /// Output chunk, optionally sequenced for lossless resume
    Output {
        data: String,
        #[serde(default, deserialize_with = "lenient_u64")]
        seq: Option<u64>,
    },
    Exit {
        #[serde(default, deserialize_with = "lenient_i32")]
        code: Option<i32>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    /// Server-initiated teardown
    Close,
    Pong {
        #[serde(default)]
        ts: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

/// Control frames sent to the panel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Graceful teardown: the remote process is terminated
    Close,
    Resize { cols: u16, rows: u16 },
    Ping { ts: i64 },
    /// Deliver a named signal (`INT`, `TERM`, ...) to the remote process
    Signal { name: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        // Serializing these plain variants cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"close"}"#.to_string())
    }
}

/// Parse a text frame; malformed JSON is ignored
pub fn parse_server_frame(text: &str) -> Option<ServerFrame> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::debug!("Ignoring malformed server frame: {}", e);
            None
        }
    }
}

/// Accepts a string or a number
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts a non-negative integer or its decimal string form
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Accepts an integer or its decimal string form
fn lenient_i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(|c| i32::try_from(c).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
