//! JSON wire protocol shared by the rendering client, the log and the store.
//!
//! Every frame is adjacently tagged:
//! ```text
//! { "type": "EDIT" | "USER" | "DATA" | "SAVE" | "SYSTEM_ERROR", "payload": { ... } }
//! ```
//!
//! A [`Record`] is the unit written to the durable log. Its encoded form is
//! byte-for-byte the `EDIT`/`USER` frame a client receives, so the session
//! tail forwards log payloads without re-encoding them.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::storage::RowId;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Session lifecycle state carried by a presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Open,
    Closed,
    Error,
}

/// Latest value of one cell as asserted by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    #[serde(deserialize_with = "scalar_string")]
    pub row_key: String,
    #[serde(deserialize_with = "scalar_string")]
    pub column_key: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
    pub user: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl EditRecord {
    /// Key of the cell in the snapshot map (`"{rowKey}-{columnKey}"`).
    pub fn cell_key(&self) -> String {
        format!("{}-{}", self.row_key, self.column_key)
    }
}

/// Session lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user: String,
    pub status: PresenceStatus,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PresenceRecord {
    pub fn open(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            status: PresenceStatus::Open,
            timestamp: now_millis(),
            message: None,
        }
    }

    pub fn closed(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            status: PresenceStatus::Closed,
            timestamp: now_millis(),
            message: None,
        }
    }

    /// Forced closure; `message` names the unreachable backend.
    pub fn error(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            status: PresenceStatus::Error,
            timestamp: now_millis(),
            message: Some(message.into()),
        }
    }
}

/// The unit written to the durable log and persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Record {
    Edit(EditRecord),
    User(PresenceRecord),
}

impl Record {
    /// Serialize to the JSON payload stored in log entries and store rows.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a stored payload.
    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Client id of the session that produced this record.
    pub fn author(&self) -> &str {
        match self {
            Record::Edit(edit) => &edit.user,
            Record::User(presence) => &presence.user,
        }
    }
}

/// Cell edit as submitted by a client, before the server stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellEdit {
    #[serde(deserialize_with = "scalar_string")]
    pub row_key: String,
    #[serde(deserialize_with = "scalar_string")]
    pub column_key: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
}

impl CellEdit {
    pub fn new(
        row_key: impl Into<String>,
        column_key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            row_key: row_key.into(),
            column_key: column_key.into(),
            value: value.into(),
        }
    }

    /// Attach the session identity. Any `user` the client sent is ignored.
    pub fn stamp(self, user: &str) -> EditRecord {
        EditRecord {
            row_key: self.row_key,
            column_key: self.column_key,
            value: self.value,
            user: user.to_string(),
            timestamp: now_millis(),
        }
    }
}

/// Frames accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Edit(CellEdit),
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Reconstructed value of a single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    pub value: String,
    pub user: String,
    pub id: RowId,
}

/// Bootstrap snapshot payload, one message per map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "data_type", content = "message", rename_all = "lowercase")]
pub enum DataPayload {
    User(BTreeMap<String, PresenceRecord>),
    Data(BTreeMap<String, CellState>),
}

/// HTTP-style status codes carried in `SAVE` acknowledgements.
pub const SAVE_OK: u16 = 200;
pub const SAVE_FAILED: u16 = 400;

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Data(DataPayload),
    Edit(EditRecord),
    User(PresenceRecord),
    Save {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        status: u16,
    },
    SystemError {
        message: String,
    },
}

impl ServerMessage {
    pub fn saved(id: u64) -> Self {
        Self::Save {
            id: Some(id),
            status: SAVE_OK,
        }
    }

    pub fn save_failed() -> Self {
        Self::Save {
            id: None,
            status: SAVE_FAILED,
        }
    }

    pub fn system_error(message: impl Into<String>) -> Self {
        Self::SystemError {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("encoding error: {0}")]
    Encode(String),
}

/// Grid keys and values arrive as strings or bare numbers; store them as text.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(n) => n.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}
