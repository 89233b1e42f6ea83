//! Change protocol codec: the section channel's message union and its JSON
//! wire envelope.
//!
//! Wire format (one JSON object per text frame, `type` selects the variant):
//! ```text
//! ┌──────────────────┬──────────────────────────────────────┬──────────────────┐
//! │ type             │ fields                               │ direction        │
//! ├──────────────────┼──────────────────────────────────────┼──────────────────┤
//! │ join             │ reportid, section                    │ client→authority │
//! │ delta            │ delta: {editorId, delta: {ops}}      │ both             │
//! │ sync             │ reportid, section, contents          │ both             │
//! │ updateRepo       │ reportid, section, contents          │ client→authority │
//! │ request_contents │ —                                    │ authority→client │
//! │ close            │ section                              │ client→authority │
//! └──────────────────┴──────────────────────────────────────┴──────────────────┘
//! ```
//!
//! `contents` maps each field id to a nested delta envelope:
//! `{"type": "delta", "delta": {"editorId": F, "delta": {"ops": [...]}}}`.
//! Older authorities send `{"action": "request_contents"}` with no `type`;
//! that form is accepted on decode.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::delta::Delta;
use crate::registry::FieldSnapshot;

/// Message kinds, named as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Join,
    Change,
    RequestSnapshot,
    SnapshotSync,
    SnapshotPublish,
    Leave,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Join => "join",
            MessageType::Change => "delta",
            MessageType::RequestSnapshot => "request_contents",
            MessageType::SnapshotSync => "sync",
            MessageType::SnapshotPublish => "updateRepo",
            MessageType::Leave => "close",
        }
    }

    pub fn from_wire(kind: &str) -> Option<Self> {
        Some(match kind {
            "join" => MessageType::Join,
            "delta" => MessageType::Change,
            "request_contents" => MessageType::RequestSnapshot,
            "sync" => MessageType::SnapshotSync,
            "updateRepo" => MessageType::SnapshotPublish,
            "close" => MessageType::Leave,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol message. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Announce this client on the channel.
    Join { document_id: String, section_id: String },
    /// Incremental change to one field.
    Change { field_id: String, ops: Delta },
    /// Authority asks for the section's current contents.
    RequestSnapshot,
    /// Full contents of a section, relayed to peers.
    SnapshotSync {
        document_id: String,
        section_id: String,
        fields: FieldSnapshot,
    },
    /// Full contents of a section, to be persisted by the authority.
    SnapshotPublish {
        document_id: String,
        section_id: String,
        fields: FieldSnapshot,
    },
    /// This client is leaving the section.
    Leave { section_id: String },
}

impl Message {
    pub fn join(document_id: impl Into<String>, section_id: impl Into<String>) -> Self {
        Message::Join {
            document_id: document_id.into(),
            section_id: section_id.into(),
        }
    }

    pub fn change(field_id: impl Into<String>, ops: Delta) -> Self {
        Message::Change {
            field_id: field_id.into(),
            ops,
        }
    }

    pub fn snapshot_sync(
        document_id: impl Into<String>,
        section_id: impl Into<String>,
        fields: FieldSnapshot,
    ) -> Self {
        Message::SnapshotSync {
            document_id: document_id.into(),
            section_id: section_id.into(),
            fields,
        }
    }

    pub fn snapshot_publish(
        document_id: impl Into<String>,
        section_id: impl Into<String>,
        fields: FieldSnapshot,
    ) -> Self {
        Message::SnapshotPublish {
            document_id: document_id.into(),
            section_id: section_id.into(),
            fields,
        }
    }

    pub fn leave(section_id: impl Into<String>) -> Self {
        Message::Leave {
            section_id: section_id.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Join { .. } => MessageType::Join,
            Message::Change { .. } => MessageType::Change,
            Message::RequestSnapshot => MessageType::RequestSnapshot,
            Message::SnapshotSync { .. } => MessageType::SnapshotSync,
            Message::SnapshotPublish { .. } => MessageType::SnapshotPublish,
            Message::Leave { .. } => MessageType::Leave,
        }
    }

    /// Serialize to the JSON wire envelope.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&Envelope::from(self)).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a JSON wire envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(ProtocolError::Malformed("`type` is not a string".into())),
            None => match value.get("action").and_then(Value::as_str) {
                Some("request_contents") => return Ok(Message::RequestSnapshot),
                _ => return Err(ProtocolError::Malformed("missing `type`".into())),
            },
        };

        if MessageType::from_wire(&kind).is_none() {
            return Err(ProtocolError::UnknownType(kind));
        }

        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(envelope.into())
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

// ───────────────────────────────────────────────────────────────────
// Wire envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "join")]
    Join { reportid: String, section: String },
    #[serde(rename = "delta")]
    Delta { delta: FieldDelta },
    #[serde(rename = "request_contents")]
    RequestContents,
    #[serde(rename = "sync")]
    Sync(SnapshotBody),
    #[serde(rename = "updateRepo")]
    UpdateRepo(SnapshotBody),
    #[serde(rename = "close")]
    Close { section: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldDelta {
    #[serde(rename = "editorId")]
    editor_id: String,
    delta: Delta,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBody {
    reportid: String,
    section: String,
    #[serde(default)]
    contents: IndexMap<String, ContentEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentEntry {
    #[serde(rename = "type", default = "delta_kind")]
    kind: String,
    delta: FieldDelta,
}

fn delta_kind() -> String {
    MessageType::Change.as_str().to_string()
}

impl SnapshotBody {
    fn new(document_id: &str, section_id: &str, fields: &FieldSnapshot) -> Self {
        let contents = fields
            .iter()
            .map(|(field_id, ops)| {
                let entry = ContentEntry {
                    kind: delta_kind(),
                    delta: FieldDelta {
                        editor_id: field_id.clone(),
                        delta: ops.clone(),
                    },
                };
                (field_id.clone(), entry)
            })
            .collect();
        Self {
            reportid: document_id.to_string(),
            section: section_id.to_string(),
            contents,
        }
    }

    fn into_fields(self) -> (String, String, FieldSnapshot) {
        let fields = self
            .contents
            .into_iter()
            .map(|(field_id, entry)| (field_id, entry.delta.delta))
            .collect();
        (self.reportid, self.section, fields)
    }
}

impl From<&Message> for Envelope {
    fn from(msg: &Message) -> Self {
        match msg {
            Message::Join { document_id, section_id } => Envelope::Join {
                reportid: document_id.clone(),
                section: section_id.clone(),
            },
            Message::Change { field_id, ops } => Envelope::Delta {
                delta: FieldDelta {
                    editor_id: field_id.clone(),
                    delta: ops.clone(),
                },
            },
            Message::RequestSnapshot => Envelope::RequestContents,
            Message::SnapshotSync { document_id, section_id, fields } => {
                Envelope::Sync(SnapshotBody::new(document_id, section_id, fields))
            }
            Message::SnapshotPublish { document_id, section_id, fields } => {
                Envelope::UpdateRepo(SnapshotBody::new(document_id, section_id, fields))
            }
            Message::Leave { section_id } => Envelope::Close {
                section: section_id.clone(),
            },
        }
    }
}

impl From<Envelope> for Message {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Join { reportid, section } => Message::Join {
                document_id: reportid,
                section_id: section,
            },
            Envelope::Delta { delta } => Message::Change {
                field_id: delta.editor_id,
                ops: delta.delta,
            },
            Envelope::RequestContents => Message::RequestSnapshot,
            Envelope::Sync(body) => {
                let (document_id, section_id, fields) = body.into_fields();
                Message::SnapshotSync { document_id, section_id, fields }
            }
            Envelope::UpdateRepo(body) => {
                let (document_id, section_id, fields) = body.into_fields();
                Message::SnapshotPublish { document_id, section_id, fields }
            }
            Envelope::Close { section } => Message::Leave { section_id: section },
        }
    }
}
