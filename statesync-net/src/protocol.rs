//! JSON wire protocol between clients and the sync server.
//!
//! Every frame is a single JSON object with an envelope of `id` (UUID,
//! correlates requests to responses), `type` and `data`:
//!
//! ```text
//! client ─▶ server                      server ─▶ client
//! {"id", "type": "write",   "data"}     {"id", "type": "view",    "data"}
//! {"id", "type": "call",    "data"}     {"id", "type": "call",    "data"}
//! {"id", "type": "message", "data"}     {"id", "type": "return",  "data"}
//!                                       {"id", "type": "message", "data"}
//! ```
//!
//! `view` frames carry coalesced per-entity diffs; `call` frames fan method
//! outputs to listeners immediately; `return` frames echo a call's result to
//! the caller, correlated by the originating input id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol decode/encode errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a text payload")]
    NotText,
}

/// Addresses one entity from the wire side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityIndexes {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    /// Channel id qualifier; omitted when addressing an owned entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Restrict resolution to the sender's owned entities.
    #[serde(default, rename = "isOwned", skip_serializing_if = "is_false")]
    pub is_owned: bool,
    /// Restrict resolution to channels the sender has joined (always the
    /// case server-side; carried for symmetry with client-side indexes).
    #[serde(default, rename = "hasJoined", skip_serializing_if = "is_false")]
    pub has_joined: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl EntityIndexes {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            channel: None,
            is_owned: false,
            has_joined: false,
        }
    }

    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn owned(mut self) -> Self {
        self.is_owned = true;
        self
    }
}

/// Client-to-server frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Input {
    pub id: String,
    #[serde(flatten)]
    pub body: InputBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum InputBody {
    /// Write one or more properties of an entity.
    Write {
        entity: EntityIndexes,
        changes: serde_json::Map<String, Value>,
    },
    /// Invoke a method on an entity.
    Call {
        entity: EntityIndexes,
        method: String,
        parameters: Vec<Value>,
    },
    /// Opaque application payload, echoed to the host's message handler.
    Message(Value),
}

impl Input {
    pub fn new(body: InputBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body,
        }
    }

    pub fn decode(text: &str) -> Result<Input, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One entity's coalesced diff inside a `view` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewChange {
    /// Entity path: `ChannelKind/channel_id/Type/entity_id`.
    pub path: String,
    /// Latest value per written key; one entry per key regardless of how
    /// many writes occurred during the tick.
    pub diff: serde_json::Map<String, Value>,
}

/// Server-to-client frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Output {
    pub id: String,
    #[serde(flatten)]
    pub body: OutputBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum OutputBody {
    /// Per-tick state diff for every entity visible to the recipient.
    View { changes: Vec<ViewChange> },
    /// A method fired on an entity the recipient listens to.
    Call {
        path: String,
        method: String,
        parameters: Vec<Value>,
        #[serde(rename = "returnedValue")]
        returned_value: Value,
    },
    /// Result of the recipient's own call, correlated by input id.
    Return {
        #[serde(rename = "inputId")]
        input_id: String,
        #[serde(rename = "returnedValue")]
        returned_value: Value,
    },
    /// Opaque application payload from the host.
    Message(Value),
}

impl Output {
    pub fn new(body: OutputBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body,
        }
    }

    pub fn decode(text: &str) -> Result<Output, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}
