//! Task envelope wire format.
//!
//! An envelope is a flat JSON object: a `type` tag plus type-specific
//! fields, for example `{"type":"iptv_live","provider_id":42}`.
//! Envelopes are value objects. Nothing mutates one after it is built;
//! a retry publishes a new message instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::task::TaskType;

/// Errors raised while building, decoding or interpreting an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Task type is empty")]
    EmptyTaskType,

    #[error("unknown_task_type: {0}")]
    UnknownTaskType(String),

    #[error("Task payload must be a JSON object")]
    PayloadNotObject,

    #[error("Task payload may not define reserved field `{0}`")]
    ReservedField(&'static str),

    #[error("Task {task_type} is missing field `{field}`")]
    MissingField {
        task_type: String,
        field: &'static str,
    },

    #[error("Task {task_type} has invalid field `{field}`: {reason}")]
    InvalidField {
        task_type: String,
        field: &'static str,
        reason: String,
    },

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

impl EnvelopeError {
    /// Returns true if the error comes from an unrecognized `type` tag.
    pub fn is_unknown_task_type(&self) -> bool {
        matches!(self, EnvelopeError::UnknownTaskType(_))
    }
}

/// Serialized task message: a type tag and its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TaskEnvelope {
    /// Envelope for a provider-wide task.
    pub fn for_provider(task_type: TaskType, provider_id: i64) -> Self {
        let mut fields = Map::new();
        fields.insert("provider_id".to_string(), Value::from(provider_id));
        Self {
            task_type: task_type.as_str().to_string(),
            fields,
        }
    }

    /// Envelope for a folder-scoped task.
    pub fn for_folder(task_type: TaskType, provider_id: i64, path: impl Into<String>) -> Self {
        let mut envelope = Self::for_provider(task_type, provider_id);
        envelope
            .fields
            .insert("path".to_string(), Value::String(path.into()));
        envelope
    }

    /// Build and validate an envelope from an untyped tag and payload.
    ///
    /// Rejects empty or unknown tags, non-object payloads, payloads that
    /// define their own `type`, and payloads whose arguments do not fit the
    /// task type. No I/O happens here.
    pub fn build(task_type: &str, payload: Value) -> Result<Self, EnvelopeError> {
        let kind: TaskType = task_type.parse()?;

        let fields = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            _ => return Err(EnvelopeError::PayloadNotObject),
        };

        if fields.contains_key("type") {
            return Err(EnvelopeError::ReservedField("type"));
        }

        let envelope = Self {
            task_type: kind.as_str().to_string(),
            fields,
        };
        TaskArgs::from_envelope(&envelope)?;
        Ok(envelope)
    }

    /// Decode an envelope from its JSON wire form.
    ///
    /// Only the shape is checked: a JSON object with a non-empty string
    /// `type`. Unknown tags decode successfully so that dispatch can report
    /// them as `unknown_task_type`.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: TaskEnvelope =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if envelope.task_type.trim().is_empty() {
            return Err(EnvelopeError::EmptyTaskType);
        }

        Ok(envelope)
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Raw `type` tag as carried on the wire.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Resolve the `type` tag to a known task type.
    pub fn kind(&self) -> Result<TaskType, EnvelopeError> {
        self.task_type.parse()
    }

    /// Type-specific fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// `provider_id` field, if present and an integer.
    pub fn provider_id(&self) -> Option<i64> {
        self.fields.get("provider_id").and_then(Value::as_i64)
    }

    /// `path` field, if present and a string.
    pub fn path(&self) -> Option<&str> {
        self.fields.get("path").and_then(Value::as_str)
    }
}

/// Arguments handed to a sync handler, decoded from an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskArgs {
    #[serde(skip)]
    pub task_type: TaskType,
    pub provider_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl TaskArgs {
    /// Extract and validate handler arguments.
    pub fn from_envelope(envelope: &TaskEnvelope) -> Result<Self, EnvelopeError> {
        let task_type = envelope.kind()?;

        let provider_id = match envelope.fields.get("provider_id") {
            None | Some(Value::Null) => {
                return Err(EnvelopeError::MissingField {
                    task_type: task_type.to_string(),
                    field: "provider_id",
                })
            }
            Some(value) => value.as_i64().ok_or_else(|| EnvelopeError::InvalidField {
                task_type: task_type.to_string(),
                field: "provider_id",
                reason: format!("expected integer, got {}", value),
            })?,
        };

        let path = match envelope.fields.get("path") {
            None | Some(Value::Null) => None,
            Some(Value::String(path)) => Some(path.clone()),
            Some(other) => {
                return Err(EnvelopeError::InvalidField {
                    task_type: task_type.to_string(),
                    field: "path",
                    reason: format!("expected string, got {}", other),
                })
            }
        };

        if task_type.requires_path() && path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(EnvelopeError::MissingField {
                task_type: task_type.to_string(),
                field: "path",
            });
        }

        Ok(Self {
            task_type,
            provider_id,
            path,
        })
    }
}
