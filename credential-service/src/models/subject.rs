//! Subject model - the user or resource a credential authenticates.

use serde_json::Value;
use uuid::Uuid;

/// Read-only view of a subject owned by the user directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub subject_id: String,
    pub instance_id: Uuid,
    /// Profile data exposed to JWT template shortcodes.
    pub data: Value,
}

impl Subject {
    pub fn new(instance_id: Uuid, subject_id: impl Into<String>, data: Value) -> Self {
        Self {
            subject_id: subject_id.into(),
            instance_id,
            data,
        }
    }
}
