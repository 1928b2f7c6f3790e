use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOperation {
    Create,
    Update,
    Delete,
}

text_enum!(SnapshotOperation, "snapshot operation" {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    Full,
    FieldLevel,
}

text_enum!(SnapshotType, "snapshot type" {
    Full => "full",
    FieldLevel => "field_level",
});

impl SnapshotType {
    pub fn for_changed_fields(changed_fields: &[String]) -> Self {
        if changed_fields.is_empty() {
            SnapshotType::Full
        } else {
            SnapshotType::FieldLevel
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub audit_log_id: Option<Uuid>,
    pub tool_name: Option<String>,
    pub sequence: i32,
    pub entity_type: String,
    pub entity_id: String,
    pub before_state: serde_json::Value,
    pub after_state: serde_json::Value,
    pub changed_fields: Vec<String>,
    #[sqlx(try_from = "String")]
    pub operation: SnapshotOperation,
    #[sqlx(try_from = "String")]
    pub snapshot_type: SnapshotType,
    pub is_reverted: bool,
    pub reverted_at: Option<DateTime<Utc>>,
    pub reverted_by: Option<Uuid>,
    pub revert_reason: Option<String>,
    pub partial_revert_fields: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}
