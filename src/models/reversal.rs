use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalMethod {
    Automatic,
    Manual,
    Partial,
}

text_enum!(ReversalMethod, "reversal method" {
    Automatic => "automatic",
    Manual => "manual",
    Partial => "partial",
});

/// Durable record of one reversal. Points at the audit record, the snapshot, or both.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Reversal {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub audit_log_id: Option<Uuid>,
    pub snapshot_id: Option<Uuid>,
    pub reversed_by: Uuid,
    pub reason: String,
    #[sqlx(try_from = "String")]
    pub method: ReversalMethod,
    pub restored_state: Option<serde_json::Value>,
    pub partial_fields: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}
