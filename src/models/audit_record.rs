use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Query,
    ToolCall,
    ApiCall,
    FileAccess,
    PermissionChange,
    ConfigurationChange,
    DataExport,
    BulkOperation,
}

text_enum!(AuditAction, "audit action" {
    Create => "create",
    Update => "update",
    Delete => "delete",
    Query => "query",
    ToolCall => "tool_call",
    ApiCall => "api_call",
    FileAccess => "file_access",
    PermissionChange => "permission_change",
    ConfigurationChange => "configuration_change",
    DataExport => "data_export",
    BulkOperation => "bulk_operation",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(AuditSeverity, "audit severity" {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub span_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_ids: Option<Vec<String>>,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub changed_fields: Vec<String>,
    pub tool_name: Option<String>,
    pub tool_params: Option<serde_json::Value>,
    pub tool_result: Option<serde_json::Value>,
    #[sqlx(try_from = "String")]
    pub severity: AuditSeverity,
    pub checksum: String,
    pub is_reversible: bool,
    pub reversed: bool,
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversed_by: Option<Uuid>,
    pub reversal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// True when the record names `entity_id` directly or as part of a bulk operation.
    pub fn touches_entity(&self, entity_id: &str) -> bool {
        self.entity_id.as_deref() == Some(entity_id)
            || self
                .entity_ids
                .as_ref()
                .is_some_and(|ids| ids.iter().any(|id| id == entity_id))
    }
}
