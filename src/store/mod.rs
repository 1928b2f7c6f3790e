pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{AuditRecord, AuditSeverity, Reversal, Snapshot, Span, SpanEvent, SpanStatus};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
    UnknownEntityType(String),
    EntityNotFound { entity_type: String, entity_id: String },
    InvalidIdentifier(String),
    Serialization(serde_json::Error),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(err) => write!(f, "database error: {err}"),
            StoreError::UnknownEntityType(t) => write!(f, "no table registered for entity type '{t}'"),
            StoreError::EntityNotFound {
                entity_type,
                entity_id,
            } => write!(f, "{entity_type} {entity_id} not found"),
            StoreError::InvalidIdentifier(ident) => write!(f, "invalid SQL identifier '{ident}'"),
            StoreError::Serialization(err) => write!(f, "serialization error: {err}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(err) => Some(err),
            StoreError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

/// Filter over a tenant's audit records. Results are always newest first.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub tenant_id: Uuid,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub severities: Vec<AuditSeverity>,
    pub include_reversed: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl AuditQuery {
    pub fn for_tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            entity_type: None,
            entity_id: None,
            conversation_id: None,
            severities: Vec::new(),
            include_reversed: true,
            since: None,
            until: None,
            limit: None,
            offset: 0,
        }
    }

    /// Same predicate the SQL builds, for stores that filter in process.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        record.tenant_id == self.tenant_id
            && self
                .entity_type
                .as_ref()
                .is_none_or(|t| &record.entity_type == t)
            && self
                .entity_id
                .as_ref()
                .is_none_or(|id| record.touches_entity(id))
            && self
                .conversation_id
                .is_none_or(|c| record.conversation_id == Some(c))
            && (self.severities.is_empty() || self.severities.contains(&record.severity))
            && (self.include_reversed || !record.reversed)
            && self.since.is_none_or(|s| record.created_at >= s)
            && self.until.is_none_or(|u| record.created_at <= u)
    }
}

/// The write a snapshot reversal makes to the business entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMutation {
    /// Set the deletion marker. Never a hard delete.
    SoftDelete {
        entity_type: String,
        entity_id: String,
    },
    /// Write the captured state back and clear the deletion marker, recreating the row if it is gone.
    Restore {
        entity_type: String,
        entity_id: String,
        state: Map<String, Value>,
    },
    /// Overwrite only the listed fields.
    Update {
        entity_type: String,
        entity_id: String,
        fields: Map<String, Value>,
    },
}

impl EntityMutation {
    pub fn entity_type(&self) -> &str {
        match self {
            EntityMutation::SoftDelete { entity_type, .. }
            | EntityMutation::Restore { entity_type, .. }
            | EntityMutation::Update { entity_type, .. } => entity_type,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            EntityMutation::SoftDelete { entity_id, .. }
            | EntityMutation::Restore { entity_id, .. }
            | EntityMutation::Update { entity_id, .. } => entity_id,
        }
    }
}

/// Reversal flags written onto a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RevertMark {
    pub reverted_by: Uuid,
    pub reverted_at: DateTime<Utc>,
    pub reason: String,
    pub partial_fields: Option<Vec<String>>,
}

/// Terminal values written onto a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanFinish {
    pub status: SpanStatus,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub cost_cents: f64,
    pub output_preview: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub attributes: Option<Value>,
}

/// Tenant-scoped persistence used by every ledger operation.
///
/// Methods returning `bool` perform a conditional write and report whether it applied.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError>;

    async fn find_audit_record(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<AuditRecord>, StoreError>;

    async fn query_audit_records(&self, query: &AuditQuery)
    -> Result<Vec<AuditRecord>, StoreError>;

    /// Ignores `limit` and `offset`.
    async fn count_audit_records(&self, query: &AuditQuery) -> Result<i64, StoreError>;

    /// Insert the reversal and flip the record's flags in one transaction.
    /// Returns false, writing nothing, when the record is already reversed.
    async fn reverse_audit_record(&self, reversal: &Reversal) -> Result<bool, StoreError>;

    /// Insert a reversal not tied to an audit record. False if the snapshot already has one.
    async fn insert_reversal(&self, reversal: &Reversal) -> Result<bool, StoreError>;

    async fn find_reversal(&self, tenant_id: Uuid, id: Uuid)
    -> Result<Option<Reversal>, StoreError>;

    /// All rows or none.
    async fn insert_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), StoreError>;

    async fn find_snapshot(&self, tenant_id: Uuid, id: Uuid)
    -> Result<Option<Snapshot>, StoreError>;

    /// Creation order.
    async fn list_message_snapshots(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Newest first.
    async fn list_conversation_snapshots(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        include_reverted: bool,
        limit: i64,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Mark the snapshot reverted and apply the entity mutation in one transaction.
    /// Returns false, touching nothing, when the snapshot is already reverted.
    async fn revert_snapshot(
        &self,
        tenant_id: Uuid,
        snapshot_id: Uuid,
        mutation: &EntityMutation,
        mark: &RevertMark,
    ) -> Result<bool, StoreError>;

    /// Live state of a business entity, including its deletion marker.
    async fn fetch_entity(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, StoreError>;

    async fn insert_span(&self, span: &Span) -> Result<(), StoreError>;

    async fn find_span(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Span>, StoreError>;

    /// Applies only while the span is running; returns the updated span.
    async fn finish_span(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        finish: &SpanFinish,
    ) -> Result<Option<Span>, StoreError>;

    /// Start order.
    async fn list_trace_spans(&self, tenant_id: Uuid, trace_id: Uuid)
    -> Result<Vec<Span>, StoreError>;

    /// Spans started in `[start, end)`.
    async fn list_spans_between(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Span>, StoreError>;

    async fn insert_span_event(&self, event: &SpanEvent) -> Result<(), StoreError>;

    async fn list_trace_events(
        &self,
        tenant_id: Uuid,
        trace_id: Uuid,
    ) -> Result<Vec<SpanEvent>, StoreError>;
}
