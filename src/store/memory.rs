use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::integrity;
use crate::models::{AuditRecord, Reversal, Snapshot, Span, SpanEvent, SpanStatus};

use super::{AuditQuery, EntityMutation, RevertMark, SpanFinish, Store, StoreError};

type EntityKey = (Uuid, String, String);

#[derive(Default)]
struct Inner {
    audit_records: Vec<AuditRecord>,
    reversals: Vec<Reversal>,
    snapshots: Vec<Snapshot>,
    entities: HashMap<EntityKey, Map<String, Value>>,
    spans: Vec<Span>,
    events: Vec<SpanEvent>,
    applied: Vec<EntityMutation>,
    failing_entities: HashSet<(String, String)>,
    unregistered_types: HashSet<String>,
    fail_reversal_writes: bool,
    fail_all_writes: bool,
}

impl Inner {
    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_all_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    fn check_reversal_writable(&self) -> Result<(), StoreError> {
        self.check_writable()?;
        if self.fail_reversal_writes {
            return Err(StoreError::Unavailable("reversal writes disabled".to_string()));
        }
        Ok(())
    }

    fn has_reversal_for(&self, reversal: &Reversal) -> bool {
        self.reversals.iter().any(|r| {
            (reversal.audit_log_id.is_some() && r.audit_log_id == reversal.audit_log_id)
                || (reversal.snapshot_id.is_some() && r.snapshot_id == reversal.snapshot_id)
        })
    }

    fn apply_mutation(
        &mut self,
        tenant_id: Uuid,
        mutation: &EntityMutation,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let entity_type = mutation.entity_type().to_string();
        let entity_id = mutation.entity_id().to_string();

        if self
            .failing_entities
            .contains(&(entity_type.clone(), entity_id.clone()))
        {
            return Err(StoreError::Unavailable(format!(
                "{entity_type} {entity_id} rejected the write"
            )));
        }

        let key = (tenant_id, entity_type.clone(), entity_id.clone());
        let not_found = || StoreError::EntityNotFound {
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
        };

        match mutation {
            EntityMutation::SoftDelete { .. } => {
                let entity = self.entities.get_mut(&key).ok_or_else(not_found)?;
                entity.insert(
                    "deleted_at".to_string(),
                    Value::String(integrity::format_timestamp(&at)),
                );
            }
            EntityMutation::Update { fields, .. } => {
                let entity = self.entities.get_mut(&key).ok_or_else(not_found)?;
                for (field, value) in fields {
                    entity.insert(field.clone(), value.clone());
                }
            }
            EntityMutation::Restore { state, .. } => {
                let entity = self.entities.entry(key).or_insert_with(|| {
                    let mut row = Map::new();
                    row.insert("id".to_string(), Value::String(entity_id.clone()));
                    row
                });
                for (field, value) in state {
                    if field != "id" {
                        entity.insert(field.clone(), value.clone());
                    }
                }
                entity.insert("deleted_at".to_string(), Value::Null);
            }
        }

        self.applied.push(mutation.clone());
        Ok(())
    }
}

/// In-process store. Everything lives behind one async mutex, so each trait call is atomic.
///
/// Besides the `Store` surface it can hold business entities directly and inject failures,
/// which is what the integration tests lean on.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a business entity. Non-object values are stored as an empty object.
    pub async fn put_entity(&self, tenant_id: Uuid, entity_type: &str, entity_id: &str, state: Value) {
        let mut fields = match state {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        fields
            .entry("id".to_string())
            .or_insert_with(|| Value::String(entity_id.to_string()));
        self.inner.lock().await.entities.insert(
            (tenant_id, entity_type.to_string(), entity_id.to_string()),
            fields,
        );
    }

    pub async fn entity(&self, tenant_id: Uuid, entity_type: &str, entity_id: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .entities
            .get(&(tenant_id, entity_type.to_string(), entity_id.to_string()))
            .cloned()
            .map(Value::Object)
    }

    /// Hard-remove an entity, as if something outside the ledger deleted it.
    pub async fn remove_entity(&self, tenant_id: Uuid, entity_type: &str, entity_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .entities
            .remove(&(tenant_id, entity_type.to_string(), entity_id.to_string()))
            .is_some()
    }

    /// Entity writes made by reversals, in order.
    pub async fn applied_mutations(&self) -> Vec<EntityMutation> {
        self.inner.lock().await.applied.clone()
    }

    /// Edit a stored audit record in place, bypassing every ledger rule.
    pub async fn tamper_audit_record<F>(&self, tenant_id: Uuid, id: Uuid, edit: F) -> bool
    where
        F: FnOnce(&mut AuditRecord),
    {
        let mut inner = self.inner.lock().await;
        match inner
            .audit_records
            .iter_mut()
            .find(|r| r.id == id && r.tenant_id == tenant_id)
        {
            Some(record) => {
                edit(record);
                true
            }
            None => false,
        }
    }

    /// Make every reversal write against this entity fail.
    pub async fn fail_entity(&self, entity_type: &str, entity_id: &str) {
        self.inner
            .lock()
            .await
            .failing_entities
            .insert((entity_type.to_string(), entity_id.to_string()));
    }

    /// Treat an entity type as having no backing table, the way `PgStore` does for types
    /// missing from `entity_tables`.
    pub async fn unregister_entity_type(&self, entity_type: &str) {
        self.inner
            .lock()
            .await
            .unregistered_types
            .insert(entity_type.to_string());
    }

    pub async fn fail_reversal_writes(&self, fail: bool) {
        self.inner.lock().await.fail_reversal_writes = fail;
    }

    pub async fn fail_all_writes(&self, fail: bool) {
        self.inner.lock().await.fail_all_writes = fail;
    }

    pub async fn reversals(&self, tenant_id: Uuid) -> Vec<Reversal> {
        self.inner
            .lock()
            .await
            .reversals
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

fn newest_first<T, K: Ord>(items: &mut [T], key: impl Fn(&T) -> K) {
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        inner.audit_records.push(record.clone());
        Ok(())
    }

    async fn find_audit_record(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<AuditRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audit_records
            .iter()
            .find(|r| r.id == id && r.tenant_id == tenant_id)
            .cloned())
    }

    async fn query_audit_records(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<AuditRecord> = inner
            .audit_records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        newest_first(&mut records, |r| (r.created_at, r.id));

        let offset = query.offset.max(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_audit_records(&self, query: &AuditQuery) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.audit_records.iter().filter(|r| query.matches(r)).count() as i64)
    }

    async fn reverse_audit_record(&self, reversal: &Reversal) -> Result<bool, StoreError> {
        let Some(audit_log_id) = reversal.audit_log_id else {
            return self.insert_reversal(reversal).await;
        };

        let mut inner = self.inner.lock().await;
        inner.check_reversal_writable()?;
        if inner.has_reversal_for(reversal) {
            return Ok(false);
        }

        let Some(record) = inner.audit_records.iter_mut().find(|r| {
            r.id == audit_log_id
                && r.tenant_id == reversal.tenant_id
                && r.is_reversible
                && !r.reversed
        }) else {
            return Ok(false);
        };

        record.reversed = true;
        record.reversed_at = Some(reversal.created_at);
        record.reversed_by = Some(reversal.reversed_by);
        record.reversal_id = Some(reversal.id);
        inner.reversals.push(reversal.clone());
        Ok(true)
    }

    async fn insert_reversal(&self, reversal: &Reversal) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_reversal_writable()?;
        if inner.has_reversal_for(reversal) {
            return Ok(false);
        }
        inner.reversals.push(reversal.clone());
        Ok(true)
    }

    async fn find_reversal(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Reversal>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reversals
            .iter()
            .find(|r| r.id == id && r.tenant_id == tenant_id)
            .cloned())
    }

    async fn insert_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        inner.snapshots.extend(snapshots.iter().cloned());
        Ok(())
    }

    async fn find_snapshot(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .iter()
            .find(|s| s.id == id && s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_message_snapshots(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock().await;
        let mut snapshots: Vec<Snapshot> = inner
            .snapshots
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.message_id == message_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| (s.created_at, s.id));
        Ok(snapshots)
    }

    async fn list_conversation_snapshots(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        include_reverted: bool,
        limit: i64,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock().await;
        let mut snapshots: Vec<Snapshot> = inner
            .snapshots
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && s.conversation_id == conversation_id
                    && (include_reverted || !s.is_reverted)
            })
            .cloned()
            .collect();
        newest_first(&mut snapshots, |s| (s.created_at, s.id));
        snapshots.truncate(limit.max(0) as usize);
        Ok(snapshots)
    }

    async fn revert_snapshot(
        &self,
        tenant_id: Uuid,
        snapshot_id: Uuid,
        mutation: &EntityMutation,
        mark: &RevertMark,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;

        let Some(index) = inner
            .snapshots
            .iter()
            .position(|s| s.id == snapshot_id && s.tenant_id == tenant_id && !s.is_reverted)
        else {
            return Ok(false);
        };

        // Entity first: if it fails the snapshot stays unreverted, as a rolled-back transaction would.
        inner.apply_mutation(tenant_id, mutation, mark.reverted_at)?;

        let snapshot = &mut inner.snapshots[index];
        snapshot.is_reverted = true;
        snapshot.reverted_at = Some(mark.reverted_at);
        snapshot.reverted_by = Some(mark.reverted_by);
        snapshot.revert_reason = Some(mark.reason.clone());
        snapshot.partial_revert_fields = mark.partial_fields.clone();
        Ok(true)
    }

    async fn fetch_entity(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, StoreError> {
        if self.inner.lock().await.unregistered_types.contains(entity_type) {
            return Err(StoreError::UnknownEntityType(entity_type.to_string()));
        }
        Ok(self.entity(tenant_id, entity_type, entity_id).await)
    }

    async fn insert_span(&self, span: &Span) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        inner.spans.push(span.clone());
        Ok(())
    }

    async fn find_span(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Span>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .spans
            .iter()
            .find(|s| s.id == id && s.tenant_id == tenant_id)
            .cloned())
    }

    async fn finish_span(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        finish: &SpanFinish,
    ) -> Result<Option<Span>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;

        let Some(span) = inner.spans.iter_mut().find(|s| {
            s.id == id && s.tenant_id == tenant_id && s.status == SpanStatus::Running
        }) else {
            return Ok(None);
        };

        span.status = finish.status;
        span.ended_at = Some(finish.ended_at);
        span.duration_ms = Some(finish.duration_ms);
        span.input_tokens = finish.input_tokens;
        span.output_tokens = finish.output_tokens;
        span.total_tokens = finish.total_tokens;
        span.cost_cents = finish.cost_cents;
        if finish.output_preview.is_some() {
            span.output_preview = finish.output_preview.clone();
        }
        span.error_message = finish.error_message.clone();
        span.error_code = finish.error_code.clone();
        if finish.attributes.is_some() {
            span.attributes = finish.attributes.clone();
        }
        Ok(Some(span.clone()))
    }

    async fn list_trace_spans(
        &self,
        tenant_id: Uuid,
        trace_id: Uuid,
    ) -> Result<Vec<Span>, StoreError> {
        let inner = self.inner.lock().await;
        let mut spans: Vec<Span> = inner
            .spans
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.trace_id == trace_id)
            .cloned()
            .collect();
        spans.sort_by_key(|s| (s.started_at, s.id));
        Ok(spans)
    }

    async fn list_spans_between(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Span>, StoreError> {
        let inner = self.inner.lock().await;
        let mut spans: Vec<Span> = inner
            .spans
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.started_at >= start && s.started_at < end)
            .cloned()
            .collect();
        spans.sort_by_key(|s| s.started_at);
        Ok(spans)
    }

    async fn insert_span_event(&self, event: &SpanEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check_writable()?;
        inner.events.push(event.clone());
        Ok(())
    }

    async fn list_trace_events(
        &self,
        tenant_id: Uuid,
        trace_id: Uuid,
    ) -> Result<Vec<SpanEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events: Vec<SpanEvent> = inner
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.trace_id == trace_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
