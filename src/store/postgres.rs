use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::db::entities::EntityTarget;
use crate::models::{AuditRecord, Reversal, Snapshot, Span, SpanEvent};

use super::{AuditQuery, EntityMutation, RevertMark, SpanFinish, Store, StoreError};

/// Postgres-backed store. Ledger tables come from `migrations/`; business tables are the caller's.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    entity_tables: HashMap<String, String>,
    tenant_column: String,
}

impl PgStore {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            entity_tables: config.entity_tables.clone(),
            tenant_column: config.entity_tenant_column.clone(),
        }
    }

    /// Connect using `DATABASE_URL` from config and apply pending migrations.
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("DATABASE_URL is not set".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        let store = Self::new(pool, config);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        tracing::info!("Ledger migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn target(&self, entity_type: &str) -> Result<EntityTarget<'_>, StoreError> {
        let table = self
            .entity_tables
            .get(entity_type)
            .ok_or_else(|| StoreError::UnknownEntityType(entity_type.to_string()))?;
        Ok(EntityTarget {
            table,
            tenant_column: &self.tenant_column,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StoreError> {
        db::audit::insert(&self.pool, record).await?;
        Ok(())
    }

    async fn find_audit_record(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<AuditRecord>, StoreError> {
        Ok(db::audit::find_by_id_scoped(&self.pool, id, tenant_id).await?)
    }

    async fn query_audit_records(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(db::audit::list(&self.pool, query).await?)
    }

    async fn count_audit_records(&self, query: &AuditQuery) -> Result<i64, StoreError> {
        Ok(db::audit::count(&self.pool, query).await?)
    }

    async fn reverse_audit_record(&self, reversal: &Reversal) -> Result<bool, StoreError> {
        let Some(audit_log_id) = reversal.audit_log_id else {
            return self.insert_reversal(reversal).await;
        };

        let mut tx = self.pool.begin().await?;

        // Flag flip first: it takes the row lock, so a concurrent request waits here and then
        // finds `reversed = true`.
        let flipped = db::audit::mark_reversed(
            &mut tx,
            audit_log_id,
            reversal.tenant_id,
            reversal.id,
            reversal.reversed_by,
            reversal.created_at,
        )
        .await?;
        if !flipped {
            tx.rollback().await?;
            return Ok(false);
        }

        if !db::reversals::insert(&mut tx, reversal).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn insert_reversal(&self, reversal: &Reversal) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(db::reversals::insert(&mut conn, reversal).await?)
    }

    async fn find_reversal(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Reversal>, StoreError> {
        Ok(db::reversals::find_by_id_scoped(&self.pool, id, tenant_id).await?)
    }

    async fn insert_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        db::snapshots::insert_many(&mut tx, snapshots).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_snapshot(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(db::snapshots::find_by_id_scoped(&self.pool, id, tenant_id).await?)
    }

    async fn list_message_snapshots(
        &self,
        tenant_id: Uuid,
        message_id: Uuid,
    ) -> Result<Vec<Snapshot>, StoreError> {
        Ok(db::snapshots::list_by_message(&self.pool, tenant_id, message_id).await?)
    }

    async fn list_conversation_snapshots(
        &self,
        tenant_id: Uuid,
        conversation_id: Uuid,
        include_reverted: bool,
        limit: i64,
    ) -> Result<Vec<Snapshot>, StoreError> {
        Ok(db::snapshots::list_by_conversation(
            &self.pool,
            tenant_id,
            conversation_id,
            include_reverted,
            limit,
        )
        .await?)
    }

    async fn revert_snapshot(
        &self,
        tenant_id: Uuid,
        snapshot_id: Uuid,
        mutation: &EntityMutation,
        mark: &RevertMark,
    ) -> Result<bool, StoreError> {
        let target = self.target(mutation.entity_type())?;
        let entity_id = mutation.entity_id();

        let mut tx = self.pool.begin().await?;

        if !db::snapshots::mark_reverted(&mut tx, snapshot_id, tenant_id, mark).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        let touched = match mutation {
            EntityMutation::SoftDelete { .. } => {
                db::entities::soft_delete(&mut tx, target, tenant_id, entity_id).await?
            }
            EntityMutation::Update { fields, .. } => {
                db::entities::update_fields(&mut tx, target, tenant_id, entity_id, fields, false)
                    .await?
            }
            EntityMutation::Restore { state, .. } => {
                match db::entities::update_fields(&mut tx, target, tenant_id, entity_id, state, true)
                    .await?
                {
                    0 => db::entities::reinsert(&mut tx, target, tenant_id, entity_id, state).await?,
                    n => n,
                }
            }
        };

        if touched == 0 {
            tx.rollback().await?;
            return Err(StoreError::EntityNotFound {
                entity_type: mutation.entity_type().to_string(),
                entity_id: entity_id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn fetch_entity(
        &self,
        tenant_id: Uuid,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let target = self.target(entity_type)?;
        db::entities::fetch(&self.pool, target, tenant_id, entity_id).await
    }

    async fn insert_span(&self, span: &Span) -> Result<(), StoreError> {
        db::spans::insert(&self.pool, span).await?;
        Ok(())
    }

    async fn find_span(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Span>, StoreError> {
        Ok(db::spans::find_by_id_scoped(&self.pool, id, tenant_id).await?)
    }

    async fn finish_span(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        finish: &SpanFinish,
    ) -> Result<Option<Span>, StoreError> {
        Ok(db::spans::finish(&self.pool, id, tenant_id, finish).await?)
    }

    async fn list_trace_spans(
        &self,
        tenant_id: Uuid,
        trace_id: Uuid,
    ) -> Result<Vec<Span>, StoreError> {
        Ok(db::spans::list_by_trace(&self.pool, tenant_id, trace_id).await?)
    }

    async fn list_spans_between(
        &self,
        tenant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Span>, StoreError> {
        Ok(db::spans::list_between(&self.pool, tenant_id, start, end).await?)
    }

    async fn insert_span_event(&self, event: &SpanEvent) -> Result<(), StoreError> {
        db::spans::insert_event(&self.pool, event).await?;
        Ok(())
    }

    async fn list_trace_events(
        &self,
        tenant_id: Uuid,
        trace_id: Uuid,
    ) -> Result<Vec<SpanEvent>, StoreError> {
        Ok(db::spans::list_events_by_trace(&self.pool, tenant_id, trace_id).await?)
    }
}
