#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use actionledger::audit::{self, AuditContext, AuditLogEntry};
use actionledger::config::Config;
use actionledger::models::SnapshotOperation;
use actionledger::revert::{self, SnapshotContext, SnapshotInput};
use actionledger::state::{LedgerState, SharedState};
use actionledger::store::{MemoryStore, PgStore};

/// A ledger over the in-process store, with one tenant and one operator ready to go.
pub struct TestLedger {
    pub state: SharedState,
    pub store: Arc<MemoryStore>,
    pub tenant: Uuid,
    pub actor: Uuid,
}

impl TestLedger {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let (state, store) = actionledger::in_memory(config);
        TestLedger {
            state,
            store,
            tenant: Uuid::now_v7(),
            actor: Uuid::now_v7(),
        }
    }

    pub fn audit_context(&self) -> AuditContext {
        let mut ctx = AuditContext::new(self.tenant);
        ctx.actor_user_id = Some(self.actor);
        ctx
    }

    /// Write an audit record under this ledger's tenant, return its id.
    pub async fn log(&self, entry: AuditLogEntry) -> Uuid {
        audit::create_audit_log(&self.state, &self.audit_context(), entry)
            .await
            .expect("create audit log failed")
    }

    pub fn snapshot_context(&self, conversation_id: Uuid, message_id: Uuid) -> SnapshotContext {
        SnapshotContext {
            tenant_id: self.tenant,
            conversation_id,
            message_id,
            tool_name: Some("update_record".to_string()),
        }
    }

    /// Seed the entity with `after`, capture the change, return the snapshot id.
    pub async fn capture(
        &self,
        message_id: Uuid,
        entity_type: &str,
        entity_id: &str,
        operation: SnapshotOperation,
        before: Value,
        after: Value,
    ) -> Uuid {
        self.store
            .put_entity(self.tenant, entity_type, entity_id, after.clone())
            .await;
        let ctx = self.snapshot_context(Uuid::now_v7(), message_id);
        revert::create_action_snapshot(
            &self.state,
            &ctx,
            SnapshotInput::new(entity_type, entity_id, operation, before, after),
        )
        .await
        .expect("create snapshot failed")
    }

    pub async fn entity(&self, entity_type: &str, entity_id: &str) -> Value {
        self.store
            .entity(self.tenant, entity_type, entity_id)
            .await
            .expect("entity missing")
    }
}

/// A Postgres-backed ledger on a dedicated temporary database.
pub struct TestDb {
    pub state: SharedState,
    pub pool: PgPool,
    pub db_name: String,
    pub tenant: Uuid,
}

fn database_url() -> Option<String> {
    let _ = dotenvy::dotenv();
    std::env::var("DATABASE_URL").ok()
}

fn admin_url(base_url: &str) -> String {
    base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/postgres"))
        .unwrap_or_else(|| base_url.to_string())
}

/// Create a fresh database, apply migrations and a small business schema.
/// Returns None (the test should return early) when `DATABASE_URL` is not set.
pub async fn spawn_pg() -> Option<TestDb> {
    let Some(base_url) = database_url() else {
        eprintln!("DATABASE_URL not set, skipping Postgres test");
        return None;
    };

    let db_name = format!("actionledger_test_{}", Uuid::now_v7().to_string().replace('-', ""));

    let admin_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url(&base_url))
        .await
        .expect("Failed to connect to postgres for test DB creation");

    sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
        .execute(&admin_pool)
        .await
        .expect("Failed to create test database");

    admin_pool.close().await;

    let test_url = base_url
        .rsplit_once('/')
        .map(|(base, _)| format!("{base}/{db_name}"))
        .unwrap_or_else(|| base_url.clone());

    let config = Config {
        database_url: Some(test_url),
        max_connections: 5,
        log_level: "warn".to_string(),
        ..Config::default()
    };

    let store = PgStore::connect(&config)
        .await
        .expect("Failed to connect to test database");
    let pool = store.pool().clone();

    sqlx::query(
        "CREATE TABLE invoices (
            id TEXT PRIMARY KEY,
            company_id UUID NOT NULL,
            status TEXT,
            amount NUMERIC,
            notes TEXT,
            deleted_at TIMESTAMPTZ
        )",
    )
    .execute(&pool)
    .await
    .expect("Failed to create invoices table");

    Some(TestDb {
        state: LedgerState::new(Arc::new(store), config).shared(),
        pool,
        db_name,
        tenant: Uuid::now_v7(),
    })
}

/// Drop the test database.
pub async fn cleanup(db: TestDb) {
    let db_name = db.db_name.clone();
    db.pool.close().await;
    drop(db);

    let Some(base_url) = database_url() else {
        return;
    };
    if let Ok(admin_pool) = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url(&base_url))
        .await
    {
        let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)"))
            .execute(&admin_pool)
            .await;
        admin_pool.close().await;
    }
}

/// Drop stale test databases (useful after test crashes).
pub async fn cleanup_stale_test_dbs() {
    let Some(base_url) = database_url() else {
        return;
    };

    if let Ok(admin_pool) = PgPoolOptions::new()
        .max_connections(2)
        .connect(&admin_url(&base_url))
        .await
    {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT datname FROM pg_database WHERE datname LIKE 'actionledger_test_%'",
        )
        .fetch_all(&admin_pool)
        .await
        .unwrap_or_default();

        for name in rows {
            let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS \"{name}\" WITH (FORCE)"))
                .execute(&admin_pool)
                .await;
        }
        admin_pool.close().await;
    }
}
