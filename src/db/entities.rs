//! Writes against the caller's business tables during reversal.
//!
//! Table and column names cannot be bound, so every identifier is checked
//! against a strict pattern before it is spliced into SQL.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::store::StoreError;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier pattern is valid"));

/// Columns a reversal never writes through the field map.
const PROTECTED_COLUMNS: &[&str] = &["id", "deleted_at"];

pub fn check_identifier(ident: &str) -> Result<&str, StoreError> {
    if IDENTIFIER.is_match(ident) {
        Ok(ident)
    } else {
        Err(StoreError::InvalidIdentifier(ident.to_string()))
    }
}

/// Where and how an entity type lives in the business schema.
#[derive(Debug, Clone, Copy)]
pub struct EntityTarget<'a> {
    pub table: &'a str,
    pub tenant_column: &'a str,
}

pub async fn fetch(
    pool: &PgPool,
    target: EntityTarget<'_>,
    tenant_id: Uuid,
    entity_id: &str,
) -> Result<Option<Value>, StoreError> {
    let sql = format!(
        "SELECT to_jsonb(t) FROM {table} t WHERE t.id::text = $1 AND t.{tenant} = $2",
        table = check_identifier(target.table)?,
        tenant = check_identifier(target.tenant_column)?,
    );
    let row: Option<(Value,)> = sqlx::query_as(&sql)
        .bind(entity_id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

fn writable_columns<'m>(
    fields: &'m Map<String, Value>,
    tenant_column: &str,
) -> Result<Vec<&'m str>, StoreError> {
    fields
        .keys()
        .map(String::as_str)
        .filter(|k| !PROTECTED_COLUMNS.contains(k) && *k != tenant_column)
        .map(check_identifier)
        .collect()
}

/// Overwrite `fields` on one row, optionally clearing the deletion marker. Returns rows touched.
pub async fn update_fields(
    conn: &mut PgConnection,
    target: EntityTarget<'_>,
    tenant_id: Uuid,
    entity_id: &str,
    fields: &Map<String, Value>,
    clear_deleted: bool,
) -> Result<u64, StoreError> {
    let table = check_identifier(target.table)?;
    let tenant = check_identifier(target.tenant_column)?;

    let mut assignments: Vec<String> = writable_columns(fields, tenant)?
        .into_iter()
        .map(|col| format!("{col} = r.{col}"))
        .collect();
    if clear_deleted {
        assignments.push("deleted_at = NULL".to_string());
    }
    if assignments.is_empty() {
        let exists: Option<(i32,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {table} WHERE id::text = $1 AND {tenant} = $2"
        ))
        .bind(entity_id)
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;
        return Ok(exists.map_or(0, |_| 1));
    }

    // jsonb_populate_record casts each value to the column's declared type.
    let sql = format!(
        "UPDATE {table} AS t SET {assignments}
         FROM jsonb_populate_record(NULL::{table}, $3) AS r
         WHERE t.id::text = $1 AND t.{tenant} = $2",
        assignments = assignments.join(", "),
    );
    let result = sqlx::query(&sql)
        .bind(entity_id)
        .bind(tenant_id)
        .bind(Value::Object(fields.clone()))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn soft_delete(
    conn: &mut PgConnection,
    target: EntityTarget<'_>,
    tenant_id: Uuid,
    entity_id: &str,
) -> Result<u64, StoreError> {
    let sql = format!(
        "UPDATE {table} SET deleted_at = now() WHERE id::text = $1 AND {tenant} = $2",
        table = check_identifier(target.table)?,
        tenant = check_identifier(target.tenant_column)?,
    );
    let result = sqlx::query(&sql)
        .bind(entity_id)
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Recreate a row that was hard-deleted outside the ledger.
pub async fn reinsert(
    conn: &mut PgConnection,
    target: EntityTarget<'_>,
    tenant_id: Uuid,
    entity_id: &str,
    state: &Map<String, Value>,
) -> Result<u64, StoreError> {
    let table = check_identifier(target.table)?;
    let tenant = check_identifier(target.tenant_column)?;

    let mut row = state.clone();
    row.insert("id".to_string(), Value::String(entity_id.to_string()));
    row.insert(tenant.to_string(), Value::String(tenant_id.to_string()));
    row.insert("deleted_at".to_string(), Value::Null);

    let sql = format!("INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)");
    let result = sqlx::query(&sql)
        .bind(Value::Object(row))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
