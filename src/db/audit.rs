use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::AuditRecord;
use crate::store::AuditQuery;

pub async fn insert(pool: &PgPool, record: &AuditRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_records (
            id, tenant_id, actor_user_id, conversation_id, message_id, trace_id, span_id,
            action, entity_type, entity_id, entity_ids, before_state, after_state,
            changed_fields, tool_name, tool_params, tool_result, severity, checksum,
            is_reversible, reversed, created_at
         ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17, $18, $19, $20, false, $21
         )",
    )
    .bind(record.id)
    .bind(record.tenant_id)
    .bind(record.actor_user_id)
    .bind(record.conversation_id)
    .bind(record.message_id)
    .bind(record.trace_id)
    .bind(record.span_id)
    .bind(record.action.as_str())
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(&record.entity_ids)
    .bind(&record.before_state)
    .bind(&record.after_state)
    .bind(&record.changed_fields)
    .bind(&record.tool_name)
    .bind(&record.tool_params)
    .bind(&record.tool_result)
    .bind(record.severity.as_str())
    .bind(&record.checksum)
    .bind(record.is_reversible)
    .bind(record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_id_scoped(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<AuditRecord>, sqlx::Error> {
    sqlx::query_as::<_, AuditRecord>(
        "SELECT * FROM audit_records WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &AuditQuery) {
    builder.push(" WHERE tenant_id = ").push_bind(query.tenant_id);

    if let Some(entity_type) = &query.entity_type {
        builder.push(" AND entity_type = ").push_bind(entity_type.clone());
    }
    if let Some(entity_id) = &query.entity_id {
        builder
            .push(" AND (entity_id = ")
            .push_bind(entity_id.clone())
            .push(" OR ")
            .push_bind(entity_id.clone())
            .push(" = ANY(entity_ids))");
    }
    if let Some(conversation_id) = query.conversation_id {
        builder.push(" AND conversation_id = ").push_bind(conversation_id);
    }
    if !query.severities.is_empty() {
        let severities: Vec<String> = query
            .severities
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        builder.push(" AND severity = ANY(").push_bind(severities).push(")");
    }
    if !query.include_reversed {
        builder.push(" AND reversed = false");
    }
    if let Some(since) = query.since {
        builder.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = query.until {
        builder.push(" AND created_at <= ").push_bind(until);
    }
}

pub async fn list(pool: &PgPool, query: &AuditQuery) -> Result<Vec<AuditRecord>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM audit_records");
    push_filters(&mut builder, query);
    builder.push(" ORDER BY created_at DESC, id DESC");
    if let Some(limit) = query.limit {
        builder.push(" LIMIT ").push_bind(limit);
    }
    builder.push(" OFFSET ").push_bind(query.offset);

    builder
        .build_query_as::<AuditRecord>()
        .fetch_all(pool)
        .await
}

pub async fn count(pool: &PgPool, query: &AuditQuery) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_records");
    push_filters(&mut builder, query);

    let row: (i64,) = builder.build_query_as().fetch_one(pool).await?;
    Ok(row.0)
}

/// Flip the reversal flags. Only a reversible, not yet reversed record is touched.
pub async fn mark_reversed(
    conn: &mut PgConnection,
    id: Uuid,
    tenant_id: Uuid,
    reversal_id: Uuid,
    reversed_by: Uuid,
    reversed_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE audit_records
         SET reversed = true, reversed_at = $3, reversed_by = $4, reversal_id = $5
         WHERE id = $1 AND tenant_id = $2 AND reversed = false AND is_reversible = true",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(reversed_at)
    .bind(reversed_by)
    .bind(reversal_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
