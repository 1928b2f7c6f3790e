use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Span, SpanEvent};
use crate::store::SpanFinish;

pub async fn insert(pool: &PgPool, span: &Span) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO trace_spans (
            id, trace_id, tenant_id, user_id, conversation_id, parent_span_id, name, span_type,
            model, provider, tool_name, input_preview, output_preview, input_tokens,
            output_tokens, total_tokens, cost_cents, status, attributes, started_at
         ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20
         )",
    )
    .bind(span.id)
    .bind(span.trace_id)
    .bind(span.tenant_id)
    .bind(span.user_id)
    .bind(span.conversation_id)
    .bind(span.parent_span_id)
    .bind(&span.name)
    .bind(span.span_type.as_str())
    .bind(&span.model)
    .bind(&span.provider)
    .bind(&span.tool_name)
    .bind(&span.input_preview)
    .bind(&span.output_preview)
    .bind(span.input_tokens)
    .bind(span.output_tokens)
    .bind(span.total_tokens)
    .bind(span.cost_cents)
    .bind(span.status.as_str())
    .bind(&span.attributes)
    .bind(span.started_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_id_scoped(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<Span>, sqlx::Error> {
    sqlx::query_as::<_, Span>("SELECT * FROM trace_spans WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
}

/// Terminal write guarded on `status = 'running'`; `None` when nothing matched.
pub async fn finish(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
    finish: &SpanFinish,
) -> Result<Option<Span>, sqlx::Error> {
    sqlx::query_as::<_, Span>(
        "UPDATE trace_spans
         SET status = $3, ended_at = $4, duration_ms = $5, input_tokens = $6,
             output_tokens = $7, total_tokens = $8, cost_cents = $9,
             output_preview = COALESCE($10, output_preview), error_message = $11,
             error_code = $12, attributes = COALESCE($13, attributes)
         WHERE id = $1 AND tenant_id = $2 AND status = 'running'
         RETURNING *",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(finish.status.as_str())
    .bind(finish.ended_at)
    .bind(finish.duration_ms)
    .bind(finish.input_tokens)
    .bind(finish.output_tokens)
    .bind(finish.total_tokens)
    .bind(finish.cost_cents)
    .bind(&finish.output_preview)
    .bind(&finish.error_message)
    .bind(&finish.error_code)
    .bind(&finish.attributes)
    .fetch_optional(pool)
    .await
}

pub async fn list_by_trace(
    pool: &PgPool,
    tenant_id: Uuid,
    trace_id: Uuid,
) -> Result<Vec<Span>, sqlx::Error> {
    sqlx::query_as::<_, Span>(
        "SELECT * FROM trace_spans WHERE tenant_id = $1 AND trace_id = $2
         ORDER BY started_at ASC, id ASC",
    )
    .bind(tenant_id)
    .bind(trace_id)
    .fetch_all(pool)
    .await
}

pub async fn list_between(
    pool: &PgPool,
    tenant_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Span>, sqlx::Error> {
    sqlx::query_as::<_, Span>(
        "SELECT * FROM trace_spans
         WHERE tenant_id = $1 AND started_at >= $2 AND started_at < $3
         ORDER BY started_at ASC",
    )
    .bind(tenant_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

pub async fn insert_event(pool: &PgPool, event: &SpanEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO span_events (
            id, span_id, trace_id, tenant_id, event_type, name, level, message, attributes,
            timestamp
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(event.id)
    .bind(event.span_id)
    .bind(event.trace_id)
    .bind(event.tenant_id)
    .bind(&event.event_type)
    .bind(&event.name)
    .bind(event.level.as_str())
    .bind(&event.message)
    .bind(&event.attributes)
    .bind(event.timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_events_by_trace(
    pool: &PgPool,
    tenant_id: Uuid,
    trace_id: Uuid,
) -> Result<Vec<SpanEvent>, sqlx::Error> {
    sqlx::query_as::<_, SpanEvent>(
        "SELECT * FROM span_events WHERE tenant_id = $1 AND trace_id = $2
         ORDER BY timestamp ASC",
    )
    .bind(tenant_id)
    .bind(trace_id)
    .fetch_all(pool)
    .await
}
