use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::Snapshot;
use crate::store::RevertMark;

pub async fn insert_many(
    conn: &mut PgConnection,
    snapshots: &[Snapshot],
) -> Result<(), sqlx::Error> {
    if snapshots.is_empty() {
        return Ok(());
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO action_snapshots (
            id, tenant_id, message_id, conversation_id, audit_log_id, tool_name, sequence,
            entity_type, entity_id, before_state, after_state, changed_fields, operation,
            snapshot_type, is_reverted, created_at
         ) ",
    );
    builder.push_values(snapshots, |mut row, s| {
        row.push_bind(s.id)
            .push_bind(s.tenant_id)
            .push_bind(s.message_id)
            .push_bind(s.conversation_id)
            .push_bind(s.audit_log_id)
            .push_bind(s.tool_name.clone())
            .push_bind(s.sequence)
            .push_bind(s.entity_type.clone())
            .push_bind(s.entity_id.clone())
            .push_bind(s.before_state.clone())
            .push_bind(s.after_state.clone())
            .push_bind(s.changed_fields.clone())
            .push_bind(s.operation.as_str())
            .push_bind(s.snapshot_type.as_str())
            .push_bind(false)
            .push_bind(s.created_at);
    });

    builder.build().execute(conn).await?;
    Ok(())
}

pub async fn find_by_id_scoped(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<Snapshot>, sqlx::Error> {
    sqlx::query_as::<_, Snapshot>(
        "SELECT * FROM action_snapshots WHERE id = $1 AND tenant_id = $2",
    )
    .bind(id)
    .bind(tenant_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_by_message(
    pool: &PgPool,
    tenant_id: Uuid,
    message_id: Uuid,
) -> Result<Vec<Snapshot>, sqlx::Error> {
    sqlx::query_as::<_, Snapshot>(
        "SELECT * FROM action_snapshots WHERE tenant_id = $1 AND message_id = $2
         ORDER BY created_at ASC, id ASC",
    )
    .bind(tenant_id)
    .bind(message_id)
    .fetch_all(pool)
    .await
}

pub async fn list_by_conversation(
    pool: &PgPool,
    tenant_id: Uuid,
    conversation_id: Uuid,
    include_reverted: bool,
    limit: i64,
) -> Result<Vec<Snapshot>, sqlx::Error> {
    sqlx::query_as::<_, Snapshot>(
        "SELECT * FROM action_snapshots
         WHERE tenant_id = $1 AND conversation_id = $2 AND ($3 OR is_reverted = false)
         ORDER BY created_at DESC, id DESC LIMIT $4",
    )
    .bind(tenant_id)
    .bind(conversation_id)
    .bind(include_reverted)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Claim the snapshot for reversal. False means someone else already did.
pub async fn mark_reverted(
    conn: &mut PgConnection,
    id: Uuid,
    tenant_id: Uuid,
    mark: &RevertMark,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE action_snapshots
         SET is_reverted = true, reverted_at = $3, reverted_by = $4, revert_reason = $5,
             partial_revert_fields = $6
         WHERE id = $1 AND tenant_id = $2 AND is_reverted = false",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(mark.reverted_at)
    .bind(mark.reverted_by)
    .bind(&mark.reason)
    .bind(&mark.partial_fields)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
