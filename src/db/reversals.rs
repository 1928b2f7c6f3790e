use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::Reversal;

/// Returns false when the target already has a reversal (unique index hit).
pub async fn insert(conn: &mut PgConnection, reversal: &Reversal) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO reversals (
            id, tenant_id, audit_log_id, snapshot_id, reversed_by, reason, method,
            restored_state, partial_fields, created_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT DO NOTHING",
    )
    .bind(reversal.id)
    .bind(reversal.tenant_id)
    .bind(reversal.audit_log_id)
    .bind(reversal.snapshot_id)
    .bind(reversal.reversed_by)
    .bind(&reversal.reason)
    .bind(reversal.method.as_str())
    .bind(&reversal.restored_state)
    .bind(&reversal.partial_fields)
    .bind(reversal.created_at)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn find_by_id_scoped(
    pool: &PgPool,
    id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<Reversal>, sqlx::Error> {
    sqlx::query_as::<_, Reversal>("SELECT * FROM reversals WHERE id = $1 AND tenant_id = $2")
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
}
