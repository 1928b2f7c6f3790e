use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::audit::{self, ReversalRequest};
use crate::error::LedgerError;
use crate::integrity;
use crate::models::{Reversal, ReversalMethod, Snapshot, SnapshotOperation};
use crate::state::LedgerState;
use crate::store::{EntityMutation, RevertMark, StoreError};

const DELETION_MARKER: &str = "deleted_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertOptions {
    /// Restore only these fields; everything else keeps its latest value.
    pub partial_fields: Option<Vec<String>>,
}

impl RevertOptions {
    pub fn partial<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partial_fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertedEntity {
    pub snapshot_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub reverted_fields: Vec<String>,
    /// None when the reversal record could not be written.
    pub reversal_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntity {
    pub snapshot_id: Uuid,
    /// Unknown when the snapshot itself could not be loaded.
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevertOutcome {
    pub success: bool,
    pub reverted_entities: Vec<RevertedEntity>,
    pub failed_entities: Vec<FailedEntity>,
    /// Set for single-snapshot reverts; aggregates carry ids per entity.
    pub reversal_id: Option<Uuid>,
}

impl RevertOutcome {
    fn single(reverted: RevertedEntity) -> Self {
        Self {
            success: true,
            reversal_id: reverted.reversal_id,
            reverted_entities: vec![reverted],
            failed_entities: Vec::new(),
        }
    }

    fn record(&mut self, snapshot: &Snapshot, result: Result<RevertedEntity, LedgerError>) {
        match result {
            Ok(reverted) => self.reverted_entities.push(reverted),
            Err(err) => {
                tracing::warn!(
                    snapshot_id = %snapshot.id,
                    entity_type = %snapshot.entity_type,
                    entity_id = %snapshot.entity_id,
                    "Revert failed: {err}"
                );
                self.failed_entities.push(FailedEntity {
                    snapshot_id: snapshot.id,
                    entity_type: Some(snapshot.entity_type.clone()),
                    entity_id: Some(snapshot.entity_id.clone()),
                    error: err.to_string(),
                });
            }
        }
    }

    fn finish(mut self) -> Self {
        self.success = self.failed_entities.is_empty();
        self
    }

    pub fn into_result(self) -> Result<Self, LedgerError> {
        if self.success {
            Ok(self)
        } else {
            Err(LedgerError::PartialBatchFailure {
                reverted: self.reverted_entities.len(),
                failed: self.failed_entities.len(),
            })
        }
    }
}

/// What a revert of one snapshot will write.
struct RestorePlan {
    mutation: EntityMutation,
    fields: Vec<String>,
    restored_state: Map<String, Value>,
}

fn object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Fields a full revert puts back. Falls back to every captured key when the
/// snapshot recorded no diff.
fn full_target(snapshot: &Snapshot) -> Vec<String> {
    if !snapshot.changed_fields.is_empty() {
        return snapshot.changed_fields.clone();
    }
    let before = object(&snapshot.before_state);
    let after = object(&snapshot.after_state);
    before
        .keys()
        .chain(after.keys())
        .filter(|k| k.as_str() != "id")
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn plan_restore(snapshot: &Snapshot, partial_fields: Option<&[String]>) -> Result<RestorePlan, LedgerError> {
    let before = object(&snapshot.before_state);
    let entity_type = snapshot.entity_type.clone();
    let entity_id = snapshot.entity_id.clone();

    let (fields, state_to_restore) = match partial_fields {
        None => (full_target(snapshot), before.clone()),
        Some([]) => {
            return Err(LedgerError::InvalidInput(
                "partial revert needs at least one field".to_string(),
            ));
        }
        Some(requested) => {
            if snapshot.operation != SnapshotOperation::Update {
                return Err(LedgerError::InvalidInput(format!(
                    "partial revert only applies to updates, this snapshot is a {}",
                    snapshot.operation
                )));
            }
            let allowed = full_target(snapshot);
            if let Some(field) = requested.iter().find(|f| !allowed.contains(f)) {
                return Err(LedgerError::InvalidInput(format!(
                    "field '{field}' was not changed by this action"
                )));
            }

            let mut state = object(&snapshot.after_state);
            for field in requested {
                state.insert(field.clone(), before.get(field).cloned().unwrap_or(Value::Null));
            }
            (requested.to_vec(), state)
        }
    };

    let mutation = match snapshot.operation {
        SnapshotOperation::Create => EntityMutation::SoftDelete {
            entity_type,
            entity_id,
        },
        SnapshotOperation::Delete => EntityMutation::Restore {
            entity_type,
            entity_id,
            state: before.clone(),
        },
        SnapshotOperation::Update => EntityMutation::Update {
            entity_type,
            entity_id,
            fields: fields
                .iter()
                .map(|f| {
                    let value = state_to_restore.get(f).cloned().unwrap_or(Value::Null);
                    (f.clone(), value)
                })
                .collect(),
        },
    };

    let restored_state = match &mutation {
        EntityMutation::Update { fields, .. } => fields.clone(),
        _ => before,
    };

    Ok(RestorePlan {
        mutation,
        fields,
        restored_state,
    })
}

fn entity_error(err: StoreError) -> LedgerError {
    match err {
        StoreError::EntityNotFound {
            entity_type,
            entity_id,
        } => LedgerError::NotFound(format!("{entity_type} {entity_id} no longer exists")),
        other => other.into(),
    }
}

/// Reversal record for a reverted snapshot: through the audit log when the snapshot links an
/// audit record, stand-alone otherwise.
async fn link_reversal(
    state: &LedgerState,
    snapshot: &Snapshot,
    actor: Uuid,
    reason: &str,
    partial_fields: Option<&[String]>,
    restored_state: &Map<String, Value>,
) -> Result<Uuid, LedgerError> {
    let method = if partial_fields.is_some() {
        ReversalMethod::Partial
    } else {
        ReversalMethod::Automatic
    };

    if let Some(audit_log_id) = snapshot.audit_log_id {
        let request = ReversalRequest {
            audit_log_id,
            reason: reason.to_string(),
            reversed_by: actor,
            method,
            partial_fields: partial_fields.map(<[String]>::to_vec),
            snapshot_id: Some(snapshot.id),
        };
        match audit::record_reversal(state, snapshot.tenant_id, request).await {
            Ok(id) => return Ok(id),
            // refused by the audit record; the snapshot still gets its own row
            Err(
                err @ (LedgerError::NotReversible(_)
                | LedgerError::AlreadyReverted(_)
                | LedgerError::NotFound(_)),
            ) => {
                tracing::debug!(
                    snapshot_id = %snapshot.id,
                    %audit_log_id,
                    "Audit record not cross-linked: {err}"
                );
            }
            Err(err) => return Err(err),
        }
    }

    let reversal = Reversal {
        id: Uuid::now_v7(),
        tenant_id: snapshot.tenant_id,
        audit_log_id: None,
        snapshot_id: Some(snapshot.id),
        reversed_by: actor,
        reason: reason.to_string(),
        method,
        restored_state: Some(Value::Object(restored_state.clone())),
        partial_fields: partial_fields.map(<[String]>::to_vec),
        created_at: integrity::now(),
    };
    if !state.store.insert_reversal(&reversal).await? {
        return Err(LedgerError::AlreadyReverted(format!(
            "snapshot {} already has a reversal record",
            snapshot.id
        )));
    }
    Ok(reversal.id)
}

async fn revert_loaded(
    state: &LedgerState,
    snapshot: &Snapshot,
    actor: Uuid,
    reason: &str,
    options: &RevertOptions,
) -> Result<RevertedEntity, LedgerError> {
    if snapshot.is_reverted {
        return Err(LedgerError::AlreadyReverted(format!(
            "snapshot {} has already been reverted",
            snapshot.id
        )));
    }

    let partial_fields = options.partial_fields.as_deref();
    let plan = plan_restore(snapshot, partial_fields)?;

    if snapshot.operation == SnapshotOperation::Update {
        let current = state
            .store
            .fetch_entity(snapshot.tenant_id, &snapshot.entity_type, &snapshot.entity_id)
            .await?;
        if current.as_ref().is_some_and(|entity| deleted_since(snapshot, entity)) {
            return Err(LedgerError::NotReversible(format!(
                "{} {} has been deleted since this change",
                snapshot.entity_type, snapshot.entity_id
            )));
        }
    }

    let mark = RevertMark {
        reverted_by: actor,
        reverted_at: integrity::now(),
        reason: reason.to_string(),
        partial_fields: options.partial_fields.clone(),
    };

    let applied = state
        .store
        .revert_snapshot(snapshot.tenant_id, snapshot.id, &plan.mutation, &mark)
        .await
        .map_err(entity_error)?;
    if !applied {
        return Err(LedgerError::AlreadyReverted(format!(
            "snapshot {} has already been reverted",
            snapshot.id
        )));
    }

    let reversal_id = match link_reversal(
        state,
        snapshot,
        actor,
        reason,
        partial_fields,
        &plan.restored_state,
    )
    .await
    {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::warn!(
                snapshot_id = %snapshot.id,
                "Entity restored but reversal record not written: {err}"
            );
            None
        }
    };

    tracing::info!(
        tenant_id = %snapshot.tenant_id,
        snapshot_id = %snapshot.id,
        operation = %snapshot.operation,
        "Reverted {} {}",
        snapshot.entity_type,
        snapshot.entity_id,
    );

    Ok(RevertedEntity {
        snapshot_id: snapshot.id,
        entity_type: snapshot.entity_type.clone(),
        entity_id: snapshot.entity_id.clone(),
        reverted_fields: plan.fields,
        reversal_id,
    })
}

/// Undo one captured change.
///
/// The entity write and the reverted flag land in one store transaction guarded on the
/// snapshot still being unreverted, so a second concurrent request gets `AlreadyReverted`
/// and the entity is written once.
pub async fn revert_snapshot(
    state: &LedgerState,
    tenant_id: Uuid,
    snapshot_id: Uuid,
    actor: Uuid,
    reason: &str,
    options: RevertOptions,
) -> Result<RevertOutcome, LedgerError> {
    let snapshot = state
        .store
        .find_snapshot(tenant_id, snapshot_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("Snapshot {snapshot_id} not found")))?;

    let reverted = revert_loaded(state, &snapshot, actor, reason, &options).await?;
    Ok(RevertOutcome::single(reverted))
}

/// Revert everything one message did, latest change first.
pub async fn revert_message_actions(
    state: &LedgerState,
    tenant_id: Uuid,
    message_id: Uuid,
    actor: Uuid,
    reason: &str,
) -> Result<RevertOutcome, LedgerError> {
    let snapshots = state
        .store
        .list_message_snapshots(tenant_id, message_id)
        .await?;

    let options = RevertOptions::default();
    let mut outcome = RevertOutcome::default();
    for snapshot in snapshots.iter().rev().filter(|s| !s.is_reverted) {
        let result = revert_loaded(state, snapshot, actor, reason, &options).await;
        outcome.record(snapshot, result);
    }

    let outcome = outcome.finish();
    tracing::info!(
        %tenant_id,
        %message_id,
        reverted = outcome.reverted_entities.len(),
        failed = outcome.failed_entities.len(),
        "Message actions reverted"
    );
    Ok(outcome)
}

/// Revert the given snapshots in the order supplied. Every id is attempted.
pub async fn batch_revert(
    state: &LedgerState,
    tenant_id: Uuid,
    snapshot_ids: &[Uuid],
    actor: Uuid,
    reason: &str,
) -> RevertOutcome {
    let options = RevertOptions::default();
    let mut outcome = RevertOutcome::default();

    for &snapshot_id in snapshot_ids {
        let snapshot = match state.store.find_snapshot(tenant_id, snapshot_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                outcome.failed_entities.push(FailedEntity {
                    snapshot_id,
                    entity_type: None,
                    entity_id: None,
                    error: LedgerError::NotFound(format!("Snapshot {snapshot_id} not found"))
                        .to_string(),
                });
                continue;
            }
            Err(err) => {
                tracing::warn!(%snapshot_id, "Snapshot lookup failed: {err}");
                outcome.failed_entities.push(FailedEntity {
                    snapshot_id,
                    entity_type: None,
                    entity_id: None,
                    error: LedgerError::from(err).to_string(),
                });
                continue;
            }
        };

        let result = revert_loaded(state, &snapshot, actor, reason, &options).await;
        outcome.record(&snapshot, result);
    }

    outcome.finish()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertPreview {
    pub snapshot_id: Uuid,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub operation: Option<SnapshotOperation>,
    pub current_state: Option<Value>,
    pub restored_state: Option<Value>,
    pub changed_fields: Vec<String>,
    pub can_revert: bool,
    pub reason: Option<String>,
}

impl RevertPreview {
    fn blocked(snapshot_id: Uuid, reason: &str) -> Self {
        Self {
            snapshot_id,
            entity_type: None,
            entity_id: None,
            operation: None,
            current_state: None,
            restored_state: None,
            changed_fields: Vec::new(),
            can_revert: false,
            reason: Some(reason.to_string()),
        }
    }
}

fn is_soft_deleted(entity: &Value) -> bool {
    entity
        .get(DELETION_MARKER)
        .is_some_and(|marker| !marker.is_null())
}

/// The entity carries a deletion marker that the captured change did not set.
fn deleted_since(snapshot: &Snapshot, entity: &Value) -> bool {
    is_soft_deleted(entity) && !is_soft_deleted(&snapshot.after_state)
}

/// What `revert_snapshot` would do, without writing anything.
pub async fn preview_revert(
    state: &LedgerState,
    tenant_id: Uuid,
    snapshot_id: Uuid,
) -> Result<RevertPreview, LedgerError> {
    let Some(snapshot) = state.store.find_snapshot(tenant_id, snapshot_id).await? else {
        return Ok(RevertPreview::blocked(snapshot_id, "Snapshot not found"));
    };

    let current = match state
        .store
        .fetch_entity(tenant_id, &snapshot.entity_type, &snapshot.entity_id)
        .await
    {
        Ok(current) => current,
        Err(StoreError::UnknownEntityType(entity_type)) => {
            let reason = format!("Entity type {entity_type} is not registered");
            return Ok(RevertPreview {
                entity_type: Some(snapshot.entity_type),
                entity_id: Some(snapshot.entity_id),
                operation: Some(snapshot.operation),
                changed_fields: snapshot.changed_fields,
                ..RevertPreview::blocked(snapshot_id, &reason)
            });
        }
        Err(err) => return Err(err.into()),
    };
    let plan = plan_restore(&snapshot, None)?;

    let restored_state = match (&plan.mutation, &current) {
        (EntityMutation::Update { fields, .. }, Some(Value::Object(current))) => {
            let mut merged = current.clone();
            merged.extend(fields.clone());
            Value::Object(merged)
        }
        _ => Value::Object(plan.restored_state),
    };

    let blocker = if snapshot.is_reverted {
        Some("Already reverted")
    } else {
        match (&current, snapshot.operation) {
            // A delete revert recreates a vanished row.
            (None, SnapshotOperation::Delete) => None,
            (None, _) => Some("Entity no longer exists"),
            (Some(entity), SnapshotOperation::Update) if deleted_since(&snapshot, entity) => {
                Some("Entity has been deleted since this change")
            }
            _ => None,
        }
    };

    Ok(RevertPreview {
        snapshot_id,
        entity_type: Some(snapshot.entity_type),
        entity_id: Some(snapshot.entity_id),
        operation: Some(snapshot.operation),
        current_state: current,
        restored_state: Some(restored_state),
        changed_fields: snapshot.changed_fields,
        can_revert: blocker.is_none(),
        reason: blocker.map(str::to_string),
    })
}
