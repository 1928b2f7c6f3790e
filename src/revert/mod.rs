//! Entity snapshots captured around agent mutations, and the reversal engine built on them.

pub mod reverter;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::integrity;
use crate::models::{Snapshot, SnapshotOperation, SnapshotType};
use crate::state::LedgerState;

pub use reverter::{
    batch_revert, preview_revert, revert_message_actions, revert_snapshot, FailedEntity,
    RevertOptions, RevertOutcome, RevertPreview, RevertedEntity,
};

pub const DEFAULT_REVERTABLE_LIMIT: i64 = 50;

/// Message-level tags shared by every snapshot captured for one agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub tenant_id: Uuid,
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInput {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: SnapshotOperation,
    pub before_state: Value,
    pub after_state: Value,
    /// Derived from the state diff when absent.
    pub changed_fields: Option<Vec<String>>,
    pub audit_log_id: Option<Uuid>,
}

impl SnapshotInput {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: SnapshotOperation,
        before_state: Value,
        after_state: Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            before_state,
            after_state,
            changed_fields: None,
            audit_log_id: None,
        }
    }

    pub fn linked_to(mut self, audit_log_id: Uuid) -> Self {
        self.audit_log_id = Some(audit_log_id);
        self
    }
}

fn entity_state(value: Value, what: &str) -> Result<Value, LedgerError> {
    let value = match value {
        Value::Null => Value::Object(Map::new()),
        Value::Object(_) => value,
        _ => {
            return Err(LedgerError::InvalidInput(format!(
                "{what} must be a JSON object"
            )));
        }
    };
    integrity::canonicalize_state(value)
        .map_err(|e| LedgerError::InvalidInput(format!("{what}: {e}")))
}

pub async fn create_action_snapshot(
    state: &LedgerState,
    context: &SnapshotContext,
    input: SnapshotInput,
) -> Result<Uuid, LedgerError> {
    let ids = create_bulk_snapshots(state, context, vec![input]).await?;
    ids.into_iter()
        .next()
        .ok_or_else(|| LedgerError::InvalidInput("no snapshot was captured".to_string()))
}

/// Capture several entity changes made by one message. All rows share a timestamp; `sequence`
/// is the position in `inputs` and ids are allocated in the same order. They are written
/// together or not at all.
pub async fn create_bulk_snapshots(
    state: &LedgerState,
    context: &SnapshotContext,
    inputs: Vec<SnapshotInput>,
) -> Result<Vec<Uuid>, LedgerError> {
    let created_at = integrity::now();

    let snapshots = inputs
        .into_iter()
        .enumerate()
        .map(|(sequence, input)| {
            let before_state = entity_state(input.before_state, "before_state")?;
            let after_state = entity_state(input.after_state, "after_state")?;
            let changed_fields = input.changed_fields.unwrap_or_else(|| {
                integrity::changed_fields(Some(&before_state), Some(&after_state))
            });

            Ok(Snapshot {
                id: Uuid::now_v7(),
                tenant_id: context.tenant_id,
                message_id: context.message_id,
                conversation_id: context.conversation_id,
                audit_log_id: input.audit_log_id,
                tool_name: context.tool_name.clone(),
                sequence: sequence as i32,
                entity_type: input.entity_type,
                entity_id: input.entity_id,
                before_state,
                after_state,
                snapshot_type: SnapshotType::for_changed_fields(&changed_fields),
                changed_fields,
                operation: input.operation,
                is_reverted: false,
                reverted_at: None,
                reverted_by: None,
                revert_reason: None,
                partial_revert_fields: None,
                created_at,
            })
        })
        .collect::<Result<Vec<_>, LedgerError>>()?;

    if snapshots.is_empty() {
        return Ok(Vec::new());
    }

    state.store.insert_snapshots(&snapshots).await?;

    tracing::debug!(
        tenant_id = %context.tenant_id,
        message_id = %context.message_id,
        count = snapshots.len(),
        "Snapshots captured"
    );

    Ok(snapshots.into_iter().map(|s| s.id).collect())
}

/// Snapshots for one message in the order they were captured.
pub async fn get_message_snapshots(
    state: &LedgerState,
    tenant_id: Uuid,
    message_id: Uuid,
) -> Result<Vec<Snapshot>, LedgerError> {
    Ok(state
        .store
        .list_message_snapshots(tenant_id, message_id)
        .await?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertableOptions {
    pub limit: i64,
    pub include_reverted: bool,
}

impl Default for RevertableOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_REVERTABLE_LIMIT,
            include_reverted: false,
        }
    }
}

/// Newest first, so the head of the list is what an "undo" button would target.
pub async fn get_revertable_actions(
    state: &LedgerState,
    tenant_id: Uuid,
    conversation_id: Uuid,
    options: RevertableOptions,
) -> Result<Vec<Snapshot>, LedgerError> {
    Ok(state
        .store
        .list_conversation_snapshots(
            tenant_id,
            conversation_id,
            options.include_reverted,
            options.limit.max(1),
        )
        .await?)
}
