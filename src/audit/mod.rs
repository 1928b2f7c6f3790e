//! Tamper-evident audit log of agent actions.
//!
//! Each record carries a SHA-256 checksum over a fixed set of its fields,
//! computed once when the record is written. Verification recomputes it from
//! whatever is stored now; any out-of-band edit to a covered field shows up as
//! a mismatch. Reversal flags are outside the checksum and are the only
//! fields that ever change after insert.

pub mod trail;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::integrity;
use crate::models::{AuditAction, AuditRecord, AuditSeverity, Reversal, ReversalMethod};
use crate::policy;
use crate::state::LedgerState;
use crate::store::AuditQuery;

pub use trail::{
    get_audit_statistics, get_chat_audit_trail, get_entity_audit_trail,
    get_high_severity_audit_entries, AuditStatistics, AuditTrailPage, ChatTrailOptions,
    HighSeverityOptions, Page, TimeRange,
};

/// Who acted and which conversation, message and span the action belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditContext {
    pub tenant_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub span_id: Option<Uuid>,
}

impl AuditContext {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            actor_user_id: None,
            conversation_id: None,
            message_id: None,
            trace_id: None,
            span_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_ids: Option<Vec<String>>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    /// Derived from the state diff when absent.
    pub changed_fields: Option<Vec<String>>,
    pub tool_name: Option<String>,
    pub tool_params: Option<Value>,
    pub tool_result: Option<Value>,
    /// Overrides the policy when set.
    pub severity: Option<AuditSeverity>,
}

impl AuditLogEntry {
    pub fn new(action: AuditAction, entity_type: impl Into<String>) -> Self {
        Self {
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            entity_ids: None,
            before_state: None,
            after_state: None,
            changed_fields: None,
            tool_name: None,
            tool_params: None,
            tool_result: None,
            severity: None,
        }
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn states(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before_state = before;
        self.after_state = after;
        self
    }

    pub fn tool(mut self, name: impl Into<String>, params: Option<Value>, result: Option<Value>) -> Self {
        self.tool_name = Some(name.into());
        self.tool_params = params;
        self.tool_result = result;
        self
    }
}

fn canonical(value: Option<Value>, what: &str) -> Result<Option<Value>, LedgerError> {
    value
        .map(integrity::canonicalize_state)
        .transpose()
        .map_err(|e| LedgerError::InvalidInput(format!("{what}: {e}")))
}

/// Record one action. The caller has already performed (or is about to perform) the mutation;
/// a store failure is returned as-is and nothing is retried.
pub async fn create_audit_log(
    state: &LedgerState,
    context: &AuditContext,
    entry: AuditLogEntry,
) -> Result<Uuid, LedgerError> {
    let before_state = canonical(entry.before_state, "before_state")?;
    let after_state = canonical(entry.after_state, "after_state")?;
    let tool_params = canonical(entry.tool_params, "tool_params")?;
    let tool_result = canonical(entry.tool_result, "tool_result")?;

    let changed_fields = entry.changed_fields.unwrap_or_else(|| {
        integrity::changed_fields(before_state.as_ref(), after_state.as_ref())
    });
    let severity = entry
        .severity
        .unwrap_or_else(|| state.policy.severity_for(entry.action, &entry.entity_type));
    let is_reversible = policy::is_reversible(entry.action, before_state.as_ref());

    let mut record = AuditRecord {
        id: Uuid::now_v7(),
        tenant_id: context.tenant_id,
        actor_user_id: context.actor_user_id,
        conversation_id: context.conversation_id,
        message_id: context.message_id,
        trace_id: context.trace_id,
        span_id: context.span_id,
        action: entry.action,
        entity_type: entry.entity_type,
        entity_id: entry.entity_id,
        entity_ids: entry.entity_ids,
        before_state,
        after_state,
        changed_fields,
        tool_name: entry.tool_name,
        tool_params,
        tool_result,
        severity,
        checksum: String::new(),
        is_reversible,
        reversed: false,
        reversed_at: None,
        reversed_by: None,
        reversal_id: None,
        created_at: integrity::now(),
    };
    record.checksum = integrity::compute_checksum(&record);

    state.store.insert_audit_record(&record).await?;

    tracing::debug!(
        audit_log_id = %record.id,
        action = %record.action,
        severity = %record.severity,
        "Audit record written for {} {}",
        record.entity_type,
        record.entity_id.as_deref().unwrap_or("-"),
    );

    Ok(record.id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityFailure {
    NotFound,
    ChecksumMismatch,
}

impl std::fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityFailure::NotFound => write!(f, "Audit log not found"),
            IntegrityFailure::ChecksumMismatch => {
                write!(f, "Checksum mismatch: record may have been tampered with")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub audit_log_id: Uuid,
    pub valid: bool,
    pub reason: Option<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn into_result(self) -> Result<(), LedgerError> {
        match self.reason {
            None => Ok(()),
            Some(IntegrityFailure::NotFound) => Err(LedgerError::NotFound(format!(
                "audit log {}",
                self.audit_log_id
            ))),
            Some(IntegrityFailure::ChecksumMismatch) => Err(LedgerError::IntegrityViolation(
                format!("audit log {} failed checksum verification", self.audit_log_id),
            )),
        }
    }
}

fn report_for(audit_log_id: Uuid, record: Option<&AuditRecord>) -> IntegrityReport {
    let reason = match record {
        None => Some(IntegrityFailure::NotFound),
        Some(record) if !integrity::checksum_matches(record) => {
            Some(IntegrityFailure::ChecksumMismatch)
        }
        Some(_) => None,
    };
    IntegrityReport {
        audit_log_id,
        valid: reason.is_none(),
        reason,
    }
}

pub async fn verify_audit_log_integrity(
    state: &LedgerState,
    tenant_id: Uuid,
    audit_log_id: Uuid,
) -> Result<IntegrityReport, LedgerError> {
    let record = state
        .store
        .find_audit_record(tenant_id, audit_log_id)
        .await?;
    let report = report_for(audit_log_id, record.as_ref());

    if report.reason == Some(IntegrityFailure::ChecksumMismatch) {
        tracing::error!(
            %tenant_id,
            %audit_log_id,
            "Audit record checksum mismatch"
        );
    }

    Ok(report)
}

const SWEEP_BATCH: i64 = 500;

/// Verify every record created in `range`; returns the ids that fail.
pub async fn verify_tenant_integrity(
    state: &LedgerState,
    tenant_id: Uuid,
    range: TimeRange,
) -> Result<Vec<Uuid>, LedgerError> {
    let mut query = AuditQuery::for_tenant(tenant_id);
    query.since = Some(range.start);
    query.until = Some(range.end);
    query.limit = Some(SWEEP_BATCH);

    let mut failed = Vec::new();
    let mut checked = 0usize;
    loop {
        let batch = state.store.query_audit_records(&query).await?;
        let len = batch.len();
        checked += len;
        failed.extend(
            batch
                .iter()
                .filter(|r| !integrity::checksum_matches(r))
                .map(|r| r.id),
        );
        if (len as i64) < SWEEP_BATCH {
            break;
        }
        query.offset += SWEEP_BATCH;
    }

    if failed.is_empty() {
        tracing::info!(%tenant_id, checked, "Audit integrity sweep clean");
    } else {
        tracing::error!(
            %tenant_id,
            checked,
            failed = failed.len(),
            "Audit integrity sweep found tampered records"
        );
    }

    Ok(failed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalRequest {
    pub audit_log_id: Uuid,
    pub reason: String,
    pub reversed_by: Uuid,
    pub method: ReversalMethod,
    pub partial_fields: Option<Vec<String>>,
    /// Set when the reversal was driven by a snapshot revert.
    pub snapshot_id: Option<Uuid>,
}

fn restored_state(before: Option<&Value>, partial_fields: Option<&[String]>) -> Option<Value> {
    let before = before?;
    match (partial_fields, before.as_object()) {
        (Some(fields), Some(map)) => {
            let subset: Map<String, Value> = fields
                .iter()
                .filter_map(|f| map.get(f).map(|v| (f.clone(), v.clone())))
                .collect();
            Some(Value::Object(subset))
        }
        _ => Some(before.clone()),
    }
}

/// Write the durable reversal record for an audit entry and flip its flags.
///
/// Both writes happen in one store transaction, and the flag flip only applies to a record
/// that is still unreversed, so concurrent requests produce exactly one reversal.
pub async fn record_reversal(
    state: &LedgerState,
    tenant_id: Uuid,
    request: ReversalRequest,
) -> Result<Uuid, LedgerError> {
    let record = state
        .store
        .find_audit_record(tenant_id, request.audit_log_id)
        .await?
        .ok_or_else(|| {
            LedgerError::NotFound(format!("Audit log entry {} not found", request.audit_log_id))
        })?;

    if !record.is_reversible {
        return Err(LedgerError::NotReversible(
            "This action is not reversible".to_string(),
        ));
    }
    if record.reversed {
        return Err(LedgerError::AlreadyReverted(
            "This action has already been reversed".to_string(),
        ));
    }

    let reversal = Reversal {
        id: Uuid::now_v7(),
        tenant_id,
        audit_log_id: Some(record.id),
        snapshot_id: request.snapshot_id,
        reversed_by: request.reversed_by,
        reason: request.reason,
        method: request.method,
        restored_state: restored_state(
            record.before_state.as_ref(),
            request.partial_fields.as_deref(),
        ),
        partial_fields: request.partial_fields,
        created_at: integrity::now(),
    };

    if !state.store.reverse_audit_record(&reversal).await? {
        return Err(LedgerError::AlreadyReverted(
            "This action has already been reversed".to_string(),
        ));
    }

    tracing::info!(
        %tenant_id,
        audit_log_id = %record.id,
        reversal_id = %reversal.id,
        method = %reversal.method,
        "Audit action reversed"
    );

    Ok(reversal.id)
}
