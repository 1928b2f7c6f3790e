use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::models::AuditRecord;

/// Current time at the precision Postgres `timestamptz` keeps, so stored values hash the same.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Keys whose values differ between two object states, sorted.
///
/// A key present on only one side counts as changed. When one side is not an
/// object every key of the other side is reported.
pub fn changed_fields(before: Option<&Value>, after: Option<&Value>) -> Vec<String> {
    let before = before.and_then(Value::as_object);
    let after = after.and_then(Value::as_object);

    let keys: BTreeSet<&String> = before
        .iter()
        .flat_map(|m| m.keys())
        .chain(after.iter().flat_map(|m| m.keys()))
        .collect();

    keys.into_iter()
        .filter(|key| {
            let old = before.and_then(|m| m.get(key.as_str()));
            let new = after.and_then(|m| m.get(key.as_str()));
            old != new
        })
        .cloned()
        .collect()
}

/// Serialize with object keys sorted at every depth and no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Check that a state blob survives the canonical form unchanged, returning it as stored.
pub fn canonicalize_state(value: Value) -> Result<Value, String> {
    let text = canonical_json(&value);
    let reparsed: Value =
        serde_json::from_str(&text).map_err(|e| format!("state is not canonical JSON: {e}"))?;
    if reparsed != value {
        return Err("state does not round-trip through canonical JSON".to_string());
    }
    Ok(reparsed)
}

/// The fixed field set covered by an audit record's checksum.
pub fn checksum_payload(record: &AuditRecord) -> Value {
    json!({
        "id": record.id,
        "tenant_id": record.tenant_id,
        "actor_user_id": record.actor_user_id,
        "conversation_id": record.conversation_id,
        "message_id": record.message_id,
        "trace_id": record.trace_id,
        "span_id": record.span_id,
        "action": record.action.as_str(),
        "entity_type": record.entity_type,
        "entity_id": record.entity_id,
        "entity_ids": record.entity_ids,
        "before_state": record.before_state,
        "after_state": record.after_state,
        "changed_fields": record.changed_fields,
        "tool_name": record.tool_name,
        "tool_params": record.tool_params,
        "tool_result": record.tool_result,
        "timestamp": format_timestamp(&record.created_at),
    })
}

pub fn compute_checksum(record: &AuditRecord) -> String {
    let canonical = canonical_json(&checksum_payload(record));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn checksum_matches(record: &AuditRecord) -> bool {
    compute_checksum(record) == record.checksum
}
