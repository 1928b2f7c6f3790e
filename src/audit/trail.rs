use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{AuditRecord, AuditSeverity};
use crate::state::LedgerState;
use crate::stats::{self, ToolCount};
use crate::store::AuditQuery;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Page {
    fn clamped(self) -> Self {
        Self {
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
            offset: self.offset.max(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrailPage {
    pub entries: Vec<AuditRecord>,
    pub total: i64,
}

async fn paged(state: &LedgerState, mut query: AuditQuery, page: Page) -> Result<AuditTrailPage, LedgerError> {
    let page = page.clamped();
    let total = state.store.count_audit_records(&query).await?;
    query.limit = Some(page.limit);
    query.offset = page.offset;
    let entries = state.store.query_audit_records(&query).await?;
    Ok(AuditTrailPage { entries, total })
}

/// Every action touching one entity, including bulk operations that list it, newest first.
pub async fn get_entity_audit_trail(
    state: &LedgerState,
    tenant_id: Uuid,
    entity_type: &str,
    entity_id: &str,
    page: Page,
) -> Result<AuditTrailPage, LedgerError> {
    let mut query = AuditQuery::for_tenant(tenant_id);
    query.entity_type = Some(entity_type.to_string());
    query.entity_id = Some(entity_id.to_string());
    paged(state, query, page).await
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatTrailOptions {
    pub page: Page,
    /// Empty means every severity.
    pub severity_filter: Vec<AuditSeverity>,
}

pub async fn get_chat_audit_trail(
    state: &LedgerState,
    tenant_id: Uuid,
    conversation_id: Uuid,
    options: ChatTrailOptions,
) -> Result<AuditTrailPage, LedgerError> {
    let mut query = AuditQuery::for_tenant(tenant_id);
    query.conversation_id = Some(conversation_id);
    query.severities = options.severity_filter;
    paged(state, query, options.page).await
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighSeverityOptions {
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
    pub include_reversed: bool,
}

impl Default for HighSeverityOptions {
    fn default() -> Self {
        Self {
            since: None,
            limit: DEFAULT_PAGE_SIZE,
            include_reversed: false,
        }
    }
}

pub async fn get_high_severity_audit_entries(
    state: &LedgerState,
    tenant_id: Uuid,
    options: HighSeverityOptions,
) -> Result<Vec<AuditRecord>, LedgerError> {
    let mut query = AuditQuery::for_tenant(tenant_id);
    query.severities = vec![AuditSeverity::High, AuditSeverity::Critical];
    query.include_reversed = options.include_reversed;
    query.since = options.since;
    query.limit = Some(options.limit.clamp(1, MAX_PAGE_SIZE));
    Ok(state.store.query_audit_records(&query).await?)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total_actions: i64,
    pub by_action: BTreeMap<String, i64>,
    pub by_severity: BTreeMap<String, i64>,
    pub by_entity_type: BTreeMap<String, i64>,
    /// Percentage of records that have been reversed.
    pub reversal_rate: f64,
    pub critical_actions_count: i64,
    pub top_tools: Vec<ToolCount>,
}

impl AuditStatistics {
    pub fn from_records(records: &[AuditRecord]) -> Self {
        let mut stats = AuditStatistics {
            total_actions: records.len() as i64,
            ..Default::default()
        };

        let mut reversed = 0i64;
        for record in records {
            *stats
                .by_action
                .entry(record.action.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_severity
                .entry(record.severity.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_entity_type
                .entry(record.entity_type.clone())
                .or_insert(0) += 1;
            if record.reversed {
                reversed += 1;
            }
            if record.severity == AuditSeverity::Critical {
                stats.critical_actions_count += 1;
            }
        }

        if stats.total_actions > 0 {
            stats.reversal_rate = reversed as f64 * 100.0 / stats.total_actions as f64;
        }
        stats.top_tools = stats::top_tools(
            records.iter().filter_map(|r| r.tool_name.as_deref()),
            stats::TOP_TOOLS_LIMIT,
        );
        stats
    }
}

pub async fn get_audit_statistics(
    state: &LedgerState,
    tenant_id: Uuid,
    range: TimeRange,
) -> Result<AuditStatistics, LedgerError> {
    let mut query = AuditQuery::for_tenant(tenant_id);
    query.since = Some(range.start);
    query.until = Some(range.end);
    let records = state.store.query_audit_records(&query).await?;
    Ok(AuditStatistics::from_records(&records))
}
