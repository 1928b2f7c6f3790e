use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::Span;
use crate::state::LedgerState;
use crate::stats::{self, ToolCount};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: Uuid,
    pub span_count: i64,
    /// Spans that ended failed or timed out.
    pub error_count: i64,
    pub running_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub total_cost_cents: f64,
    /// First start to last end (or start, for spans still running).
    pub duration_ms: Option<i64>,
    pub event_count: i64,
    pub models: Vec<String>,
    pub tools: Vec<String>,
}

impl TraceSummary {
    pub fn from_spans(trace_id: Uuid, spans: &[Span], event_count: i64) -> Self {
        let mut summary = TraceSummary {
            trace_id,
            span_count: spans.len() as i64,
            event_count,
            ..Default::default()
        };

        let mut models = BTreeSet::new();
        let mut tools = BTreeSet::new();
        for span in spans {
            if span.status.is_error() {
                summary.error_count += 1;
            }
            if !span.status.is_terminal() {
                summary.running_count += 1;
            }
            summary.input_tokens += i64::from(span.input_tokens);
            summary.output_tokens += i64::from(span.output_tokens);
            summary.total_tokens += i64::from(span.total_tokens);
            summary.total_cost_cents += span.cost_cents;
            if let Some(model) = &span.model {
                models.insert(model.clone());
            }
            if let Some(tool) = &span.tool_name {
                tools.insert(tool.clone());
            }
        }

        let first = spans.iter().map(|s| s.started_at).min();
        let last = spans.iter().map(|s| s.ended_at.unwrap_or(s.started_at)).max();
        if let (Some(first), Some(last)) = (first, last) {
            summary.duration_ms = Some((last - first).num_milliseconds().max(0));
        }

        summary.models = models.into_iter().collect();
        summary.tools = tools.into_iter().collect();
        summary
    }
}

/// Roll-up of every span and event recorded under one trace. An unknown trace summarizes to zeros.
pub async fn get_trace_summary(
    state: &LedgerState,
    tenant_id: Uuid,
    trace_id: Uuid,
) -> Result<TraceSummary, LedgerError> {
    let spans = state.store.list_trace_spans(tenant_id, trace_id).await?;
    let events = state.store.list_trace_events(tenant_id, trace_id).await?;
    Ok(TraceSummary::from_spans(
        trace_id,
        &spans,
        events.len() as i64,
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanNode {
    pub span: Span,
    pub children: Vec<SpanNode>,
    /// This span plus all descendants.
    pub subtree_tokens: i64,
    pub subtree_cost_cents: f64,
    pub subtree_duration_ms: i64,
}

fn build_node(
    span: &Span,
    spans: &[Span],
    children_of: &HashMap<Uuid, Vec<usize>>,
    visited: &mut HashSet<Uuid>,
) -> SpanNode {
    visited.insert(span.id);

    let children: Vec<SpanNode> = children_of
        .get(&span.id)
        .into_iter()
        .flatten()
        .filter_map(|&i| {
            let child = &spans[i];
            (!visited.contains(&child.id)).then(|| build_node(child, spans, children_of, visited))
        })
        .collect();

    SpanNode {
        subtree_tokens: i64::from(span.total_tokens)
            + children.iter().map(|c| c.subtree_tokens).sum::<i64>(),
        subtree_cost_cents: span.cost_cents
            + children.iter().map(|c| c.subtree_cost_cents).sum::<f64>(),
        subtree_duration_ms: span.duration_ms.unwrap_or(0)
            + children.iter().map(|c| c.subtree_duration_ms).sum::<i64>(),
        span: span.clone(),
        children,
    }
}

/// Spans nested under their parents, in start order. Spans whose parent is missing become roots.
pub async fn get_span_tree(
    state: &LedgerState,
    tenant_id: Uuid,
    trace_id: Uuid,
) -> Result<Vec<SpanNode>, LedgerError> {
    let spans = state.store.list_trace_spans(tenant_id, trace_id).await?;
    let ids: HashSet<Uuid> = spans.iter().map(|s| s.id).collect();

    let mut children_of: HashMap<Uuid, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (i, span) in spans.iter().enumerate() {
        match span.parent_span_id {
            Some(parent) if parent != span.id && ids.contains(&parent) => {
                children_of.entry(parent).or_default().push(i);
            }
            _ => roots.push(i),
        }
    }

    let mut visited = HashSet::new();
    Ok(roots
        .into_iter()
        .map(|i| build_node(&spans[i], &spans, &children_of, &mut visited))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub date: NaiveDate,
    pub total_spans: i64,
    pub unique_traces: i64,
    pub total_tokens: i64,
    pub total_cost_cents: f64,
    /// Over spans that have ended.
    pub avg_latency_ms: Option<f64>,
    pub error_count: i64,
    /// Percentage of spans that ended in error.
    pub error_rate: f64,
    pub by_span_type: BTreeMap<String, i64>,
    pub cost_by_model: BTreeMap<String, f64>,
    pub top_tools: Vec<ToolCount>,
}

impl DailyMetrics {
    pub fn from_spans(date: NaiveDate, spans: &[Span]) -> Self {
        let mut by_span_type = BTreeMap::new();
        let mut cost_by_model = BTreeMap::new();
        let mut traces = HashSet::new();
        let mut total_tokens = 0i64;
        let mut total_cost_cents = 0.0;
        let mut error_count = 0i64;
        let mut latency_total = 0i64;
        let mut latency_count = 0i64;

        for span in spans {
            traces.insert(span.trace_id);
            total_tokens += i64::from(span.total_tokens);
            total_cost_cents += span.cost_cents;
            if span.status.is_error() {
                error_count += 1;
            }
            if let Some(duration) = span.duration_ms {
                latency_total += duration;
                latency_count += 1;
            }
            *by_span_type
                .entry(span.span_type.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(model) = &span.model {
                *cost_by_model.entry(model.clone()).or_insert(0.0) += span.cost_cents;
            }
        }

        let total_spans = spans.len() as i64;
        DailyMetrics {
            date,
            total_spans,
            unique_traces: traces.len() as i64,
            total_tokens,
            total_cost_cents,
            avg_latency_ms: (latency_count > 0)
                .then(|| latency_total as f64 / latency_count as f64),
            error_count,
            error_rate: if total_spans > 0 {
                error_count as f64 * 100.0 / total_spans as f64
            } else {
                0.0
            },
            by_span_type,
            cost_by_model,
            top_tools: stats::top_tools(
                spans.iter().filter_map(|s| s.tool_name.as_deref()),
                stats::TOP_TOOLS_LIMIT,
            ),
        }
    }
}

/// Metrics for spans started on `date` (UTC).
pub async fn get_daily_metrics(
    state: &LedgerState,
    tenant_id: Uuid,
    date: NaiveDate,
) -> Result<DailyMetrics, LedgerError> {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    let end = start + Duration::days(1);
    let spans = state.store.list_spans_between(tenant_id, start, end).await?;
    Ok(DailyMetrics::from_spans(date, &spans))
}
