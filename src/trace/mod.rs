//! Hierarchical telemetry for model calls and tool executions: trace, span, event.

pub mod metrics;
pub mod pricing;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::integrity;
use crate::models::{EventLevel, Span, SpanEvent, SpanStatus, SpanType};
use crate::state::LedgerState;
use crate::store::SpanFinish;

pub use metrics::{
    get_daily_metrics, get_span_tree, get_trace_summary, DailyMetrics, SpanNode, TraceSummary,
};
pub use pricing::{calculate_cost, ModelPrice, PriceTable, DEFAULT_PRICE};

/// Correlation value threaded through every span of one agent run. Never stored on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
}

pub fn create_trace_context(
    tenant_id: Uuid,
    user_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
) -> TraceContext {
    TraceContext {
        trace_id: Uuid::now_v7(),
        tenant_id,
        user_id,
        conversation_id,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSpan {
    pub name: String,
    pub span_type: SpanType,
    pub parent_span_id: Option<Uuid>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tool_name: Option<String>,
    pub input_preview: Option<String>,
    pub attributes: Option<Value>,
}

impl StartSpan {
    pub fn new(name: impl Into<String>, span_type: SpanType) -> Self {
        Self {
            name: name.into(),
            span_type,
            parent_span_id: None,
            model: None,
            provider: None,
            tool_name: None,
            input_preview: None,
            attributes: None,
        }
    }

    pub fn child_of(mut self, parent_span_id: Uuid) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    pub fn model(mut self, model: impl Into<String>, provider: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self.provider = Some(provider.into());
        self
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn input(mut self, preview: impl Into<String>) -> Self {
        self.input_preview = Some(preview.into());
        self
    }
}

/// Cut to at most `max_chars` characters, never splitting one.
fn truncate_preview(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

pub async fn start_span(
    state: &LedgerState,
    context: &TraceContext,
    data: StartSpan,
) -> Result<Uuid, LedgerError> {
    if data.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("span name is required".to_string()));
    }

    if let Some(parent_id) = data.parent_span_id {
        let parent = state.store.find_span(context.tenant_id, parent_id).await?;
        match parent {
            Some(parent) if parent.trace_id == context.trace_id => {}
            Some(_) => {
                return Err(LedgerError::InvalidInput(format!(
                    "parent span {parent_id} belongs to another trace"
                )));
            }
            None => {
                return Err(LedgerError::InvalidInput(format!(
                    "parent span {parent_id} does not exist"
                )));
            }
        }
    }

    let max_chars = state.config.preview_max_chars;
    let span = Span {
        id: Uuid::now_v7(),
        trace_id: context.trace_id,
        tenant_id: context.tenant_id,
        user_id: context.user_id,
        conversation_id: context.conversation_id,
        parent_span_id: data.parent_span_id,
        name: data.name,
        span_type: data.span_type,
        model: data.model,
        provider: data.provider,
        tool_name: data.tool_name,
        input_preview: data.input_preview.map(|p| truncate_preview(p, max_chars)),
        output_preview: None,
        input_tokens: 0,
        output_tokens: 0,
        total_tokens: 0,
        cost_cents: 0.0,
        status: SpanStatus::Running,
        error_message: None,
        error_code: None,
        attributes: data.attributes,
        started_at: integrity::now(),
        ended_at: None,
        duration_ms: None,
    };

    state.store.insert_span(&span).await?;

    tracing::debug!(
        trace_id = %span.trace_id,
        span_id = %span.id,
        span_type = %span.span_type,
        "Span started: {}",
        span.name
    );

    Ok(span.id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanResult {
    pub status: SpanStatus,
    pub input_tokens: i32,
    pub output_tokens: i32,
    /// Computed from the price table when absent.
    pub cost_cents: Option<f64>,
    pub output_preview: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub attributes: Option<Value>,
}

impl SpanResult {
    pub fn new(status: SpanStatus) -> Self {
        Self {
            status,
            input_tokens: 0,
            output_tokens: 0,
            cost_cents: None,
            output_preview: None,
            error_message: None,
            error_code: None,
            attributes: None,
        }
    }

    pub fn completed() -> Self {
        Self::new(SpanStatus::Completed)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut result = Self::new(SpanStatus::Failed);
        result.error_message = Some(message.into());
        result
    }

    pub fn tokens(mut self, input_tokens: i32, output_tokens: i32) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn output(mut self, preview: impl Into<String>) -> Self {
        self.output_preview = Some(preview.into());
        self
    }
}

fn already_ended(span_id: Uuid) -> LedgerError {
    LedgerError::SpanAlreadyEnded(format!("span {span_id} has already ended"))
}

/// Close a running span. A span ends exactly once; later calls get `SpanAlreadyEnded`.
pub async fn end_span(
    state: &LedgerState,
    tenant_id: Uuid,
    span_id: Uuid,
    result: SpanResult,
) -> Result<Span, LedgerError> {
    if !result.status.is_terminal() {
        return Err(LedgerError::InvalidInput(
            "a span cannot end in the running state".to_string(),
        ));
    }
    if result.input_tokens < 0 || result.output_tokens < 0 {
        return Err(LedgerError::InvalidInput(
            "token counts cannot be negative".to_string(),
        ));
    }

    let span = state
        .store
        .find_span(tenant_id, span_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("span {span_id}")))?;
    if span.status.is_terminal() {
        return Err(already_ended(span_id));
    }

    let cost_cents = match (result.cost_cents, span.model.as_deref()) {
        (Some(cost), _) => cost,
        (None, Some(model)) => state.prices.cost_cents(
            model,
            result.input_tokens as u64,
            result.output_tokens as u64,
        ),
        (None, None) => 0.0,
    };

    let ended_at = integrity::now();
    let finish = SpanFinish {
        status: result.status,
        ended_at,
        duration_ms: (ended_at - span.started_at).num_milliseconds().max(0),
        input_tokens: result.input_tokens,
        output_tokens: result.output_tokens,
        total_tokens: result.input_tokens.saturating_add(result.output_tokens),
        cost_cents,
        output_preview: result
            .output_preview
            .map(|p| truncate_preview(p, state.config.preview_max_chars)),
        error_message: result.error_message,
        error_code: result.error_code,
        attributes: result.attributes,
    };

    // Another caller may have ended it between the read and this write.
    let ended = state
        .store
        .finish_span(tenant_id, span_id, &finish)
        .await?
        .ok_or_else(|| already_ended(span_id))?;

    if ended.status.is_error() {
        tracing::warn!(
            trace_id = %ended.trace_id,
            %span_id,
            status = %ended.status,
            "Span ended with error: {}",
            ended.error_message.as_deref().unwrap_or("unknown")
        );
    } else {
        tracing::debug!(
            trace_id = %ended.trace_id,
            %span_id,
            duration_ms = finish.duration_ms,
            cost_cents,
            "Span ended"
        );
    }

    Ok(ended)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSpanEvent {
    pub event_type: String,
    pub name: String,
    pub level: EventLevel,
    pub message: Option<String>,
    pub attributes: Option<Value>,
}

impl NewSpanEvent {
    pub fn new(event_type: impl Into<String>, name: impl Into<String>, level: EventLevel) -> Self {
        Self {
            event_type: event_type.into(),
            name: name.into(),
            level,
            message: None,
            attributes: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Append an annotation. Allowed whatever the span's status.
pub async fn record_span_event(
    state: &LedgerState,
    span_id: Uuid,
    trace_id: Uuid,
    tenant_id: Uuid,
    event: NewSpanEvent,
) -> Result<Uuid, LedgerError> {
    let event = SpanEvent {
        id: Uuid::now_v7(),
        span_id,
        trace_id,
        tenant_id,
        event_type: event.event_type,
        name: event.name,
        level: event.level,
        message: event.message,
        attributes: event.attributes,
        timestamp: integrity::now(),
    };

    state.store.insert_span_event(&event).await?;
    Ok(event.id)
}
