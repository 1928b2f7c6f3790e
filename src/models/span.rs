use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    ModelCall,
    ToolExecution,
    Retrieval,
    Embedding,
    UserInput,
    System,
    AgentStep,
    MemoryOp,
}

text_enum!(SpanType, "span type" {
    ModelCall => "model_call",
    ToolExecution => "tool_execution",
    Retrieval => "retrieval",
    Embedding => "embedding",
    UserInput => "user_input",
    System => "system",
    AgentStep => "agent_step",
    MemoryOp => "memory_op",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

text_enum!(SpanStatus, "span status" {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    Timeout => "timeout",
});

impl SpanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpanStatus::Running)
    }

    /// Failed and timed-out spans count as errors; cancellation does not.
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Failed | SpanStatus::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

text_enum!(EventLevel, "event level" {
    Debug => "debug",
    Info => "info",
    Warn => "warn",
    Error => "error",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Span {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub parent_span_id: Option<Uuid>,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub span_type: SpanType,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tool_name: Option<String>,
    pub input_preview: Option<String>,
    pub output_preview: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub cost_cents: f64,
    #[sqlx(try_from = "String")]
    pub status: SpanStatus,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub attributes: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct SpanEvent {
    pub id: Uuid,
    pub span_id: Uuid,
    pub trace_id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub level: EventLevel,
    pub message: Option<String>,
    pub attributes: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}
