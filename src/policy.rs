use std::collections::HashSet;

use crate::config::Config;
use crate::models::{AuditAction, AuditSeverity};

/// Severity rules for audit records.
#[derive(Debug, Clone)]
pub struct AuditPolicy {
    high_value_entities: HashSet<String>,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl AuditPolicy {
    pub fn new<I, S>(high_value_entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_value_entities: high_value_entities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.high_value_entities.iter().cloned())
    }

    pub fn is_high_value(&self, entity_type: &str) -> bool {
        self.high_value_entities.contains(entity_type)
    }

    pub fn severity_for(&self, action: AuditAction, entity_type: &str) -> AuditSeverity {
        match action {
            AuditAction::Delete | AuditAction::PermissionChange => AuditSeverity::Critical,
            AuditAction::BulkOperation
            | AuditAction::ConfigurationChange
            | AuditAction::DataExport => AuditSeverity::High,
            _ if self.is_high_value(entity_type) => AuditSeverity::High,
            AuditAction::Create | AuditAction::Update => AuditSeverity::Medium,
            _ => AuditSeverity::Low,
        }
    }
}

/// Queries never change anything, and nothing can be restored without a before state.
pub fn is_reversible(action: AuditAction, before_state: Option<&serde_json::Value>) -> bool {
    action != AuditAction::Query && before_state.is_some_and(|state| !state.is_null())
}
