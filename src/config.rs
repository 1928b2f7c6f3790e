use std::collections::HashMap;

pub const DEFAULT_PREVIEW_MAX_CHARS: usize = 1000;

pub const DEFAULT_HIGH_VALUE_ENTITIES: &[&str] = &[
    "payment",
    "invoice",
    "refund",
    "payout",
    "bank_account",
    "contract",
];

const DEFAULT_ENTITY_TABLES: &[(&str, &str)] = &[
    ("customer", "customers"),
    ("job", "jobs"),
    ("invoice", "invoices"),
    ("estimate", "estimates"),
    ("payment", "payments"),
    ("appointment", "appointments"),
    ("property", "properties"),
    ("contract", "contracts"),
    ("vendor", "vendors"),
    ("equipment", "equipment"),
    ("purchase_order", "purchase_orders"),
    ("service_plan", "service_plans"),
    ("price_book_item", "price_book_items"),
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Always set by `from_env`; `None` only for hand-built in-memory configs.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub log_level: String,
    pub preview_max_chars: usize,
    pub high_value_entities: Vec<String>,
    /// entity_type -> business table used when reverting.
    pub entity_tables: HashMap<String, String>,
    pub entity_tenant_column: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: None,
            max_connections: 10,
            log_level: "info".to_string(),
            preview_max_chars: DEFAULT_PREVIEW_MAX_CHARS,
            high_value_entities: DEFAULT_HIGH_VALUE_ENTITIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            entity_tables: default_entity_tables(),
            entity_tenant_column: "company_id".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = Some(env_required("DATABASE_URL")?);

        let max_connections: u32 = env_or("LEDGER_MAX_CONNECTIONS", "10")
            .parse()
            .map_err(|e| format!("Invalid LEDGER_MAX_CONNECTIONS: {e}"))?;

        let log_level = env_or("LEDGER_LOG_LEVEL", "info");

        let preview_max_chars: usize =
            env_or("LEDGER_PREVIEW_MAX_CHARS", &DEFAULT_PREVIEW_MAX_CHARS.to_string())
                .parse()
                .map_err(|e| format!("Invalid LEDGER_PREVIEW_MAX_CHARS: {e}"))?;

        let high_value_entities = match std::env::var("LEDGER_HIGH_VALUE_ENTITIES") {
            Ok(list) => split_list(&list),
            Err(_) => DEFAULT_HIGH_VALUE_ENTITIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let mut entity_tables = default_entity_tables();
        for entry in split_list(&env_or("LEDGER_ENTITY_TABLES", "")) {
            let (entity_type, table) = entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| {
                    format!("Invalid LEDGER_ENTITY_TABLES entry '{entry}': expected type=table")
                })?;
            entity_tables.insert(entity_type, table);
        }

        let entity_tenant_column = env_or("LEDGER_ENTITY_TENANT_COLUMN", "company_id");

        Ok(Config {
            database_url,
            max_connections,
            log_level,
            preview_max_chars,
            high_value_entities,
            entity_tables,
            entity_tenant_column,
        })
    }
}

pub fn default_entity_tables() -> HashMap<String, String> {
    DEFAULT_ENTITY_TABLES
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("{key} must be set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
