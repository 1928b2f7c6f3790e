use std::sync::Arc;

use crate::config::Config;
use crate::policy::AuditPolicy;
use crate::store::Store;
use crate::trace::PriceTable;

pub type SharedState = Arc<LedgerState>;

/// Everything an operation needs: the store handle plus the policies built from config.
/// Built once by the caller and passed explicitly; nothing here is global.
pub struct LedgerState {
    pub store: Arc<dyn Store>,
    pub config: Config,
    pub policy: AuditPolicy,
    pub prices: PriceTable,
}

impl LedgerState {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let policy = AuditPolicy::from_config(&config);
        Self {
            store,
            config,
            policy,
            prices: PriceTable::default(),
        }
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }
}
