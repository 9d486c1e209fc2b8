//! 应用状态

use std::sync::Arc;

use crate::service::StockLedgerService;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<StockLedgerService>,
}

impl AppState {
    pub fn new(ledger: Arc<StockLedgerService>) -> Self {
        Self { ledger }
    }
}
