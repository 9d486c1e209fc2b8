//! 应用状态

use std::sync::Arc;

use crate::service::ClaimService;

#[derive(Clone)]
pub struct AppState {
    pub claims: Arc<ClaimService>,
}

impl AppState {
    pub fn new(claims: Arc<ClaimService>) -> Self {
        Self { claims }
    }
}
