//! 应用状态

use std::sync::Arc;

use crate::service::PointService;

#[derive(Clone)]
pub struct AppState {
    pub points: Arc<PointService>,
}

impl AppState {
    pub fn new(points: Arc<PointService>) -> Self {
        Self { points }
    }
}
