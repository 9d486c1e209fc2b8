//! 积分台账仓储层

mod memory;
mod points_repo;
mod traits;

pub use memory::MemoryPointLedger;
pub use points_repo::PointsRepository;
pub use traits::*;
