//! 奖励与领取仓储层

mod claim_repo;
mod memory;
mod traits;

pub use claim_repo::ClaimRepository;
pub use memory::MemoryClaimStore;
pub use traits::*;
