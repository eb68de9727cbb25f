pub mod memory;
pub mod models;
pub mod quota;
pub mod repository;
pub mod store;

pub use memory::InMemoryLedger;
pub use quota::{QuotaLedger, ReleaseOutcome};
pub use repository::LedgerRepository;
pub use store::{CommitOutcome, QuotaAction, SettlementStore, TransitionCommit};
