use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use super::quota::ReleaseOutcome;
use crate::error::AppResult;

/// Quota side effect applied in the same atomic unit as a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaAction {
    None,
    Lock { lp_wallet_address: String, amount: Decimal },
    Release,
}

/// A fully computed next version of an intent, written only if the stored
/// row still has `expected_status` and `expected_history_len` entries.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    pub expected_status: IntentStatus,
    pub expected_history_len: usize,
    pub next: PaymentIntent,
    pub quota: QuotaAction,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed {
        intent: PaymentIntent,
        release: Option<ReleaseOutcome>,
    },
    /// The stored intent moved on since it was read; nothing was written
    Conflict { current: Option<PaymentIntent> },
}

/// Durable state of the engine: intents, LPs, quota locks, task pool, audit log
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // ========== INTENTS ==========

    async fn insert_intent(&self, intent: &PaymentIntent) -> AppResult<()>;

    async fn get_intent(&self, id: Uuid) -> AppResult<Option<PaymentIntent>>;

    async fn find_by_gateway_order(&self, order_id: &str) -> AppResult<Option<PaymentIntent>>;

    async fn find_by_gateway_capture(&self, capture_id: &str)
        -> AppResult<Option<PaymentIntent>>;

    async fn list_by_status(&self, statuses: &[IntentStatus]) -> AppResult<Vec<PaymentIntent>>;

    async fn list_user_intents(&self, wallet_address: &str) -> AppResult<Vec<PaymentIntent>>;

    /// Atomically: compare status and history length, write `next`, apply
    /// the quota action and upsert the task pool row.
    async fn commit_transition(&self, commit: TransitionCommit) -> AppResult<CommitOutcome>;

    // ========== LIQUIDITY PROVIDERS ==========

    async fn insert_lp(&self, lp: &LiquidityProvider) -> AppResult<()>;

    async fn get_lp(&self, wallet_address: &str) -> AppResult<Option<LiquidityProvider>>;

    async fn list_active_lps(&self) -> AppResult<Vec<LiquidityProvider>>;

    async fn update_lp_quota(
        &self,
        wallet_address: &str,
        total_quota: Decimal,
        per_transaction_quota: Decimal,
    ) -> AppResult<LiquidityProvider>;

    async fn record_lp_completion(&self, wallet_address: &str, amount: Decimal) -> AppResult<()>;

    // ========== QUOTA LEDGER ==========

    async fn list_quota_locks(&self) -> AppResult<Vec<QuotaLock>>;

    /// Release the lock paired with `intent_id` unless the intent holds quota
    /// at that moment. The status check and the release form one atomic unit;
    /// `None` means the intent still holds its lock and nothing was released.
    async fn release_orphaned_lock(&self, intent_id: Uuid) -> AppResult<Option<ReleaseOutcome>>;

    // ========== TASK POOL ==========

    async fn query_task_pool(&self, filter: &TaskPoolFilter) -> AppResult<Vec<TaskPoolEntry>>;

    async fn rebuild_task_pool(&self) -> AppResult<usize>;

    // ========== AUDIT ==========

    async fn log_audit_event(
        &self,
        intent_id: Option<Uuid>,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> AppResult<()>;

    async fn list_audit_events(&self, intent_id: Uuid) -> AppResult<Vec<AuditLog>>;
}
