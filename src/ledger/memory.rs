use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::quota::{ensure_can_serve, QuotaBalance, ReleaseOutcome};
use super::store::{CommitOutcome, QuotaAction, SettlementStore, TransitionCommit};
use crate::error::{AppError, AppResult, IntentError, QuotaError};

#[derive(Default)]
struct LedgerState {
    intents: HashMap<Uuid, PaymentIntent>,
    lps: HashMap<String, LiquidityProvider>,
    locks: HashMap<Uuid, QuotaLock>,
    task_pool: HashMap<Uuid, TaskPoolEntry>,
    audit: Vec<AuditLog>,
}

impl LedgerState {
    fn release_locked(&mut self, intent_id: Uuid) -> ReleaseOutcome {
        let Some(lock) = self.locks.remove(&intent_id) else {
            return ReleaseOutcome::NoLock;
        };

        let Some(lp) = self.lps.get_mut(&lock.lp_wallet_address) else {
            return ReleaseOutcome::Clamped {
                lp_wallet_address: lock.lp_wallet_address,
                requested: lock.amount,
                released: Decimal::ZERO,
            };
        };

        let mut balance = QuotaBalance::new(lp.total_quota, lp.locked_quota);
        let released = balance.release(lock.amount);
        lp.locked_quota = balance.locked;
        lp.updated_at = Utc::now();

        if released < lock.amount {
            ReleaseOutcome::Clamped {
                lp_wallet_address: lock.lp_wallet_address,
                requested: lock.amount,
                released,
            }
        } else {
            ReleaseOutcome::Released {
                lp_wallet_address: lock.lp_wallet_address,
                amount: released,
            }
        }
    }
}

/// Settlement store held in process memory.
///
/// Every operation runs under one mutex, which gives the same atomicity the
/// Postgres repository gets from a transaction. Used by tests and by
/// deployments started without a database.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementStore for InMemoryLedger {
    async fn insert_intent(&self, intent: &PaymentIntent) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.intents.contains_key(&intent.id) {
            return Err(AppError::Validation(format!(
                "Payment intent {} already exists",
                intent.id
            )));
        }
        state
            .task_pool
            .insert(intent.id, TaskPoolEntry::from(intent));
        state.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> AppResult<Option<PaymentIntent>> {
        Ok(self.state.lock().intents.get(&id).cloned())
    }

    async fn find_by_gateway_order(&self, order_id: &str) -> AppResult<Option<PaymentIntent>> {
        let state = self.state.lock();
        Ok(state
            .intents
            .values()
            .find(|intent| intent.gateway_order_id() == Some(order_id))
            .cloned())
    }

    async fn find_by_gateway_capture(
        &self,
        capture_id: &str,
    ) -> AppResult<Option<PaymentIntent>> {
        let state = self.state.lock();
        Ok(state
            .intents
            .values()
            .find(|intent| intent.gateway_capture_id() == Some(capture_id))
            .cloned())
    }

    async fn list_by_status(&self, statuses: &[IntentStatus]) -> AppResult<Vec<PaymentIntent>> {
        let state = self.state.lock();
        let mut intents: Vec<PaymentIntent> = state
            .intents
            .values()
            .filter(|intent| statuses.contains(&intent.status))
            .cloned()
            .collect();
        intents.sort_by_key(|intent| intent.updated_at);
        Ok(intents)
    }

    async fn list_user_intents(&self, wallet_address: &str) -> AppResult<Vec<PaymentIntent>> {
        let state = self.state.lock();
        let mut intents: Vec<PaymentIntent> = state
            .intents
            .values()
            .filter(|intent| intent.user_wallet_address == wallet_address)
            .cloned()
            .collect();
        intents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(intents)
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> AppResult<CommitOutcome> {
        let mut state = self.state.lock();
        let intent_id = commit.next.id;

        let current = state
            .intents
            .get(&intent_id)
            .ok_or(IntentError::NotFound(intent_id))?;

        if current.status != commit.expected_status
            || current.status_history.len() != commit.expected_history_len
        {
            return Ok(CommitOutcome::Conflict {
                current: Some(current.clone()),
            });
        }

        let release = match &commit.quota {
            QuotaAction::None => None,
            QuotaAction::Lock {
                lp_wallet_address,
                amount,
            } => {
                if state.locks.contains_key(&intent_id) {
                    return Err(AppError::Internal(format!(
                        "Intent {} already holds a quota lock",
                        intent_id
                    )));
                }
                let lp = state
                    .lps
                    .get_mut(lp_wallet_address)
                    .ok_or_else(|| QuotaError::LpNotFound(lp_wallet_address.clone()))?;
                ensure_can_serve(lp, commit.next.platform, *amount)?;

                let mut balance = QuotaBalance::new(lp.total_quota, lp.locked_quota);
                balance.lock(*amount)?;
                lp.locked_quota = balance.locked;
                lp.updated_at = Utc::now();

                state.locks.insert(
                    intent_id,
                    QuotaLock {
                        intent_id,
                        lp_wallet_address: lp_wallet_address.clone(),
                        amount: *amount,
                        locked_at: Utc::now(),
                    },
                );
                None
            }
            QuotaAction::Release => Some(state.release_locked(intent_id)),
        };

        state
            .task_pool
            .insert(intent_id, TaskPoolEntry::from(&commit.next));
        state.intents.insert(intent_id, commit.next.clone());

        Ok(CommitOutcome::Committed {
            intent: commit.next,
            release,
        })
    }

    async fn insert_lp(&self, lp: &LiquidityProvider) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.lps.contains_key(&lp.wallet_address) {
            return Err(QuotaError::AlreadyRegistered(lp.wallet_address.clone()).into());
        }
        state.lps.insert(lp.wallet_address.clone(), lp.clone());
        Ok(())
    }

    async fn get_lp(&self, wallet_address: &str) -> AppResult<Option<LiquidityProvider>> {
        Ok(self.state.lock().lps.get(wallet_address).cloned())
    }

    async fn list_active_lps(&self) -> AppResult<Vec<LiquidityProvider>> {
        let state = self.state.lock();
        Ok(state.lps.values().filter(|lp| lp.is_active).cloned().collect())
    }

    async fn update_lp_quota(
        &self,
        wallet_address: &str,
        total_quota: Decimal,
        per_transaction_quota: Decimal,
    ) -> AppResult<LiquidityProvider> {
        let mut state = self.state.lock();
        let lp = state
            .lps
            .get_mut(wallet_address)
            .ok_or_else(|| QuotaError::LpNotFound(wallet_address.to_string()))?;

        let mut balance = QuotaBalance::new(lp.total_quota, lp.locked_quota);
        balance.resize(total_quota)?;
        lp.total_quota = balance.total;
        lp.per_transaction_quota = per_transaction_quota;
        lp.updated_at = Utc::now();
        Ok(lp.clone())
    }

    async fn record_lp_completion(&self, wallet_address: &str, amount: Decimal) -> AppResult<()> {
        let mut state = self.state.lock();
        if let Some(lp) = state.lps.get_mut(wallet_address) {
            lp.completed_count += 1;
            lp.completed_volume += amount;
            lp.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_quota_locks(&self) -> AppResult<Vec<QuotaLock>> {
        let state = self.state.lock();
        let mut locks: Vec<QuotaLock> = state.locks.values().cloned().collect();
        locks.sort_by_key(|lock| lock.locked_at);
        Ok(locks)
    }

    async fn release_orphaned_lock(&self, intent_id: Uuid) -> AppResult<Option<ReleaseOutcome>> {
        let mut state = self.state.lock();
        let holds = state
            .intents
            .get(&intent_id)
            .map_or(false, |intent| intent.status.holds_quota());
        if holds {
            return Ok(None);
        }
        Ok(Some(state.release_locked(intent_id)))
    }

    async fn query_task_pool(&self, filter: &TaskPoolFilter) -> AppResult<Vec<TaskPoolEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<TaskPoolEntry> = state
            .task_pool
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn rebuild_task_pool(&self) -> AppResult<usize> {
        let mut state = self.state.lock();
        let rebuilt: HashMap<Uuid, TaskPoolEntry> = state
            .intents
            .values()
            .map(|intent| (intent.id, TaskPoolEntry::from(intent)))
            .collect();
        let count = rebuilt.len();
        state.task_pool = rebuilt;
        Ok(count)
    }

    async fn log_audit_event(
        &self,
        intent_id: Option<Uuid>,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> AppResult<()> {
        self.state.lock().audit.push(AuditLog {
            id: Uuid::new_v4(),
            intent_id,
            event_type,
            details,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit_events(&self, intent_id: Uuid) -> AppResult<Vec<AuditLog>> {
        let state = self.state.lock();
        Ok(state
            .audit
            .iter()
            .filter(|log| log.intent_id == Some(intent_id))
            .cloned()
            .collect())
    }
}
