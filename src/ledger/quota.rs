// Quota ledger arithmetic.
//
// Both stores run these rules inside their own atomic section: the
// in-memory store under its mutex, Postgres inside the transition
// transaction with the LP row locked.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::{AuditEventType, LiquidityProvider, Platform, TaskPoolEntry, TaskPoolFilter};
use super::store::SettlementStore;
use crate::error::{AppError, AppResult, QuotaError};

/// Locked/total pair of a single LP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaBalance {
    pub total: Decimal,
    pub locked: Decimal,
}

/// Result of releasing the lock paired with an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released { lp_wallet_address: String, amount: Decimal },
    /// Locked quota was smaller than the recorded lock; floored at zero
    Clamped {
        lp_wallet_address: String,
        requested: Decimal,
        released: Decimal,
    },
    /// No lock recorded for the intent (double release)
    NoLock,
}

impl ReleaseOutcome {
    pub fn audit_event(&self) -> Option<AuditEventType> {
        match self {
            ReleaseOutcome::Released { .. } => None,
            ReleaseOutcome::Clamped { .. } => Some(AuditEventType::ClampedRelease),
            ReleaseOutcome::NoLock => Some(AuditEventType::DoubleRelease),
        }
    }
}

impl QuotaBalance {
    pub fn new(total: Decimal, locked: Decimal) -> Self {
        Self { total, locked }
    }

    pub fn available(&self) -> Decimal {
        self.total - self.locked
    }

    pub fn lock(&mut self, amount: Decimal) -> Result<(), QuotaError> {
        if self.available() < amount {
            return Err(QuotaError::InsufficientQuota {
                required: amount.to_string(),
                available: self.available().to_string(),
            });
        }
        self.locked += amount;
        Ok(())
    }

    /// Returns the amount actually released. Never lets `locked` go negative.
    pub fn release(&mut self, amount: Decimal) -> Decimal {
        let released = amount.min(self.locked).max(Decimal::ZERO);
        self.locked -= released;
        released
    }

    /// Re-set total quota; refuses to drop below what is locked
    pub fn resize(&mut self, total: Decimal) -> Result<(), QuotaError> {
        if total < self.locked {
            return Err(QuotaError::TotalBelowLocked {
                total: total.to_string(),
                locked: self.locked.to_string(),
            });
        }
        self.total = total;
        Ok(())
    }
}

/// Checks an LP must pass before a lock is attempted
pub fn ensure_can_serve(
    lp: &LiquidityProvider,
    platform: Platform,
    amount: Decimal,
) -> Result<(), QuotaError> {
    if !lp.is_active {
        return Err(QuotaError::Inactive(lp.wallet_address.clone()));
    }
    if !lp.supports(platform) {
        return Err(QuotaError::UnsupportedPlatform {
            lp: lp.wallet_address.clone(),
            platform: platform.to_string(),
        });
    }
    if amount > lp.per_transaction_quota {
        return Err(QuotaError::PerTransactionExceeded {
            amount: amount.to_string(),
            limit: lp.per_transaction_quota.to_string(),
        });
    }
    if lp.available_quota() < amount {
        return Err(QuotaError::InsufficientQuota {
            required: amount.to_string(),
            available: lp.available_quota().to_string(),
        });
    }
    Ok(())
}

/// Pick the LP for a new intent: supports the platform, can take the amount,
/// charges no more than the requested fee rate. Cheapest first, then the one
/// with most headroom.
pub fn best_match<'a>(
    lps: &'a [LiquidityProvider],
    platform: Platform,
    amount: Decimal,
    max_fee_rate: Decimal,
) -> Option<&'a LiquidityProvider> {
    lps.iter()
        .filter(|lp| ensure_can_serve(lp, platform, amount).is_ok())
        .filter(|lp| lp.fee_rate <= max_fee_rate)
        .min_by(|a, b| {
            a.fee_rate
                .cmp(&b.fee_rate)
                .then_with(|| b.available_quota().cmp(&a.available_quota()))
        })
}

/// Registration data for a new LP
#[derive(Debug, Clone)]
pub struct NewLiquidityProvider {
    pub wallet_address: String,
    pub name: String,
    pub email: Option<String>,
    pub total_quota: Decimal,
    pub per_transaction_quota: Decimal,
    pub fee_rate: Decimal,
    pub supported_platforms: Vec<Platform>,
    pub paypal_email: Option<String>,
}

/// Operations on quota that run outside an intent transition
pub struct QuotaLedger {
    store: Arc<dyn SettlementStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub async fn register_lp(&self, request: NewLiquidityProvider) -> AppResult<LiquidityProvider> {
        if request.total_quota < Decimal::ZERO || request.per_transaction_quota <= Decimal::ZERO {
            return Err(AppError::Validation(
                "Quotas must be positive".to_string(),
            ));
        }
        if request.supported_platforms.is_empty() {
            return Err(AppError::Validation(
                "At least one supported platform is required".to_string(),
            ));
        }
        if request.supported_platforms.contains(&Platform::PayPal)
            && request.paypal_email.is_none()
        {
            return Err(AppError::Validation(
                "A PayPal email is required to serve PayPal payments".to_string(),
            ));
        }

        let now = Utc::now();
        let lp = LiquidityProvider {
            wallet_address: request.wallet_address,
            name: request.name,
            email: request.email,
            total_quota: request.total_quota,
            locked_quota: Decimal::ZERO,
            per_transaction_quota: request.per_transaction_quota,
            fee_rate: request.fee_rate,
            supported_platforms: request.supported_platforms,
            paypal_email: request.paypal_email,
            is_active: true,
            completed_count: 0,
            completed_volume: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_lp(&lp).await?;

        info!(
            "🏦 Registered LP {} with quota {} ({} per transaction)",
            lp.wallet_address, lp.total_quota, lp.per_transaction_quota
        );
        Ok(lp)
    }

    pub async fn get_lp(&self, wallet_address: &str) -> AppResult<LiquidityProvider> {
        self.store
            .get_lp(wallet_address)
            .await?
            .ok_or_else(|| QuotaError::LpNotFound(wallet_address.to_string()).into())
    }

    /// Administrative quota change; `available` is re-derived and the new
    /// total may not drop below what is currently locked.
    pub async fn update_quota(
        &self,
        wallet_address: &str,
        total_quota: Decimal,
        per_transaction_quota: Option<Decimal>,
    ) -> AppResult<LiquidityProvider> {
        let current = self.get_lp(wallet_address).await?;
        let per_transaction_quota =
            per_transaction_quota.unwrap_or(current.per_transaction_quota);
        if per_transaction_quota <= Decimal::ZERO {
            return Err(AppError::Validation(
                "Per-transaction quota must be positive".to_string(),
            ));
        }

        let updated = self
            .store
            .update_lp_quota(wallet_address, total_quota, per_transaction_quota)
            .await?;

        self.store
            .log_audit_event(
                None,
                AuditEventType::QuotaUpdated,
                serde_json::json!({
                    "lp_wallet_address": wallet_address,
                    "previous_total": current.total_quota.to_string(),
                    "total_quota": updated.total_quota.to_string(),
                    "per_transaction_quota": updated.per_transaction_quota.to_string(),
                }),
            )
            .await?;

        info!(
            "📊 LP {} quota updated: total {} -> {}, available {}",
            wallet_address,
            current.total_quota,
            updated.total_quota,
            updated.available_quota()
        );
        Ok(updated)
    }

    pub async fn task_pool(&self, filter: &TaskPoolFilter) -> AppResult<Vec<TaskPoolEntry>> {
        self.store.query_task_pool(filter).await
    }

    /// Release every lock whose intent no longer holds quota.
    /// Returns how many locks were released.
    pub async fn release_orphaned_locks(&self) -> AppResult<usize> {
        let locks = self.store.list_quota_locks().await?;
        let mut released = 0;

        for lock in locks {
            // Cheap pre-check; the store repeats it atomically with the release
            if let Some(intent) = self.store.get_intent(lock.intent_id).await? {
                if intent.status.holds_quota() {
                    continue;
                }
            }

            let outcome = match self.store.release_orphaned_lock(lock.intent_id).await? {
                // Reclaimed since the check above, or released by a transition
                None | Some(ReleaseOutcome::NoLock) => continue,
                Some(outcome) => outcome,
            };
            warn!(
                "🔓 Released orphaned quota lock for intent {} (LP {}, amount {})",
                lock.intent_id, lock.lp_wallet_address, lock.amount
            );
            self.store
                .log_audit_event(
                    Some(lock.intent_id),
                    AuditEventType::OrphanedLockReleased,
                    serde_json::json!({
                        "lp_wallet_address": lock.lp_wallet_address,
                        "amount": lock.amount.to_string(),
                        "outcome": outcome,
                    }),
                )
                .await?;
            released += 1;
        }

        if released > 0 {
            info!("🧹 Released {} orphaned quota locks", released);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::models::IntentStatus;
    use crate::ledger::store::{QuotaAction, TransitionCommit};
    use rust_decimal_macros::dec;

    fn lp(wallet: &str, fee_rate: Decimal, total: Decimal) -> LiquidityProvider {
        LiquidityProvider {
            wallet_address: wallet.to_string(),
            name: wallet.to_string(),
            email: None,
            total_quota: total,
            locked_quota: Decimal::ZERO,
            per_transaction_quota: dec!(500),
            fee_rate,
            supported_platforms: vec![Platform::PayPal],
            paypal_email: None,
            is_active: true,
            completed_count: 0,
            completed_volume: Decimal::ZERO,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_lock_and_release_conserve_total() {
        let mut balance = QuotaBalance::new(dec!(1000), Decimal::ZERO);
        balance.lock(dec!(100)).unwrap();
        assert_eq!(balance.available(), dec!(900));
        assert_eq!(balance.locked + balance.available(), balance.total);

        assert_eq!(balance.release(dec!(100)), dec!(100));
        assert_eq!(balance.available(), dec!(1000));
    }

    #[test]
    fn test_lock_rejects_over_available() {
        let mut balance = QuotaBalance::new(dec!(100), dec!(50));
        let err = balance.lock(dec!(60)).unwrap_err();
        assert!(matches!(err, QuotaError::InsufficientQuota { .. }));
        assert_eq!(balance.locked, dec!(50));
    }

    #[test]
    fn test_release_is_clamped_at_zero() {
        let mut balance = QuotaBalance::new(dec!(100), dec!(30));
        assert_eq!(balance.release(dec!(50)), dec!(30));
        assert_eq!(balance.locked, Decimal::ZERO);
        assert_eq!(balance.release(dec!(10)), Decimal::ZERO);
    }

    #[test]
    fn test_resize_below_locked_fails() {
        let mut balance = QuotaBalance::new(dec!(100), dec!(80));
        assert!(balance.resize(dec!(50)).is_err());
        balance.resize(dec!(80)).unwrap();
        assert_eq!(balance.available(), Decimal::ZERO);
    }

    #[test]
    fn test_best_match_prefers_cheapest_then_headroom() {
        let lps = vec![
            lp("0xa", dec!(0.5), dec!(1000)),
            lp("0xb", dec!(0.3), dec!(200)),
            lp("0xc", dec!(0.3), dec!(900)),
            lp("0xd", dec!(2.0), dec!(5000)),
        ];
        let picked = best_match(&lps, Platform::PayPal, dec!(100), dec!(1.0)).unwrap();
        assert_eq!(picked.wallet_address, "0xc");

        assert!(best_match(&lps, Platform::WeChat, dec!(100), dec!(1.0)).is_none());
        assert!(best_match(&lps, Platform::PayPal, dec!(600), dec!(5.0)).is_none());
    }

    fn registration(wallet: &str) -> NewLiquidityProvider {
        NewLiquidityProvider {
            wallet_address: wallet.to_string(),
            name: "Test LP".to_string(),
            email: None,
            total_quota: dec!(1000),
            per_transaction_quota: dec!(500),
            fee_rate: dec!(0.5),
            supported_platforms: vec![Platform::PayPal],
            paypal_email: Some("lp@example.com".to_string()),
        }
    }

    #[tokio::test]
    async fn test_register_and_update_quota() {
        let store = Arc::new(InMemoryLedger::new());
        let ledger = QuotaLedger::new(store.clone());

        let lp = ledger.register_lp(registration("0xlp")).await.unwrap();
        assert_eq!(lp.available_quota(), dec!(1000));

        let err = ledger.register_lp(registration("0xlp")).await.unwrap_err();
        assert!(matches!(err, AppError::Quota(QuotaError::AlreadyRegistered(_))));

        let updated = ledger.update_quota("0xlp", dec!(2000), None).await.unwrap();
        assert_eq!(updated.total_quota, dec!(2000));
        assert_eq!(updated.per_transaction_quota, dec!(500));
        assert_eq!(updated.available_quota(), dec!(2000));
    }

    #[tokio::test]
    async fn test_paypal_lp_needs_email() {
        let ledger = QuotaLedger::new(Arc::new(InMemoryLedger::new()));
        let mut request = registration("0xlp");
        request.paypal_email = None;
        assert!(matches!(
            ledger.register_lp(request).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_orphaned_lock_is_released() {
        let store = Arc::new(InMemoryLedger::new());
        let ledger = QuotaLedger::new(store.clone());
        ledger.register_lp(registration("0xlp")).await.unwrap();

        let intent = test_support::created_intent(dec!(100));
        store.insert_intent(&intent).await.unwrap();

        let claimed = test_support::with_status(&intent, IntentStatus::Claimed, Some("0xlp"));
        store
            .commit_transition(TransitionCommit {
                expected_status: IntentStatus::Created,
                expected_history_len: 1,
                next: claimed.clone(),
                quota: QuotaAction::Lock {
                    lp_wallet_address: "0xlp".to_string(),
                    amount: dec!(100),
                },
            })
            .await
            .unwrap();
        assert_eq!(ledger.get_lp("0xlp").await.unwrap().locked_quota, dec!(100));

        // Terminal status written without releasing: the lock is now orphaned
        let expired = test_support::with_status(&claimed, IntentStatus::Expired, None);
        store
            .commit_transition(TransitionCommit {
                expected_status: IntentStatus::Claimed,
                expected_history_len: 2,
                next: expired,
                quota: QuotaAction::None,
            })
            .await
            .unwrap();

        assert_eq!(ledger.release_orphaned_locks().await.unwrap(), 1);
        assert_eq!(ledger.get_lp("0xlp").await.unwrap().locked_quota, Decimal::ZERO);
        assert_eq!(ledger.release_orphaned_locks().await.unwrap(), 0);

        let audit = store.list_audit_events(intent.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event_type, AuditEventType::OrphanedLockReleased);
    }

    #[tokio::test]
    async fn test_sweep_leaves_lock_of_reclaimed_intent() {
        let store = Arc::new(InMemoryLedger::new());
        let ledger = QuotaLedger::new(store.clone());
        ledger.register_lp(registration("0xlp")).await.unwrap();

        let intent = test_support::created_intent(dec!(100));
        store.insert_intent(&intent).await.unwrap();
        let lock_for = |next: crate::ledger::models::PaymentIntent,
                        expected_status: IntentStatus,
                        expected_history_len: usize| {
            TransitionCommit {
                expected_status,
                expected_history_len,
                next,
                quota: QuotaAction::Lock {
                    lp_wallet_address: "0xlp".to_string(),
                    amount: dec!(100),
                },
            }
        };

        let claimed = test_support::with_status(&intent, IntentStatus::Claimed, Some("0xlp"));
        store
            .commit_transition(lock_for(claimed.clone(), IntentStatus::Created, 1))
            .await
            .unwrap();

        // Sweep lists the lock, then the intent is reset and reclaimed
        // before the sweep gets to release it
        let locks = store.list_quota_locks().await.unwrap();
        assert_eq!(locks.len(), 1);

        let reset = test_support::with_status(&claimed, IntentStatus::Created, None);
        store
            .commit_transition(TransitionCommit {
                expected_status: IntentStatus::Claimed,
                expected_history_len: 2,
                next: reset.clone(),
                quota: QuotaAction::Release,
            })
            .await
            .unwrap();
        let seen = store.get_intent(intent.id).await.unwrap().unwrap();
        assert!(!seen.status.holds_quota());

        let reclaimed = test_support::with_status(&reset, IntentStatus::Claimed, Some("0xlp"));
        store
            .commit_transition(lock_for(reclaimed, IntentStatus::Created, 3))
            .await
            .unwrap();

        let outcome = store.release_orphaned_lock(locks[0].intent_id).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(ledger.get_lp("0xlp").await.unwrap().locked_quota, dec!(100));
        assert_eq!(store.list_quota_locks().await.unwrap().len(), 1);
        assert_eq!(ledger.release_orphaned_locks().await.unwrap(), 0);
    }
}

/// Intent builders shared by test modules across the crate
#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use crate::ledger::models::*;

    pub fn created_intent(amount: Decimal) -> PaymentIntent {
        let now = Utc::now();
        PaymentIntent {
            id: Uuid::new_v4(),
            amount,
            currency: "USD".to_string(),
            fee_rate: Decimal::ZERO,
            fee_amount: Decimal::ZERO,
            total_amount: amount,
            user_wallet_address: "0xuser".to_string(),
            lp_wallet_address: None,
            designated_lp_address: None,
            platform: Platform::PayPal,
            merchant_info: MerchantInfo::PayPal {
                email: "shop@example.com".to_string(),
            },
            payment_proof: None,
            processing_details: ProcessingDetails::default(),
            settlement_tx_hash: None,
            blockchain_payment_id: None,
            status: IntentStatus::Created,
            status_history: vec![StatusHistoryEntry::new(
                HistoryEvent::Created { reset: None },
                now,
                "created",
            )],
            expires_at: now + chrono::Duration::minutes(30),
            lock_time: None,
            release_time: None,
            withdrawal_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next version of `intent` in `status`, with one plain history entry appended
    pub fn with_status(
        intent: &PaymentIntent,
        status: IntentStatus,
        lp_wallet_address: Option<&str>,
    ) -> PaymentIntent {
        let mut next = intent.clone();
        let event = match status {
            IntentStatus::Created => HistoryEvent::Created { reset: None },
            IntentStatus::Claimed => HistoryEvent::Claimed {
                lp_wallet_address: lp_wallet_address.unwrap_or_default().to_string(),
            },
            IntentStatus::Processing => HistoryEvent::Processing { order_id: None },
            IntentStatus::Expired => HistoryEvent::Expired,
            other => HistoryEvent::Failed {
                reason: format!("test status {}", other),
            },
        };
        next.status = event.status();
        next.lp_wallet_address = lp_wallet_address.map(str::to_string);
        next.status_history
            .push(StatusHistoryEntry::new(event, Utc::now(), "test"));
        next.updated_at = Utc::now();
        next
    }
}
