use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::{CachedChainStatus, ChainStatusCache};
use super::{transition_outcome, ReconcileOutcome};
use crate::adapters::traits::{
    EscrowChainClient, EscrowSnapshot, EscrowState, SimulationOutcome, WithdrawReceipt,
};
use crate::config::{ChainConfig, ChainQueryStrategy};
use crate::error::{AppError, AppResult, IntentError, ReconcileError};
use crate::intent::IntentStateMachine;
use crate::ledger::models::*;
use crate::ledger::store::SettlementStore;

/// Classified reason a simulated withdraw reverted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertKind {
    NotFound,
    InvalidStatus,
    NotOwner,
    Disputed,
    /// Confirmed, but the withdrawal delay has not elapsed
    NotDue,
}

impl RevertKind {
    /// What the revert tells us about the escrow when simulating as `caller`
    fn inferred_snapshot(self, caller: &str) -> EscrowSnapshot {
        match self {
            RevertKind::NotFound => EscrowSnapshot {
                state: Some(EscrowState::None),
                ..Default::default()
            },
            RevertKind::Disputed => EscrowSnapshot {
                disputed: Some(true),
                ..Default::default()
            },
            RevertKind::NotDue => EscrowSnapshot {
                state: Some(EscrowState::Confirmed),
                recipient: Some(caller.to_string()),
                disputed: Some(false),
                ..Default::default()
            },
            RevertKind::InvalidStatus | RevertKind::NotOwner => EscrowSnapshot::default(),
        }
    }
}

pub fn classify_revert(reason: &str) -> Option<RevertKind> {
    let reason = reason.to_ascii_lowercase();
    let has = |needle: &str| reason.contains(needle);

    if has("alreadydisputed") || has("already disputed") || has("disputed") {
        Some(RevertKind::Disputed)
    } else if has("notdueyet") || has("not due") {
        Some(RevertKind::NotDue)
    } else if has("invalidstatus") || has("invalid status") {
        Some(RevertKind::InvalidStatus)
    } else if has("unauthorized")
        || has("notpaymentparticipant")
        || has("not payment participant")
        || has("notowner")
    {
        Some(RevertKind::NotOwner)
    } else if has("not found")
        || has("notfound")
        || has("accountnotinitialized")
        || has("account not initialized")
    {
        Some(RevertKind::NotFound)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub intent_id: Uuid,
    pub payment_id: String,
    pub strategy: ChainQueryStrategy,
    pub escrow: EscrowSnapshot,
    pub revert: Option<RevertKind>,
    pub intent_status: IntentStatus,
    pub outcome: Option<ReconcileOutcome>,
    pub cached: bool,
    /// `None` until the chain has been read once for this intent
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ChainStatus {
    /// The chain could not be read; everything else is the last known view
    pub fn is_unknown(&self) -> bool {
        matches!(self.outcome, Some(ReconcileOutcome::Unknown { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalCheck {
    EscrowNotConfirmed,
    NotRecipient,
    NotYetDue,
    Disputed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalAuthorization {
    pub intent_id: Uuid,
    pub allowed: bool,
    pub failed_checks: Vec<WithdrawalCheck>,
    pub eligible_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
}

impl WithdrawalAuthorization {
    fn describe(&self) -> String {
        self.failed_checks
            .iter()
            .map(|check| format!("{:?}", check))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

struct Observation {
    snapshot: EscrowSnapshot,
    revert: Option<RevertKind>,
}

/// Reads escrow state on chain and folds it into the ledger
pub struct ChainReconciler {
    machine: Arc<IntentStateMachine>,
    store: Arc<dyn SettlementStore>,
    client: Arc<dyn EscrowChainClient>,
    strategy: ChainQueryStrategy,
    cache: ChainStatusCache,
    withdrawal_delay: Duration,
    call_timeout: std::time::Duration,
}

impl ChainReconciler {
    pub fn new(
        machine: Arc<IntentStateMachine>,
        store: Arc<dyn SettlementStore>,
        client: Arc<dyn EscrowChainClient>,
        config: &ChainConfig,
    ) -> Self {
        let withdrawal_delay = machine.config().withdrawal_delay;
        info!("⛓️ Chain reconciler using {:?} queries", config.strategy);
        Self {
            machine,
            store,
            client,
            strategy: config.strategy,
            cache: ChainStatusCache::new(config.cache_ttl),
            withdrawal_delay,
            call_timeout: config.request_timeout,
        }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("⏱️ Chain {} timed out after {:?}", operation, self.call_timeout);
                Err(ReconcileError::ExternalUnavailable(format!("Chain {} timed out", operation))
                    .into())
            }
        }
    }

    // ========== OBSERVATION ==========

    async fn observe_as(&self, intent: &PaymentIntent, caller: &str) -> AppResult<Observation> {
        let payment_id = payment_id(intent);
        match self.strategy {
            ChainQueryStrategy::Direct => {
                let snapshot = self
                    .bounded("status query", self.client.escrow_status(&payment_id))
                    .await?;
                Ok(Observation {
                    snapshot,
                    revert: None,
                })
            }
            ChainQueryStrategy::DryRun => self.dry_run_observation(&payment_id, caller).await,
        }
    }

    /// Simulate a withdraw as `caller` and read the escrow off the result
    async fn dry_run_observation(&self, payment_id: &str, caller: &str) -> AppResult<Observation> {
        let outcome = self
            .bounded(
                "withdraw simulation",
                self.client.simulate_withdraw(payment_id, caller),
            )
            .await?;

        match outcome {
            SimulationOutcome::Succeeded => Ok(Observation {
                snapshot: EscrowSnapshot {
                    state: Some(EscrowState::Confirmed),
                    recipient: Some(caller.to_string()),
                    disputed: Some(false),
                    ..Default::default()
                },
                revert: None,
            }),
            SimulationOutcome::Reverted(reason) => match classify_revert(&reason) {
                Some(kind) => {
                    debug!("Simulation for {} reverted: {:?}", payment_id, kind);
                    Ok(Observation {
                        snapshot: kind.inferred_snapshot(caller),
                        revert: Some(kind),
                    })
                }
                None => Err(ReconcileError::Unreconcilable(format!(
                    "Unrecognised revert for {}: {}",
                    payment_id, reason
                ))
                .into()),
            },
        }
    }

    async fn audit_unreconcilable(&self, intent: &PaymentIntent, reason: &str) {
        warn!("🚨 Chain state of intent {} is unreconcilable: {}", intent.id, reason);
        let details = serde_json::json!({
            "status": intent.status,
            "payment_id": payment_id(intent),
            "reason": reason,
        });
        if let Err(e) = self
            .store
            .log_audit_event(Some(intent.id), AuditEventType::UnreconcilableState, details)
            .await
        {
            error!("❌ Failed to audit intent {}: {:?}", intent.id, e);
        }
    }

    // ========== SYNC ==========

    /// Escrow status of the intent, applying whatever the chain shows
    pub async fn sync(&self, intent_id: Uuid) -> AppResult<ChainStatus> {
        let intent = self.machine.get(intent_id).await?;
        let now = Utc::now();

        if let Some(cached) = self.cache.get(intent_id, now).await {
            return Ok(ChainStatus {
                intent_id,
                payment_id: payment_id(&intent),
                strategy: self.strategy,
                escrow: cached.snapshot,
                revert: cached.revert,
                intent_status: intent.status,
                outcome: None,
                cached: true,
                last_synced_at: Some(cached.synced_at),
            });
        }

        let caller = intent
            .lp_wallet_address
            .clone()
            .or_else(|| intent.designated_lp_address.clone())
            .unwrap_or_else(|| intent.user_wallet_address.clone());
        let observation = match self.observe_as(&intent, &caller).await {
            Ok(observation) => observation,
            // Nothing changes; the next sync retries
            Err(AppError::Reconcile(ReconcileError::ExternalUnavailable(reason))) => {
                warn!("⚠️ Escrow status of intent {} unknown: {}", intent_id, reason);
                return Ok(self.unknown_status(&intent, reason).await);
            }
            Err(AppError::Reconcile(ReconcileError::Unreconcilable(reason))) => {
                self.audit_unreconcilable(&intent, &reason).await;
                return Err(ReconcileError::Unreconcilable(reason).into());
            }
            Err(e) => return Err(e),
        };

        let evicted = self.cache.evict_stale(now).await;
        if evicted > 0 {
            debug!("Evicted {} stale chain status entries", evicted);
        }

        self.cache
            .put(
                intent_id,
                CachedChainStatus {
                    snapshot: observation.snapshot.clone(),
                    revert: observation.revert,
                    synced_at: now,
                },
            )
            .await;

        let outcome = self.apply(&intent, &observation.snapshot, now).await?;
        let intent_status = match &outcome {
            ReconcileOutcome::Transitioned { to, .. } => *to,
            _ => intent.status,
        };

        Ok(ChainStatus {
            intent_id,
            payment_id: payment_id(&intent),
            strategy: self.strategy,
            escrow: observation.snapshot,
            revert: observation.revert,
            intent_status,
            outcome: Some(outcome),
            cached: false,
            last_synced_at: Some(now),
        })
    }

    /// Last known escrow view, stale or not, tagged with an unknown outcome
    async fn unknown_status(&self, intent: &PaymentIntent, reason: String) -> ChainStatus {
        let last = self.cache.last_known(intent.id).await;
        ChainStatus {
            intent_id: intent.id,
            payment_id: payment_id(intent),
            strategy: self.strategy,
            escrow: last
                .as_ref()
                .map(|entry| entry.snapshot.clone())
                .unwrap_or_default(),
            revert: last.as_ref().and_then(|entry| entry.revert),
            intent_status: intent.status,
            outcome: Some(ReconcileOutcome::Unknown {
                intent_id: intent.id,
                reason,
            }),
            cached: last.is_some(),
            last_synced_at: last.map(|entry| entry.synced_at),
        }
    }

    async fn apply(
        &self,
        intent: &PaymentIntent,
        snapshot: &EscrowSnapshot,
        now: DateTime<Utc>,
    ) -> AppResult<ReconcileOutcome> {
        let actor = Actor::ChainReconciler;

        let result = if snapshot.disputed == Some(true) {
            if intent.status == IntentStatus::Disputed
                || !intent.status.can_transition_to(IntentStatus::Disputed)
            {
                return Ok(ReconcileOutcome::no_change(
                    intent,
                    "chain dispute flag already reflected",
                ));
            }
            self.machine
                .dispute_snapshot(intent, &actor, "Escrow disputed on chain", now)
                .await
        } else {
            match (snapshot.state, intent.status) {
                (Some(EscrowState::Released), IntentStatus::Confirmed) => {
                    self.machine.settle_snapshot(intent, &actor, None, now).await
                }
                (Some(EscrowState::Confirmed), IntentStatus::Paid | IntentStatus::Processing) => {
                    self.machine
                        .confirm_snapshot(intent, &actor, ConfirmationProof::ChainObserved, now)
                        .await
                }
                (Some(EscrowState::Refunded), status)
                    if status.can_transition_to(IntentStatus::Failed) =>
                {
                    self.machine
                        .fail_snapshot(intent, "Escrow refunded on chain", None, now)
                        .await
                }
                _ => {
                    return Ok(ReconcileOutcome::no_change(
                        intent,
                        "chain agrees with the ledger",
                    ))
                }
            }
        };

        transition_outcome(intent, result)
    }

    // ========== WITHDRAWAL ==========

    /// Independent checks against a fresh chain read
    pub async fn authorize_withdrawal(
        &self,
        intent_id: Uuid,
        caller: &str,
    ) -> AppResult<WithdrawalAuthorization> {
        let intent = self.machine.get(intent_id).await?;
        self.authorize_at(&intent, caller, Utc::now()).await
    }

    pub(crate) async fn authorize_at(
        &self,
        intent: &PaymentIntent,
        caller: &str,
        now: DateTime<Utc>,
    ) -> AppResult<WithdrawalAuthorization> {
        let observation = self.observe_as(intent, caller).await?;
        self.cache
            .put(
                intent.id,
                CachedChainStatus {
                    snapshot: observation.snapshot.clone(),
                    revert: observation.revert,
                    synced_at: now,
                },
            )
            .await;

        let snapshot = &observation.snapshot;
        let confirmed_at = snapshot.confirmed_at.or(intent.release_time);
        let eligible_at = confirmed_at.map(|at| at + self.withdrawal_delay);

        let failed_checks = match self.strategy {
            ChainQueryStrategy::Direct => {
                let mut failed = Vec::new();
                if snapshot.state != Some(EscrowState::Confirmed) {
                    failed.push(WithdrawalCheck::EscrowNotConfirmed);
                }
                if snapshot.recipient.as_deref() != Some(caller) {
                    failed.push(WithdrawalCheck::NotRecipient);
                }
                if !eligible_at.map(|at| now >= at).unwrap_or(false) {
                    failed.push(WithdrawalCheck::NotYetDue);
                }
                if snapshot.disputed == Some(true) {
                    failed.push(WithdrawalCheck::Disputed);
                }
                failed
            }
            // The simulation already ran every check; a revert names the first that failed
            ChainQueryStrategy::DryRun => match observation.revert {
                None => Vec::new(),
                Some(RevertKind::NotFound | RevertKind::InvalidStatus) => {
                    vec![WithdrawalCheck::EscrowNotConfirmed]
                }
                Some(RevertKind::NotOwner) => vec![WithdrawalCheck::NotRecipient],
                Some(RevertKind::NotDue) => vec![WithdrawalCheck::NotYetDue],
                Some(RevertKind::Disputed) => vec![WithdrawalCheck::Disputed],
            },
        };

        Ok(WithdrawalAuthorization {
            intent_id: intent.id,
            allowed: failed_checks.is_empty(),
            failed_checks,
            eligible_at,
            checked_at: now,
        })
    }

    /// Withdraw the escrow to the LP and settle the intent
    pub async fn withdraw(
        &self,
        intent_id: Uuid,
        caller: &str,
    ) -> AppResult<(PaymentIntent, WithdrawReceipt)> {
        let intent = self.machine.get(intent_id).await?;
        ensure_recipient(&intent, caller)?;

        let authorization = self.authorize_at(&intent, caller, Utc::now()).await?;
        if !authorization.allowed {
            info!(
                "🚫 Withdrawal of intent {} denied: {}",
                intent_id,
                authorization.describe()
            );
            return Err(ReconcileError::WithdrawalDenied(authorization.describe()).into());
        }

        let payment_id = payment_id(&intent);
        let receipt = self
            .bounded("withdraw", self.client.withdraw(&payment_id, caller))
            .await?;
        self.cache.invalidate(intent_id).await;
        info!("🏧 Intent {} withdrawn on chain: {}", intent_id, receipt.tx_hash);

        let actor = Actor::LiquidityProvider {
            wallet: caller.to_string(),
        };
        match self
            .machine
            .settle_snapshot(&intent, &actor, Some(receipt.tx_hash.clone()), Utc::now())
            .await
        {
            Ok(settled) => Ok((settled, receipt)),
            Err(e) => {
                error!(
                    "❌ Escrow {} withdrawn ({}) but intent {} not settled: {}",
                    payment_id, receipt.tx_hash, intent_id, e
                );
                Err(e)
            }
        }
    }

    /// Client withdrew on its own; verify the escrow is released and settle
    pub async fn withdraw_complete(
        &self,
        intent_id: Uuid,
        caller: &str,
        tx_hash: &str,
    ) -> AppResult<PaymentIntent> {
        if tx_hash.trim().is_empty() {
            return Err(AppError::Validation("Transaction hash is required".to_string()));
        }
        let intent = self.machine.get(intent_id).await?;
        if intent.status == IntentStatus::Settled
            && intent.settlement_tx_hash.as_deref() == Some(tx_hash)
        {
            return Ok(intent);
        }
        ensure_recipient(&intent, caller)?;

        let observation = self.observe_as(&intent, caller).await?;
        self.cache.invalidate(intent_id).await;
        let released = match self.strategy {
            ChainQueryStrategy::Direct => observation.snapshot.state == Some(EscrowState::Released),
            ChainQueryStrategy::DryRun => observation.revert == Some(RevertKind::InvalidStatus),
        };
        if !released {
            return Err(ReconcileError::Unreconcilable(format!(
                "Escrow for intent {} is not released on chain",
                intent_id
            ))
            .into());
        }

        let actor = Actor::LiquidityProvider {
            wallet: caller.to_string(),
        };
        self.machine
            .settle_snapshot(&intent, &actor, Some(tx_hash.to_string()), Utc::now())
            .await
    }
}

/// Identifier the escrow contract knows the intent by
fn payment_id(intent: &PaymentIntent) -> String {
    intent
        .blockchain_payment_id
        .clone()
        .unwrap_or_else(|| intent.id.to_string())
}

fn ensure_recipient(intent: &PaymentIntent, caller: &str) -> AppResult<()> {
    if intent.lp_wallet_address.as_deref() != Some(caller) {
        return Err(AppError::Forbidden(format!(
            "{} is not the LP of intent {}",
            caller, intent.id
        )));
    }
    if intent.status != IntentStatus::Confirmed {
        return Err(IntentError::InvalidStateTransition {
            from: intent.status,
            to: IntentStatus::Settled,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::ScriptedChain;
    use crate::config::LifecycleConfig;
    use crate::intent::NewIntent;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::quota::{NewLiquidityProvider, QuotaLedger};
    use crate::notifications::NotificationHub;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<InMemoryLedger>,
        machine: Arc<IntentStateMachine>,
        chain: Arc<ScriptedChain>,
        reconciler: ChainReconciler,
    }

    async fn harness(strategy: ChainQueryStrategy, cache_ttl: Duration) -> Harness {
        let store = Arc::new(InMemoryLedger::new());
        let machine = Arc::new(IntentStateMachine::new(
            store.clone(),
            Arc::new(NotificationHub::new()),
            LifecycleConfig::default(),
        ));
        QuotaLedger::new(store.clone())
            .register_lp(NewLiquidityProvider {
                wallet_address: "0xlp".to_string(),
                name: "lp".to_string(),
                email: None,
                total_quota: dec!(1000),
                per_transaction_quota: dec!(1000),
                fee_rate: dec!(0.5),
                supported_platforms: vec![Platform::PayPal],
                paypal_email: Some("lp@example.com".to_string()),
            })
            .await
            .unwrap();

        let chain = Arc::new(ScriptedChain::new());
        let config = ChainConfig {
            rpc_url: None,
            contract_address: "escrow".to_string(),
            strategy,
            cache_ttl,
            request_timeout: std::time::Duration::from_secs(1),
        };
        let reconciler = ChainReconciler::new(machine.clone(), store.clone(), chain.clone(), &config);
        Harness {
            store,
            machine,
            chain,
            reconciler,
        }
    }

    async fn intent_in(h: &Harness, status: IntentStatus) -> PaymentIntent {
        let intent = h
            .machine
            .create_intent(NewIntent {
                amount: dec!(100),
                currency: "USD".to_string(),
                fee_rate: None,
                user_wallet_address: "0xuser".to_string(),
                merchant_info: MerchantInfo::PayPal {
                    email: "shop@example.com".to_string(),
                },
                lp_wallet_address: None,
                auto_match_lp: false,
            })
            .await
            .unwrap();
        h.machine.claim(intent.id, "0xlp").await.unwrap();
        let lp = Actor::LiquidityProvider {
            wallet: "0xlp".to_string(),
        };
        let paid = h
            .machine
            .mark_paid(
                intent.id,
                &lp,
                PaymentProof::Receipt {
                    platform: Platform::PayPal,
                    transaction_id: "TX-1".to_string(),
                },
            )
            .await
            .unwrap();
        if status == IntentStatus::Paid {
            return paid;
        }
        let user = Actor::User {
            wallet: "0xuser".to_string(),
        };
        h.machine
            .confirm(intent.id, &user, ConfirmationProof::TxHash("0xpay".to_string()))
            .await
            .unwrap()
    }

    fn confirmed_escrow(confirmed_at: DateTime<Utc>) -> EscrowSnapshot {
        EscrowSnapshot {
            state: Some(EscrowState::Confirmed),
            user: Some("0xuser".to_string()),
            recipient: Some("0xlp".to_string()),
            amount: Some("100".to_string()),
            confirmed_at: Some(confirmed_at),
            disputed: Some(false),
        }
    }

    #[test]
    fn test_revert_classification() {
        assert_eq!(
            classify_revert("Program log: Error: InvalidStatus"),
            Some(RevertKind::InvalidStatus)
        );
        assert_eq!(classify_revert("Unauthorized"), Some(RevertKind::NotOwner));
        assert_eq!(
            classify_revert("NotPaymentParticipant"),
            Some(RevertKind::NotOwner)
        );
        assert_eq!(classify_revert("AlreadyDisputed"), Some(RevertKind::Disputed));
        assert_eq!(
            classify_revert("AccountNotInitialized"),
            Some(RevertKind::NotFound)
        );
        assert_eq!(classify_revert("NotDueYet"), Some(RevertKind::NotDue));
        assert_eq!(classify_revert("out of gas"), None);
    }

    #[tokio::test]
    async fn test_withdrawal_denied_before_delay_and_granted_after() {
        let h = harness(ChainQueryStrategy::Direct, Duration::minutes(2)).await;
        let intent = intent_in(&h, IntentStatus::Confirmed).await;
        let t0 = Utc::now();
        h.chain
            .set_snapshot(&intent.id.to_string(), confirmed_escrow(t0));

        let early = h
            .reconciler
            .authorize_at(&intent, "0xlp", t0 + Duration::hours(24) - Duration::seconds(1))
            .await
            .unwrap();
        assert!(!early.allowed);
        assert_eq!(early.failed_checks, vec![WithdrawalCheck::NotYetDue]);
        assert_eq!(early.eligible_at, Some(t0 + Duration::hours(24)));

        let due = h
            .reconciler
            .authorize_at(&intent, "0xlp", t0 + Duration::hours(24))
            .await
            .unwrap();
        assert!(due.allowed);
        assert!(due.failed_checks.is_empty());
    }

    #[tokio::test]
    async fn test_authorization_lists_every_failure() {
        let h = harness(ChainQueryStrategy::Direct, Duration::minutes(2)).await;
        let intent = intent_in(&h, IntentStatus::Confirmed).await;
        h.chain.set_snapshot(
            &intent.id.to_string(),
            EscrowSnapshot {
                state: Some(EscrowState::Locked),
                recipient: Some("0xsomeone".to_string()),
                disputed: Some(true),
                ..Default::default()
            },
        );

        let auth = h
            .reconciler
            .authorize_at(&intent, "0xlp", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            auth.failed_checks,
            vec![
                WithdrawalCheck::EscrowNotConfirmed,
                WithdrawalCheck::NotRecipient,
                WithdrawalCheck::NotYetDue,
                WithdrawalCheck::Disputed,
            ]
        );
    }

    #[tokio::test]
    async fn test_withdraw_settles_intent() {
        let h = harness(ChainQueryStrategy::Direct, Duration::minutes(2)).await;
        let intent = intent_in(&h, IntentStatus::Confirmed).await;
        h.chain.set_snapshot(
            &intent.id.to_string(),
            confirmed_escrow(Utc::now() - Duration::hours(25)),
        );

        let (settled, receipt) = h.reconciler.withdraw(intent.id, "0xlp").await.unwrap();
        assert_eq!(settled.status, IntentStatus::Settled);
        assert_eq!(settled.settlement_tx_hash.as_deref(), Some(receipt.tx_hash.as_str()));
        assert_eq!(h.chain.withdrawals(), 1);

        let again = h
            .reconciler
            .withdraw_complete(intent.id, "0xlp", &receipt.tx_hash)
            .await
            .unwrap();
        assert_eq!(again.status_history.len(), settled.status_history.len());
    }

    #[tokio::test]
    async fn test_denied_withdraw_never_reaches_chain() {
        let h = harness(ChainQueryStrategy::Direct, Duration::minutes(2)).await;
        let intent = intent_in(&h, IntentStatus::Confirmed).await;
        h.chain
            .set_snapshot(&intent.id.to_string(), confirmed_escrow(Utc::now()));

        let err = h.reconciler.withdraw(intent.id, "0xlp").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconcile(ReconcileError::WithdrawalDenied(_))
        ));
        assert_eq!(h.chain.withdrawals(), 0);

        let err = h.reconciler.withdraw(intent.id, "0xuser").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_sync_follows_chain() {
        let h = harness(ChainQueryStrategy::Direct, Duration::zero()).await;
        let intent = intent_in(&h, IntentStatus::Paid).await;
        let key = intent.id.to_string();

        h.chain.set_snapshot(&key, confirmed_escrow(Utc::now()));
        let status = h.reconciler.sync(intent.id).await.unwrap();
        assert_eq!(status.intent_status, IntentStatus::Confirmed);
        assert!(!status.cached);

        h.chain.set_snapshot(
            &key,
            EscrowSnapshot {
                state: Some(EscrowState::Released),
                ..Default::default()
            },
        );
        let status = h.reconciler.sync(intent.id).await.unwrap();
        assert_eq!(status.intent_status, IntentStatus::Settled);

        let status = h.reconciler.sync(intent.id).await.unwrap();
        assert!(matches!(status.outcome, Some(ReconcileOutcome::NoChange { .. })));
    }

    #[tokio::test]
    async fn test_sync_is_cached_within_ttl() {
        let h = harness(ChainQueryStrategy::Direct, Duration::minutes(2)).await;
        let intent = intent_in(&h, IntentStatus::Paid).await;

        let first = h.reconciler.sync(intent.id).await.unwrap();
        let second = h.reconciler.sync(intent.id).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.last_synced_at, first.last_synced_at);
        assert_eq!(h.chain.status_queries(), 1);
    }

    #[tokio::test]
    async fn test_sync_during_rpc_outage_is_unknown() {
        let h = harness(ChainQueryStrategy::Direct, Duration::zero()).await;
        let intent = intent_in(&h, IntentStatus::Paid).await;
        h.chain.set_snapshot(
            &intent.id.to_string(),
            EscrowSnapshot {
                state: Some(EscrowState::Locked),
                ..Default::default()
            },
        );
        let synced = h.reconciler.sync(intent.id).await.unwrap();
        assert!(!synced.is_unknown());

        h.chain.set_unavailable(true);
        let status = h.reconciler.sync(intent.id).await.unwrap();
        assert!(status.is_unknown());
        assert!(status.cached);
        assert_eq!(status.last_synced_at, synced.last_synced_at);
        assert_eq!(status.escrow.state, Some(EscrowState::Locked));
        assert_eq!(status.intent_status, IntentStatus::Paid);
        assert_eq!(
            h.machine.get(intent.id).await.unwrap().status,
            IntentStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_sync_against_hanging_rpc_is_unknown() {
        let h = harness(ChainQueryStrategy::DryRun, Duration::zero()).await;
        let intent = intent_in(&h, IntentStatus::Confirmed).await;
        h.chain.set_hanging(true);

        let status = h.reconciler.sync(intent.id).await.unwrap();
        assert!(status.is_unknown());
        assert!(!status.cached);
        assert_eq!(status.last_synced_at, None);
        assert_eq!(
            h.machine.get(intent.id).await.unwrap().status,
            IntentStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_dry_run_infers_status() {
        let h = harness(ChainQueryStrategy::DryRun, Duration::zero()).await;
        let intent = intent_in(&h, IntentStatus::Paid).await;
        let key = intent.id.to_string();

        h.chain
            .set_simulation(&key, SimulationOutcome::Reverted("NotDueYet".to_string()));
        let status = h.reconciler.sync(intent.id).await.unwrap();
        assert_eq!(status.revert, Some(RevertKind::NotDue));
        assert_eq!(status.intent_status, IntentStatus::Confirmed);

        h.chain
            .set_simulation(&key, SimulationOutcome::Reverted("stack overflow".to_string()));
        let err = h.reconciler.sync(intent.id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconcile(ReconcileError::Unreconcilable(_))
        ));
        let audit = h.store.list_audit_events(intent.id).await.unwrap();
        assert!(audit
            .iter()
            .any(|e| e.event_type == AuditEventType::UnreconcilableState));
    }
}
