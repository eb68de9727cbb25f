use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::fees::FeeBreakdown;
use crate::config::LifecycleConfig;
use crate::error::{AppError, AppResult, IntentError, QuotaError};
use crate::ledger::models::*;
use crate::ledger::quota::{best_match, ensure_can_serve, ReleaseOutcome};
use crate::ledger::store::{CommitOutcome, QuotaAction, SettlementStore, TransitionCommit};
use crate::notifications::NotificationHub;

/// Attempts made to append an annotation when the intent keeps moving
const ANNOTATE_ATTEMPTS: usize = 3;

/// Request to open a new payment intent
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub amount: Decimal,
    pub currency: String,
    pub fee_rate: Option<Decimal>,
    pub user_wallet_address: String,
    pub merchant_info: MerchantInfo,
    /// LP proposed by the user; advisory only
    pub lp_wallet_address: Option<String>,
    /// Propose the cheapest LP able to serve the intent
    pub auto_match_lp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeResolution {
    Settle { tx_hash: Option<String> },
    Fail { reason: String },
}

/// The one place intents change status.
///
/// Every transition is validated against the edge table, committed with an
/// optimistic status/history check together with its quota side effect, and
/// published only after the commit.
pub struct IntentStateMachine {
    store: Arc<dyn SettlementStore>,
    notifier: Arc<NotificationHub>,
    config: LifecycleConfig,
}

impl IntentStateMachine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        notifier: Arc<NotificationHub>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ========== QUERIES ==========

    pub async fn get(&self, id: Uuid) -> AppResult<PaymentIntent> {
        self.store
            .get_intent(id)
            .await?
            .ok_or_else(|| IntentError::NotFound(id).into())
    }

    pub async fn list_for_user(&self, wallet_address: &str) -> AppResult<Vec<PaymentIntent>> {
        self.store.list_user_intents(wallet_address).await
    }

    pub async fn find_by_gateway_order(&self, order_id: &str) -> AppResult<Option<PaymentIntent>> {
        self.store.find_by_gateway_order(order_id).await
    }

    pub async fn find_by_gateway_capture(
        &self,
        capture_id: &str,
    ) -> AppResult<Option<PaymentIntent>> {
        self.store.find_by_gateway_capture(capture_id).await
    }

    pub async fn list_by_status(&self, statuses: &[IntentStatus]) -> AppResult<Vec<PaymentIntent>> {
        self.store.list_by_status(statuses).await
    }

    // ========== CREATION ==========

    pub async fn create_intent(&self, request: NewIntent) -> AppResult<PaymentIntent> {
        if request.currency.trim().is_empty() {
            return Err(AppError::Validation("Currency is required".to_string()));
        }
        if request.merchant_info.payee().trim().is_empty() {
            return Err(AppError::Validation("Merchant payee is required".to_string()));
        }

        let fee_rate = request.fee_rate.unwrap_or(self.config.default_fee_rate);
        let fees = FeeBreakdown::compute(request.amount, fee_rate)?;
        let platform = request.merchant_info.platform();

        let designated_lp_address = match request.lp_wallet_address {
            Some(wallet) => {
                let lp = self
                    .store
                    .get_lp(&wallet)
                    .await?
                    .ok_or_else(|| QuotaError::LpNotFound(wallet.clone()))?;
                if let Err(e) = ensure_can_serve(&lp, platform, request.amount) {
                    warn!("⚠️ Proposed LP {} cannot serve right now: {}", wallet, e);
                }
                Some(wallet)
            }
            None if request.auto_match_lp => {
                let lps = self.store.list_active_lps().await?;
                let matched = best_match(&lps, platform, request.amount, fee_rate)
                    .map(|lp| lp.wallet_address.clone());
                if matched.is_none() {
                    debug!("No LP matched {} {} on {}", request.amount, request.currency, platform);
                }
                matched
            }
            None => None,
        };

        let now = Utc::now();
        let intent = PaymentIntent {
            id: Uuid::new_v4(),
            amount: request.amount,
            currency: request.currency.trim().to_uppercase(),
            fee_rate: fees.fee_rate,
            fee_amount: fees.fee_amount,
            total_amount: fees.total_amount,
            user_wallet_address: request.user_wallet_address,
            lp_wallet_address: None,
            designated_lp_address,
            platform,
            merchant_info: request.merchant_info,
            payment_proof: None,
            processing_details: ProcessingDetails::default(),
            settlement_tx_hash: None,
            blockchain_payment_id: None,
            status: IntentStatus::Created,
            status_history: vec![StatusHistoryEntry::new(
                HistoryEvent::Created { reset: None },
                now,
                "Payment intent created",
            )],
            expires_at: now + self.config.intent_ttl,
            lock_time: None,
            release_time: None,
            withdrawal_time: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_intent(&intent).await?;
        info!(
            "✨ Created payment intent {}: {} {} (fee {}) via {}",
            intent.id, intent.amount, intent.currency, intent.fee_amount, intent.platform
        );
        self.notifier.publish_transition(&intent, None);

        Ok(intent)
    }

    // ========== MAIN PATH ==========

    /// LP takes a task from the pool; locks its quota in the same commit
    pub async fn claim(&self, id: Uuid, lp_wallet_address: &str) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        if intent.status != IntentStatus::Created {
            return Err(if intent.lp_wallet_address.is_some() {
                IntentError::TaskAlreadyClaimed(id).into()
            } else {
                IntentError::InvalidStateTransition {
                    from: intent.status,
                    to: IntentStatus::Claimed,
                }
                .into()
            });
        }

        let lp = self
            .store
            .get_lp(lp_wallet_address)
            .await?
            .ok_or_else(|| QuotaError::LpNotFound(lp_wallet_address.to_string()))?;
        ensure_can_serve(&lp, intent.platform, intent.amount)?;

        let now = Utc::now();
        let claim_ttl = self.config.claim_ttl;
        let wallet = lp_wallet_address.to_string();
        let result = self
            .transition(
                &intent,
                HistoryEvent::Claimed {
                    lp_wallet_address: wallet.clone(),
                },
                format!("Claimed by LP {}", wallet),
                now,
                |next| {
                    next.lp_wallet_address = Some(wallet.clone());
                    next.expires_at = now + claim_ttl;
                    next.lock_time = Some(now);
                },
            )
            .await;

        match result {
            Err(AppError::Intent(IntentError::InvalidStateTransition { .. })) => {
                Err(IntentError::TaskAlreadyClaimed(id).into())
            }
            other => other,
        }
    }

    /// Gateway order opened for a claimed intent
    pub async fn start_processing(
        &self,
        id: Uuid,
        order_id: Option<String>,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        let note = match &order_id {
            Some(order) => format!("Gateway order {} opened", order),
            None => "Payment in progress".to_string(),
        };
        self.transition(
            &intent,
            HistoryEvent::Processing {
                order_id: order_id.clone(),
            },
            note,
            Utc::now(),
            |next| {
                if let Some(order_id) = order_id.clone() {
                    next.payment_proof = Some(PaymentProof::PayPalOrder {
                        order_id,
                        capture_id: None,
                    });
                }
            },
        )
        .await
    }

    /// Merchant was paid: LP receipt or captured gateway order
    pub async fn mark_paid(
        &self,
        id: Uuid,
        actor: &Actor,
        proof: PaymentProof,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        match actor {
            Actor::LiquidityProvider { wallet } => {
                ensure_assigned_lp(&intent, wallet)?;
            }
            Actor::GatewayReconciler => {}
            other => {
                return Err(AppError::Forbidden(format!(
                    "{} cannot mark intent {} as paid",
                    other, id
                )))
            }
        }

        let now = Utc::now();
        let capture = match &proof {
            PaymentProof::PayPalOrder {
                capture_id: Some(capture_id),
                ..
            } => Some(CaptureRecord {
                capture_id: capture_id.clone(),
                event_id: None,
                amount: Some(intent.amount.to_string()),
                completed_at: now,
            }),
            _ => None,
        };

        self.transition(
            &intent,
            HistoryEvent::Paid {
                proof: proof.clone(),
            },
            format!("Marked paid by {}", actor),
            now,
            |next| {
                next.payment_proof = Some(proof.clone());
                if let Some(capture) = capture.clone() {
                    next.processing_details.capture = Some(capture);
                }
            },
        )
        .await
    }

    /// User, gateway or chain confirms that funds moved
    pub async fn confirm(
        &self,
        id: Uuid,
        actor: &Actor,
        proof: ConfirmationProof,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        self.confirm_snapshot(&intent, actor, proof, Utc::now()).await
    }

    pub async fn confirm_snapshot(
        &self,
        intent: &PaymentIntent,
        actor: &Actor,
        proof: ConfirmationProof,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentIntent> {
        match actor {
            Actor::User { wallet } if *wallet == intent.user_wallet_address => {}
            Actor::GatewayReconciler | Actor::ChainReconciler => {}
            other => {
                return Err(AppError::Forbidden(format!(
                    "{} cannot confirm intent {}",
                    other, intent.id
                )))
            }
        }

        let withdrawal_delay = self.config.withdrawal_delay;
        self.transition(
            intent,
            HistoryEvent::Confirmed {
                proof: proof.clone(),
                actor: actor.clone(),
            },
            format!("Confirmed by {}", actor),
            now,
            |next| {
                match &proof {
                    ConfirmationProof::TxHash(hash) => {
                        next.settlement_tx_hash = Some(hash.clone());
                    }
                    ConfirmationProof::CaptureId(capture) => {
                        if let Some(PaymentProof::PayPalOrder { capture_id, .. }) =
                            next.payment_proof.as_mut()
                        {
                            *capture_id = Some(capture.clone());
                        }
                    }
                    ConfirmationProof::ChainObserved => {}
                }
                next.release_time = Some(now);
                next.withdrawal_time = Some(now + withdrawal_delay);
            },
        )
        .await
    }

    /// Funds withdrawn by the LP
    pub async fn settle(
        &self,
        id: Uuid,
        actor: &Actor,
        tx_hash: Option<String>,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        self.settle_snapshot(&intent, actor, tx_hash, Utc::now()).await
    }

    pub async fn settle_snapshot(
        &self,
        intent: &PaymentIntent,
        actor: &Actor,
        tx_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentIntent> {
        match actor {
            Actor::LiquidityProvider { wallet } => ensure_assigned_lp(intent, wallet)?,
            Actor::ChainReconciler | Actor::Operator => {}
            other => {
                return Err(AppError::Forbidden(format!(
                    "{} cannot settle intent {}",
                    other, intent.id
                )))
            }
        }

        let settled = self
            .transition(
                intent,
                HistoryEvent::Settled {
                    tx_hash: tx_hash.clone(),
                    actor: actor.clone(),
                },
                format!("Settled by {}", actor),
                now,
                |next| {
                    if tx_hash.is_some() {
                        next.settlement_tx_hash = tx_hash.clone();
                    }
                },
            )
            .await?;

        if let Some(lp) = &settled.lp_wallet_address {
            if let Err(e) = self.store.record_lp_completion(lp, settled.amount).await {
                error!("❌ Failed to record completion for LP {}: {:?}", lp, e);
            }
        }
        Ok(settled)
    }

    // ========== SIDE EXITS ==========

    /// User cancellation; only before the payment started
    pub async fn cancel(&self, id: Uuid, user_wallet_address: &str) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        if intent.user_wallet_address != user_wallet_address {
            return Err(AppError::Forbidden(format!(
                "Intent {} belongs to another user",
                id
            )));
        }
        if !matches!(intent.status, IntentStatus::Created | IntentStatus::Claimed) {
            return Err(IntentError::NotCancellable(intent.status).into());
        }

        let actor = Actor::User {
            wallet: user_wallet_address.to_string(),
        };
        self.transition(
            &intent,
            HistoryEvent::Cancelled { actor },
            "Cancelled by user",
            Utc::now(),
            |_| {},
        )
        .await
    }

    pub async fn expire(
        &self,
        intent: &PaymentIntent,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentIntent> {
        self.transition(
            intent,
            HistoryEvent::Expired,
            format!("Expired at {}", intent.expires_at.to_rfc3339()),
            now,
            |_| {},
        )
        .await
    }

    pub async fn fail(
        &self,
        id: Uuid,
        reason: impl Into<String>,
        refund: Option<RefundRecord>,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        self.fail_snapshot(&intent, reason, refund, Utc::now()).await
    }

    pub async fn fail_snapshot(
        &self,
        intent: &PaymentIntent,
        reason: impl Into<String>,
        refund: Option<RefundRecord>,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentIntent> {
        let reason = reason.into();
        self.transition(
            intent,
            HistoryEvent::Failed {
                reason: reason.clone(),
            },
            reason.clone(),
            now,
            |next| {
                next.processing_details.failure_reason = Some(reason.clone());
                if refund.is_some() {
                    next.processing_details.refund = refund.clone();
                }
            },
        )
        .await
    }

    pub async fn dispute(
        &self,
        id: Uuid,
        actor: &Actor,
        reason: impl Into<String>,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        self.dispute_snapshot(&intent, actor, reason, Utc::now()).await
    }

    pub async fn dispute_snapshot(
        &self,
        intent: &PaymentIntent,
        actor: &Actor,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentIntent> {
        match actor {
            Actor::User { wallet } if *wallet == intent.user_wallet_address => {}
            Actor::LiquidityProvider { wallet } => ensure_assigned_lp(intent, wallet)?,
            Actor::GatewayReconciler | Actor::ChainReconciler | Actor::Operator => {}
            other => {
                return Err(AppError::Forbidden(format!(
                    "{} cannot dispute intent {}",
                    other, intent.id
                )))
            }
        }

        let reason = reason.into();
        self.transition(
            intent,
            HistoryEvent::Disputed {
                reason: reason.clone(),
            },
            format!("Disputed by {}: {}", actor, reason),
            now,
            |_| {},
        )
        .await
    }

    /// Operator decision on a disputed intent
    pub async fn resolve_dispute(
        &self,
        id: Uuid,
        resolution: DisputeResolution,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        if intent.status != IntentStatus::Disputed {
            let to = match resolution {
                DisputeResolution::Settle { .. } => IntentStatus::Settled,
                DisputeResolution::Fail { .. } => IntentStatus::Failed,
            };
            return Err(IntentError::InvalidStateTransition {
                from: intent.status,
                to,
            }
            .into());
        }

        info!("⚖️ Resolving dispute on intent {}: {:?}", id, resolution);
        match resolution {
            DisputeResolution::Settle { .. } if intent.lp_wallet_address.is_none() => {
                Err(AppError::Validation(format!(
                    "Intent {} was disputed before any LP took it and cannot settle",
                    id
                )))
            }
            DisputeResolution::Settle { tx_hash } => {
                self.settle_snapshot(&intent, &Actor::Operator, tx_hash, Utc::now())
                    .await
            }
            DisputeResolution::Fail { reason } => {
                self.fail_snapshot(&intent, reason, None, Utc::now()).await
            }
        }
    }

    /// Put an intent back in the task pool: releases quota, clears the LP
    pub async fn reset_to_created(
        &self,
        intent: &PaymentIntent,
        reason: ResetReason,
        now: DateTime<Utc>,
    ) -> AppResult<PaymentIntent> {
        self.transition(
            intent,
            HistoryEvent::Created {
                reset: Some(reason),
            },
            format!("Returned to task pool ({:?})", reason),
            now,
            |next| {
                next.lock_time = None;
            },
        )
        .await
    }

    // ========== ANNOTATIONS ==========

    /// Append a same-status history entry
    pub async fn annotate(
        &self,
        id: Uuid,
        annotation: Annotation,
        note: impl Into<String>,
    ) -> AppResult<PaymentIntent> {
        self.annotate_with(id, annotation, note.into(), |_| {}).await
    }

    /// Annotate and apply `update` to the intent in the same commit.
    /// Retried against the latest version if the intent moves concurrently.
    pub async fn annotate_with<F>(
        &self,
        id: Uuid,
        annotation: Annotation,
        note: String,
        update: F,
    ) -> AppResult<PaymentIntent>
    where
        F: Fn(&mut PaymentIntent) + Send + Sync,
    {
        for _ in 0..ANNOTATE_ATTEMPTS {
            let current = self.get(id).await?;
            let now = Utc::now();

            let mut next = current.clone();
            update(&mut next);
            next.status_history.push(StatusHistoryEntry::new(
                HistoryEvent::Annotated {
                    status: current.status,
                    annotation: annotation.clone(),
                },
                now,
                note.clone(),
            ));
            next.updated_at = now;

            let commit = TransitionCommit {
                expected_status: current.status,
                expected_history_len: current.status_history.len(),
                next,
                quota: QuotaAction::None,
            };
            match self.store.commit_transition(commit).await? {
                CommitOutcome::Committed { intent, .. } => {
                    debug!("📎 Annotated intent {}: {:?}", id, annotation);
                    return Ok(intent);
                }
                CommitOutcome::Conflict { .. } => {
                    debug!("Intent {} moved while annotating, retrying", id);
                }
            }
        }

        Err(AppError::Internal(format!(
            "Intent {} kept changing while annotating",
            id
        )))
    }

    /// Give the intent the id it is known by on chain. Idempotent.
    pub async fn assign_blockchain_id(
        &self,
        id: Uuid,
        user_wallet_address: &str,
    ) -> AppResult<PaymentIntent> {
        let intent = self.get(id).await?;
        if intent.user_wallet_address != user_wallet_address {
            return Err(AppError::Forbidden(format!(
                "Intent {} belongs to another user",
                id
            )));
        }
        if intent.blockchain_payment_id.is_some() {
            return Ok(intent);
        }

        let blockchain_payment_id = derive_blockchain_id(id);
        let assigned = blockchain_payment_id.clone();
        let intent = self
            .annotate_with(
                id,
                Annotation::BlockchainIdAssigned {
                    blockchain_payment_id: blockchain_payment_id.clone(),
                },
                "Blockchain payment id assigned".to_string(),
                move |next| {
                    if next.blockchain_payment_id.is_none() {
                        next.blockchain_payment_id = Some(assigned.clone());
                    }
                },
            )
            .await?;

        info!(
            "🔗 Intent {} has blockchain id {}",
            id,
            intent.blockchain_payment_id.as_deref().unwrap_or_default()
        );
        Ok(intent)
    }

    // ========== CORE ==========

    async fn transition<F>(
        &self,
        current: &PaymentIntent,
        event: HistoryEvent,
        note: impl Into<String>,
        now: DateTime<Utc>,
        update: F,
    ) -> AppResult<PaymentIntent>
    where
        F: FnOnce(&mut PaymentIntent),
    {
        let from = current.status;
        let to = event.status();
        if !from.can_transition_to(to) {
            return Err(IntentError::InvalidStateTransition { from, to }.into());
        }

        let mut next = current.clone();
        update(&mut next);
        if !to.has_lp_assignment() {
            next.lp_wallet_address = None;
        }
        next.status = to;
        next.status_history
            .push(StatusHistoryEntry::new(event, now, note));
        next.updated_at = now;

        let quota = match (from.holds_quota(), to.holds_quota()) {
            (false, true) => QuotaAction::Lock {
                lp_wallet_address: next.lp_wallet_address.clone().ok_or_else(|| {
                    AppError::Internal(format!("Intent {} entered {} without an LP", next.id, to))
                })?,
                amount: next.amount,
            },
            (true, false) => QuotaAction::Release,
            _ => QuotaAction::None,
        };

        let commit = TransitionCommit {
            expected_status: from,
            expected_history_len: current.status_history.len(),
            next,
            quota,
        };

        match self.store.commit_transition(commit).await? {
            CommitOutcome::Committed { intent, release } => {
                info!("🔄 Intent {}: {} -> {}", intent.id, from, to);
                if let Some(outcome) = release {
                    self.report_release(&intent, &outcome).await;
                }
                self.notifier.publish_transition(&intent, Some(from));
                Ok(intent)
            }
            CommitOutcome::Conflict { current: latest } => {
                let actual = latest.map(|intent| intent.status).unwrap_or(from);
                debug!(
                    "Intent {} changed concurrently (now {}), {} -> {} rejected",
                    current.id, actual, from, to
                );
                Err(IntentError::InvalidStateTransition { from: actual, to }.into())
            }
        }
    }

    async fn report_release(&self, intent: &PaymentIntent, outcome: &ReleaseOutcome) {
        let Some(event_type) = outcome.audit_event() else {
            return;
        };
        warn!(
            "⚠️ Quota release for intent {} was not clean: {:?}",
            intent.id, outcome
        );
        let details = serde_json::json!({ "status": intent.status, "release": outcome });
        if let Err(e) = self
            .store
            .log_audit_event(Some(intent.id), event_type, details)
            .await
        {
            error!("❌ Failed to write audit event for intent {}: {:?}", intent.id, e);
        }
    }
}

fn ensure_assigned_lp(intent: &PaymentIntent, wallet: &str) -> AppResult<()> {
    if intent.lp_wallet_address.as_deref() == Some(wallet) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "LP {} is not assigned to intent {}",
            wallet, intent.id
        )))
    }
}

/// hex(sha256(intent id || random nonce))
fn derive_blockchain_id(id: Uuid) -> String {
    let nonce: [u8; 16] = rand::rng().random();
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::quota::{NewLiquidityProvider, QuotaLedger};
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<InMemoryLedger>,
        machine: Arc<IntentStateMachine>,
        quota: QuotaLedger,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryLedger::new());
        let machine = Arc::new(IntentStateMachine::new(
            store.clone(),
            Arc::new(NotificationHub::new()),
            LifecycleConfig::default(),
        ));
        let quota = QuotaLedger::new(store.clone());
        for wallet in ["0xlp1", "0xlp2"] {
            quota
                .register_lp(NewLiquidityProvider {
                    wallet_address: wallet.to_string(),
                    name: wallet.to_string(),
                    email: None,
                    total_quota: dec!(1000),
                    per_transaction_quota: dec!(500),
                    fee_rate: dec!(0.5),
                    supported_platforms: vec![Platform::PayPal],
                    paypal_email: Some(format!("{}@example.com", wallet)),
                })
                .await
                .unwrap();
        }
        Harness {
            store,
            machine,
            quota,
        }
    }

    fn new_intent(amount: Decimal) -> NewIntent {
        NewIntent {
            amount,
            currency: "usd".to_string(),
            fee_rate: None,
            user_wallet_address: "0xuser".to_string(),
            merchant_info: MerchantInfo::PayPal {
                email: "shop@example.com".to_string(),
            },
            lp_wallet_address: None,
            auto_match_lp: false,
        }
    }

    async fn locked(h: &Harness, wallet: &str) -> Decimal {
        h.quota.get_lp(wallet).await.unwrap().locked_quota
    }

    #[tokio::test]
    async fn test_create_computes_fees() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();

        assert_eq!(intent.status, IntentStatus::Created);
        assert_eq!(intent.currency, "USD");
        assert_eq!(intent.fee_amount, dec!(0.50));
        assert_eq!(intent.total_amount, dec!(100.50));
        assert!(intent.is_consistent());
    }

    #[tokio::test]
    async fn test_auto_match_proposes_lp() {
        let h = harness().await;
        let mut request = new_intent(dec!(100));
        request.auto_match_lp = true;
        let intent = h.machine.create_intent(request).await.unwrap();
        assert!(intent.designated_lp_address.is_some());
        assert!(intent.lp_wallet_address.is_none());
    }

    #[tokio::test]
    async fn test_full_main_path() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();

        let claimed = h.machine.claim(intent.id, "0xlp1").await.unwrap();
        assert_eq!(claimed.lp_wallet_address.as_deref(), Some("0xlp1"));
        assert!(claimed.lock_time.is_some());
        assert_eq!(locked(&h, "0xlp1").await, dec!(100));

        let processing = h
            .machine
            .start_processing(intent.id, Some("ORDER-1".to_string()))
            .await
            .unwrap();
        assert_eq!(processing.gateway_order_id(), Some("ORDER-1"));

        let paid = h
            .machine
            .mark_paid(
                intent.id,
                &Actor::GatewayReconciler,
                PaymentProof::PayPalOrder {
                    order_id: "ORDER-1".to_string(),
                    capture_id: Some("CAP-1".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(paid.gateway_capture_id(), Some("CAP-1"));
        assert_eq!(locked(&h, "0xlp1").await, Decimal::ZERO);

        let user = Actor::User {
            wallet: "0xuser".to_string(),
        };
        let confirmed = h
            .machine
            .confirm(intent.id, &user, ConfirmationProof::TxHash("0xabc".to_string()))
            .await
            .unwrap();
        let release = confirmed.release_time.unwrap();
        assert_eq!(confirmed.withdrawal_time, Some(release + chrono::Duration::hours(24)));
        assert_eq!(confirmed.settlement_tx_hash.as_deref(), Some("0xabc"));

        let lp = Actor::LiquidityProvider {
            wallet: "0xlp1".to_string(),
        };
        let settled = h
            .machine
            .settle(intent.id, &lp, Some("0xwithdraw".to_string()))
            .await
            .unwrap();
        assert_eq!(settled.status, IntentStatus::Settled);
        assert_eq!(settled.status_history.len(), 6);
        assert!(settled.is_consistent());

        let lp = h.quota.get_lp("0xlp1").await.unwrap();
        assert_eq!(lp.completed_count, 1);
        assert_eq!(lp.available_quota(), dec!(1000));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();

        let id = intent.id;
        let mut handles = Vec::new();
        for wallet in ["0xlp1", "0xlp2", "0xlp1", "0xlp2"] {
            let machine = h.machine.clone();
            handles.push(tokio::spawn(async move { machine.claim(id, wallet).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(
                    matches!(e, AppError::Intent(IntentError::TaskAlreadyClaimed(_))),
                    "unexpected error: {:?}",
                    e
                ),
            }
        }
        assert_eq!(winners, 1);

        let total_locked = locked(&h, "0xlp1").await + locked(&h, "0xlp2").await;
        assert_eq!(total_locked, dec!(100));
        assert_eq!(h.store.list_quota_locks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_illegal_edge_changes_nothing() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();
        h.machine.claim(intent.id, "0xlp1").await.unwrap();
        let before = h.machine.get(intent.id).await.unwrap();

        let user = Actor::User {
            wallet: "0xuser".to_string(),
        };
        let err = h
            .machine
            .confirm(intent.id, &user, ConfirmationProof::ChainObserved)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Intent(IntentError::InvalidStateTransition {
                from: IntentStatus::Claimed,
                to: IntentStatus::Confirmed
            })
        ));

        let after = h.machine.get(intent.id).await.unwrap();
        assert_eq!(after.status_history, before.status_history);
        assert_eq!(locked(&h, "0xlp1").await, dec!(100));
    }

    #[tokio::test]
    async fn test_cancel_only_before_payment() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();
        h.machine.claim(intent.id, "0xlp1").await.unwrap();

        assert!(matches!(
            h.machine.cancel(intent.id, "0xsomeone").await,
            Err(AppError::Forbidden(_))
        ));

        let cancelled = h.machine.cancel(intent.id, "0xuser").await.unwrap();
        assert_eq!(cancelled.status, IntentStatus::Cancelled);
        assert!(cancelled.lp_wallet_address.is_none());
        assert_eq!(locked(&h, "0xlp1").await, Decimal::ZERO);

        let other = h.machine.create_intent(new_intent(dec!(50))).await.unwrap();
        h.machine.claim(other.id, "0xlp1").await.unwrap();
        h.machine.start_processing(other.id, None).await.unwrap();
        assert!(matches!(
            h.machine.cancel(other.id, "0xuser").await,
            Err(AppError::Intent(IntentError::NotCancellable(IntentStatus::Processing)))
        ));
    }

    #[tokio::test]
    async fn test_claim_rejects_quota_overrun() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(600))).await.unwrap();
        let err = h.machine.claim(intent.id, "0xlp1").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Quota(QuotaError::PerTransactionExceeded { .. })
        ));
        assert_eq!(h.machine.get(intent.id).await.unwrap().status, IntentStatus::Created);
    }

    #[tokio::test]
    async fn test_quota_conserved_across_outcomes() {
        let h = harness().await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();
            h.machine.claim(intent.id, "0xlp1").await.unwrap();
            h.machine.start_processing(intent.id, None).await.unwrap();
            ids.push(intent.id);
        }
        assert_eq!(locked(&h, "0xlp1").await, dec!(400));

        let snapshot = h.machine.get(ids[0]).await.unwrap();
        h.machine
            .reset_to_created(&snapshot, ResetReason::Stalled, Utc::now())
            .await
            .unwrap();
        h.machine.fail(ids[1], "denied", None).await.unwrap();
        let snapshot = h.machine.get(ids[2]).await.unwrap();
        h.machine.expire(&snapshot, Utc::now()).await.unwrap();

        let lp = h.quota.get_lp("0xlp1").await.unwrap();
        assert_eq!(lp.locked_quota, dec!(100));
        assert_eq!(lp.locked_quota + lp.available_quota(), lp.total_quota);

        let reset = h.machine.get(ids[0]).await.unwrap();
        assert!(reset.lp_wallet_address.is_none());
        assert!(reset.is_consistent());
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rejected() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();
        h.machine.claim(intent.id, "0xlp1").await.unwrap();
        let stale = h.machine.start_processing(intent.id, None).await.unwrap();

        h.machine
            .annotate(
                intent.id,
                Annotation::GatewayObserved {
                    order_status: "APPROVED".to_string(),
                },
                "observed",
            )
            .await
            .unwrap();

        let err = h
            .machine
            .reset_to_created(&stale, ResetReason::Stalled, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Intent(IntentError::InvalidStateTransition { .. })));
        assert_eq!(
            h.machine.get(intent.id).await.unwrap().status,
            IntentStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_dispute_resolution() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();
        h.machine.claim(intent.id, "0xlp1").await.unwrap();
        h.machine.start_processing(intent.id, None).await.unwrap();

        let disputed = h
            .machine
            .dispute(intent.id, &Actor::GatewayReconciler, "reversed")
            .await
            .unwrap();
        assert_eq!(disputed.status, IntentStatus::Disputed);
        assert_eq!(disputed.lp_wallet_address.as_deref(), Some("0xlp1"));
        assert_eq!(locked(&h, "0xlp1").await, Decimal::ZERO);

        let resolved = h
            .machine
            .resolve_dispute(
                intent.id,
                DisputeResolution::Fail {
                    reason: "chargeback upheld".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, IntentStatus::Failed);
        assert!(resolved.lp_wallet_address.is_none());
    }

    #[tokio::test]
    async fn test_dispute_of_claimed_intent_releases_quota() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();
        h.machine.claim(intent.id, "0xlp1").await.unwrap();
        assert_eq!(locked(&h, "0xlp1").await, dec!(100));

        let disputed = h
            .machine
            .dispute(
                intent.id,
                &Actor::LiquidityProvider {
                    wallet: "0xlp1".to_string(),
                },
                "merchant details look wrong",
            )
            .await
            .unwrap();
        assert_eq!(disputed.status, IntentStatus::Disputed);
        assert!(disputed.is_consistent());
        assert_eq!(locked(&h, "0xlp1").await, Decimal::ZERO);
        assert!(h.store.list_quota_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispute_of_unclaimed_intent() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();

        let disputed = h
            .machine
            .dispute(
                intent.id,
                &Actor::User {
                    wallet: "0xuser".to_string(),
                },
                "wrong merchant",
            )
            .await
            .unwrap();
        assert_eq!(disputed.status, IntentStatus::Disputed);
        assert!(disputed.lp_wallet_address.is_none());
        assert!(disputed.is_consistent());

        let err = h
            .machine
            .claim(intent.id, "0xlp1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Intent(IntentError::InvalidStateTransition { .. })));

        let err = h
            .machine
            .resolve_dispute(
                intent.id,
                DisputeResolution::Settle {
                    tx_hash: Some("0xsettle".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let failed = h
            .machine
            .resolve_dispute(
                intent.id,
                DisputeResolution::Fail {
                    reason: "user withdrew".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.status, IntentStatus::Failed);
    }

    #[tokio::test]
    async fn test_blockchain_id_is_stable() {
        let h = harness().await;
        let intent = h.machine.create_intent(new_intent(dec!(100))).await.unwrap();

        let first = h.machine.assign_blockchain_id(intent.id, "0xuser").await.unwrap();
        let id = first.blockchain_payment_id.clone().unwrap();
        assert_eq!(id.len(), 64);

        let second = h.machine.assign_blockchain_id(intent.id, "0xuser").await.unwrap();
        assert_eq!(second.blockchain_payment_id, Some(id));
        assert_eq!(second.status, IntentStatus::Created);
        assert_eq!(second.status_history.len(), 2);
    }
}
