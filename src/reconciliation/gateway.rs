use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::signals::{GatewaySignal, SignalKind};
use super::{transition_outcome, ReconcileOutcome};
use crate::adapters::registry::GatewayRegistry;
use crate::adapters::traits::{
    CreateOrderRequest, GatewayCapture, GatewayOrder, GatewayOrderStatus, PaymentGateway,
    WebhookHeaders,
};
use crate::error::{AppError, AppResult, IntentError, ReconcileError};
use crate::intent::IntentStateMachine;
use crate::ledger::models::*;
use crate::ledger::store::SettlementStore;

/// What the client saw happen to the gateway payment window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientReport {
    /// User pressed cancel; reset without asking the gateway
    Cancelled,
    /// Window closed with no explicit result; ask the gateway
    WindowClosed,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatusView {
    pub intent_id: Uuid,
    pub status: IntentStatus,
    pub order_id: Option<String>,
    pub capture_id: Option<String>,
    pub order_status: Option<GatewayOrderStatus>,
    pub gateway_error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl GatewayStatusView {
    fn new(intent: &PaymentIntent, observed_at: DateTime<Utc>) -> Self {
        Self {
            intent_id: intent.id,
            status: intent.status,
            order_id: intent.gateway_order_id().map(str::to_string),
            capture_id: intent.gateway_capture_id().map(str::to_string),
            order_status: None,
            gateway_error: None,
            observed_at,
        }
    }
}

/// Maps gateway events, client reports and polling results onto transitions
pub struct GatewayReconciler {
    machine: Arc<IntentStateMachine>,
    store: Arc<dyn SettlementStore>,
    gateways: Arc<GatewayRegistry>,
    call_timeout: Duration,
}

impl GatewayReconciler {
    pub fn new(
        machine: Arc<IntentStateMachine>,
        store: Arc<dyn SettlementStore>,
        gateways: Arc<GatewayRegistry>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            machine,
            store,
            gateways,
            call_timeout,
        }
    }

    fn gateway(&self, platform: Platform) -> AppResult<Arc<dyn PaymentGateway>> {
        self.gateways.get(platform).ok_or_else(|| {
            AppError::Validation(format!("No payment gateway configured for {}", platform))
        })
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("⏱️ Gateway {} timed out after {:?}", operation, self.call_timeout);
                Err(ReconcileError::ExternalUnavailable(format!(
                    "Gateway {} timed out",
                    operation
                ))
                .into())
            }
        }
    }

    // ========== CLIENT DRIVEN OPERATIONS ==========

    /// Open a gateway order for a claimed intent: `claimed -> processing`
    pub async fn create_order(
        &self,
        intent_id: Uuid,
        wallet_address: &str,
    ) -> AppResult<(PaymentIntent, GatewayOrder)> {
        let intent = self.machine.get(intent_id).await?;
        ensure_participant(&intent, wallet_address)?;
        if intent.status != IntentStatus::Claimed {
            return Err(IntentError::InvalidStateTransition {
                from: intent.status,
                to: IntentStatus::Processing,
            }
            .into());
        }

        let gateway = self.gateway(intent.platform)?;
        let request = CreateOrderRequest {
            intent_id,
            amount: intent.amount,
            currency: intent.currency.clone(),
            payee: intent.merchant_info.payee().to_string(),
        };
        let order = self
            .bounded("order creation", gateway.create_order(&request))
            .await?;

        match self
            .machine
            .start_processing(intent_id, Some(order.order_id.clone()))
            .await
        {
            Ok(intent) => Ok((intent, order)),
            Err(e) => {
                error!(
                    "❌ Gateway order {} opened but intent {} did not move: {}",
                    order.order_id, intent_id, e
                );
                Err(e)
            }
        }
    }

    /// Capture an approved order: `processing -> paid`. Any other order
    /// status fails the intent.
    pub async fn capture(&self, intent_id: Uuid, order_id: Option<&str>) -> AppResult<PaymentIntent> {
        let intent = self.machine.get(intent_id).await?;
        check_order_link(&intent, order_id)?;
        if intent.status != IntentStatus::Processing {
            return Err(IntentError::InvalidStateTransition {
                from: intent.status,
                to: IntentStatus::Paid,
            }
            .into());
        }
        let order_id = intent
            .gateway_order_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation(format!("Intent {} has no gateway order", intent_id)))?;

        let gateway = self.gateway(intent.platform)?;
        let order = self
            .bounded("order lookup", gateway.get_order(&order_id))
            .await?;

        let captured = match order.order_status {
            GatewayOrderStatus::Approved => {
                let capture = self
                    .bounded("capture", gateway.capture_order(&order_id))
                    .await?;
                if !capture.is_completed() {
                    let reason = format!(
                        "Capture of order {} ended as {}",
                        order_id, capture.order_status
                    );
                    return self
                        .machine
                        .fail_snapshot(&intent, reason, None, Utc::now())
                        .await;
                }
                capture
            }
            // Captured elsewhere already
            GatewayOrderStatus::Completed => order,
            other => {
                let reason = format!("Order {} is {}, not approved", order_id, other);
                return self
                    .machine
                    .fail_snapshot(&intent, reason, None, Utc::now())
                    .await;
            }
        };

        info!(
            "💰 Order {} captured for intent {} ({:?})",
            order_id, intent_id, captured.capture_id
        );
        self.machine
            .mark_paid(
                intent_id,
                &Actor::GatewayReconciler,
                PaymentProof::PayPalOrder {
                    order_id,
                    capture_id: captured.capture_id,
                },
            )
            .await
    }

    /// Ask the gateway where the order stands; records the observation
    pub async fn poll(&self, intent_id: Uuid) -> AppResult<GatewayStatusView> {
        let intent = self.machine.get(intent_id).await?;
        let observed_at = Utc::now();
        let Some(order_id) = intent.gateway_order_id().map(str::to_string) else {
            return Ok(GatewayStatusView::new(&intent, observed_at));
        };

        let gateway = self.gateway(intent.platform)?;
        match self.bounded("status poll", gateway.get_order(&order_id)).await {
            Ok(order) => {
                let intent = self.record_observation(&intent, &order.order_status).await?;
                let mut view = GatewayStatusView::new(&intent, observed_at);
                view.order_status = Some(order.order_status);
                if view.capture_id.is_none() {
                    view.capture_id = order.capture_id;
                }
                Ok(view)
            }
            Err(AppError::Reconcile(e)) => {
                let mut view = GatewayStatusView::new(&intent, observed_at);
                view.gateway_error = Some(e.to_string());
                Ok(view)
            }
            Err(e) => Err(e),
        }
    }

    async fn record_observation(
        &self,
        intent: &PaymentIntent,
        status: &GatewayOrderStatus,
    ) -> AppResult<PaymentIntent> {
        let unchanged = intent
            .processing_details
            .gateway_observation
            .as_ref()
            .map(|seen| seen.order_status == status.as_str())
            .unwrap_or(false);
        if unchanged {
            return Ok(intent.clone());
        }

        let observation = GatewayObservation {
            order_status: status.to_string(),
            observed_at: Utc::now(),
        };
        self.machine
            .annotate_with(
                intent.id,
                Annotation::GatewayObserved {
                    order_status: status.to_string(),
                },
                format!("Gateway reports order {}", status),
                move |next| next.processing_details.gateway_observation = Some(observation.clone()),
            )
            .await
    }

    // ========== WEBHOOKS ==========

    /// Reject deliveries the gateway does not vouch for
    pub async fn verify_webhook(
        &self,
        platform: Platform,
        headers: &WebhookHeaders,
        event: &serde_json::Value,
    ) -> AppResult<()> {
        let gateway = self.gateway(platform)?;
        let verified = self
            .bounded("webhook verification", gateway.verify_webhook(headers, event))
            .await?;
        if verified {
            Ok(())
        } else {
            warn!(
                "🚫 {} webhook {:?} failed signature verification",
                platform, headers.transmission_id
            );
            Err(AppError::Unauthorized(format!(
                "{} webhook signature could not be verified",
                platform
            )))
        }
    }

    /// Apply one gateway event. Unlinkable events are acknowledged, not raised.
    pub async fn handle_signal(&self, signal: GatewaySignal) -> AppResult<ReconcileOutcome> {
        let Some(intent) = self.locate(&signal).await? else {
            return self.unlinked(&signal).await;
        };

        info!(
            "📨 {} ({}) for intent {} in {}",
            signal.event_type,
            signal.reference(),
            intent.id,
            intent.status
        );
        let outcome = match signal.kind {
            SignalKind::CaptureCompleted => {
                self.capture_succeeded(intent, signal.capture_id, signal.event_id)
                    .await?
            }
            SignalKind::CaptureDenied => {
                self.fail_on_signal(intent, "Gateway capture denied", None)
                    .await?
            }
            SignalKind::CaptureRefunded => {
                self.fail_on_signal(intent, "Gateway capture refunded", signal.refund)
                    .await?
            }
            SignalKind::CaptureReversed => self.dispute_on_signal(intent).await?,
            SignalKind::OrderCancelled => {
                self.cancel_on_signal(intent, ResetReason::GatewayCancelled)
                    .await?
            }
        };
        debug!("Gateway signal outcome: {:?}", outcome);
        Ok(outcome)
    }

    async fn locate(&self, signal: &GatewaySignal) -> AppResult<Option<PaymentIntent>> {
        if let Some(capture_id) = &signal.capture_id {
            if let Some(intent) = self.machine.find_by_gateway_capture(capture_id).await? {
                return Ok(Some(intent));
            }
        }
        match &signal.order_id {
            Some(order_id) => self.machine.find_by_gateway_order(order_id).await,
            None => Ok(None),
        }
    }

    async fn unlinked(&self, signal: &GatewaySignal) -> AppResult<ReconcileOutcome> {
        let reference = signal.reference();
        warn!("⚠️ {} for {} matches no intent", signal.event_type, reference);

        let details = serde_json::json!({
            "event_type": signal.event_type,
            "event_id": signal.event_id,
            "order_id": signal.order_id,
            "capture_id": signal.capture_id,
        });
        if let Err(e) = self
            .store
            .log_audit_event(None, AuditEventType::UnlinkedGatewaySignal, details)
            .await
        {
            error!("❌ Failed to audit unlinked signal {}: {:?}", reference, e);
        }
        Ok(ReconcileOutcome::Unlinked { reference })
    }

    async fn capture_succeeded(
        &self,
        intent: PaymentIntent,
        capture_id: Option<String>,
        event_id: Option<String>,
    ) -> AppResult<ReconcileOutcome> {
        match intent.status {
            IntentStatus::Processing | IntentStatus::Paid => {
                let Some(order_id) = intent.gateway_order_id().map(str::to_string) else {
                    return Ok(ReconcileOutcome::no_change(
                        &intent,
                        "capture reported for an intent without a gateway order",
                    ));
                };

                // A capture event only counts once the gateway itself reports it
                let gateway = self.gateway(intent.platform)?;
                let order = match self
                    .bounded("capture verification", gateway.get_order(&order_id))
                    .await
                {
                    Ok(order) => order,
                    Err(AppError::Reconcile(e)) => {
                        warn!("⚠️ Capture on order {} unverified: {}", order_id, e);
                        return Ok(ReconcileOutcome::Unknown {
                            intent_id: intent.id,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                };

                let reported = capture_id.as_deref();
                let stored = intent.gateway_capture_id();
                let actual = order.capture_id.as_deref();
                let matches = order.is_completed()
                    && reported.map_or(true, |id| Some(id) == actual)
                    && stored.map_or(true, |id| Some(id) == actual);
                if !matches {
                    return self.unverified_capture(intent, order, capture_id, event_id).await;
                }
                self.apply_capture(intent, order).await
            }
            IntentStatus::Confirmed | IntentStatus::Settled | IntentStatus::Disputed => {
                Ok(ReconcileOutcome::no_change(&intent, "duplicate capture signal"))
            }
            IntentStatus::Created
            | IntentStatus::Claimed
            | IntentStatus::Cancelled
            | IntentStatus::Expired
            | IntentStatus::Failed => self.late_success(intent, capture_id, event_id).await,
        }
    }

    /// `processing -> paid -> confirmed` or `paid -> confirmed` on a capture
    /// the gateway has reported as completed
    async fn apply_capture(
        &self,
        intent: PaymentIntent,
        order: GatewayCapture,
    ) -> AppResult<ReconcileOutcome> {
        let capture_id = match order.capture_id {
            Some(capture_id) if order.order_status == GatewayOrderStatus::Completed => capture_id,
            _ => {
                return Ok(ReconcileOutcome::no_change(
                    &intent,
                    "completed order reported without a capture id",
                ))
            }
        };

        let paid = match intent.status {
            IntentStatus::Processing => {
                let proof = PaymentProof::PayPalOrder {
                    order_id: order.order_id,
                    capture_id: Some(capture_id.clone()),
                };
                match self
                    .machine
                    .mark_paid(intent.id, &Actor::GatewayReconciler, proof)
                    .await
                {
                    Ok(paid) => paid,
                    Err(e) => return transition_outcome(&intent, Err(e)),
                }
            }
            IntentStatus::Paid => intent.clone(),
            other => {
                return Ok(ReconcileOutcome::no_change(
                    &intent,
                    format!("capture not applied in {}", other),
                ))
            }
        };

        let result = self
            .machine
            .confirm_snapshot(
                &paid,
                &Actor::GatewayReconciler,
                ConfirmationProof::CaptureId(capture_id),
                Utc::now(),
            )
            .await;
        transition_outcome(&intent, result)
    }

    /// Capture event the gateway does not back up. Audited, never applied.
    async fn unverified_capture(
        &self,
        intent: PaymentIntent,
        order: GatewayCapture,
        capture_id: Option<String>,
        event_id: Option<String>,
    ) -> AppResult<ReconcileOutcome> {
        let detail = format!(
            "Capture {} not confirmed by the gateway: order {} is {} with capture {}",
            capture_id.as_deref().unwrap_or("(none)"),
            order.order_id,
            order.order_status,
            order.capture_id.as_deref().unwrap_or("(none)")
        );
        warn!("🚨 {} (intent {})", detail, intent.id);

        let details = serde_json::json!({
            "status": intent.status,
            "order_id": order.order_id,
            "order_status": order.order_status,
            "reported_capture_id": capture_id,
            "gateway_capture_id": order.capture_id,
            "event_id": event_id,
        });
        if let Err(e) = self
            .store
            .log_audit_event(Some(intent.id), AuditEventType::UnreconcilableState, details)
            .await
        {
            error!("❌ Failed to audit unverified capture on {}: {:?}", intent.id, e);
        }

        Ok(ReconcileOutcome::no_change(&intent, detail))
    }

    /// Money moved after the intent was reset or closed. Recorded, never
    /// applied.
    async fn late_success(
        &self,
        intent: PaymentIntent,
        capture_id: Option<String>,
        event_id: Option<String>,
    ) -> AppResult<ReconcileOutcome> {
        let already_recorded = intent.status_history.iter().any(|entry| {
            matches!(
                &entry.event,
                HistoryEvent::Annotated {
                    annotation: Annotation::LateGatewaySuccess { capture_id: seen },
                    ..
                } if *seen == capture_id
            )
        });
        if already_recorded {
            return Ok(ReconcileOutcome::no_change(
                &intent,
                "late capture already recorded",
            ));
        }

        let detail = format!(
            "Gateway captured {} after the intent became {}",
            capture_id.as_deref().unwrap_or("the order"),
            intent.status
        );
        warn!("🚨 {} (intent {})", detail, intent.id);

        let anomaly = AnomalyRecord {
            kind: "late_gateway_success".to_string(),
            detail: detail.clone(),
            observed_at: Utc::now(),
        };
        self.machine
            .annotate_with(
                intent.id,
                Annotation::LateGatewaySuccess {
                    capture_id: capture_id.clone(),
                },
                detail.clone(),
                move |next| next.processing_details.anomalies.push(anomaly.clone()),
            )
            .await?;

        let details = serde_json::json!({
            "status": intent.status,
            "order_id": intent.gateway_order_id(),
            "capture_id": capture_id,
            "event_id": event_id,
        });
        if let Err(e) = self
            .store
            .log_audit_event(Some(intent.id), AuditEventType::LateGatewaySuccess, details)
            .await
        {
            error!("❌ Failed to audit late capture on {}: {:?}", intent.id, e);
        }

        Ok(ReconcileOutcome::Anomaly {
            intent_id: intent.id,
            detail,
        })
    }

    async fn fail_on_signal(
        &self,
        intent: PaymentIntent,
        reason: &str,
        refund: Option<RefundRecord>,
    ) -> AppResult<ReconcileOutcome> {
        let in_flight = match refund {
            Some(_) => matches!(
                intent.status,
                IntentStatus::Processing
                    | IntentStatus::Paid
                    | IntentStatus::Confirmed
                    | IntentStatus::Disputed
            ),
            None => matches!(
                intent.status,
                IntentStatus::Processing | IntentStatus::Paid | IntentStatus::Confirmed
            ),
        };
        if !in_flight {
            return Ok(ReconcileOutcome::no_change(
                &intent,
                format!("{} ignored in {}", reason, intent.status),
            ));
        }

        let result = self
            .machine
            .fail_snapshot(&intent, reason, refund, Utc::now())
            .await;
        transition_outcome(&intent, result)
    }

    async fn dispute_on_signal(&self, intent: PaymentIntent) -> AppResult<ReconcileOutcome> {
        if !matches!(
            intent.status,
            IntentStatus::Processing | IntentStatus::Paid | IntentStatus::Confirmed
        ) {
            return Ok(ReconcileOutcome::no_change(
                &intent,
                format!("reversal ignored in {}", intent.status),
            ));
        }

        let result = self
            .machine
            .dispute_snapshot(
                &intent,
                &Actor::GatewayReconciler,
                "Gateway capture reversed",
                Utc::now(),
            )
            .await;
        transition_outcome(&intent, result)
    }

    async fn cancel_on_signal(
        &self,
        intent: PaymentIntent,
        reason: ResetReason,
    ) -> AppResult<ReconcileOutcome> {
        match intent.status {
            IntentStatus::Claimed | IntentStatus::Processing => {
                let result = self
                    .machine
                    .reset_to_created(&intent, reason, Utc::now())
                    .await;
                transition_outcome(&intent, result)
            }
            IntentStatus::Created => Ok(ReconcileOutcome::no_change(
                &intent,
                "already back in the task pool",
            )),
            other => Ok(ReconcileOutcome::no_change(
                &intent,
                format!("cancellation ignored in {}", other),
            )),
        }
    }

    // ========== CLIENT REPORTS ==========

    pub async fn client_report(
        &self,
        intent_id: Uuid,
        wallet_address: &str,
        order_id: Option<&str>,
        report: ClientReport,
    ) -> AppResult<ReconcileOutcome> {
        let intent = self.machine.get(intent_id).await?;
        ensure_participant(&intent, wallet_address)?;
        check_order_link(&intent, order_id)?;

        match report {
            ClientReport::Cancelled => {
                info!("🙅 Client cancelled the gateway payment for intent {}", intent_id);
                self.cancel_on_signal(intent, ResetReason::ClientCancelled)
                    .await
            }
            ClientReport::WindowClosed => self.window_closed(intent).await,
        }
    }

    async fn window_closed(&self, intent: PaymentIntent) -> AppResult<ReconcileOutcome> {
        if intent.status != IntentStatus::Processing {
            return Ok(ReconcileOutcome::no_change(
                &intent,
                "payment window closed outside processing",
            ));
        }
        let Some(order_id) = intent.gateway_order_id().map(str::to_string) else {
            return Ok(ReconcileOutcome::no_change(&intent, "no gateway order to poll"));
        };

        let gateway = self.gateway(intent.platform)?;
        let order = match self.bounded("status poll", gateway.get_order(&order_id)).await {
            Ok(order) => order,
            Err(AppError::Reconcile(e)) => {
                warn!("⚠️ Order {} status unknown: {}", order_id, e);
                return Ok(ReconcileOutcome::Unknown {
                    intent_id: intent.id,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        debug!("Window closed on order {} ({})", order_id, order.order_status);
        match order.order_status.clone() {
            GatewayOrderStatus::Completed => self.apply_capture(intent, order).await,
            GatewayOrderStatus::Voided
            | GatewayOrderStatus::Created
            | GatewayOrderStatus::PayerActionRequired => {
                self.cancel_on_signal(intent, ResetReason::ClientCancelled)
                    .await
            }
            GatewayOrderStatus::Approved => {
                let observation = GatewayObservation {
                    order_status: GatewayOrderStatus::Approved.to_string(),
                    observed_at: Utc::now(),
                };
                self.machine
                    .annotate_with(
                        intent.id,
                        Annotation::CancellationRequested {
                            source: CancellationSource::GatewayPoll,
                        },
                        "Payment window closed on an approved order".to_string(),
                        move |next| {
                            next.processing_details.gateway_observation = Some(observation.clone())
                        },
                    )
                    .await?;
                Ok(ReconcileOutcome::no_change(
                    &intent,
                    "order approved; capture grace started",
                ))
            }
            other => {
                self.record_observation(&intent, &other).await?;
                Ok(ReconcileOutcome::no_change(
                    &intent,
                    format!("order is {}", other),
                ))
            }
        }
    }
}

fn ensure_participant(intent: &PaymentIntent, wallet_address: &str) -> AppResult<()> {
    let is_user = intent.user_wallet_address == wallet_address;
    let is_lp = intent.lp_wallet_address.as_deref() == Some(wallet_address);
    if is_user || is_lp {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "{} is not a participant of intent {}",
            wallet_address, intent.id
        )))
    }
}

/// A caller-supplied order id must agree with the stored one
fn check_order_link(intent: &PaymentIntent, order_id: Option<&str>) -> AppResult<()> {
    match order_id {
        Some(supplied) if intent.gateway_order_id() != Some(supplied) => {
            Err(AppError::Validation(format!(
                "Order {} does not belong to intent {}",
                supplied, intent.id
            )))
        }
        _ => Ok(()),
    }
}
