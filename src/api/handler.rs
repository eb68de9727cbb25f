use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use crate::adapters::traits::WebhookHeaders;
use crate::adapters::GatewayRegistry;
use crate::error::{AppError, AppResult, ReconcileError};
use crate::intent::IntentStateMachine;
use crate::ledger::models::*;
use crate::ledger::quota::QuotaLedger;
use crate::ledger::SettlementStore;
use crate::middleware::ValidatedJson;
use crate::notifications::NotificationHub;
use crate::reconciliation::{
    ChainReconciler, GatewayReconciler, GatewayStatusView, ReconcileOutcome, WebhookEnvelope,
};

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<IntentStateMachine>,
    pub quota: Arc<QuotaLedger>,
    pub gateway: Arc<GatewayReconciler>,
    pub gateways: Arc<GatewayRegistry>,
    /// Unset when no escrow RPC endpoint is configured
    pub chain: Option<Arc<ChainReconciler>>,
    pub hub: Arc<NotificationHub>,
    pub store: Arc<dyn SettlementStore>,
    pub store_kind: &'static str,
}

impl AppState {
    fn chain(&self) -> AppResult<&ChainReconciler> {
        self.chain.as_deref().ok_or_else(|| {
            ReconcileError::ExternalUnavailable("No escrow chain client configured".to_string())
                .into()
        })
    }
}

// ========== INTENTS ==========

/// POST /intents
pub async fn create_intent(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateIntentRequest>,
) -> AppResult<(StatusCode, Json<IntentResponse>)> {
    info!(
        "📝 Create intent: {} {} for {}",
        request.amount, request.currency, request.user_wallet_address
    );
    let intent = state.machine.create_intent(request.into()).await?;
    Ok((StatusCode::CREATED, Json(intent.into())))
}

/// GET /intents/:id
pub async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state.machine.get(id).await?;
    Ok(Json(intent.into()))
}

/// GET /intents/user/:wallet
pub async fn list_user_intents(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> AppResult<Json<Vec<IntentResponse>>> {
    let intents = state.machine.list_for_user(&wallet).await?;
    debug!("Found {} intents for {}", intents.len(), wallet);
    Ok(Json(intents.into_iter().map(Into::into).collect()))
}

/// POST /intents/:id/cancel
pub async fn cancel_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<WalletRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state.machine.cancel(id, &request.wallet_address).await?;
    info!("🛑 Intent {} cancelled by user", id);
    Ok(Json(intent.into()))
}

/// POST /intents/:id/confirm - user confirms the escrow transaction
pub async fn confirm_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ConfirmRequest>,
) -> AppResult<Json<IntentResponse>> {
    let actor = Actor::User {
        wallet: request.wallet_address,
    };
    let intent = state
        .machine
        .confirm(id, &actor, ConfirmationProof::TxHash(request.tx_hash))
        .await?;
    Ok(Json(intent.into()))
}

/// POST /intents/:id/blockchain-id
pub async fn assign_blockchain_id(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<WalletRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state
        .machine
        .assign_blockchain_id(id, &request.wallet_address)
        .await?;
    Ok(Json(intent.into()))
}

/// GET /intents/:id/chain-status?wallet_address=
///
/// With a wallet, the withdrawal checks for that caller are included. They
/// need a fresh chain read, so they are left out while the chain is unknown.
pub async fn get_chain_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ChainStatusQuery>,
) -> AppResult<Json<ChainStatusResponse>> {
    let chain = state.chain()?;
    let status = chain.sync(id).await?;
    let withdrawal = match query.wallet_address.as_deref() {
        Some(wallet) if !wallet.is_empty() && !status.is_unknown() => {
            Some(chain.authorize_withdrawal(id, wallet).await?)
        }
        _ => None,
    };
    Ok(Json(ChainStatusResponse { status, withdrawal }))
}

/// POST /intents/:id/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<WalletRequest>,
) -> AppResult<Json<WithdrawResponse>> {
    info!("🏧 Withdrawal requested for intent {} by {}", id, request.wallet_address);
    let (intent, receipt) = state.chain()?.withdraw(id, &request.wallet_address).await?;
    Ok(Json(WithdrawResponse {
        intent: intent.into(),
        receipt,
    }))
}

/// POST /intents/:id/withdraw-complete
pub async fn withdraw_complete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<WithdrawCompleteRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state
        .chain()?
        .withdraw_complete(id, &request.wallet_address, &request.tx_hash)
        .await?;
    Ok(Json(intent.into()))
}

/// POST /intents/:id/dispute
pub async fn dispute_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<DisputeRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state.machine.get(id).await?;
    let actor = if intent.user_wallet_address == request.wallet_address {
        Actor::User {
            wallet: request.wallet_address,
        }
    } else {
        Actor::LiquidityProvider {
            wallet: request.wallet_address,
        }
    };
    info!("⚠️ Dispute opened on intent {} by {}", id, actor);
    let intent = state
        .machine
        .dispute_snapshot(&intent, &actor, request.reason, chrono::Utc::now())
        .await?;
    Ok(Json(intent.into()))
}

/// POST /admin/intents/:id/resolve-dispute
pub async fn resolve_dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ResolveDisputeRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state
        .machine
        .resolve_dispute(id, request.into_resolution())
        .await?;
    Ok(Json(intent.into()))
}

/// GET /admin/intents/:id/audit
pub async fn get_audit_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<AuditLog>>> {
    // 404 for unknown intents rather than an empty list
    state.machine.get(id).await?;
    let events = state.store.list_audit_events(id).await?;
    Ok(Json(events))
}

// ========== LIQUIDITY PROVIDERS ==========

/// POST /lp/register
pub async fn register_lp(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<RegisterLpRequest>,
) -> AppResult<(StatusCode, Json<LiquidityProviderResponse>)> {
    let lp = state.quota.register_lp(request.into()).await?;
    Ok((StatusCode::CREATED, Json(lp.into())))
}

/// PUT /lp/quota
pub async fn update_quota(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<UpdateQuotaRequest>,
) -> AppResult<Json<LiquidityProviderResponse>> {
    let lp = state
        .quota
        .update_quota(
            &request.wallet_address,
            request.total_quota,
            request.per_transaction_quota,
        )
        .await?;
    Ok(Json(lp.into()))
}

/// GET /lp/:wallet
pub async fn get_lp(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> AppResult<Json<LiquidityProviderResponse>> {
    let lp = state.quota.get_lp(&wallet).await?;
    Ok(Json(lp.into()))
}

/// GET /lp/task-pool?wallet=&platform=&min_amount=&max_amount=
pub async fn get_task_pool(
    State(state): State<AppState>,
    Query(query): Query<TaskPoolQuery>,
) -> AppResult<Json<TaskPoolResponse>> {
    let filter: TaskPoolFilter = query.into();
    if let (Some(min), Some(max)) = (filter.min_amount, filter.max_amount) {
        if min > max {
            return Err(AppError::Validation(format!(
                "min_amount {} is above max_amount {}",
                min, max
            )));
        }
    }
    let tasks = state.quota.task_pool(&filter).await?;
    Ok(Json(TaskPoolResponse {
        count: tasks.len(),
        tasks,
    }))
}

/// POST /lp/tasks/:id/claim
pub async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<WalletRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state.machine.claim(id, &request.wallet_address).await?;
    Ok(Json(intent.into()))
}

/// POST /lp/tasks/:id/mark-paid - receipt for rails without a gateway
pub async fn mark_paid(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<MarkPaidRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state.machine.get(id).await?;
    if intent.platform.has_gateway() {
        return Err(AppError::Validation(format!(
            "{} payments are confirmed through the gateway, not by receipt",
            intent.platform
        )));
    }

    let actor = Actor::LiquidityProvider {
        wallet: request.wallet_address,
    };
    let proof = PaymentProof::Receipt {
        platform: intent.platform,
        transaction_id: request.transaction_id,
    };
    let intent = state.machine.mark_paid(id, &actor, proof).await?;
    Ok(Json(intent.into()))
}

// ========== PAYPAL ==========

/// POST /paypal/orders
pub async fn create_paypal_order(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<CreateOrderResponse>)> {
    let (intent, order) = state
        .gateway
        .create_order(request.intent_id, &request.wallet_address)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            intent: intent.into(),
            order,
        }),
    ))
}

/// POST /paypal/orders/:intent_id/capture
pub async fn capture_paypal_order(
    State(state): State<AppState>,
    Path(intent_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CaptureRequest>,
) -> AppResult<Json<IntentResponse>> {
    let intent = state
        .gateway
        .capture(intent_id, request.order_id.as_deref())
        .await?;
    Ok(Json(intent.into()))
}

/// GET /paypal/status/:intent_id
pub async fn get_paypal_status(
    State(state): State<AppState>,
    Path(intent_id): Path<Uuid>,
) -> AppResult<Json<GatewayStatusView>> {
    let view = state.gateway.poll(intent_id).await?;
    Ok(Json(view))
}

/// POST /paypal/orders/:intent_id/client-report
pub async fn paypal_client_report(
    State(state): State<AppState>,
    Path(intent_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ClientReportRequest>,
) -> AppResult<Json<ReconcileOutcome>> {
    let outcome = state
        .gateway
        .client_report(
            intent_id,
            &request.wallet_address,
            request.order_id.as_deref(),
            request.report,
        )
        .await?;
    Ok(Json(outcome))
}

/// POST /webhooks/paypal
///
/// The delivery is verified with PayPal before its body is read. Event types the engine does not act on are acknowledged and ignored so
/// the gateway stops redelivering them.
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<serde_json::Value>,
) -> AppResult<Json<ReconcileOutcome>> {
    let headers = WebhookHeaders::from_header_map(&headers);
    state
        .gateway
        .verify_webhook(Platform::PayPal, &headers, &event)
        .await?;

    let envelope: WebhookEnvelope = serde_json::from_value(event)
        .map_err(|e| AppError::Validation(format!("Malformed PayPal webhook: {}", e)))?;
    info!(
        "📨 PayPal webhook {} ({})",
        envelope.event_type,
        envelope.id.as_deref().unwrap_or("no id")
    );

    let event_type = envelope.event_type.clone();
    let Some(signal) = envelope.into_signal() else {
        debug!("Ignoring PayPal webhook {}", event_type);
        return Ok(Json(ReconcileOutcome::Ignored { event_type }));
    };

    let outcome = state.gateway.handle_signal(signal).await?;
    Ok(Json(outcome))
}

// ========== HEALTH ==========

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        store: state.store_kind.to_string(),
        gateways: state.gateways.platforms(),
        chain_client: state.chain.is_some(),
        subscribers: state.hub.subscriber_count(),
    }))
}
