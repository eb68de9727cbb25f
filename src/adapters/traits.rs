use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::Platform;

// ========== PAYMENT GATEWAY ==========

/// Order status as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOrderStatus {
    Created,
    Saved,
    Approved,
    Voided,
    Completed,
    PayerActionRequired,
    Other(String),
}

impl GatewayOrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "CREATED" => GatewayOrderStatus::Created,
            "SAVED" => GatewayOrderStatus::Saved,
            "APPROVED" => GatewayOrderStatus::Approved,
            "VOIDED" => GatewayOrderStatus::Voided,
            "COMPLETED" => GatewayOrderStatus::Completed,
            "PAYER_ACTION_REQUIRED" => GatewayOrderStatus::PayerActionRequired,
            other => GatewayOrderStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GatewayOrderStatus::Created => "CREATED",
            GatewayOrderStatus::Saved => "SAVED",
            GatewayOrderStatus::Approved => "APPROVED",
            GatewayOrderStatus::Voided => "VOIDED",
            GatewayOrderStatus::Completed => "COMPLETED",
            GatewayOrderStatus::PayerActionRequired => "PAYER_ACTION_REQUIRED",
            GatewayOrderStatus::Other(raw) => raw,
        }
    }
}

impl fmt::Display for GatewayOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateOrderRequest {
    pub intent_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayOrder {
    pub order_id: String,
    pub status: GatewayOrderStatus,
    pub approval_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayCapture {
    pub order_id: String,
    pub order_status: GatewayOrderStatus,
    pub capture_id: Option<String>,
    pub capture_status: Option<String>,
    pub amount: Option<String>,
}

impl GatewayCapture {
    pub fn is_completed(&self) -> bool {
        self.order_status == GatewayOrderStatus::Completed
            && self.capture_id.is_some()
            && self
                .capture_status
                .as_deref()
                .map(|status| status.eq_ignore_ascii_case("COMPLETED"))
                .unwrap_or(true)
    }
}

/// Transmission headers a gateway signs each webhook delivery with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub transmission_id: Option<String>,
    pub transmission_time: Option<String>,
    pub transmission_sig: Option<String>,
    pub cert_url: Option<String>,
    pub auth_algo: Option<String>,
}

impl WebhookHeaders {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Self {
            transmission_id: get("paypal-transmission-id"),
            transmission_time: get("paypal-transmission-time"),
            transmission_sig: get("paypal-transmission-sig"),
            cert_url: get("paypal-cert-url"),
            auth_algo: get("paypal-auth-algo"),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.transmission_id.is_some()
            && self.transmission_time.is_some()
            && self.transmission_sig.is_some()
            && self.cert_url.is_some()
            && self.auth_algo.is_some()
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn platform(&self) -> Platform;

    async fn create_order(&self, request: &CreateOrderRequest) -> AppResult<GatewayOrder>;

    async fn capture_order(&self, order_id: &str) -> AppResult<GatewayCapture>;

    /// Current order status with its capture, if any
    async fn get_order(&self, order_id: &str) -> AppResult<GatewayCapture>;

    /// Whether a webhook delivery really came from the gateway. `event` is the
    /// delivered body, untouched.
    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        event: &serde_json::Value,
    ) -> AppResult<bool>;
}

// ========== ESCROW CHAIN ==========

/// Status of an escrow record on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    None,
    Locked,
    Confirmed,
    Released,
    Refunded,
}

impl EscrowState {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(EscrowState::None),
            1 => Some(EscrowState::Locked),
            2 => Some(EscrowState::Confirmed),
            3 => Some(EscrowState::Released),
            4 => Some(EscrowState::Refunded),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(EscrowState::None),
            "locked" => Some(EscrowState::Locked),
            "confirmed" => Some(EscrowState::Confirmed),
            "released" => Some(EscrowState::Released),
            "refunded" => Some(EscrowState::Refunded),
            _ => None,
        }
    }
}

/// What the engine knows about one escrow record. Every field the chain
/// did not report is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub state: Option<EscrowState>,
    pub user: Option<String>,
    pub recipient: Option<String>,
    pub amount: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub disputed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationOutcome {
    Succeeded,
    Reverted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WithdrawReceipt {
    pub tx_hash: String,
}

#[async_trait]
pub trait EscrowChainClient: Send + Sync {
    async fn escrow_status(&self, payment_id: &str) -> AppResult<EscrowSnapshot>;

    /// Dry-run of the withdraw call as `caller`
    async fn simulate_withdraw(&self, payment_id: &str, caller: &str)
        -> AppResult<SimulationOutcome>;

    async fn withdraw(&self, payment_id: &str, caller: &str) -> AppResult<WithdrawReceipt>;
}
