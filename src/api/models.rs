use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::adapters::traits::{GatewayOrder, WithdrawReceipt};
use crate::intent::{DisputeResolution, FeeBreakdown, NewIntent};
use crate::ledger::models::*;
use crate::ledger::quota::NewLiquidityProvider;
use crate::reconciliation::{ChainStatus, ClientReport, WithdrawalAuthorization};

// ========== FIELD VALIDATORS ==========

fn positive_amount(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO {
        return Err(ValidationError::new("must_be_positive"));
    }
    Ok(())
}

fn fee_rate_percent(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO || *value > Decimal::ONE_HUNDRED {
        return Err(ValidationError::new("fee_rate_out_of_range"));
    }
    Ok(())
}

fn currency_code(value: &str) -> Result<(), ValidationError> {
    if value.len() != 3 || !value.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::new("invalid_currency_code"));
    }
    Ok(())
}

fn merchant_payee(value: &MerchantInfo) -> Result<(), ValidationError> {
    if value.payee().trim().is_empty() {
        return Err(ValidationError::new("merchant_payee_required"));
    }
    Ok(())
}

fn platforms_not_empty(value: &[Platform]) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("at_least_one_platform"));
    }
    Ok(())
}

// ========== INTENT REQUESTS ==========

#[derive(Debug, Deserialize, Validate)]
pub struct CreateIntentRequest {
    #[validate(custom = "positive_amount")]
    pub amount: Decimal,
    #[validate(custom = "currency_code")]
    pub currency: String,
    #[validate(custom = "fee_rate_percent")]
    pub fee_rate: Option<Decimal>,
    #[validate(length(min = 1, max = 128))]
    pub user_wallet_address: String,
    #[validate(custom = "merchant_payee")]
    pub merchant_info: MerchantInfo,
    #[validate(length(min = 1, max = 128))]
    pub lp_wallet_address: Option<String>,
    #[serde(default)]
    pub auto_match_lp: bool,
}

impl From<CreateIntentRequest> for NewIntent {
    fn from(request: CreateIntentRequest) -> Self {
        Self {
            amount: request.amount,
            currency: request.currency.to_ascii_uppercase(),
            fee_rate: request.fee_rate,
            user_wallet_address: request.user_wallet_address,
            merchant_info: request.merchant_info,
            lp_wallet_address: request.lp_wallet_address,
            auto_match_lp: request.auto_match_lp,
        }
    }
}

/// Body shared by actions that only identify the caller
#[derive(Debug, Deserialize, Validate)]
pub struct WalletRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConfirmRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 256))]
    pub tx_hash: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawCompleteRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 256))]
    pub tx_hash: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DisputeRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Settle,
    Fail,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveDisputeRequest {
    pub resolution: ResolutionKind,
    #[validate(length(min = 1, max = 256))]
    pub tx_hash: Option<String>,
    #[validate(length(min = 1, max = 1000))]
    pub reason: Option<String>,
}

impl ResolveDisputeRequest {
    pub fn into_resolution(self) -> DisputeResolution {
        match self.resolution {
            ResolutionKind::Settle => DisputeResolution::Settle {
                tx_hash: self.tx_hash,
            },
            ResolutionKind::Fail => DisputeResolution::Fail {
                reason: self
                    .reason
                    .unwrap_or_else(|| "Dispute resolved against the payment".to_string()),
            },
        }
    }
}

/// Optional caller for `GET /intents/:id/chain-status`
#[derive(Debug, Deserialize)]
pub struct ChainStatusQuery {
    pub wallet_address: Option<String>,
}

// ========== LP REQUESTS ==========

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterLpRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(custom = "positive_amount")]
    pub total_quota: Decimal,
    #[validate(custom = "positive_amount")]
    pub per_transaction_quota: Decimal,
    #[validate(custom = "fee_rate_percent")]
    pub fee_rate: Decimal,
    #[validate(custom = "platforms_not_empty")]
    pub supported_platforms: Vec<Platform>,
    #[validate(email)]
    pub paypal_email: Option<String>,
}

impl From<RegisterLpRequest> for NewLiquidityProvider {
    fn from(request: RegisterLpRequest) -> Self {
        Self {
            wallet_address: request.wallet_address,
            name: request.name,
            email: request.email,
            total_quota: request.total_quota,
            per_transaction_quota: request.per_transaction_quota,
            fee_rate: request.fee_rate,
            supported_platforms: request.supported_platforms,
            paypal_email: request.paypal_email,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuotaRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(custom = "positive_amount")]
    pub total_quota: Decimal,
    #[validate(custom = "positive_amount")]
    pub per_transaction_quota: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskPoolQuery {
    pub wallet: Option<String>,
    pub platform: Option<Platform>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
}

impl From<TaskPoolQuery> for TaskPoolFilter {
    fn from(query: TaskPoolQuery) -> Self {
        Self {
            wallet_address: query.wallet,
            platform: query.platform,
            min_amount: query.min_amount,
            max_amount: query.max_amount,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct MarkPaidRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    /// Receipt or transaction reference on the payment rail
    #[validate(length(min = 1, max = 256))]
    pub transaction_id: String,
}

// ========== GATEWAY REQUESTS ==========

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub intent_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CaptureRequest {
    #[validate(length(min = 1, max = 128))]
    pub order_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ClientReportRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 128))]
    pub order_id: Option<String>,
    pub report: ClientReport,
}

// ========== RESPONSE MODELS ==========

/// Intent as returned to clients, with its fee breakdown spelled out
#[derive(Debug, Serialize)]
pub struct IntentResponse {
    #[serde(flatten)]
    pub intent: PaymentIntent,
    pub fees: FeeBreakdown,
}

impl From<PaymentIntent> for IntentResponse {
    fn from(intent: PaymentIntent) -> Self {
        let fees = FeeBreakdown {
            fee_rate: intent.fee_rate,
            fee_amount: intent.fee_amount,
            total_amount: intent.total_amount,
        };
        Self { intent, fees }
    }
}

#[derive(Debug, Serialize)]
pub struct LiquidityProviderResponse {
    #[serde(flatten)]
    pub lp: LiquidityProvider,
    #[serde(with = "rust_decimal::serde::float")]
    pub available_quota: Decimal,
}

impl From<LiquidityProvider> for LiquidityProviderResponse {
    fn from(lp: LiquidityProvider) -> Self {
        let available_quota = lp.available_quota();
        Self { lp, available_quota }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskPoolResponse {
    pub count: usize,
    pub tasks: Vec<TaskPoolEntry>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub intent: IntentResponse,
    pub order: GatewayOrder,
}

#[derive(Debug, Serialize)]
pub struct ChainStatusResponse {
    #[serde(flatten)]
    pub status: ChainStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal: Option<WithdrawalAuthorization>,
}

#[derive(Debug, Serialize)]
pub struct WithdrawResponse {
    pub intent: IntentResponse,
    pub receipt: WithdrawReceipt,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub gateways: Vec<Platform>,
    pub chain_client: bool,
    pub subscribers: usize,
}
