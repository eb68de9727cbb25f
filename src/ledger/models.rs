use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, types::Json, Row, Type};
use std::fmt;
use uuid::Uuid;

/// External payment rail the user pays the merchant on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_platform", rename_all = "lowercase")]
pub enum Platform {
    PayPal,
    WeChat,
    Alipay,
    Other,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::PayPal => "PayPal",
            Platform::WeChat => "WeChat",
            Platform::Alipay => "Alipay",
            Platform::Other => "Other",
        }
    }

    /// Platforms whose payments are observed through a gateway API
    /// rather than an LP-submitted receipt
    pub fn has_gateway(&self) -> bool {
        matches!(self, Platform::PayPal)
    }
}

/// Payment intent lifecycle status
///
/// Main path: created -> claimed -> processing -> paid -> confirmed -> settled.
/// Side exits: cancelled, expired, failed, disputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "intent_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Created,
    Claimed,
    Processing,
    Paid,
    Confirmed,
    Settled,
    Cancelled,
    Expired,
    Failed,
    Disputed,
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Created => "created",
            IntentStatus::Claimed => "claimed",
            IntentStatus::Processing => "processing",
            IntentStatus::Paid => "paid",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Settled => "settled",
            IntentStatus::Cancelled => "cancelled",
            IntentStatus::Expired => "expired",
            IntentStatus::Failed => "failed",
            IntentStatus::Disputed => "disputed",
        }
    }

    pub fn all() -> [IntentStatus; 10] {
        [
            IntentStatus::Created,
            IntentStatus::Claimed,
            IntentStatus::Processing,
            IntentStatus::Paid,
            IntentStatus::Confirmed,
            IntentStatus::Settled,
            IntentStatus::Cancelled,
            IntentStatus::Expired,
            IntentStatus::Failed,
            IntentStatus::Disputed,
        ]
    }

    /// Legal successors of this status. Terminal statuses have none.
    pub fn allowed_transitions(&self) -> &'static [IntentStatus] {
        use IntentStatus::*;
        match self {
            Created => &[Claimed, Cancelled, Expired, Failed, Disputed],
            Claimed => &[Processing, Paid, Created, Cancelled, Expired, Failed, Disputed],
            Processing => &[Paid, Confirmed, Created, Cancelled, Expired, Failed, Disputed],
            Paid => &[Confirmed, Cancelled, Expired, Failed, Disputed],
            Confirmed => &[Settled, Cancelled, Expired, Failed, Disputed],
            // Manual resolution only
            Disputed => &[Settled, Failed],
            Settled | Cancelled | Expired | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Quota is locked against the LP exactly while the intent sits here
    pub fn holds_quota(&self) -> bool {
        matches!(self, IntentStatus::Claimed | IntentStatus::Processing)
    }

    /// Statuses that carry an LP assignment
    pub fn has_lp_assignment(&self) -> bool {
        matches!(
            self,
            IntentStatus::Claimed
                | IntentStatus::Processing
                | IntentStatus::Paid
                | IntentStatus::Confirmed
                | IntentStatus::Settled
                | IntentStatus::Disputed
        )
    }

    /// Eligible for the expiry sweep once expires_at has passed
    pub fn is_expirable(&self) -> bool {
        matches!(
            self,
            IntentStatus::Created | IntentStatus::Claimed | IntentStatus::Processing
        )
    }
}

/// Platform-specific payee identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform")]
pub enum MerchantInfo {
    PayPal { email: String },
    WeChat { account: String },
    Alipay { account: String },
    Other { payee: String },
}

impl MerchantInfo {
    pub fn platform(&self) -> Platform {
        match self {
            MerchantInfo::PayPal { .. } => Platform::PayPal,
            MerchantInfo::WeChat { .. } => Platform::WeChat,
            MerchantInfo::Alipay { .. } => Platform::Alipay,
            MerchantInfo::Other { .. } => Platform::Other,
        }
    }

    pub fn payee(&self) -> &str {
        match self {
            MerchantInfo::PayPal { email } => email,
            MerchantInfo::WeChat { account } | MerchantInfo::Alipay { account } => account,
            MerchantInfo::Other { payee } => payee,
        }
    }
}

/// Evidence that the merchant was paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentProof {
    /// Gateway order, with the capture id once the order was captured
    PayPalOrder {
        order_id: String,
        capture_id: Option<String>,
    },
    /// Receipt reported by the LP for rails without a gateway integration
    Receipt {
        platform: Platform,
        transaction_id: String,
    },
}

/// Proof recorded when an intent is confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfirmationProof {
    TxHash(String),
    CaptureId(String),
    ChainObserved,
}

/// Who caused a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    User { wallet: String },
    LiquidityProvider { wallet: String },
    GatewayReconciler,
    ChainReconciler,
    RecoverySweep,
    ExpirySweep,
    Operator,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User { wallet } => write!(f, "user {}", wallet),
            Actor::LiquidityProvider { wallet } => write!(f, "LP {}", wallet),
            Actor::GatewayReconciler => write!(f, "gateway reconciler"),
            Actor::ChainReconciler => write!(f, "chain reconciler"),
            Actor::RecoverySweep => write!(f, "recovery sweep"),
            Actor::ExpirySweep => write!(f, "expiry sweep"),
            Actor::Operator => write!(f, "operator"),
        }
    }
}

/// Why an intent was put back into the task pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    GatewayCancelled,
    ClientCancelled,
    CancelGraceElapsed,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationSource {
    Webhook,
    ClientReport,
    GatewayPoll,
}

/// Same-status history entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Annotation {
    CancellationRequested { source: CancellationSource },
    LateGatewaySuccess { capture_id: Option<String> },
    BlockchainIdAssigned { blockchain_payment_id: String },
    GatewayObserved { order_status: String },
}

/// One entry of the append-only status history, one variant per status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Created { reset: Option<ResetReason> },
    Claimed { lp_wallet_address: String },
    Processing { order_id: Option<String> },
    Paid { proof: PaymentProof },
    Confirmed { proof: ConfirmationProof, actor: Actor },
    Settled { tx_hash: Option<String>, actor: Actor },
    Cancelled { actor: Actor },
    Expired,
    Failed { reason: String },
    Disputed { reason: String },
    Annotated { status: IntentStatus, annotation: Annotation },
}

impl HistoryEvent {
    pub fn status(&self) -> IntentStatus {
        match self {
            HistoryEvent::Created { .. } => IntentStatus::Created,
            HistoryEvent::Claimed { .. } => IntentStatus::Claimed,
            HistoryEvent::Processing { .. } => IntentStatus::Processing,
            HistoryEvent::Paid { .. } => IntentStatus::Paid,
            HistoryEvent::Confirmed { .. } => IntentStatus::Confirmed,
            HistoryEvent::Settled { .. } => IntentStatus::Settled,
            HistoryEvent::Cancelled { .. } => IntentStatus::Cancelled,
            HistoryEvent::Expired => IntentStatus::Expired,
            HistoryEvent::Failed { .. } => IntentStatus::Failed,
            HistoryEvent::Disputed { .. } => IntentStatus::Disputed,
            HistoryEvent::Annotated { status, .. } => *status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    #[serde(flatten)]
    pub event: HistoryEvent,
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

impl StatusHistoryEntry {
    pub fn new(event: HistoryEvent, timestamp: DateTime<Utc>, note: impl Into<String>) -> Self {
        Self {
            event,
            timestamp,
            note: note.into(),
        }
    }

    pub fn status(&self) -> IntentStatus {
        self.event.status()
    }

    pub fn is_cancellation_marker(&self) -> bool {
        matches!(
            self.event,
            HistoryEvent::Annotated {
                annotation: Annotation::CancellationRequested { .. },
                ..
            } | HistoryEvent::Cancelled { .. }
                | HistoryEvent::Created {
                    reset: Some(ResetReason::GatewayCancelled | ResetReason::ClientCancelled)
                }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayObservation {
    pub order_status: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub capture_id: String,
    pub event_id: Option<String>,
    pub amount: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub refund_id: String,
    pub status: Option<String>,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub kind: String,
    pub detail: String,
    pub observed_at: DateTime<Utc>,
}

/// Reconciliation metadata gathered while an intent is in flight
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingDetails {
    pub gateway_observation: Option<GatewayObservation>,
    pub capture: Option<CaptureRecord>,
    pub refund: Option<RefundRecord>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub anomalies: Vec<AnomalyRecord>,
}

/// Payment intent - the central entity
///
/// INVARIANTS:
/// - `status` equals the status of the last `status_history` entry
/// - `lp_wallet_address` is set iff `status.has_lp_assignment()`, except in
///   `disputed`, which keeps whatever assignment the intent had
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,

    // Financial terms, fixed at creation
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_rate: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,

    // Parties
    pub user_wallet_address: String,
    pub lp_wallet_address: Option<String>,
    pub designated_lp_address: Option<String>,

    // Platform linkage
    pub platform: Platform,
    pub merchant_info: MerchantInfo,

    // Settlement linkage
    pub payment_proof: Option<PaymentProof>,
    pub processing_details: ProcessingDetails,
    pub settlement_tx_hash: Option<String>,
    pub blockchain_payment_id: Option<String>,

    // Lifecycle
    pub status: IntentStatus,
    pub status_history: Vec<StatusHistoryEntry>,
    pub expires_at: DateTime<Utc>,
    pub lock_time: Option<DateTime<Utc>>,
    pub release_time: Option<DateTime<Utc>>,
    pub withdrawal_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn gateway_order_id(&self) -> Option<&str> {
        match &self.payment_proof {
            Some(PaymentProof::PayPalOrder { order_id, .. }) => Some(order_id),
            _ => None,
        }
    }

    pub fn gateway_capture_id(&self) -> Option<&str> {
        match &self.payment_proof {
            Some(PaymentProof::PayPalOrder { capture_id, .. }) => capture_id.as_deref(),
            _ => None,
        }
    }

    pub fn last_entry(&self) -> Option<&StatusHistoryEntry> {
        self.status_history.last()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// True when a cancellation marker was recorded since the intent last
    /// entered `processing`, looking at no more than `window` entries.
    pub fn has_pending_cancellation(&self, window: usize) -> bool {
        self.status_history
            .iter()
            .rev()
            .take(window)
            .take_while(|entry| !matches!(entry.event, HistoryEvent::Processing { .. }))
            .any(|entry| entry.is_cancellation_marker())
    }

    /// True when the invariants tying status, history and LP assignment hold
    pub fn is_consistent(&self) -> bool {
        let history_matches = self
            .last_entry()
            .map(|entry| entry.status() == self.status)
            .unwrap_or(false);
        let lp_matches = self.status == IntentStatus::Disputed
            || self.lp_wallet_address.is_some() == self.status.has_lp_assignment();
        history_matches && lp_matches
    }

    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            fee_rate: row.try_get("fee_rate")?,
            fee_amount: row.try_get("fee_amount")?,
            total_amount: row.try_get("total_amount")?,
            user_wallet_address: row.try_get("user_wallet_address")?,
            lp_wallet_address: row.try_get("lp_wallet_address")?,
            designated_lp_address: row.try_get("designated_lp_address")?,
            platform: row.try_get("platform")?,
            merchant_info: row.try_get::<Json<MerchantInfo>, _>("merchant_info")?.0,
            payment_proof: row
                .try_get::<Option<Json<PaymentProof>>, _>("payment_proof")?
                .map(|proof| proof.0),
            processing_details: row
                .try_get::<Json<ProcessingDetails>, _>("processing_details")?
                .0,
            settlement_tx_hash: row.try_get("settlement_tx_hash")?,
            blockchain_payment_id: row.try_get("blockchain_payment_id")?,
            status: row.try_get("status")?,
            status_history: row
                .try_get::<Json<Vec<StatusHistoryEntry>>, _>("status_history")?
                .0,
            expires_at: row.try_get("expires_at")?,
            lock_time: row.try_get("lock_time")?,
            release_time: row.try_get("release_time")?,
            withdrawal_time: row.try_get("withdrawal_time")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Liquidity provider and its quota
///
/// `available_quota()` is always `total_quota - locked_quota`; only the
/// quota ledger moves `locked_quota`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityProvider {
    pub wallet_address: String,
    pub name: String,
    pub email: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_quota: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub locked_quota: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub per_transaction_quota: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_rate: Decimal,
    pub supported_platforms: Vec<Platform>,
    pub paypal_email: Option<String>,
    pub is_active: bool,
    pub completed_count: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub completed_volume: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiquidityProvider {
    pub fn available_quota(&self) -> Decimal {
        self.total_quota - self.locked_quota
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.supported_platforms.contains(&platform)
    }

    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            wallet_address: row.try_get("wallet_address")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            total_quota: row.try_get("total_quota")?,
            locked_quota: row.try_get("locked_quota")?,
            per_transaction_quota: row.try_get("per_transaction_quota")?,
            fee_rate: row.try_get("fee_rate")?,
            supported_platforms: row
                .try_get::<Json<Vec<Platform>>, _>("supported_platforms")?
                .0,
            paypal_email: row.try_get("paypal_email")?,
            is_active: row.try_get("is_active")?,
            completed_count: row.try_get("completed_count")?,
            completed_volume: row.try_get("completed_volume")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A quota lock, paired with the intent that caused it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaLock {
    pub intent_id: Uuid,
    pub lp_wallet_address: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub locked_at: DateTime<Utc>,
}

/// LP-facing projection of a payment intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPoolEntry {
    pub intent_id: Uuid,
    pub status: IntentStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub platform: Platform,
    pub lp_wallet_address: Option<String>,
    pub designated_lp_address: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PaymentIntent> for TaskPoolEntry {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            intent_id: intent.id,
            status: intent.status,
            amount: intent.amount,
            currency: intent.currency.clone(),
            platform: intent.platform,
            lp_wallet_address: intent.lp_wallet_address.clone(),
            designated_lp_address: intent.designated_lp_address.clone(),
            active: !intent.status.is_terminal(),
            created_at: intent.created_at,
            updated_at: intent.updated_at,
        }
    }
}

impl TaskPoolEntry {
    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            intent_id: row.try_get("intent_id")?,
            status: row.try_get("status")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            platform: row.try_get("platform")?,
            lp_wallet_address: row.try_get("lp_wallet_address")?,
            designated_lp_address: row.try_get("designated_lp_address")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Statuses an LP keeps seeing for tasks it claimed
    pub fn visible_to_claimer(status: IntentStatus) -> bool {
        matches!(
            status,
            IntentStatus::Claimed
                | IntentStatus::Processing
                | IntentStatus::Paid
                | IntentStatus::Confirmed
                | IntentStatus::Settled
        )
    }
}

/// Task pool query
///
/// Without a wallet only claimable tasks are returned; with one, the
/// tasks that wallet claimed are included too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPoolFilter {
    pub wallet_address: Option<String>,
    pub platform: Option<Platform>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
}

impl TaskPoolFilter {
    pub fn matches(&self, entry: &TaskPoolEntry) -> bool {
        if !entry.active && entry.status != IntentStatus::Settled {
            return false;
        }
        let claimable = entry.status == IntentStatus::Created;
        let owned = match (&self.wallet_address, &entry.lp_wallet_address) {
            (Some(wallet), Some(lp)) => {
                wallet == lp && TaskPoolEntry::visible_to_claimer(entry.status)
            }
            _ => false,
        };
        if !claimable && !owned {
            return false;
        }
        if let Some(platform) = self.platform {
            if entry.platform != platform {
                return false;
            }
        }
        if let Some(min) = self.min_amount {
            if entry.amount < min {
                return false;
            }
        }
        if let Some(max) = self.max_amount {
            if entry.amount > max {
                return false;
            }
        }
        true
    }
}

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "audit_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LateGatewaySuccess,
    DoubleRelease,
    ClampedRelease,
    OrphanedLockReleased,
    UnreconcilableState,
    UnlinkedGatewaySignal,
    QuotaUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub intent_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            intent_id: row.try_get("intent_id")?,
            event_type: row.try_get("event_type")?,
            details: row.try_get::<Json<serde_json::Value>, _>("details")?.0,
            created_at: row.try_get("created_at")?,
        })
    }
}
