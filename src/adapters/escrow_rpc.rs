use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapters::traits::{
    EscrowChainClient, EscrowSnapshot, EscrowState, SimulationOutcome, WithdrawReceipt,
};
use crate::error::{AppError, AppResult, ReconcileError};

// ========== WIRE SHAPES ==========

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcError {
    fn reason(&self) -> String {
        match &self.data {
            Some(Value::String(data)) => format!("{}: {}", self.message, data),
            Some(data) if !data.is_null() => format!("{}: {}", self.message, data),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusField {
    Code(u64),
    Name(String),
}

impl StatusField {
    fn state(&self) -> Option<EscrowState> {
        match self {
            StatusField::Code(code) => EscrowState::from_code(*code),
            StatusField::Name(name) => EscrowState::from_name(name),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimeField {
    Seconds(i64),
    Text(String),
}

impl TimeField {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            // Zero means "not set" on chain
            TimeField::Seconds(0) => None,
            TimeField::Seconds(secs) => Utc.timestamp_opt(*secs, 0).single(),
            TimeField::Text(text) => match text.parse::<i64>() {
                Ok(secs) => TimeField::Seconds(secs).timestamp(),
                Err(_) => DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountField {
    Number(serde_json::Number),
    Text(String),
}

impl AmountField {
    fn into_string(self) -> String {
        match self {
            AmountField::Number(n) => n.to_string(),
            AmountField::Text(s) => s,
        }
    }
}

/// Escrow record keyed by name; camelCase and snake_case both accepted
#[derive(Debug, Deserialize)]
struct EscrowRecord {
    #[serde(default, alias = "escrow_status", alias = "escrowStatus", alias = "state")]
    status: Option<StatusField>,
    #[serde(default, alias = "owner")]
    user: Option<String>,
    #[serde(default, alias = "lp", alias = "lp_address", alias = "lpAddress")]
    recipient: Option<String>,
    #[serde(default)]
    amount: Option<AmountField>,
    #[serde(
        default,
        alias = "release_time",
        alias = "releaseTime",
        alias = "confirmedAt"
    )]
    confirmed_at: Option<TimeField>,
    #[serde(default, alias = "is_disputed", alias = "isDisputed")]
    disputed: Option<bool>,
}

impl From<EscrowRecord> for EscrowSnapshot {
    fn from(record: EscrowRecord) -> Self {
        Self {
            state: record.status.as_ref().and_then(StatusField::state),
            user: record.user,
            recipient: record.recipient,
            amount: record.amount.map(AmountField::into_string),
            confirmed_at: record.confirmed_at.as_ref().and_then(TimeField::timestamp),
            disputed: record.disputed,
        }
    }
}

/// Shapes the status query is known to answer with
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EscrowResponse {
    Wrapped { payment: EscrowRecord },
    /// Positional account layout:
    /// [user, lp, token, amount, timestamp, lock_time, release_time,
    ///  platform_fee, payment_seed, payment_type, escrow_status, is_disputed]
    Positional(Vec<Value>),
    Record(EscrowRecord),
}

impl EscrowResponse {
    fn into_snapshot(self) -> EscrowSnapshot {
        match self {
            EscrowResponse::Wrapped { payment } => payment.into(),
            EscrowResponse::Record(record) => record.into(),
            EscrowResponse::Positional(values) => {
                let field = |i: usize| values.get(i).cloned().unwrap_or(Value::Null);
                let text = |i: usize| field(i).as_str().map(str::to_string);
                EscrowSnapshot {
                    state: serde_json::from_value::<StatusField>(field(10))
                        .ok()
                        .and_then(|s| s.state()),
                    user: text(0),
                    recipient: text(1),
                    amount: serde_json::from_value::<AmountField>(field(3))
                        .ok()
                        .map(AmountField::into_string),
                    confirmed_at: serde_json::from_value::<TimeField>(field(6))
                        .ok()
                        .and_then(|t| t.timestamp()),
                    disputed: field(11).as_bool(),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SimulationValue {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    logs: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SimulationResponse {
    Flag(bool),
    Wrapped { value: SimulationValue },
    Report {
        #[serde(default, alias = "ok")]
        success: Option<bool>,
        #[serde(default, alias = "revert_reason", alias = "revertReason", alias = "message")]
        error: Option<String>,
        #[serde(default)]
        logs: Vec<String>,
    },
}

impl SimulationResponse {
    fn into_outcome(self) -> SimulationOutcome {
        match self {
            SimulationResponse::Flag(true) => SimulationOutcome::Succeeded,
            SimulationResponse::Flag(false) => {
                SimulationOutcome::Reverted("simulation failed".to_string())
            }
            SimulationResponse::Wrapped { value } => match value.err {
                None | Some(Value::Null) => SimulationOutcome::Succeeded,
                Some(err) => {
                    let logs = value.logs.unwrap_or_default().join("\n");
                    SimulationOutcome::Reverted(format!("{} {}", err, logs).trim().to_string())
                }
            },
            SimulationResponse::Report {
                success,
                error,
                logs,
            } => match (success, error) {
                (Some(true), _) | (None, None) => SimulationOutcome::Succeeded,
                (_, Some(reason)) => SimulationOutcome::Reverted(reason),
                (Some(false), None) => SimulationOutcome::Reverted(logs.join("\n")),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WithdrawResponse {
    Hash(String),
    Receipt {
        #[serde(alias = "signature", alias = "transactionHash", alias = "txHash")]
        tx_hash: String,
    },
}

// ========== CLIENT ==========

/// Escrow contract reached through a JSON-RPC gateway
pub struct EscrowRpcClient {
    rpc_url: String,
    contract_address: String,
    client: Client,
    next_id: AtomicU64,
}

impl EscrowRpcClient {
    pub fn new(rpc_url: String, contract_address: String, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Escrow RPC client: {}", e)))?;

        info!("✅ Escrow RPC client configured: {} ({})", rpc_url, contract_address);
        Ok(Self {
            rpc_url,
            contract_address,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> AppResult<Result<Option<T>, RpcError>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!("⛓️ RPC {} #{}", method, id);

        let response = self.client.post(&self.rpc_url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ReconcileError::ExternalUnavailable(format!(
                "Escrow RPC returned {}",
                response.status()
            ))
            .into());
        }

        let envelope: RpcResponse<T> = response.json().await?;
        Ok(match envelope.error {
            Some(error) => Err(error),
            None => Ok(envelope.result),
        })
    }
}

#[async_trait]
impl EscrowChainClient for EscrowRpcClient {
    async fn escrow_status(&self, payment_id: &str) -> AppResult<EscrowSnapshot> {
        let outcome = self
            .call::<EscrowResponse>(
                "escrow_getPayment",
                json!([self.contract_address, payment_id]),
            )
            .await?;

        match outcome {
            Ok(Some(response)) => Ok(response.into_snapshot()),
            Ok(None) => Ok(EscrowSnapshot::default()),
            Err(error) if error.message.to_ascii_lowercase().contains("not found") => {
                Ok(EscrowSnapshot::default())
            }
            Err(error) => {
                warn!("⚠️ Escrow status query failed ({}): {}", error.code, error.reason());
                Err(ReconcileError::Unreconcilable(error.reason()).into())
            }
        }
    }

    async fn simulate_withdraw(
        &self,
        payment_id: &str,
        caller: &str,
    ) -> AppResult<SimulationOutcome> {
        let outcome = self
            .call::<SimulationResponse>(
                "escrow_simulateWithdraw",
                json!([self.contract_address, payment_id, caller]),
            )
            .await?;

        Ok(match outcome {
            Ok(Some(response)) => response.into_outcome(),
            Ok(None) => SimulationOutcome::Succeeded,
            Err(error) => SimulationOutcome::Reverted(error.reason()),
        })
    }

    async fn withdraw(&self, payment_id: &str, caller: &str) -> AppResult<WithdrawReceipt> {
        let outcome = self
            .call::<WithdrawResponse>(
                "escrow_withdraw",
                json!([self.contract_address, payment_id, caller]),
            )
            .await?;

        match outcome {
            Ok(Some(WithdrawResponse::Hash(tx_hash)))
            | Ok(Some(WithdrawResponse::Receipt { tx_hash })) => {
                info!("🏧 Escrow {} withdrawn in {}", payment_id, tx_hash);
                Ok(WithdrawReceipt { tx_hash })
            }
            Ok(None) => Err(ReconcileError::Unreconcilable(
                "Withdraw returned no transaction hash".to_string(),
            )
            .into()),
            Err(error) => Err(ReconcileError::Unreconcilable(error.reason()).into()),
        }
    }
}
