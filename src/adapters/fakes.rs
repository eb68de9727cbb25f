//! Scripted gateway and chain clients for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::adapters::traits::*;
use crate::error::{AppResult, ReconcileError};
use crate::ledger::models::Platform;

/// Signature `ScriptedGateway` accepts on webhook deliveries
pub const SCRIPTED_SIGNATURE: &str = "scripted-signature";

#[derive(Default)]
pub struct ScriptedGateway {
    orders: Mutex<HashMap<String, GatewayOrderStatus>>,
    created: AtomicUsize,
    captures: AtomicUsize,
    unavailable: AtomicBool,
    hang: AtomicBool,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, order_id: &str, status: GatewayOrderStatus) {
        self.orders.lock().insert(order_id.to_string(), status);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every call sleeps far past any reasonable timeout
    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn capture_calls(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> AppResult<()> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReconcileError::ExternalUnavailable("scripted outage".to_string()).into());
        }
        Ok(())
    }

    fn snapshot(&self, order_id: &str, status: GatewayOrderStatus) -> GatewayCapture {
        let completed = status == GatewayOrderStatus::Completed;
        GatewayCapture {
            order_id: order_id.to_string(),
            order_status: status,
            capture_id: completed.then(|| format!("CAP-{}", order_id)),
            capture_status: completed.then(|| "COMPLETED".to_string()),
            amount: None,
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn platform(&self) -> Platform {
        Platform::PayPal
    }

    async fn create_order(&self, _request: &CreateOrderRequest) -> AppResult<GatewayOrder> {
        self.gate().await?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("ORDER-{}", n);
        self.set_status(&order_id, GatewayOrderStatus::Created);
        Ok(GatewayOrder {
            approval_url: Some(format!("https://gateway.test/approve/{}", order_id)),
            order_id,
            status: GatewayOrderStatus::Created,
        })
    }

    async fn capture_order(&self, order_id: &str) -> AppResult<GatewayCapture> {
        self.gate().await?;
        self.captures.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.lock();
        let status = orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ReconcileError::Unreconcilable(format!("unknown order {}", order_id)))?;
        let status = if status == GatewayOrderStatus::Approved {
            orders.insert(order_id.to_string(), GatewayOrderStatus::Completed);
            GatewayOrderStatus::Completed
        } else {
            status
        };
        drop(orders);
        Ok(self.snapshot(order_id, status))
    }

    async fn get_order(&self, order_id: &str) -> AppResult<GatewayCapture> {
        self.gate().await?;
        let status = self
            .orders
            .lock()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ReconcileError::Unreconcilable(format!("unknown order {}", order_id)))?;
        Ok(self.snapshot(order_id, status))
    }

    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        _event: &serde_json::Value,
    ) -> AppResult<bool> {
        self.gate().await?;
        Ok(headers.transmission_sig.as_deref() == Some(SCRIPTED_SIGNATURE))
    }
}

#[derive(Default)]
pub struct ScriptedChain {
    snapshots: Mutex<HashMap<String, EscrowSnapshot>>,
    simulations: Mutex<HashMap<String, SimulationOutcome>>,
    status_queries: AtomicUsize,
    withdrawals: AtomicUsize,
    unavailable: AtomicBool,
    hang: AtomicBool,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, payment_id: &str, snapshot: EscrowSnapshot) {
        self.snapshots.lock().insert(payment_id.to_string(), snapshot);
    }

    pub fn set_simulation(&self, payment_id: &str, outcome: SimulationOutcome) {
        self.simulations.lock().insert(payment_id.to_string(), outcome);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    async fn gate(&self) -> AppResult<()> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReconcileError::ExternalUnavailable("scripted RPC outage".to_string()).into());
        }
        Ok(())
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }

    pub fn withdrawals(&self) -> usize {
        self.withdrawals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EscrowChainClient for ScriptedChain {
    async fn escrow_status(&self, payment_id: &str) -> AppResult<EscrowSnapshot> {
        self.gate().await?;
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .snapshots
            .lock()
            .get(payment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn simulate_withdraw(
        &self,
        payment_id: &str,
        _caller: &str,
    ) -> AppResult<SimulationOutcome> {
        self.gate().await?;
        Ok(self
            .simulations
            .lock()
            .get(payment_id)
            .cloned()
            .unwrap_or_else(|| SimulationOutcome::Reverted("AccountNotInitialized".to_string())))
    }

    async fn withdraw(&self, payment_id: &str, _caller: &str) -> AppResult<WithdrawReceipt> {
        self.gate().await?;
        let n = self.withdrawals.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(snapshot) = self.snapshots.lock().get_mut(payment_id) {
            snapshot.state = Some(EscrowState::Released);
        }
        Ok(WithdrawReceipt {
            tx_hash: format!("0xwithdraw{}", n),
        })
    }
}
