use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{RunGuard, SweepReport};
use crate::error::{AppError, AppResult, IntentError};
use crate::intent::IntentStateMachine;
use crate::ledger::models::IntentStatus;

/// Moves abandoned intents to `expired` once `expires_at` has passed
pub struct ExpirySweep {
    machine: Arc<IntentStateMachine>,
    period: Duration,
    running: AtomicBool,
}

impl ExpirySweep {
    pub fn new(machine: Arc<IntentStateMachine>, period: Duration) -> Self {
        Self {
            machine,
            period,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("⌛ Expiry sweep running every {:?}", self.period);

            loop {
                ticker.tick().await;
                match self.run_once(Utc::now()).await {
                    Ok(report) if !report.is_quiet() => info!("✓ Expiry sweep: {:?}", report),
                    Ok(_) => {}
                    Err(e) => error!("❌ Expiry sweep failed: {:?}", e),
                }
            }
        })
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Expiry sweep still running, skipping this tick");
            return Ok(SweepReport::skipped());
        };

        let expirable: Vec<IntentStatus> = IntentStatus::all()
            .into_iter()
            .filter(|status| status.is_expirable())
            .collect();
        let intents = self.machine.list_by_status(&expirable).await?;

        let mut report = SweepReport::default();
        for intent in intents.iter().filter(|intent| intent.is_expired(now)) {
            report.scanned += 1;
            match self.machine.expire(intent, now).await {
                Ok(_) => {
                    report.transitioned += 1;
                    info!("⌛ Intent {} expired in {}", intent.id, intent.status);
                }
                Err(AppError::Intent(IntentError::InvalidStateTransition { .. })) => {
                    debug!("Intent {} moved before it could expire", intent.id);
                }
                Err(e) => {
                    report.failed += 1;
                    error!("❌ Failed to expire intent {}: {:?}", intent.id, e);
                }
            }
        }

        Ok(report)
    }
}
