// Recovery Sweep - returns payments stuck in `processing` to the task pool
//
// A processing intent is reset when either:
// - a cancellation was reported since it entered processing and the capture
//   grace has elapsed with nothing landing, or
// - nothing at all has happened to it for the stall timeout.
//
// Each pass ends by releasing quota locks whose intent no longer holds quota.

use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{RunGuard, SweepReport};
use crate::config::SweepConfig;
use crate::error::{AppError, AppResult, IntentError};
use crate::intent::IntentStateMachine;
use crate::ledger::models::{IntentStatus, PaymentIntent, ResetReason};
use crate::ledger::quota::QuotaLedger;

pub struct RecoverySweep {
    machine: Arc<IntentStateMachine>,
    quota: Arc<QuotaLedger>,
    config: SweepConfig,
    running: AtomicBool,
}

impl RecoverySweep {
    pub fn new(
        machine: Arc<IntentStateMachine>,
        quota: Arc<QuotaLedger>,
        config: SweepConfig,
    ) -> Self {
        Self {
            machine,
            quota,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Start the sweep (runs in background)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.recovery_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "🩺 Recovery sweep running every {:?} (grace {}s, stall {}s)",
                self.config.recovery_interval,
                self.config.cancel_grace.num_seconds(),
                self.config.stall_timeout.num_seconds()
            );

            loop {
                ticker.tick().await;
                match self.run_once(Utc::now()).await {
                    Ok(report) if !report.is_quiet() => {
                        info!("✓ Recovery sweep: {:?}", report);
                    }
                    Ok(_) => {}
                    Err(e) => error!("❌ Recovery sweep failed: {:?}", e),
                }
            }
        })
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> AppResult<SweepReport> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            debug!("Recovery sweep still running, skipping this tick");
            return Ok(SweepReport::skipped());
        };

        let mut report = SweepReport::default();
        let intents = self
            .machine
            .list_by_status(&[IntentStatus::Processing])
            .await?;

        for intent in intents {
            report.scanned += 1;
            let Some(reason) = self.reset_reason(&intent, now) else {
                continue;
            };

            match self.machine.reset_to_created(&intent, reason, now).await {
                Ok(_) => {
                    report.transitioned += 1;
                    info!("♻️ Intent {} returned to task pool ({:?})", intent.id, reason);
                }
                Err(AppError::Intent(IntentError::InvalidStateTransition { .. })) => {
                    debug!("Intent {} moved before it could be reset", intent.id);
                }
                Err(e) => {
                    report.failed += 1;
                    error!("❌ Failed to reset intent {}: {:?}", intent.id, e);
                }
            }
        }

        match self.quota.release_orphaned_locks().await {
            Ok(released) => report.orphans_released = released,
            Err(e) => {
                report.failed += 1;
                error!("❌ Orphaned lock release failed: {:?}", e);
            }
        }

        Ok(report)
    }

    fn reset_reason(&self, intent: &PaymentIntent, now: DateTime<Utc>) -> Option<ResetReason> {
        let idle = now - intent.updated_at;
        if intent.has_pending_cancellation(self.config.cancellation_window) {
            (idle >= self.config.cancel_grace).then_some(ResetReason::CancelGraceElapsed)
        } else {
            (idle >= self.config.stall_timeout).then_some(ResetReason::Stalled)
        }
    }
}
