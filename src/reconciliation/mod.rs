pub mod cache;
pub mod chain;
pub mod gateway;
pub mod signals;

pub use cache::ChainStatusCache;
pub use chain::{ChainReconciler, ChainStatus, WithdrawalAuthorization};
pub use gateway::{ClientReport, GatewayReconciler, GatewayStatusView};
pub use signals::{GatewaySignal, SignalKind, WebhookEnvelope};

use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult, IntentError};
use crate::ledger::models::{IntentStatus, PaymentIntent};

/// What a reconciler did with one external observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Transitioned {
        intent_id: Uuid,
        from: IntentStatus,
        to: IntentStatus,
    },
    NoChange {
        intent_id: Uuid,
        status: IntentStatus,
        reason: String,
    },
    /// Recorded on the intent and in the audit log, no transition
    Anomaly { intent_id: Uuid, detail: String },
    /// External state could not be read; nothing was changed
    Unknown { intent_id: Uuid, reason: String },
    /// Signal matched no intent
    Unlinked { reference: String },
    Ignored { event_type: String },
}

impl ReconcileOutcome {
    pub fn no_change(intent: &PaymentIntent, reason: impl Into<String>) -> Self {
        ReconcileOutcome::NoChange {
            intent_id: intent.id,
            status: intent.status,
            reason: reason.into(),
        }
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, ReconcileOutcome::Transitioned { .. })
    }
}

/// Fold the result of a transition attempt into an outcome. Losing a race
/// against another writer is not an error at the reconciler boundary.
pub(crate) fn transition_outcome(
    before: &PaymentIntent,
    result: AppResult<PaymentIntent>,
) -> AppResult<ReconcileOutcome> {
    match result {
        Ok(after) => Ok(ReconcileOutcome::Transitioned {
            intent_id: after.id,
            from: before.status,
            to: after.status,
        }),
        Err(AppError::Intent(IntentError::InvalidStateTransition { from, to })) => {
            Ok(ReconcileOutcome::NoChange {
                intent_id: before.id,
                status: from,
                reason: format!("{} -> {} no longer applies", from, to),
            })
        }
        Err(e) => Err(e),
    }
}
