use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::models::RefundRecord;

/// What a gateway event means for the intent it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    CaptureCompleted,
    CaptureDenied,
    CaptureRefunded,
    CaptureReversed,
    OrderCancelled,
}

/// Gateway event reduced to the ids needed to find its intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewaySignal {
    pub event_id: Option<String>,
    pub event_type: String,
    pub kind: SignalKind,
    pub order_id: Option<String>,
    pub capture_id: Option<String>,
    pub amount: Option<String>,
    pub refund: Option<RefundRecord>,
}

impl GatewaySignal {
    /// Human readable reference for logs and audit rows
    pub fn reference(&self) -> String {
        match (&self.capture_id, &self.order_id) {
            (Some(capture), _) => format!("capture {}", capture),
            (None, Some(order)) => format!("order {}", order),
            (None, None) => format!("event {}", self.event_id.as_deref().unwrap_or("?")),
        }
    }
}

// ========== PAYPAL WEBHOOK PAYLOAD ==========

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub resource: Option<WebhookResource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookResource {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<WebhookAmount>,
    #[serde(default)]
    pub supplementary_data: Option<SupplementaryData>,
    #[serde(default)]
    pub links: Vec<WebhookLink>,
    #[serde(default)]
    pub update_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAmount {
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupplementaryData {
    #[serde(default)]
    pub related_ids: Option<RelatedIds>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatedIds {
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookLink {
    pub href: String,
    pub rel: String,
}

impl WebhookResource {
    fn related_order_id(&self) -> Option<String> {
        self.supplementary_data
            .as_ref()
            .and_then(|data| data.related_ids.as_ref())
            .and_then(|ids| ids.order_id.clone())
    }

    /// Capture a refund points back to: last path segment of the "up" link
    fn parent_capture_id(&self) -> Option<String> {
        self.links
            .iter()
            .find(|link| link.rel == "up" || link.rel == "capture")
            .and_then(|link| link.href.trim_end_matches('/').rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    }
}

impl WebhookEnvelope {
    /// `None` for event types the engine does not act on
    pub fn into_signal(self) -> Option<GatewaySignal> {
        let kind = match self.event_type.as_str() {
            "PAYMENT.CAPTURE.COMPLETED" => SignalKind::CaptureCompleted,
            "PAYMENT.CAPTURE.DENIED" => SignalKind::CaptureDenied,
            "PAYMENT.CAPTURE.REFUNDED" => SignalKind::CaptureRefunded,
            "PAYMENT.CAPTURE.REVERSED" => SignalKind::CaptureReversed,
            "CHECKOUT.ORDER.CANCELLED" | "CHECKOUT.PAYMENT.CANCELLED" => SignalKind::OrderCancelled,
            _ => return None,
        };
        let resource = self.resource.unwrap_or_default();
        let amount = resource.amount.as_ref().map(|a| a.value.clone());

        let (order_id, capture_id, refund) = match kind {
            SignalKind::OrderCancelled => (resource.id.clone(), None, None),
            SignalKind::CaptureRefunded => {
                let refund = resource.id.clone().map(|refund_id| RefundRecord {
                    refund_id,
                    status: resource.status.clone(),
                    refunded_at: resource.update_time.unwrap_or_else(Utc::now),
                });
                (resource.related_order_id(), resource.parent_capture_id(), refund)
            }
            _ => (resource.related_order_id(), resource.id.clone(), None),
        };

        Some(GatewaySignal {
            event_id: self.id,
            event_type: self.event_type,
            kind,
            order_id,
            capture_id,
            amount,
            refund,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Option<GatewaySignal> {
        serde_json::from_str::<WebhookEnvelope>(raw)
            .unwrap()
            .into_signal()
    }

    #[test]
    fn test_capture_completed_links_capture_and_order() {
        let signal = parse(
            r#"{
                "id": "WH-1",
                "event_type": "PAYMENT.CAPTURE.COMPLETED",
                "resource": {
                    "id": "CAP-9",
                    "status": "COMPLETED",
                    "amount": {"currency_code": "USD", "value": "100.00"},
                    "supplementary_data": {"related_ids": {"order_id": "ORDER-9"}}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(signal.kind, SignalKind::CaptureCompleted);
        assert_eq!(signal.capture_id.as_deref(), Some("CAP-9"));
        assert_eq!(signal.order_id.as_deref(), Some("ORDER-9"));
        assert_eq!(signal.amount.as_deref(), Some("100.00"));
    }

    #[test]
    fn test_refund_points_to_parent_capture() {
        let signal = parse(
            r#"{
                "id": "WH-2",
                "event_type": "PAYMENT.CAPTURE.REFUNDED",
                "resource": {
                    "id": "REF-1",
                    "status": "COMPLETED",
                    "links": [
                        {"href": "https://api.paypal.com/v2/payments/refunds/REF-1", "rel": "self"},
                        {"href": "https://api.paypal.com/v2/payments/captures/CAP-9", "rel": "up"}
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(signal.capture_id.as_deref(), Some("CAP-9"));
        let refund = signal.refund.unwrap();
        assert_eq!(refund.refund_id, "REF-1");
        assert_eq!(refund.status.as_deref(), Some("COMPLETED"));
    }

    #[test]
    fn test_order_cancellation_uses_order_id() {
        let signal = parse(
            r#"{"event_type": "CHECKOUT.PAYMENT.CANCELLED", "resource": {"id": "ORDER-3"}}"#,
        )
        .unwrap();
        assert_eq!(signal.kind, SignalKind::OrderCancelled);
        assert_eq!(signal.order_id.as_deref(), Some("ORDER-3"));
        assert!(signal.capture_id.is_none());
    }

    #[test]
    fn test_unhandled_event_is_dropped() {
        assert!(parse(r#"{"event_type": "BILLING.PLAN.CREATED", "resource": {}}"#).is_none());
    }
}
