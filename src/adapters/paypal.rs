use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::traits::{
    CreateOrderRequest, GatewayCapture, GatewayOrder, GatewayOrderStatus, PaymentGateway,
    WebhookHeaders,
};
use crate::config::PayPalConfig;
use crate::error::{AppError, AppResult, ReconcileError};
use crate::ledger::models::Platform;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct Amount {
    value: String,
}

#[derive(Debug, Deserialize)]
struct CaptureResource {
    id: String,
    status: Option<String>,
    amount: Option<Amount>,
}

#[derive(Debug, Default, Deserialize)]
struct Payments {
    #[serde(default)]
    captures: Vec<CaptureResource>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<Payments>,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

impl VerificationResponse {
    fn is_success(&self) -> bool {
        self.verification_status.eq_ignore_ascii_case("SUCCESS")
    }
}

/// Order as returned by the orders API; everything but the id is optional
#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: Option<String>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

impl OrderResponse {
    fn order_status(&self) -> GatewayOrderStatus {
        self.status
            .as_deref()
            .map(GatewayOrderStatus::parse)
            .unwrap_or_else(|| GatewayOrderStatus::Other("UNKNOWN".to_string()))
    }

    fn approval_url(&self) -> Option<String> {
        self.links
            .iter()
            .find(|link| link.rel == "approve" || link.rel == "payer-action")
            .map(|link| link.href.clone())
    }

    fn first_capture(&self) -> Option<&CaptureResource> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .flat_map(|payments| payments.captures.iter())
            .next()
    }

    fn into_capture(self) -> GatewayCapture {
        let order_status = self.order_status();
        let capture = self.first_capture();
        GatewayCapture {
            order_id: self.id.clone(),
            order_status,
            capture_id: capture.map(|c| c.id.clone()),
            capture_status: capture.and_then(|c| c.status.clone()),
            amount: capture.and_then(|c| c.amount.as_ref().map(|a| a.value.clone())),
        }
    }
}

/// PayPal REST (v2 orders) gateway
pub struct PayPalGateway {
    config: PayPalConfig,
    client: Client,
    token: RwLock<Option<AccessToken>>,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("PayPal HTTP client: {}", e)))?;

        info!("✅ PayPal gateway configured against {}", config.base_url);
        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> AppResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.token.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.base_url))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = check(response).await?.json().await?;

        // Refresh a minute early
        let expires_at = Utc::now() + Duration::seconds((token.expires_in - 60).max(0));
        *self.token.write().await = Some(AccessToken {
            token: token.access_token.clone(),
            expires_at,
        });
        debug!("🔑 PayPal access token refreshed");

        Ok(token.access_token)
    }

    fn orders_url(&self) -> String {
        format!("{}/v2/checkout/orders", self.config.base_url)
    }
}

/// Map non-success responses: client errors are answers, the rest means unavailable
async fn check(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!("⚠️ PayPal returned {}: {}", status, body);
    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::TOO_MANY_REQUESTS => {
            ReconcileError::ExternalUnavailable(format!("PayPal {}: {}", status, body))
        }
        s if s.is_client_error() => {
            ReconcileError::Unreconcilable(format!("PayPal {}: {}", status, body))
        }
        _ => ReconcileError::ExternalUnavailable(format!("PayPal {}: {}", status, body)),
    };
    Err(error.into())
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn platform(&self) -> Platform {
        Platform::PayPal
    }

    async fn create_order(&self, request: &CreateOrderRequest) -> AppResult<GatewayOrder> {
        let token = self.access_token().await?;
        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.intent_id.to_string(),
                "amount": {
                    "currency_code": request.currency,
                    "value": request.amount.round_dp(2).to_string(),
                },
                "payee": { "email_address": request.payee },
            }],
            "application_context": {
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
            },
        });

        let response = self
            .client
            .post(self.orders_url())
            .bearer_auth(token)
            .header("Prefer", "return=representation")
            .header("PayPal-Request-Id", request.intent_id.to_string())
            .json(&body)
            .send()
            .await?;
        let order: OrderResponse = check(response).await?.json().await?;

        info!("💳 PayPal order {} created for intent {}", order.id, request.intent_id);
        Ok(GatewayOrder {
            status: order.order_status(),
            approval_url: order.approval_url(),
            order_id: order.id,
        })
    }

    async fn capture_order(&self, order_id: &str) -> AppResult<GatewayCapture> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}/{}/capture", self.orders_url(), order_id))
            .bearer_auth(token)
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let order: OrderResponse = check(response).await?.json().await?;

        let capture = order.into_capture();
        info!(
            "💰 PayPal order {} captured: {} (capture {:?})",
            order_id, capture.order_status, capture.capture_id
        );
        Ok(capture)
    }

    async fn get_order(&self, order_id: &str) -> AppResult<GatewayCapture> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/{}", self.orders_url(), order_id))
            .bearer_auth(token)
            .send()
            .await?;
        let order: OrderResponse = check(response).await?.json().await?;
        Ok(order.into_capture())
    }

    async fn verify_webhook(
        &self,
        headers: &WebhookHeaders,
        event: &serde_json::Value,
    ) -> AppResult<bool> {
        let Some(webhook_id) = self.config.webhook_id.as_deref() else {
            warn!("⚠️ PAYPAL_WEBHOOK_ID not set - rejecting webhook delivery");
            return Ok(false);
        };
        if !headers.is_complete() {
            warn!("⚠️ PayPal webhook delivery is missing transmission headers");
            return Ok(false);
        }

        let token = self.access_token().await?;
        let body = serde_json::json!({
            "auth_algo": headers.auth_algo,
            "cert_url": headers.cert_url,
            "transmission_id": headers.transmission_id,
            "transmission_sig": headers.transmission_sig,
            "transmission_time": headers.transmission_time,
            "webhook_id": webhook_id,
            "webhook_event": event,
        });
        let response = self
            .client
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.config.base_url
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let verification: VerificationResponse = check(response).await?.json().await?;

        debug!(
            "🔏 PayPal webhook {:?} verification: {}",
            headers.transmission_id, verification.verification_status
        );
        Ok(verification.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_created_order() {
        let raw = r#"{
            "id": "5O190127TN364715T",
            "status": "CREATED",
            "links": [
                {"href": "https://api.paypal.com/v2/checkout/orders/5O190127TN364715T", "rel": "self", "method": "GET"},
                {"href": "https://www.paypal.com/checkoutnow?token=5O190127TN364715T", "rel": "approve", "method": "GET"}
            ]
        }"#;
        let order: OrderResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(order.order_status(), GatewayOrderStatus::Created);
        assert_eq!(
            order.approval_url().as_deref(),
            Some("https://www.paypal.com/checkoutnow?token=5O190127TN364715T")
        );
        assert!(order.first_capture().is_none());
    }

    #[test]
    fn test_decode_captured_order() {
        let raw = r#"{
            "id": "5O190127TN364715T",
            "status": "COMPLETED",
            "purchase_units": [{
                "reference_id": "d9f80740",
                "payments": {
                    "captures": [{
                        "id": "3C679366HH908993F",
                        "status": "COMPLETED",
                        "amount": {"currency_code": "USD", "value": "100.00"}
                    }]
                }
            }]
        }"#;
        let order: OrderResponse = serde_json::from_str(raw).unwrap();
        let capture = order.into_capture();
        assert!(capture.is_completed());
        assert_eq!(capture.capture_id.as_deref(), Some("3C679366HH908993F"));
        assert_eq!(capture.amount.as_deref(), Some("100.00"));
    }

    #[test]
    fn test_decode_verification_status() {
        let ok: VerificationResponse =
            serde_json::from_str(r#"{"verification_status": "SUCCESS"}"#).unwrap();
        let bad: VerificationResponse =
            serde_json::from_str(r#"{"verification_status": "FAILURE"}"#).unwrap();
        assert!(ok.is_success());
        assert!(!bad.is_success());
    }

    #[tokio::test]
    async fn test_webhook_without_webhook_id_is_rejected() {
        let gateway = PayPalGateway::new(PayPalConfig {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            return_url: "http://localhost/ok".to_string(),
            cancel_url: "http://localhost/cancel".to_string(),
            webhook_id: None,
            request_timeout: std::time::Duration::from_secs(1),
        })
        .unwrap();
        let verified = gateway
            .verify_webhook(&WebhookHeaders::default(), &serde_json::json!({}))
            .await
            .unwrap();
        assert!(!verified);
    }

    #[test]
    fn test_decode_order_without_optional_fields() {
        let order: OrderResponse = serde_json::from_str(r#"{"id": "X"}"#).unwrap();
        let capture = order.into_capture();
        assert!(!capture.is_completed());
        assert!(capture.capture_id.is_none());
    }
}
