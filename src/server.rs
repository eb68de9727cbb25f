use axum::{
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            assign_blockchain_id, cancel_intent, capture_paypal_order, claim_task,
            confirm_intent, create_intent, create_paypal_order, dispute_intent, get_audit_log,
            get_chain_status, get_intent, get_lp, get_paypal_status, get_task_pool, health_check,
            list_user_intents, mark_paid, paypal_client_report, paypal_webhook, register_lp,
            resolve_dispute, update_quota, withdraw, withdraw_complete, AppState,
        },
        streaming::stream_notifications,
    },
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
};

/// Outer bound on a request; gateway and chain calls time out well before this
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn create_app(state: AppState, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Webhooks and claims are the routes hammered by retries and competing LPs
    let webhook_limit = RateLimitLayer::new(200, 60);
    let claim_limit = RateLimitLayer::new(60, 60);

    let intents = Router::new()
        .route("/intents", post(create_intent))
        .route("/intents/:id", get(get_intent))
        .route("/intents/user/:wallet", get(list_user_intents))
        .route("/intents/:id/cancel", post(cancel_intent))
        .route("/intents/:id/confirm", post(confirm_intent))
        .route("/intents/:id/blockchain-id", post(assign_blockchain_id))
        .route("/intents/:id/chain-status", get(get_chain_status))
        .route("/intents/:id/withdraw", post(withdraw))
        .route("/intents/:id/withdraw-complete", post(withdraw_complete))
        .route("/intents/:id/dispute", post(dispute_intent))
        .route("/admin/intents/:id/resolve-dispute", post(resolve_dispute))
        .route("/admin/intents/:id/audit", get(get_audit_log));

    let lp = Router::new()
        .route("/lp/register", post(register_lp))
        .route("/lp/quota", put(update_quota))
        .route("/lp/task-pool", get(get_task_pool))
        .route("/lp/:wallet", get(get_lp))
        .route("/lp/tasks/:id/mark-paid", post(mark_paid))
        .merge(
            Router::new()
                .route("/lp/tasks/:id/claim", post(claim_task))
                .route_layer(from_fn_with_state(claim_limit, rate_limit_middleware)),
        );

    let paypal = Router::new()
        .route("/paypal/orders", post(create_paypal_order))
        .route("/paypal/orders/:intent_id/capture", post(capture_paypal_order))
        .route("/paypal/status/:intent_id", get(get_paypal_status))
        .route(
            "/paypal/orders/:intent_id/client-report",
            post(paypal_client_report),
        )
        .merge(
            Router::new()
                .route("/webhooks/paypal", post(paypal_webhook))
                .route_layer(from_fn_with_state(webhook_limit, rate_limit_middleware)),
        );

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws/:topic", get(stream_notifications))
        .nest("/api/v1", intents.merge(lp).merge(paypal))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(create_cors_layer(cors_origins))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    REQUEST_TIMEOUT,
                )),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::{ScriptedGateway, SCRIPTED_SIGNATURE};
    use crate::adapters::traits::GatewayOrderStatus;
    use crate::adapters::GatewayRegistry;
    use crate::config::LifecycleConfig;
    use crate::intent::IntentStateMachine;
    use crate::ledger::memory::InMemoryLedger;
    use crate::ledger::quota::QuotaLedger;
    use crate::notifications::NotificationHub;
    use crate::reconciliation::GatewayReconciler;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app() -> Router {
        test_app_with_gateway().0
    }

    fn test_app_with_gateway() -> (Router, Arc<ScriptedGateway>) {
        let store = Arc::new(InMemoryLedger::new());
        let hub = Arc::new(NotificationHub::new());
        let machine = Arc::new(IntentStateMachine::new(
            store.clone(),
            hub.clone(),
            LifecycleConfig::default(),
        ));
        let scripted = Arc::new(ScriptedGateway::new());
        let mut registry = GatewayRegistry::new();
        registry.register(scripted.clone());
        let gateways = Arc::new(registry);
        let gateway = Arc::new(GatewayReconciler::new(
            machine.clone(),
            store.clone(),
            gateways.clone(),
            Duration::from_secs(1),
        ));
        let state = AppState {
            machine,
            quota: Arc::new(QuotaLedger::new(store.clone())),
            gateway,
            gateways,
            chain: None,
            hub,
            store,
            store_kind: "memory",
        };
        (create_app(state, &[]), scripted)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        dispatch(app, builder, body).await
    }

    async fn deliver_webhook(app: &Router, signature: &str, event: Value) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method("POST")
            .uri("/api/v1/webhooks/paypal")
            .header("content-type", "application/json")
            .header("paypal-transmission-id", "tx-test")
            .header("paypal-transmission-sig", signature);
        dispatch(app, builder, Some(event)).await
    }

    async fn dispatch(
        app: &Router,
        builder: axum::http::request::Builder,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_intent_claim_and_double_claim() {
        let app = test_app();

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/lp/register",
            Some(json!({
                "wallet_address": "0xlp",
                "name": "Desk",
                "email": "desk@example.com",
                "total_quota": 1000,
                "per_transaction_quota": 500,
                "fee_rate": 0.5,
                "supported_platforms": ["PayPal"],
                "paypal_email": "desk@example.com"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, intent) = send(
            &app,
            "POST",
            "/api/v1/intents",
            Some(json!({
                "amount": 100,
                "currency": "usd",
                "user_wallet_address": "0xuser",
                "merchant_info": { "platform": "PayPal", "email": "shop@example.com" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", intent);
        assert_eq!(intent["currency"], "USD");
        assert_eq!(intent["fees"]["total_amount"], 100.5);
        let id = intent["id"].as_str().unwrap().to_string();

        let (status, pool) = send(&app, "GET", "/api/v1/lp/task-pool?min_amount=50", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool["count"], 1);

        let claim_uri = format!("/api/v1/lp/tasks/{}/claim", id);
        let (status, claimed) =
            send(&app, "POST", &claim_uri, Some(json!({ "wallet_address": "0xlp" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["status"], "claimed");

        let (status, err) =
            send(&app, "POST", &claim_uri, Some(json!({ "wallet_address": "0xlp" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error_code"], "TASK_ALREADY_CLAIMED");

        let (_, lp) = send(&app, "GET", "/api/v1/lp/0xlp", None).await;
        assert_eq!(lp["locked_quota"], 100.0);
        assert_eq!(lp["available_quota"], 900.0);
    }

    #[tokio::test]
    async fn test_validation_and_missing_chain_client() {
        let app = test_app();

        let (status, err) = send(
            &app,
            "POST",
            "/api/v1/intents",
            Some(json!({
                "amount": -5,
                "currency": "USD",
                "user_wallet_address": "0xuser",
                "merchant_info": { "platform": "PayPal", "email": "shop@example.com" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error_code"], "VALIDATION_ERROR");

        let uri = format!("/api/v1/intents/{}/chain-status", uuid::Uuid::new_v4());
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_webhook_is_acknowledged() {
        let app = test_app();
        let (status, body) = deliver_webhook(
            &app,
            SCRIPTED_SIGNATURE,
            json!({ "id": "WH-1", "event_type": "BILLING.PLAN.CREATED", "resource": {} }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "ignored");
    }

    #[tokio::test]
    async fn test_unsigned_webhook_is_rejected() {
        let app = test_app();
        let (status, body) = deliver_webhook(
            &app,
            "not-a-signature",
            json!({ "id": "WH-2", "event_type": "PAYMENT.CAPTURE.COMPLETED", "resource": {} }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_unlinked_capture_webhook_is_acknowledged() {
        let app = test_app();
        let (status, body) = deliver_webhook(
            &app,
            SCRIPTED_SIGNATURE,
            capture_event("WH-3", "CAP-NOBODY", "ORDER-NOBODY"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "unlinked");
    }

    fn capture_event(event_id: &str, capture_id: &str, order_id: &str) -> Value {
        json!({
            "id": event_id,
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": capture_id,
                "status": "COMPLETED",
                "amount": { "currency_code": "USD", "value": "100.00" },
                "supplementary_data": { "related_ids": { "order_id": order_id } }
            }
        })
    }

    /// Registers an LP, creates and claims an intent, and opens its order
    async fn intent_with_open_order(app: &Router) -> (String, String) {
        send(
            app,
            "POST",
            "/api/v1/lp/register",
            Some(json!({
                "wallet_address": "0xlp",
                "name": "Desk",
                "total_quota": 1000,
                "per_transaction_quota": 500,
                "fee_rate": 0.5,
                "supported_platforms": ["PayPal"],
                "paypal_email": "desk@example.com"
            })),
        )
        .await;
        let (_, intent) = send(
            app,
            "POST",
            "/api/v1/intents",
            Some(json!({
                "amount": 100,
                "currency": "USD",
                "user_wallet_address": "0xuser",
                "merchant_info": { "platform": "PayPal", "email": "shop@example.com" }
            })),
        )
        .await;
        let id = intent["id"].as_str().unwrap().to_string();
        send(
            app,
            "POST",
            &format!("/api/v1/lp/tasks/{}/claim", id),
            Some(json!({ "wallet_address": "0xlp" })),
        )
        .await;
        let (status, created) = send(
            app,
            "POST",
            "/api/v1/paypal/orders",
            Some(json!({ "intent_id": id, "wallet_address": "0xlp" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", created);
        let order_id = created["order"]["order_id"].as_str().unwrap().to_string();
        (id, order_id)
    }

    #[tokio::test]
    async fn test_capture_webhook_without_gateway_capture_changes_nothing() {
        let (app, _) = test_app_with_gateway();
        let (id, order_id) = intent_with_open_order(&app).await;

        let (status, body) = deliver_webhook(
            &app,
            SCRIPTED_SIGNATURE,
            capture_event("WH-4", "CAP-FORGED", &order_id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "no_change");

        let (_, intent) = send(&app, "GET", &format!("/api/v1/intents/{}", id), None).await;
        assert_eq!(intent["status"], "processing");
    }

    #[tokio::test]
    async fn test_duplicate_capture_webhook_confirms_once() {
        let (app, gateway) = test_app_with_gateway();
        let (id, order_id) = intent_with_open_order(&app).await;
        gateway.set_status(&order_id, GatewayOrderStatus::Completed);
        let capture_id = format!("CAP-{}", order_id);

        let (status, first) = deliver_webhook(
            &app,
            SCRIPTED_SIGNATURE,
            capture_event("WH-5", &capture_id, &order_id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["outcome"], "transitioned");
        assert_eq!(first["to"], "confirmed");

        let (status, second) = deliver_webhook(
            &app,
            SCRIPTED_SIGNATURE,
            capture_event("WH-5", &capture_id, &order_id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["outcome"], "no_change");

        let (_, intent) = send(&app, "GET", &format!("/api/v1/intents/{}", id), None).await;
        assert_eq!(intent["status"], "confirmed");
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["chain_client"], false);
    }
}
