use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    adapters::{EscrowChainClient, EscrowRpcClient, GatewayRegistry, PayPalGateway},
    api::handler::AppState,
    config::Config,
    error::AppResult,
    intent::IntentStateMachine,
    ledger::{InMemoryLedger, LedgerRepository, QuotaLedger, SettlementStore},
    notifications::NotificationHub,
    reconciliation::{ChainReconciler, GatewayReconciler},
    settlement::{ExpirySweep, RecoverySweep},
};

/// Gateway call bound when no gateway config says otherwise
const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Store
    let (store, store_kind): (Arc<dyn SettlementStore>, &'static str) =
        match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = initialize_database(database_url).await?;
                (Arc::new(LedgerRepository::new(pool)), "postgres")
            }
            None => {
                warn!("⚠️  DATABASE_URL not set - using the in-memory store, nothing is persisted");
                (Arc::new(InMemoryLedger::new()), "memory")
            }
        };

    // Core components
    let hub = Arc::new(NotificationHub::new());
    let machine = Arc::new(IntentStateMachine::new(
        store.clone(),
        hub.clone(),
        config.lifecycle.clone(),
    ));
    let quota = Arc::new(QuotaLedger::new(store.clone()));

    // Gateways
    info!("⚙️  Initializing payment gateways...");
    let mut registry = GatewayRegistry::new();
    let gateway_timeout = match &config.paypal {
        Some(paypal) => {
            registry.register(Arc::new(PayPalGateway::new(paypal.clone())?));
            info!("✅ PayPal gateway registered");
            if paypal.webhook_id.is_none() {
                warn!("⚠️  PAYPAL_WEBHOOK_ID not set - PayPal webhooks will be rejected");
            }
            paypal.request_timeout
        }
        None => {
            warn!("⚠️  PAYPAL_CLIENT_ID / PAYPAL_CLIENT_SECRET not set - PayPal disabled");
            DEFAULT_GATEWAY_TIMEOUT
        }
    };
    let gateways = Arc::new(registry);
    let gateway = Arc::new(GatewayReconciler::new(
        machine.clone(),
        store.clone(),
        gateways.clone(),
        gateway_timeout,
    ));

    // Chain
    let chain = match &config.chain.rpc_url {
        Some(rpc_url) => {
            let client: Arc<dyn EscrowChainClient> = Arc::new(EscrowRpcClient::new(
                rpc_url.clone(),
                config.chain.contract_address.clone(),
                config.chain.request_timeout,
            )?);
            info!("✅ Escrow client connected to {}", rpc_url);
            Some(Arc::new(ChainReconciler::new(
                machine.clone(),
                store.clone(),
                client,
                &config.chain,
            )))
        }
        None => {
            warn!("⚠️  ESCROW_RPC_URL not set - chain reconciliation disabled");
            None
        }
    };

    // The task pool is a projection; rebuild it from the intents on start
    let projected = store.rebuild_task_pool().await?;
    info!("✅ Task pool rebuilt with {} entries", projected);

    // Background sweeps
    let recovery = Arc::new(RecoverySweep::new(
        machine.clone(),
        quota.clone(),
        config.sweeps.clone(),
    ));
    recovery.start();
    let expiry = Arc::new(ExpirySweep::new(
        machine.clone(),
        config.sweeps.expiry_interval,
    ));
    expiry.start();
    info!("✅ Recovery and expiry sweeps started");

    Ok(AppState {
        machine,
        quota,
        gateway,
        gateways,
        chain,
        hub,
        store,
        store_kind,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
