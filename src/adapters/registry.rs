use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::adapters::traits::PaymentGateway;
use crate::ledger::models::Platform;

/// Gateways keyed by the platform they serve
pub struct GatewayRegistry {
    gateways: HashMap<Platform, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        info!("Registering payment gateway: {}", gateway.platform());
        self.gateways.insert(gateway.platform(), gateway);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.gateways.keys().copied().collect();
        platforms.sort_by_key(|platform| platform.as_str());
        platforms
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
