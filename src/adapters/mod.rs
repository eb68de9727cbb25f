pub mod escrow_rpc;
pub mod paypal;
pub mod registry;
pub mod traits;

#[cfg(test)]
pub(crate) mod fakes;

pub use escrow_rpc::EscrowRpcClient;
pub use paypal::PayPalGateway;
pub use registry::GatewayRegistry;
pub use traits::{EscrowChainClient, PaymentGateway};
