use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::ErrorResponse;

/// Shared token bucket for a group of routes
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitLayer {
    /// `requests` per `per_seconds`, with a burst of `requests`.
    /// Zero values are raised to one.
    pub fn new(requests: u32, per_seconds: u64) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_secs(per_seconds.max(1)) / burst.get();
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        RateLimitLayer {
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn check(&self) -> Result<(), Response> {
        self.limiter.check().map_err(|_| {
            let body = Json(ErrorResponse {
                error: "Rate limit exceeded. Please try again later.".to_string(),
                error_code: "RATE_LIMITED".to_string(),
                details: None,
            });
            (StatusCode::TOO_MANY_REQUESTS, body).into_response()
        })
    }
}

/// Use with `axum::middleware::from_fn_with_state`
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Response {
    if let Err(rejected) = limiter.check() {
        warn!("🚦 Rate limit hit on {}", req.uri().path());
        return rejected;
    }
    next.run(req).await
}
