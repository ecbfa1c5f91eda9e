//! Per-IP rate limiting for HTTP endpoints.
//!
//! Each configured endpoint pattern gets its own keyed limiter with an
//! hourly per-IP quota. Unmatched paths pass through unthrottled.

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use indexmap::IndexMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

use crate::web::error::ApiError;

type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Rate limiters built from the `rate_limits` config map, ordered
/// most-specific-first the way the patterns were declared.
pub struct EndpointLimits {
    rules: Vec<(String, IpLimiter)>,
}

impl EndpointLimits {
    pub fn new(rate_limits: &IndexMap<String, u32>) -> Self {
        let rules = rate_limits
            .iter()
            .filter_map(|(pattern, per_hour)| {
                let per_hour = NonZeroU32::new(*per_hour)?;
                Some((
                    pattern.clone(),
                    RateLimiter::keyed(Quota::per_hour(per_hour)),
                ))
            })
            .collect();
        Self { rules }
    }

    /// Check the first matching pattern against the client IP.
    pub fn check(&self, path: &str, ip: IpAddr) -> bool {
        for (pattern, limiter) in &self.rules {
            if path.starts_with(pattern.as_str()) {
                return limiter.check_key(&ip).is_ok();
            }
        }
        true
    }
}

/// Axum middleware enforcing the configured per-IP hourly caps.
pub async fn rate_limit(
    State(limits): State<Arc<EndpointLimits>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if !limits.check(&path, addr.ip()) {
        debug!(path, ip = %addr.ip(), "request rate limited");
        return ApiError::new(
            crate::web::protocol::ErrorKind::RateLimited,
            "too many requests from this address",
        )
        .into_response();
    }
    next.run(request).await
}
