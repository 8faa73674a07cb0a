use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Per-client request budget shared by every instance of the service.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one request for `key`; `false` once the budget is spent.
    async fn check(&self, key: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct RedisRateLimiter {
    client: redis::Client,
    limit: i64,
    window_seconds: i64,
}

impl RedisRateLimiter {
    pub fn new(connection_string: &str, limit: i64, window_seconds: i64) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client, limit, window_seconds })
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, key: &str) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("ratelimit:{}", key);

        let (count,): (i64,) = window_pipeline(&key, self.window_seconds)
            .query_async(&mut conn)
            .await?;

        Ok(count <= self.limit)
    }
}

/// Counts a hit in a fixed window. `NX` starts the TTL on the first hit
/// only, so steady traffic cannot keep the counter alive (Redis 7+).
fn window_pipeline(key: &str, window_seconds: i64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .incr(key, 1)
        .cmd("EXPIRE")
        .arg(key)
        .arg(window_seconds)
        .arg("NX")
        .ignore();
    pipe
}

/// First `X-Forwarded-For` hop, falling back to the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(
    State(limiter): State<Option<Arc<dyn RateLimiter>>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = limiter else {
        return next.run(req).await;
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(req.headers(), peer);

    match limiter.check(&key).await {
        Ok(true) => next.run(req).await,
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response(),
        Err(e) => {
            warn!("Rate limiter unavailable, letting request through: {}", e);
            next.run(req).await
        }
    }
}
