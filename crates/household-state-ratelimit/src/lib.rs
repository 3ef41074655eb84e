//! Fixed-window rate limiting keyed by bucket, client identity and optional
//! extra parts (for example a household id).
//!
//! Counters live in a remote REST key-value store when one is configured and
//! fall back to a process-local map whenever it is absent or failing. The
//! limiter itself never fails a request.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

pub mod memory;
pub mod remote;

pub use memory::{MemoryCounterStore, DEFAULT_FALLBACK_CAPACITY};
pub use remote::{RemoteCounterStore, RemoteStoreConfig, RemoteStoreError};

pub const UNKNOWN_CLIENT: &str = "unknown";

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Counter state after one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_at_ms: u64,
}

/// Requests allowed per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitPolicy {
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    fn window_ms(self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

/// Counter key: `rl:{bucket}:{client}[:{part}...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    #[must_use]
    pub fn new(bucket: &str, client: &str) -> Self {
        Self(format!("rl:{bucket}:{client}"))
    }

    #[must_use]
    pub fn with_part(mut self, part: &str) -> Self {
        self.0.push(':');
        self.0.push_str(part);
        self
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: u64,
    /// Present only on rejections.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn evaluate(policy: RateLimitPolicy, counted: WindowCount, now_ms: u64) -> Self {
        let allowed = counted.count <= policy.limit;
        let retry_after_secs = (!allowed).then(|| {
            let wait_ms = counted.reset_at_ms.saturating_sub(now_ms);
            wait_ms.div_ceil(1_000).max(1)
        });
        Self {
            allowed,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(counted.count),
            reset_at_ms: counted.reset_at_ms,
            retry_after_secs,
        }
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` on rejections. Reset is in epoch seconds.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: u64| {
            headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
        };
        put(HEADER_LIMIT, self.limit);
        put(HEADER_REMAINING, self.remaining);
        put(HEADER_RESET, self.reset_at_ms.div_ceil(1_000));
        if let Some(retry_after) = self.retry_after_secs {
            put(HEADER_RETRY_AFTER, retry_after);
        }
        headers
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterConfig {
    pub remote: Option<RemoteStoreConfig>,
    pub fallback_capacity: Option<usize>,
}

#[derive(Debug)]
pub struct RateLimiter {
    remote: Option<RemoteCounterStore>,
    fallback: MemoryCounterStore,
}

impl RateLimiter {
    /// Build a limiter. A remote store whose client cannot be built is logged
    /// and skipped.
    #[must_use]
    pub fn new(config: &RateLimiterConfig) -> Self {
        let remote = config.remote.as_ref().and_then(|remote| {
            match RemoteCounterStore::new(remote) {
                Ok(store) => Some(store),
                Err(err) => {
                    tracing::warn!(error = %err, "remote rate-limit store disabled");
                    None
                }
            }
        });
        Self {
            remote,
            fallback: MemoryCounterStore::new(
                config.fallback_capacity.unwrap_or(DEFAULT_FALLBACK_CAPACITY),
            ),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(&RateLimiterConfig::default())
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Count one request against `key` and decide whether it may proceed.
    pub async fn check(&self, key: &RateLimitKey, policy: RateLimitPolicy) -> RateLimitDecision {
        self.check_at(key, policy, now_ms()).await
    }

    pub async fn check_at(
        &self,
        key: &RateLimitKey,
        policy: RateLimitPolicy,
        now_ms: u64,
    ) -> RateLimitDecision {
        let window_ms = policy.window_ms();
        let counted = match &self.remote {
            Some(remote) => match remote.increment(key.as_str(), window_ms, now_ms).await {
                Ok(counted) => counted,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        key = key.as_str(),
                        "remote rate-limit store unavailable; using in-process counters"
                    );
                    self.fallback.increment(key.as_str(), window_ms, now_ms)
                }
            },
            None => self.fallback.increment(key.as_str(), window_ms, now_ms),
        };

        let decision = RateLimitDecision::evaluate(policy, counted, now_ms);
        tracing::debug!(
            key = key.as_str(),
            count = counted.count,
            allowed = decision.allowed,
            "rate limit evaluated"
        );
        decision
    }
}

/// Client identity from `x-forwarded-for` (first hop), then `x-real-ip`, then
/// the peer address, else [`UNKNOWN_CLIENT`].
#[must_use]
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(ToString::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    fn policy(limit: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, Duration::from_secs(60))
    }

    fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
        headers.get(name)?.to_str().ok()?.parse().ok()
    }

    async fn spawn_pipeline_server(ttl_ms: i64) -> Option<(String, Arc<AtomicU64>)> {
        let counter = Arc::new(AtomicU64::new(0));
        let shared = Arc::clone(&counter);
        let app = Router::new().route(
            "/pipeline",
            post(move |Json(body): Json<Value>| {
                let shared = Arc::clone(&shared);
                async move {
                    assert_eq!(body[0][0], "INCR");
                    assert_eq!(body[1][3], "NX");
                    let count = shared.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!([{"result": count}, {"result": 1}, {"result": ttl_ms}]))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.ok()?;
        let addr = listener.local_addr().ok()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Some((format!("http://{addr}"), counter))
    }

    // Test IDs: TRL-001
    #[tokio::test]
    async fn request_past_the_limit_is_rejected_with_retry_after() {
        let limiter = RateLimiter::in_memory();
        let key = RateLimitKey::new("merge", "203.0.113.7");

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at(&key, policy(3), 1_000).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.retry_after_secs, None);
        }

        let rejected = limiter.check_at(&key, policy(3), 1_000).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        let Some(retry_after) = rejected.retry_after_secs else {
            panic!("rejection must carry retry-after");
        };
        assert!((1..=60).contains(&retry_after));

        let headers = rejected.headers();
        assert_eq!(header_u64(&headers, HEADER_LIMIT), Some(3));
        assert_eq!(header_u64(&headers, HEADER_REMAINING), Some(0));
        assert_eq!(header_u64(&headers, HEADER_RESET), Some(61));
        assert_eq!(header_u64(&headers, HEADER_RETRY_AFTER), Some(60));
    }

    // Test IDs: TRL-002
    #[tokio::test]
    async fn counter_restarts_in_the_next_window() {
        let limiter = RateLimiter::in_memory();
        let key = RateLimitKey::new("merge", "198.51.100.1");
        limiter.check_at(&key, policy(1), 0).await;
        assert!(!limiter.check_at(&key, policy(1), 10).await.allowed);
        assert!(limiter.check_at(&key, policy(1), 60_000).await.allowed);
    }

    // Test IDs: TRL-003
    #[tokio::test]
    async fn household_parts_give_separate_budgets() {
        let limiter = RateLimiter::in_memory();
        let first = RateLimitKey::new("state", "192.0.2.1").with_part("hh-a");
        let second = RateLimitKey::new("state", "192.0.2.1").with_part("hh-b");
        assert_eq!(first.as_str(), "rl:state:192.0.2.1:hh-a");

        limiter.check_at(&first, policy(1), 0).await;
        assert!(!limiter.check_at(&first, policy(1), 0).await.allowed);
        assert!(limiter.check_at(&second, policy(1), 0).await.allowed);
    }

    // Test IDs: TRL-004
    #[tokio::test]
    async fn unreachable_remote_store_falls_back_to_memory() {
        let limiter = RateLimiter::new(&RateLimiterConfig {
            remote: Some(RemoteStoreConfig {
                url: "http://127.0.0.1:1".to_string(),
                token: "token".to_string(),
                timeout: Duration::from_millis(250),
            }),
            fallback_capacity: None,
        });
        assert!(limiter.has_remote());

        let key = RateLimitKey::new("merge", "192.0.2.44");
        assert!(limiter.check(&key, policy(2)).await.allowed);
        assert!(limiter.check(&key, policy(2)).await.allowed);
        let third = limiter.check(&key, policy(2)).await;
        assert!(!third.allowed);
        assert!(third.retry_after_secs.is_some_and(|secs| secs <= 60));
    }

    // Test IDs: TRL-005
    #[tokio::test]
    async fn remote_store_counts_are_used_when_reachable() {
        let Some((url, counter)) = spawn_pipeline_server(30_000).await else {
            panic!("test pipeline server failed to start");
        };
        let limiter = RateLimiter::new(&RateLimiterConfig {
            remote: Some(RemoteStoreConfig {
                url,
                token: "secret".to_string(),
                timeout: Duration::from_secs(2),
            }),
            fallback_capacity: None,
        });
        let key = RateLimitKey::new("merge", "192.0.2.9");

        let first = limiter.check_at(&key, policy(1), 10_000).await;
        assert!(first.allowed);
        assert_eq!(first.reset_at_ms, 40_000);
        let second = limiter.check_at(&key, policy(1), 10_000).await;
        assert!(!second.allowed);
        assert_eq!(second.retry_after_secs, Some(30));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(limiter.fallback.is_empty());
    }

    // Test IDs: TRL-006
    #[test]
    fn client_identity_prefers_forwarded_headers() {
        let peer = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 4000));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.1 , 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_identity(&headers, peer), "203.0.113.1");

        headers.remove("x-forwarded-for");
        assert_eq!(client_identity(&headers, peer), "198.51.100.2");

        assert_eq!(client_identity(&HeaderMap::new(), peer), "10.0.0.5");
        assert_eq!(client_identity(&HeaderMap::new(), None), UNKNOWN_CLIENT);
    }
}
