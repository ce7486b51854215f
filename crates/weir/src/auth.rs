use crate::config::TokenSpec;
use crate::Error;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Extract the bearer token from an `Authorization` header value.
/// Missing or malformed credentials are indistinguishable from unknown
/// tokens on the wire: both surface as UNAUTHENTICATED.
pub fn bearer(headers: &axum::http::HeaderMap) -> Result<&str, Error> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Unauthenticated)?;

    value.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty()).ok_or(Error::Unauthenticated)
}

/// Authenticate a request against the registry derived from the current
/// config snapshot. Inactive tokens are rejected exactly like unknown ones.
pub fn authenticate<'h, 's>(
    snapshot: &'s crate::config::Snapshot,
    headers: &'h axum::http::HeaderMap,
) -> Result<(&'h str, &'s TokenSpec), Error> {
    let token = bearer(headers)?;
    let spec = snapshot.token(token).ok_or(Error::Unauthenticated)?;
    if !spec.active {
        return Err(Error::Unauthenticated);
    }
    Ok((token, spec))
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// A token-bucket rate limiter keyed by bearer token. Buckets live in a
/// bounded cache so that arbitrary unknown tokens cannot grow memory without
/// limit, and they survive config reloads because the key is the token
/// string itself rather than anything snapshot-derived.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: moka::sync::Cache<String, Arc<Mutex<Bucket>>>,
}

impl RateLimiter {
    pub const MAX_BUCKETS: u64 = 10_000;

    pub fn new() -> Self {
        Self {
            buckets: moka::sync::Cache::new(Self::MAX_BUCKETS),
        }
    }

    /// Consume one token from `token`'s bucket, creating it at full burst
    /// capacity on first use. Returns false when the bucket is exhausted.
    pub fn check(&self, token: &str, spec: &TokenSpec) -> bool {
        self.check_at(token, spec, Instant::now())
    }

    fn check_at(&self, token: &str, spec: &TokenSpec, now: Instant) -> bool {
        let bucket = self.buckets.get_with_by_ref(token, || {
            Arc::new(Mutex::new(Bucket {
                tokens: spec.rate_limit_burst,
                refilled: now,
            }))
        });
        let mut bucket = bucket.lock().unwrap();

        let elapsed = now.saturating_duration_since(bucket.refilled);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * spec.rate_limit_rps)
            .min(spec.rate_limit_burst);
        bucket.refilled = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
