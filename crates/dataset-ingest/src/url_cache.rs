// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Memoization of short-lived retrieval URLs.
//!
//! [`SecureUrlCache`] sits in front of [`ObjectStore::issue_retrieval_url`].
//! Entries are keyed by a canonical serialization of the request, served
//! until they come within a safety buffer of expiry, and evicted when the
//! cache grows past its capacity. Concurrent requests for the same key share
//! a single issuance call.

use crate::{
    Error, ObjectStore,
    limiter::ConcurrencyLimiter,
    storage::RetrievalOptions,
};
use futures::{
    FutureExt as _,
    future::{BoxFuture, Shared},
};
use log::{debug, trace, warn};
use serde_json::{Map, Value, json};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

type PendingUrl = Shared<BoxFuture<'static, Result<String, String>>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    url: String,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    inflight: HashMap<String, PendingUrl>,
}

/// Session-wide cache of retrieval URLs.
///
/// Cloning shares the underlying entries, in-flight map and issuance limiter.
#[derive(Clone)]
pub struct SecureUrlCache {
    store: Arc<dyn ObjectStore>,
    limiter: ConcurrencyLimiter,
    capacity: usize,
    buffer: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl std::fmt::Debug for SecureUrlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureUrlCache")
            .field("capacity", &self.capacity)
            .field("buffer", &self.buffer)
            .field("issue_limit", &self.limiter.limit())
            .field("entries", &self.len())
            .finish()
    }
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(String, Value)> = map.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, canonical(v)))
                    .collect::<Map<_, _>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Stable key for a retrieval request; equivalent transforms collide.
pub fn cache_key(bucket: &str, path: &str, options: &RetrievalOptions) -> String {
    let transform = options
        .transform
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok())
        .unwrap_or(Value::Null);
    canonical(json!({
        "bucket": bucket,
        "path": path,
        "ttl": options.ttl_seconds,
        "transform": transform,
    }))
    .to_string()
}

impl SecureUrlCache {
    /// Create a cache holding at most `capacity` entries, treating entries as
    /// stale `buffer` before they expire, and issuing at most `issue_limit`
    /// URLs at once.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        capacity: usize,
        buffer: Duration,
        issue_limit: usize,
    ) -> Self {
        Self {
            store,
            limiter: ConcurrencyLimiter::new(issue_limit),
            capacity: capacity.max(1),
            buffer,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached entries, stale or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached entry. In-flight requests are unaffected.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Return a retrieval URL for `bucket/path`, issuing one only when no
    /// fresh entry or in-flight request exists for the same key.
    ///
    /// When a request with a transform fails, the same path is requested once
    /// more without the transform.
    pub async fn get_url(
        &self,
        bucket: &str,
        path: &str,
        options: &RetrievalOptions,
    ) -> Result<String, Error> {
        let key = cache_key(bucket, path, options);

        let pending = {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get(&key) {
                if Instant::now() + self.buffer < entry.expires_at {
                    trace!("URL cache hit for {}/{}", bucket, path);
                    return Ok(entry.url.clone());
                }
            }

            match state.inflight.get(&key) {
                Some(pending) => {
                    trace!("Joining in-flight URL request for {}/{}", bucket, path);
                    pending.clone()
                }
                None => {
                    let pending = self.issue(key.clone(), bucket, path, options);
                    state.inflight.insert(key, pending.clone());
                    pending
                }
            }
        };

        pending.await.map_err(Error::UrlIssue)
    }

    fn issue(
        &self,
        key: String,
        bucket: &str,
        path: &str,
        options: &RetrievalOptions,
    ) -> PendingUrl {
        let store = self.store.clone();
        let limiter = self.limiter.clone();
        let state = self.state.clone();
        let capacity = self.capacity;
        let bucket = bucket.to_string();
        let path = path.to_string();
        let options = options.clone();

        async move {
            let result = limiter
                .schedule(issue_with_fallback(store.as_ref(), &bucket, &path, &options))
                .await
                .and_then(|r| r);

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.inflight.remove(&key);
            match result {
                Ok(url) => {
                    let expires_at = Instant::now() + Duration::from_secs(options.ttl_seconds);
                    state.entries.insert(
                        key,
                        CacheEntry {
                            url: url.clone(),
                            expires_at,
                        },
                    );
                    prune(&mut state.entries, capacity);
                    Ok(url)
                }
                Err(err) => Err(err.to_string()),
            }
        }
        .boxed()
        .shared()
    }
}

async fn issue_with_fallback(
    store: &dyn ObjectStore,
    bucket: &str,
    path: &str,
    options: &RetrievalOptions,
) -> Result<String, Error> {
    debug!("Issuing retrieval URL for {}/{}", bucket, path);
    match store.issue_retrieval_url(bucket, path, options).await {
        Ok(url) => Ok(url),
        Err(err) if options.transform.is_some() => {
            warn!(
                "Transformed URL request for {}/{} failed ({}); retrying without transform",
                bucket, path, err
            );
            let plain = RetrievalOptions {
                transform: None,
                ..options.clone()
            };
            store.issue_retrieval_url(bucket, path, &plain).await
        }
        Err(err) => Err(err),
    }
}

/// Shrink `entries` to `capacity`, removing expired entries first and then
/// the entries closest to expiry.
fn prune(entries: &mut HashMap<String, CacheEntry>, capacity: usize) {
    if entries.len() <= capacity {
        return;
    }

    let now = Instant::now();
    entries.retain(|_, entry| entry.expires_at > now);

    if entries.len() > capacity {
        let mut by_expiry: Vec<(Instant, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        by_expiry.sort();
        let excess = entries.len() - capacity;
        for (_, key) in by_expiry.into_iter().take(excess) {
            entries.remove(&key);
        }
    }
    debug!("Pruned URL cache to {} entries", entries.len());
}
