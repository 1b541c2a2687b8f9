//! Idempotency guard for outbound sends.
//!
//! Repeated calls carrying the same caller-supplied key must be treated as a
//! no-op retry returning the original receipt, never as a duplicate send.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Error)]
pub enum IdemError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
}

/// Contract implemented by idempotency stores.
#[async_trait]
pub trait IdemStore: Send + Sync {
    /// Attempts to register `key` with an associated `value` and TTL.
    /// Returns `Ok(None)` when the key was fresh (the caller should proceed
    /// and the value is now recorded), or `Ok(Some(existing))` with the
    /// previously recorded value for a duplicate.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_s: u64,
    ) -> Result<Option<String>, IdemError>;

    /// Returns the value recorded for `key`, if any and not expired.
    async fn get(&self, key: &str) -> Result<Option<String>, IdemError>;
}

pub type SharedIdemStore = Arc<dyn IdemStore>;

/// In-memory store with TTL eviction; the default for single-process
/// deployments and tests.
#[derive(Clone, Default)]
pub struct InMemoryIdemStore {
    inner: Arc<RwLock<HashMap<String, (String, OffsetDateTime)>>>,
}

impl InMemoryIdemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdemStore for InMemoryIdemStore {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_s: u64,
    ) -> Result<Option<String>, IdemError> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        guard.retain(|_, (_, expires)| *expires > now);
        match guard.get(key) {
            Some((existing, _)) => Ok(Some(existing.clone())),
            None => {
                let expires = now + Duration::seconds(ttl_s.max(1) as i64);
                guard.insert(key.to_string(), (value.to_string(), expires));
                Ok(None)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, IdemError> {
        let now = OffsetDateTime::now_utc();
        let guard = self.inner.read().await;
        Ok(guard
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(value, _)| value.clone()))
    }
}

/// Guard used by the transport router to deduplicate sends.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ttl_secs: u64,
    store: SharedIdemStore,
}

impl IdempotencyGuard {
    pub fn new(store: SharedIdemStore, ttl_hours: u64) -> Self {
        Self {
            store,
            ttl_secs: ttl_hours.saturating_mul(3600).max(60),
        }
    }

    /// Registers `key -> value`; returns the previously recorded value when
    /// the key was already claimed.
    pub async fn claim(&self, key: &str, value: &str) -> Result<Option<String>, IdemError> {
        let existing = self.store.put_if_absent(key, value, self.ttl_secs).await?;
        if let Some(prev) = &existing {
            warn!(key = %key, original = %prev, "duplicate send suppressed");
        }
        Ok(existing)
    }

    /// Looks the key up without claiming it.
    pub async fn lookup(&self, key: &str) -> Result<Option<String>, IdemError> {
        self.store.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_returns_original_value() {
        let store = InMemoryIdemStore::new();
        assert_eq!(store.put_if_absent("k", "msg-1", 60).await.unwrap(), None);
        assert_eq!(
            store.put_if_absent("k", "msg-2", 60).await.unwrap(),
            Some("msg-1".to_string())
        );
    }

    #[tokio::test]
    async fn expired_entries_are_reclaimable() {
        let store = InMemoryIdemStore::new();
        {
            let mut guard = store.inner.write().await;
            guard.insert(
                "old".into(),
                (
                    "msg-0".into(),
                    OffsetDateTime::now_utc() - Duration::seconds(5),
                ),
            );
        }
        assert_eq!(store.put_if_absent("old", "msg-1", 60).await.unwrap(), None);
    }

    #[tokio::test]
    async fn guard_claims_once() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 1);
        assert_eq!(guard.claim("send-1", "m1").await.unwrap(), None);
        assert_eq!(
            guard.claim("send-1", "m2").await.unwrap(),
            Some("m1".to_string())
        );
    }
}
