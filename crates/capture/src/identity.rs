//! Identity resolution cache.
//!
//! Lookups consult the cache first; an entry is fresh while its age is at
//! most the TTL. Misses and stale entries go to the source. Successful
//! resolutions are cached with the current time, failures are not cached
//! and come back as `None` so the caller falls back to the raw identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use ct_domain::config::IdentityConfig;
use ct_domain::error::Error;
use ct_domain::source::{IdentityProfile, SourceClient, SourceEvent};
use ct_domain::trace::TraceEvent;

use crate::clock::Clock;

#[derive(Debug, Clone)]
pub struct CachedIdentity {
    pub profile: IdentityProfile,
    pub resolved_at_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
    pub evictions: u64,
}

pub struct IdentityCache {
    ttl_ms: i64,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CachedIdentity>>,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

impl IdentityCache {
    pub fn new(ttl_ms: i64, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_ms,
            max_entries,
            clock,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &IdentityConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            i64::try_from(cfg.ttl_ms).unwrap_or(i64::MAX),
            cfg.max_entries,
            clock,
        )
    }

    /// Fresh cached profile, if any. Never calls out.
    pub fn peek(&self, identity: &str) -> Option<IdentityProfile> {
        let now = self.clock.now_ms();
        self.entries
            .read()
            .get(identity)
            .filter(|c| self.is_fresh(c, now))
            .map(|c| c.profile.clone())
    }

    pub async fn resolve(
        &self,
        source: &dyn SourceClient,
        identity: &str,
    ) -> Option<IdentityProfile> {
        if let Some(profile) = self.peek(identity) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(profile);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match source.resolve_identity(identity).await {
            Ok(profile) => {
                self.insert(identity, profile.clone());
                TraceEvent::IdentityResolved {
                    identity: identity.to_owned(),
                    resolved: true,
                }
                .emit();
                Some(profile)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let err = Error::CacheResolution {
                    identity: identity.to_owned(),
                    message: e.to_string(),
                };
                tracing::warn!(identity, error = %err, "identity resolution failed; using raw id");
                TraceEvent::IdentityResolved {
                    identity: identity.to_owned(),
                    resolved: false,
                }
                .emit();
                None
            }
        }
    }

    /// Display name for `identity`, falling back to the raw identity string.
    pub async fn display_name(&self, source: &dyn SourceClient, identity: &str) -> String {
        self.resolve(source, identity)
            .await
            .map(|p| p.display_name)
            .unwrap_or_else(|| identity.to_owned())
    }

    /// Fill in `sender_name` when the source left it out. Left as `None`
    /// when resolution fails.
    pub async fn fill_sender(&self, source: &dyn SourceClient, event: &mut SourceEvent) {
        if event.sender_name.is_none() {
            event.sender_name = self
                .resolve(source, &event.sender_id)
                .await
                .map(|p| p.display_name);
        }
    }

    pub fn stats(&self) -> IdentityCacheStats {
        IdentityCacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn is_fresh(&self, cached: &CachedIdentity, now_ms: i64) -> bool {
        now_ms.saturating_sub(cached.resolved_at_ms) <= self.ttl_ms
    }

    fn insert(&self, identity: &str, profile: IdentityProfile) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write();

        if self.max_entries > 0
            && entries.len() >= self.max_entries
            && !entries.contains_key(identity)
        {
            let before = entries.len();
            entries.retain(|_, c| self.is_fresh(c, now));
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, c)| c.resolved_at_ms)
                    .map(|(k, _)| k.clone());
                if let Some(key) = oldest {
                    entries.remove(&key);
                }
            }
            let evicted = (before - entries.len()) as u64;
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        entries.insert(
            identity.to_owned(),
            CachedIdentity {
                profile,
                resolved_at_ms: now,
            },
        );
    }
}
