use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use crate::models::Provider;

struct CachedProvider {
    provider: Provider,
    stored_at: Instant,
}

/**
 * \brief Short-lived cache of provider records keyed by id and by name.
 * \details Entries older than the TTL are never returned. Every registry write
 * calls [`ProviderCache::invalidate`], so reads after a write always hit the database.
 */
pub struct ProviderCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedProvider>>,
}

impl ProviderCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn id_key(id: i64) -> String {
        format!("#{id}")
    }

    /**
     * \brief Looks up by name, or by id when `key` parses as an integer.
     */
    pub fn get(&self, key: &str) -> Option<Provider> {
        if self.ttl.is_zero() {
            return None;
        }
        let guard = self.entries.read().ok()?;
        let hit = key
            .parse::<i64>()
            .ok()
            .and_then(|id| guard.get(&Self::id_key(id)))
            .or_else(|| guard.get(key))?;
        if hit.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(hit.provider.clone())
    }

    pub fn put(&self, provider: &Provider) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut guard) = self.entries.write() {
            let now = Instant::now();
            guard.insert(
                Self::id_key(provider.id),
                CachedProvider {
                    provider: provider.clone(),
                    stored_at: now,
                },
            );
            guard.insert(
                provider.name.clone(),
                CachedProvider {
                    provider: provider.clone(),
                    stored_at: now,
                },
            );
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
