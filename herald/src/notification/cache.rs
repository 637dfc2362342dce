//! Preference cache.
//!
//! Read-through TTL cache in front of the preference table. Only preference
//! rows are cached; gate decisions and frequency counts are always computed
//! live. Writers invalidate synchronously before acknowledging.
//!
//! Every invalidation bumps a per-key generation. A reader takes the
//! generation before it loads a row and only fills the cache if no
//! invalidation happened in between, so a row read before a write can never
//! be cached after it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::{Channel, Preference};

/// Default TTL for cached preferences.
pub const DEFAULT_PREFERENCE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PreferenceKey {
    user_id: String,
    channel: Channel,
    notification_type: String,
}

impl PreferenceKey {
    fn new(user_id: &str, channel: Channel, notification_type: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            channel,
            notification_type: notification_type.to_string(),
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    preference: Arc<Preference>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe preference cache.
#[derive(Clone)]
pub struct PreferenceCache {
    entries: Arc<DashMap<PreferenceKey, CacheEntry>>,
    generations: Arc<DashMap<PreferenceKey, u64>>,
    ttl: Duration,
}

impl Default for PreferenceCache {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_PREFERENCE_TTL)
    }
}

impl PreferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Cached preference, or `None` if absent or expired.
    pub fn get(
        &self,
        user_id: &str,
        channel: Channel,
        notification_type: &str,
    ) -> Option<Arc<Preference>> {
        let key = PreferenceKey::new(user_id, channel, notification_type);
        let entry = self.entries.get(&key)?;

        if entry.is_expired() {
            drop(entry); // Release the shard lock before removing
            self.entries.remove(&key);
            return None;
        }

        Some(entry.preference.clone())
    }

    /// Invalidation generation of a key; take it before loading the row.
    pub fn generation(&self, user_id: &str, channel: Channel, notification_type: &str) -> u64 {
        self.generations
            .get(&PreferenceKey::new(user_id, channel, notification_type))
            .map(|g| *g)
            .unwrap_or(0)
    }

    /// Cache `preference` if its key has not been invalidated since
    /// `generation` was taken. Returns whether the entry was stored.
    pub fn fill(&self, preference: Arc<Preference>, generation: u64) -> bool {
        let key = PreferenceKey::new(
            &preference.user_id,
            preference.channel,
            &preference.notification_type,
        );
        // The generation shard stays locked until the entry is stored, so an
        // invalidation either sees the new entry or makes this fill a no-op.
        let current = self.generations.entry(key.clone()).or_insert(0);
        if *current != generation {
            return false;
        }
        self.entries.insert(
            key,
            CacheEntry {
                preference,
                expires_at: Instant::now() + self.ttl,
            },
        );
        drop(current);
        true
    }

    pub fn invalidate(&self, user_id: &str, channel: Channel, notification_type: &str) {
        let key = PreferenceKey::new(user_id, channel, notification_type);
        *self.generations.entry(key.clone()).or_insert(0) += 1;
        self.entries.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.len())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
