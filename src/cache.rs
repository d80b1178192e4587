//! Conversation cache: stable upstream session ids per logical conversation.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::translate::Format;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: String,
    pub expire: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    // Minting at or after this instant first sweeps expired keys.
    next_sweep: Option<DateTime<Utc>>,
}

impl Entries {
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.expire > now);
        before - self.map.len()
    }
}

/// Shared by every request an executor serves. The read-check-mint-write
/// sequence for a key runs under one lock. Expired keys are swept at most
/// once per TTL, on the minting path.
#[derive(Debug)]
pub struct ConversationCache {
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(3600))
    }
}

impl ConversationCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(1)),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn get_or_create(&self, key: &str) -> String {
        self.get_or_create_at(key, Utc::now())
    }

    /// Return the live id for `key`, minting a fresh one when the key is
    /// missing or its entry expired before `now`.
    pub fn get_or_create_at(&self, key: &str, now: DateTime<Utc>) -> String {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.map.get(key) {
            if entry.expire > now {
                return entry.id.clone();
            }
        }

        if entries.next_sweep.is_some_and(|at| now >= at) {
            let removed = entries.sweep(now);
            if removed > 0 {
                debug!(removed, "swept expired conversation ids");
            }
            entries.next_sweep = None;
        }
        if entries.next_sweep.is_none() {
            entries.next_sweep = Some(now + self.ttl);
        }

        let entry = CacheEntry {
            id: uuid::Uuid::new_v4().to_string(),
            expire: now + self.ttl,
        };
        debug!(key, id = %entry.id, "minted conversation id");
        let id = entry.id.clone();
        entries.map.insert(key.to_string(), entry);
        id
    }

    /// Conversation id for a request, if one can be derived.
    ///
    /// Codex callers supply `prompt_cache_key` themselves and it is reused
    /// verbatim. Claude callers are keyed by `model + "-" + metadata.user_id`.
    pub fn cache_id_for(&self, source: Format, payload: &[u8], model: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        match source {
            Format::Codex => value
                .get("prompt_cache_key")
                .and_then(|v| v.as_str())
                .filter(|k| !k.trim().is_empty())
                .map(str::to_string),
            Format::Claude => {
                let user_id = value.pointer("/metadata/user_id").and_then(|v| v.as_str())?;
                Some(self.get_or_create(&format!("{model}-{user_id}")))
            }
        }
    }

    /// Drop every entry that expired before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.sweep(now)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
