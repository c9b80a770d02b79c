//! Usage and cache-metric accounting.
//!
//! OpenAI-compatible backends report no prompt-cache metrics, but the client
//! renders them, so the proxy estimates: the cacheable request prefix (system
//! prompt + tool declarations) counts as cache *creation* on the first turn
//! of a conversation and as cache *reads* while the conversation stays hot.
//!
//! The conversation map is process-wide behind a mutex; a periodic sweep
//! evicts stale entries. Session token totals are mirrored to a small JSON
//! file in the temp directory that the launcher tails for its status line.

use std::{
    collections::HashMap,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};

use serde_json::json;

use crate::{
    messages::unified::{UnifiedBlock, UnifiedMessage},
    provider::health::DEFAULT_CONTEXT_WINDOW,
    stream::StreamTotals,
};

/// A conversation seen again within this window reads from cache.
const CACHE_HOT_TTL: Duration = Duration::from_secs(5 * 60);

/// Entries idle longer than this are evicted.
const CACHE_EVICT_TTL: Duration = Duration::from_secs(10 * 60);

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Estimate drift beyond this many tokens reads as a cache invalidation.
const CACHE_DRIFT_TOLERANCE: u32 = 32;

/// How many bytes of the first user message feed the conversation
/// fingerprint.
const FINGERPRINT_PREFIX_BYTES: usize = 50;

/// Cache-token split for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CacheSplit {
    pub creation: u32,
    pub read: u32,
}

struct CacheEntry {
    cacheable_tokens: u32,
    last_seen: Instant,
    turns: u32,
}

/// Process-wide conversation cache state.
#[derive(Clone, Default)]
pub(crate) struct ConversationCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a turn for `key` and return its cache split.
    pub fn begin_turn(&self, key: &str, cacheable_tokens: u32) -> CacheSplit {
        self.begin_turn_at(key, cacheable_tokens, Instant::now())
    }

    fn begin_turn_at(&self, key: &str, cacheable_tokens: u32, now: Instant) -> CacheSplit {
        let Ok(mut entries) = self.entries.lock() else {
            return CacheSplit::default();
        };

        if let Some(entry) = entries.get_mut(key) {
            let fresh = now.duration_since(entry.last_seen) < CACHE_HOT_TTL;
            let drift = entry.cacheable_tokens.abs_diff(cacheable_tokens);

            if fresh && drift <= CACHE_DRIFT_TOLERANCE {
                entry.last_seen = now;
                entry.turns += 1;
                entry.cacheable_tokens = cacheable_tokens;

                log::debug!("cache read for '{key}' (turn {})", entry.turns);
                return CacheSplit {
                    creation: 0,
                    read: cacheable_tokens,
                };
            }

            if fresh {
                log::debug!(
                    "cacheable estimate for '{key}' drifted by {drift} tokens, treating as invalidation"
                );
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                cacheable_tokens,
                last_seen: now,
                turns: 1,
            },
        );

        log::debug!("cache create for '{key}' ({cacheable_tokens} tokens)");
        CacheSplit {
            creation: cacheable_tokens,
            read: 0,
        }
    }

    /// Drop entries idle past the eviction TTL.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };

        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_seen) < CACHE_EVICT_TTL);

        let evicted = before - entries.len();
        if evicted > 0 {
            log::debug!("evicted {evicted} stale conversation cache entries");
        }
    }

    /// Run the periodic sweep until the process exits.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.sweep();
            }
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// Conversation key: the model plus either the client-provided session id or
/// a fingerprint of the first user message's leading bytes.
pub(crate) fn conversation_key(
    model: &str,
    session_id: Option<&str>,
    first_user_message: Option<&UnifiedMessage>,
) -> String {
    if let Some(id) = session_id {
        return format!("{model}:{id}");
    }

    let serialized = first_user_message.map(serialize_message).unwrap_or_default();
    let prefix = &serialized.as_bytes()[..serialized.len().min(FINGERPRINT_PREFIX_BYTES)];

    format!("{model}:{:x}", md5::compute(prefix))
}

fn serialize_message(message: &UnifiedMessage) -> String {
    let mut out = String::new();

    for block in &message.blocks {
        match block {
            UnifiedBlock::Text(text) => out.push_str(text),
            UnifiedBlock::ToolResult { content, .. } => out.push_str(content),
            UnifiedBlock::Image { data, .. } => out.push_str(data),
            UnifiedBlock::ToolUse { name, .. } => out.push_str(name),
        }
    }

    out
}

struct TotalsInner {
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
    context_window: u32,
    last_turn_tokens: u64,
}

/// Cumulative token totals for this listener, mirrored to the status file.
pub(crate) struct SessionTotals {
    port: u16,
    inner: Mutex<TotalsInner>,
}

impl SessionTotals {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            inner: Mutex::new(TotalsInner {
                input_tokens: 0,
                output_tokens: 0,
                cost: 0.0,
                context_window: DEFAULT_CONTEXT_WINDOW,
                last_turn_tokens: 0,
            }),
        }
    }

    pub fn set_context_window(&self, context_window: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.context_window = context_window;
        }
    }

    pub fn record(&self, totals: StreamTotals) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.input_tokens += u64::from(totals.input_tokens);
            inner.output_tokens += u64::from(totals.output_tokens);
            inner.cost += totals.cost;
            inner.last_turn_tokens =
                u64::from(totals.input_tokens) + u64::from(totals.output_tokens);
        }
    }

    pub fn status_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("claudish-tokens-{}.json", self.port))
    }

    /// Atomically replace the status file. Best-effort: callers log failures
    /// and move on.
    pub fn write_status_file(&self) -> std::io::Result<()> {
        let snapshot = {
            let inner = self
                .inner
                .lock()
                .map_err(|_| std::io::Error::other("totals lock poisoned"))?;

            let window = u64::from(inner.context_window);
            let left = window.saturating_sub(inner.last_turn_tokens);
            let percent = if window > 0 { left * 100 / window } else { 0 };

            json!({
                "input_tokens": inner.input_tokens,
                "output_tokens": inner.output_tokens,
                "total_tokens": inner.input_tokens + inner.output_tokens,
                "total_cost": inner.cost,
                "context_window": inner.context_window,
                "context_left_percent": percent,
                "updated_at": unix_seconds(),
            })
        };

        let path = self.status_path();
        let dir = path.parent().map(PathBuf::from).unwrap_or_else(std::env::temp_dir);

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut file, &snapshot)?;
        file.write_all(b"\n")?;
        file.persist(&path).map_err(|e| e.error)?;

        Ok(())
    }

    pub fn remove_status_file(&self) {
        let path = self.status_path();
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::debug!("could not remove status file {}: {e}", path.display());
        }
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::UnifiedRole;

    #[test]
    fn first_turn_creates_then_reads() {
        let cache = ConversationCache::new();
        let now = Instant::now();

        let split = cache.begin_turn_at("m:abc", 500, now);
        assert_eq!(split, CacheSplit { creation: 500, read: 0 });

        let split = cache.begin_turn_at("m:abc", 510, now + Duration::from_secs(60));
        assert_eq!(split, CacheSplit { creation: 0, read: 510 });
    }

    #[test]
    fn stale_entries_create_again() {
        let cache = ConversationCache::new();
        let now = Instant::now();

        cache.begin_turn_at("m:abc", 500, now);

        let split = cache.begin_turn_at("m:abc", 500, now + Duration::from_secs(6 * 60));
        assert_eq!(split, CacheSplit { creation: 500, read: 0 });
    }

    #[test]
    fn estimate_drift_invalidates() {
        let cache = ConversationCache::new();
        let now = Instant::now();

        cache.begin_turn_at("m:abc", 500, now);

        let split = cache.begin_turn_at("m:abc", 900, now + Duration::from_secs(30));
        assert_eq!(split, CacheSplit { creation: 900, read: 0 });
    }

    #[test]
    fn sweep_evicts_past_the_ttl() {
        let cache = ConversationCache::new();
        let now = Instant::now();

        cache.begin_turn_at("m:old", 100, now);
        cache.begin_turn_at("m:new", 100, now + Duration::from_secs(9 * 60));
        assert_eq!(cache.len(), 2);

        cache.sweep_at(now + Duration::from_secs(11 * 60));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn conversation_key_prefers_session_id() {
        let key = conversation_key("m", Some("session-1"), None);
        assert_eq!(key, "m:session-1");
    }

    #[test]
    fn conversation_key_fingerprints_first_user_message() {
        let message = UnifiedMessage {
            role: UnifiedRole::User,
            blocks: vec![UnifiedBlock::Text("What is 2+2?".to_string())],
        };

        let a = conversation_key("m", None, Some(&message));
        let b = conversation_key("m", None, Some(&message));
        assert_eq!(a, b);

        let other = UnifiedMessage {
            role: UnifiedRole::User,
            blocks: vec![UnifiedBlock::Text("Something else entirely".to_string())],
        };
        assert_ne!(a, conversation_key("m", None, Some(&other)));

        // Only the leading bytes count: long tails do not change the key.
        let long_a = UnifiedMessage {
            role: UnifiedRole::User,
            blocks: vec![UnifiedBlock::Text(format!("{}{}", "x".repeat(60), "tail one"))],
        };
        let long_b = UnifiedMessage {
            role: UnifiedRole::User,
            blocks: vec![UnifiedBlock::Text(format!("{}{}", "x".repeat(60), "tail two"))],
        };
        assert_eq!(
            conversation_key("m", None, Some(&long_a)),
            conversation_key("m", None, Some(&long_b))
        );
    }

    #[test]
    fn status_file_round_trip() {
        let totals = SessionTotals::new(59_999);
        totals.set_context_window(40_960);
        totals.record(StreamTotals {
            input_tokens: 1_000,
            output_tokens: 200,
            cost: 0.0125,
        });

        totals.write_status_file().unwrap();

        let raw = std::fs::read_to_string(totals.status_path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(parsed["input_tokens"], 1_000);
        assert_eq!(parsed["output_tokens"], 200);
        assert_eq!(parsed["total_tokens"], 1_200);
        assert_eq!(parsed["context_window"], 40_960);
        assert_eq!(parsed["context_left_percent"], 97);
        assert!(parsed["updated_at"].as_u64().unwrap() > 0);

        totals.remove_status_file();
        assert!(!totals.status_path().exists());
    }
}
