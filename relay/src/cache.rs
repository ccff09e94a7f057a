//! Response cache with at-most-once publication.
//!
//! Cache keys are [`Fingerprint`]s: a SHA-256 digest over the fields that
//! make two requests equivalent — system prompt, user prompt, execution
//! mode, the sorted tool list, and a coarse temperature bucket. `put` is
//! first-writer-wins: once a fingerprint is published, later publications
//! for the same key are ignored, so concurrent identical requests cannot
//! flap the cached artifact.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::command::{AgentCommand, ExecutionMode};

/// A stable digest of the cache-equivalence fields of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a command and its selected tools.
    #[must_use]
    pub fn of(command: &AgentCommand, tool_names: &[String]) -> Self {
        use std::fmt::Write as _;

        let mut sorted: Vec<&str> = tool_names.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        // Tenth-of-a-degree buckets: 0.04 and 0.05 hash apart, 0.31 and
        // 0.33 hash together.
        let bucket = (command.temperature.unwrap_or(0.0) * 10.0).round() as i32;

        let mut hasher = Sha256::new();
        hasher.update(command.system_prompt.as_bytes());
        hasher.update([0]);
        hasher.update(command.user_prompt.as_bytes());
        hasher.update([0]);
        hasher.update(match command.mode {
            ExecutionMode::Standard => b"standard".as_slice(),
            ExecutionMode::React => b"react".as_slice(),
        });
        hasher.update([0]);
        for name in &sorted {
            hasher.update(name.as_bytes());
            hasher.update([1]);
        }
        hasher.update(bucket.to_le_bytes());

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached final response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Final content.
    pub content: String,
    /// Tools used to produce it, in completion order.
    pub tools_used: Vec<String>,
}

/// Key → artifact store consulted before LLM work.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Look up a response.
    async fn get(&self, key: &Fingerprint) -> Option<CachedResponse>;

    /// Publish a response. Publication is at-most-once per key: if the
    /// key is already present the call is a no-op.
    async fn put(&self, key: Fingerprint, response: CachedResponse);
}

struct Entry {
    response: CachedResponse,
    inserted: Instant,
}

/// Bounded in-process cache with TTL expiry.
pub struct InMemoryResponseCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl InMemoryResponseCache {
    /// Create a cache holding up to `capacity` responses for `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Number of live entries (expired entries may still be counted
    /// until the next touch).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns `true` when the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &Fingerprint) -> Option<CachedResponse> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key.as_str()) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.response.clone()),
            Some(_) => {
                entries.pop(key.as_str());
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: Fingerprint, response: CachedResponse) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.peek(key.as_str()) {
            // Live entry: first writer wins.
            Some(entry) if entry.inserted.elapsed() < self.ttl => {}
            _ => {
                entries.put(
                    key.as_str().to_owned(),
                    Entry {
                        response,
                        inserted: Instant::now(),
                    },
                );
            }
        }
    }
}

impl std::fmt::Debug for InMemoryResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryResponseCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(prompt: &str, temperature: f32) -> AgentCommand {
        AgentCommand::builder(prompt)
            .system_prompt("system")
            .temperature(temperature)
            .build()
    }

    fn response(content: &str) -> CachedResponse {
        CachedResponse {
            content: content.to_owned(),
            tools_used: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = Fingerprint::of(&command("hi", 0.0), &["b".to_owned(), "a".to_owned()]);
        let b = Fingerprint::of(&command("hi", 0.0), &["a".to_owned(), "b".to_owned()]);
        // Tool order does not matter.
        assert_eq!(a, b);

        let c = Fingerprint::of(&command("hi", 0.0), &[]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_temperature_buckets() {
        let cold = Fingerprint::of(&command("hi", 0.31), &[]);
        let near = Fingerprint::of(&command("hi", 0.33), &[]);
        let far = Fingerprint::of(&command("hi", 0.8), &[]);
        assert_eq!(cold, near);
        assert_ne!(cold, far);
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let cache = InMemoryResponseCache::new(8, Duration::from_secs(60));
        let key = Fingerprint::of(&command("hi", 0.0), &[]);

        assert!(cache.get(&key).await.is_none());
        cache.put(key.clone(), response("cached")).await;
        assert_eq!(cache.get(&key).await.unwrap().content, "cached");
    }

    #[tokio::test]
    async fn test_put_is_first_writer_wins() {
        let cache = InMemoryResponseCache::new(8, Duration::from_secs(60));
        let key = Fingerprint::of(&command("hi", 0.0), &[]);

        cache.put(key.clone(), response("first")).await;
        cache.put(key.clone(), response("second")).await;
        assert_eq!(cache.get(&key).await.unwrap().content, "first");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = InMemoryResponseCache::new(8, Duration::from_millis(10));
        let key = Fingerprint::of(&command("hi", 0.0), &[]);

        cache.put(key.clone(), response("soon gone")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&key).await.is_none());
        // An expired entry may be overwritten.
        cache.put(key.clone(), response("fresh")).await;
        assert_eq!(cache.get(&key).await.unwrap().content, "fresh");
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let cache = InMemoryResponseCache::new(2, Duration::from_secs(60));
        for i in 0..3 {
            let key = Fingerprint::of(&command(&format!("p{i}"), 0.0), &[]);
            cache.put(key, response("x")).await;
        }
        assert_eq!(cache.len(), 2);
    }
}
