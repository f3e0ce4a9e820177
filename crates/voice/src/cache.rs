//! Synthesis cache: fingerprint → audio with single-flight generation.
//!
//! Concurrent `get_or_build` calls for one fingerprint invoke the
//! producer exactly once; every waiter receives the same bytes (or the
//! same error — failures are broadcast and never cached). The producer
//! runs in its own task, so a caller disconnecting mid-build does not
//! cancel generation for the remaining waiters.
//!
//! Eviction is size-bounded LRU with a per-entry TTL; pinned entries
//! (greetings, fallback lines) are exempt from both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use voxgate_core::{Error, Result, SynthesizedAudio};

/// A cached synthesis artifact. Shared behind `Arc`, never copied out.
#[derive(Debug)]
pub struct CachedArtifact {
    pub fingerprint: String,
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
    pub quality: Option<f32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a lookup, carrying the hit flag callers report.
#[derive(Debug)]
pub struct CacheOutcome {
    pub artifact: Arc<CachedArtifact>,
    pub cache_hit: bool,
}

#[derive(Clone)]
enum BuildState {
    Pending,
    Done(std::result::Result<Arc<CachedArtifact>, String>),
}

struct CacheEntry {
    artifact: Arc<CachedArtifact>,
    inserted_at: Instant,
    last_used_tick: u64,
    pinned: bool,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    flights: HashMap<String, watch::Receiver<BuildState>>,
    total_bytes: u64,
    tick: u64,
}

struct Shared {
    inner: Mutex<CacheInner>,
    capacity_bytes: u64,
    entry_ttl: Duration,
}

/// Cheaply cloneable cache handle.
#[derive(Clone)]
pub struct SynthesisCache {
    shared: Arc<Shared>,
}

impl SynthesisCache {
    pub fn new(capacity_bytes: u64, entry_ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(CacheInner {
                    entries: HashMap::new(),
                    flights: HashMap::new(),
                    total_bytes: 0,
                    tick: 0,
                }),
                capacity_bytes,
                entry_ttl,
            }),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.shared.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached lookup; expired entries read as misses.
    pub fn get(&self, fingerprint: &str) -> Option<Arc<CachedArtifact>> {
        let mut inner = self.shared.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let ttl = self.shared.entry_ttl;

        match inner.entries.get_mut(fingerprint) {
            Some(entry) if entry.pinned || entry.inserted_at.elapsed() <= ttl => {
                entry.last_used_tick = tick;
                Some(entry.artifact.clone())
            }
            Some(_) => {
                remove_entry(&mut inner, fingerprint);
                None
            }
            None => None,
        }
    }

    /// Pin an artifact (greeting/fallback) so it never expires or evicts.
    pub fn pin(&self, fingerprint: &str) {
        if let Some(entry) = self.shared.inner.lock().entries.get_mut(fingerprint) {
            entry.pinned = true;
        }
    }

    /// Get the cached artifact, or build it exactly once across all
    /// concurrent callers for this fingerprint.
    pub async fn get_or_build<F, Fut>(&self, fingerprint: &str, producer: F) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SynthesizedAudio>> + Send + 'static,
    {
        // Hit check and flight registration happen under one lock, so two
        // callers can never both become the builder.
        let (mut rx, is_builder) = {
            let mut inner = self.shared.inner.lock();
            inner.tick += 1;
            let tick = inner.tick;
            let ttl = self.shared.entry_ttl;

            if let Some(entry) = inner.entries.get_mut(fingerprint) {
                if entry.pinned || entry.inserted_at.elapsed() <= ttl {
                    entry.last_used_tick = tick;
                    return Ok(CacheOutcome {
                        artifact: entry.artifact.clone(),
                        cache_hit: true,
                    });
                }
                remove_entry(&mut inner, fingerprint);
            }

            match inner.flights.get(fingerprint) {
                Some(rx) => (rx.clone(), false),
                None => {
                    let (tx, rx) = watch::channel(BuildState::Pending);
                    inner.flights.insert(fingerprint.to_string(), rx.clone());
                    drop(inner);
                    self.spawn_builder(fingerprint.to_string(), tx, producer());
                    (rx, true)
                }
            }
        };

        loop {
            if let BuildState::Done(result) = rx.borrow().clone() {
                return match result {
                    Ok(artifact) => Ok(CacheOutcome {
                        artifact,
                        // The builder produced fresh bytes; waiters report
                        // a hit since they shared the flight.
                        cache_hit: !is_builder,
                    }),
                    Err(message) => Err(Error::ProviderError {
                        provider: "tts".to_string(),
                        message,
                        correlation_id: None,
                    }),
                };
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal("synthesis flight dropped".to_string()));
            }
        }
    }

    fn spawn_builder<Fut>(&self, fingerprint: String, tx: watch::Sender<BuildState>, producer: Fut)
    where
        Fut: std::future::Future<Output = Result<SynthesizedAudio>> + Send + 'static,
    {
        // The producer runs detached: a cancelled caller does not abort
        // generation for the remaining waiters.
        let cache = self.clone();
        tokio::spawn(async move {
            let result = match producer.await {
                Ok(audio) => {
                    let artifact = Arc::new(CachedArtifact {
                        fingerprint: fingerprint.clone(),
                        bytes: audio.bytes,
                        duration_ms: audio.duration_ms,
                        quality: audio.quality,
                        created_at: chrono::Utc::now(),
                    });
                    cache.insert(&fingerprint, artifact.clone());
                    Ok(artifact)
                }
                Err(e) => {
                    tracing::warn!(
                        fingerprint = %fingerprint,
                        error = %e,
                        "synthesis producer failed"
                    );
                    Err(e.to_string())
                }
            };
            cache.shared.inner.lock().flights.remove(&fingerprint);
            let _ = tx.send(BuildState::Done(result));
        });
    }

    fn insert(&self, fingerprint: &str, artifact: Arc<CachedArtifact>) {
        let mut inner = self.shared.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let size = artifact.bytes.len() as u64;

        if let Some(previous) = inner.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                artifact,
                inserted_at: Instant::now(),
                last_used_tick: tick,
                pinned: false,
            },
        ) {
            inner.total_bytes -= previous.artifact.bytes.len() as u64;
        }
        inner.total_bytes += size;

        self.evict_over_capacity(&mut inner);
        metrics::gauge!("voxgate_synthesis_cache_bytes").set(inner.total_bytes as f64);
    }

    fn evict_over_capacity(&self, inner: &mut CacheInner) {
        while inner.total_bytes > self.shared.capacity_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| !e.pinned)
                .min_by_key(|(_, e)| e.last_used_tick)
                .map(|(fp, _)| fp.clone());
            match victim {
                Some(fp) => {
                    tracing::debug!(fingerprint = %fp, "evicting synthesis artifact");
                    remove_entry(inner, &fp);
                }
                // Only pinned entries remain; capacity becomes best-effort.
                None => break,
            }
        }
    }
}

fn remove_entry(inner: &mut CacheInner, fingerprint: &str) {
    if let Some(entry) = inner.entries.remove(fingerprint) {
        inner.total_bytes -= entry.artifact.bytes.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn audio(bytes: Vec<u8>) -> SynthesizedAudio {
        SynthesizedAudio {
            bytes,
            duration_ms: 500,
            quality: Some(0.9),
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = SynthesisCache::new(1024, Duration::from_secs(60));

        let first = cache
            .get_or_build("fp-1", || async { Ok(audio(vec![1, 2, 3])) })
            .await
            .unwrap();
        assert!(!first.cache_hit);

        let second = cache
            .get_or_build("fp-1", || async { panic!("producer must not run twice") })
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.artifact.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn single_flight_under_concurrency() {
        let cache = SynthesisCache::new(1 << 20, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build("fp-hot", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(audio(vec![9, 9, 9]))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for outcome in &outcomes {
            assert_eq!(outcome.artifact.bytes, vec![9, 9, 9]);
        }
    }

    #[tokio::test]
    async fn producer_failure_releases_waiters_and_is_not_cached() {
        let cache = SynthesisCache::new(1024, Duration::from_secs(60));

        let err = cache
            .get_or_build("fp-bad", || async {
                Err(Error::ProviderUnavailable {
                    provider: "tts".into(),
                    message: "down".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderError { .. }));

        // The failure was not cached; a healthy producer runs next time.
        let ok = cache
            .get_or_build("fp-bad", || async { Ok(audio(vec![7])) })
            .await
            .unwrap();
        assert!(!ok.cache_hit);
    }

    #[tokio::test]
    async fn lru_eviction_respects_pins() {
        let cache = SynthesisCache::new(10, Duration::from_secs(60));

        cache
            .get_or_build("fp-greeting", || async { Ok(audio(vec![0; 6])) })
            .await
            .unwrap();
        cache.pin("fp-greeting");

        cache
            .get_or_build("fp-a", || async { Ok(audio(vec![0; 6])) })
            .await
            .unwrap();
        // Over capacity: fp-a (unpinned LRU victim) goes, greeting stays.
        cache
            .get_or_build("fp-b", || async { Ok(audio(vec![0; 4])) })
            .await
            .unwrap();

        assert!(cache.get("fp-greeting").is_some());
        assert!(cache.get("fp-a").is_none());
        assert!(cache.get("fp-b").is_some());
    }

    #[tokio::test]
    async fn ttl_expiry_misses_unless_pinned() {
        let cache = SynthesisCache::new(1024, Duration::from_millis(20));
        cache
            .get_or_build("fp-short", || async { Ok(audio(vec![1])) })
            .await
            .unwrap();
        cache
            .get_or_build("fp-pinned", || async { Ok(audio(vec![2])) })
            .await
            .unwrap();
        cache.pin("fp-pinned");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("fp-short").is_none());
        assert!(cache.get("fp-pinned").is_some());
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_starve_waiters() {
        let cache = SynthesisCache::new(1024, Duration::from_secs(60));

        let builder = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_build("fp-slow", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(audio(vec![5, 5]))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // The original caller goes away mid-build.
        builder.abort();

        let outcome = cache
            .get_or_build("fp-slow", || async {
                panic!("second producer must not run")
            })
            .await
            .unwrap();
        assert_eq!(outcome.artifact.bytes, vec![5, 5]);
    }
}
