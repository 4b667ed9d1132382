//! The per-client session store.
//!
//! Maps a masked client key to that client's pipeline and last-activity
//! timestamp. The map guards only metadata transitions; each pipeline
//! sits behind its own async mutex, so model loads and generation never
//! hold a map lock and never block other clients' entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kiln_core::PipelineLike;
use tokio::sync::Mutex;

/// A cheaply cloneable reference to one session's pipeline. The session
/// owns its pipeline exclusively; the mutex serializes that client's
/// requests against each other and against eviction-time cleanup.
pub type SessionHandle<P> = Arc<Mutex<P>>;

/// The store refused a new client because every slot is taken.
#[derive(Debug, thiserror::Error)]
#[error("session capacity {0} reached, try again later")]
pub struct CapacityError(pub usize);

struct Entry<P> {
    pipeline: SessionHandle<P>,
    last_active: Instant,
}

pub struct SessionStore<P> {
    entries: DashMap<String, Entry<P>>,
    max_sessions: usize,
}

impl<P: PipelineLike> SessionStore<P> {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a session without touching its timestamp.
    pub fn get(&self, key: &str) -> Option<SessionHandle<P>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.pipeline))
    }

    /// Return the existing session for `key` or insert one built by
    /// `factory`. The factory runs at most once per vacancy and must be
    /// cheap; expensive initialization belongs behind the session mutex.
    ///
    /// The capacity check is advisory: concurrent first requests from
    /// distinct new clients may briefly overshoot `max_sessions`.
    pub fn get_or_create(
        &self,
        key: &str,
        factory: impl FnOnce() -> P,
    ) -> Result<SessionHandle<P>, CapacityError> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(Arc::clone(&entry.pipeline));
        }
        if self.entries.len() >= self.max_sessions {
            return Err(CapacityError(self.max_sessions));
        }
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            pipeline: Arc::new(Mutex::new(factory())),
            last_active: Instant::now(),
        });
        Ok(Arc::clone(&entry.pipeline))
    }

    /// Refresh `key`'s activity timestamp. No-op when absent.
    pub fn touch(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_active = Instant::now();
        }
    }

    /// Remove and return `key`'s session. Of two racing callers, exactly
    /// one receives the handle and owns the cleanup.
    pub fn evict(&self, key: &str) -> Option<SessionHandle<P>> {
        self.entries.remove(key).map(|(_, entry)| entry.pipeline)
    }

    /// Remove `key` only if it is still idle past `threshold` at removal
    /// time, so an eviction decided from a stale snapshot loses to a
    /// concurrent touch.
    pub fn evict_if_idle(&self, key: &str, threshold: Duration) -> Option<SessionHandle<P>> {
        self.entries
            .remove_if(key, |_, entry| entry.last_active.elapsed() > threshold)
            .map(|(_, entry)| entry.pipeline)
    }

    /// Keys whose last activity predates `now - threshold`. Non-mutating.
    pub fn snapshot_idle(&self, threshold: Duration, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_active) > threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counters, FakePipeline};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store(max_sessions: usize) -> SessionStore<FakePipeline> {
        SessionStore::new(max_sessions)
    }

    fn fake() -> FakePipeline {
        FakePipeline::new(Arc::new(Counters::default()))
    }

    #[test]
    fn get_or_create_reuses_the_session() {
        let store = store(4);
        let factory_calls = AtomicUsize::new(0);
        let make = || {
            factory_calls.fetch_add(1, Ordering::SeqCst);
            fake()
        };

        let first = store.get_or_create("10.1.2.0", make).unwrap();
        let second = store
            .get_or_create("10.1.2.0", || {
                factory_calls.fetch_add(1, Ordering::SeqCst);
                fake()
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_get_or_create_builds_one_session() {
        let store = Arc::new(store(4));
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let factory_calls = Arc::clone(&factory_calls);
            handles.push(tokio::spawn(async move {
                store
                    .get_or_create("10.1.2.0", move || {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        fake()
                    })
                    .unwrap()
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[test]
    fn evict_removes_the_session() {
        let store = store(4);
        store.get_or_create("10.1.2.0", fake).unwrap();

        assert!(store.evict("10.1.2.0").is_some());
        assert!(store.get("10.1.2.0").is_none());
        // A second eviction finds nothing; exactly one caller owned the
        // handle.
        assert!(store.evict("10.1.2.0").is_none());
    }

    #[test]
    fn capacity_rejects_new_keys_only() {
        let store = store(1);
        store.get_or_create("10.1.2.0", fake).unwrap();

        assert!(store.get_or_create("10.9.9.0", fake).is_err());
        // The existing key is still served.
        assert!(store.get_or_create("10.1.2.0", fake).is_ok());
    }

    #[test]
    fn snapshot_idle_respects_the_threshold_boundary() {
        let store = store(4);
        store.get_or_create("10.1.2.0", fake).unwrap();
        let threshold = Duration::from_secs(60);

        let before_expiry = Instant::now() + threshold - Duration::from_secs(1);
        assert!(store.snapshot_idle(threshold, before_expiry).is_empty());

        let after_expiry = Instant::now() + threshold + Duration::from_secs(1);
        assert_eq!(
            store.snapshot_idle(threshold, after_expiry),
            vec!["10.1.2.0".to_string()]
        );
    }

    #[test]
    fn touch_refreshes_the_timestamp() {
        let store = store(4);
        store.get_or_create("10.1.2.0", fake).unwrap();
        store.get_or_create("10.9.9.0", fake).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        store.touch("10.1.2.0");

        let idle = store.snapshot_idle(Duration::from_millis(20), Instant::now());
        assert_eq!(idle, vec!["10.9.9.0".to_string()]);
    }

    #[test]
    fn touch_on_absent_key_is_a_noop() {
        let store = store(4);
        store.touch("10.1.2.0");
        assert!(store.is_empty());
    }

    #[test]
    fn evict_if_idle_spares_fresh_sessions() {
        let store = store(4);
        store.get_or_create("10.1.2.0", fake).unwrap();

        assert!(store
            .evict_if_idle("10.1.2.0", Duration::from_secs(60))
            .is_none());
        assert!(store.get("10.1.2.0").is_some());

        std::thread::sleep(Duration::from_millis(10));
        assert!(store
            .evict_if_idle("10.1.2.0", Duration::from_millis(5))
            .is_some());
        assert!(store.get("10.1.2.0").is_none());
    }
}
