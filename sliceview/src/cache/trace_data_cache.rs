//! Time-windowed slice cache over the query engine
//!
//! Serves per-thread range queries synchronously from whatever is resident,
//! and refetches a widened window in the background when a query is not
//! fully covered.
//!
//! ```text
//!   get_data(q)
//!     │
//!     ├─► drain completions (crossbeam) ──► replace entries, bump generation
//!     │
//!     ├─► covered?  ── no ──► widen ──► pending covers it? ── no ──► spawn fetch
//!     │                                       │ yes
//!     │                                       └──► dedup
//!     │
//!     └─► interval_index::query(entry.slices, q.start, q.end)   (never blocks)
//! ```
//!
//! The cache is single-owner (`&mut self`); only the fetch futures run on the
//! tokio runtime. Callers re-query after the generation counter moves.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::entry::CacheEntry;
use crate::analysis::interval_index;
use crate::config::CacheConfig;
use crate::domain::{EngineError, ThreadKey};
use crate::trace_data::{Slice, TraceDataQuery};

/// Future returned by a [`SliceSource`] fetch
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Vec<Slice>, EngineError>> + Send>>;

/// Where the cache gets slices from
pub trait SliceSource: Send + Sync {
    /// Slices of `key` intersecting `[start, end)`.
    ///
    /// Called synchronously from the cache owner; the returned future is
    /// driven on the cache's runtime.
    fn fetch_slices(&self, key: ThreadKey, start: i64, end: i64) -> FetchFuture;
}

/// Counters describing cache behavior since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches_issued: u64,
    pub fetches_deduplicated: u64,
    pub fetch_failures: u64,
    pub evictions: u64,
}

/// A fetch in flight
#[derive(Debug, Clone, Copy)]
struct InFlight {
    id: u64,
    start: i64,
    end: i64,
}

struct Completion {
    key: ThreadKey,
    fetch: InFlight,
    /// Cache epoch at dispatch; completions from before a `clear()` are dropped
    epoch: u64,
    outcome: Result<Vec<Slice>, EngineError>,
}

pub struct TraceDataCache {
    source: Arc<dyn SliceSource>,
    runtime: Handle,
    config: CacheConfig,

    entries: HashMap<ThreadKey, CacheEntry>,
    pending: HashMap<ThreadKey, Vec<InFlight>>,
    errors: HashMap<ThreadKey, String>,

    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    changes: Arc<watch::Sender<u64>>,

    next_fetch_id: u64,
    epoch: u64,
    /// Logical clock for LRU ordering
    tick: u64,
    stats: CacheStats,
}

impl TraceDataCache {
    #[must_use]
    pub fn new(source: Arc<dyn SliceSource>, runtime: Handle, config: CacheConfig) -> Self {
        let (completions_tx, completions_rx) = unbounded();
        let (changes, _) = watch::channel(0);
        Self {
            source,
            runtime,
            config,
            entries: HashMap::new(),
            pending: HashMap::new(),
            errors: HashMap::new(),
            completions_tx,
            completions_rx,
            changes: Arc::new(changes),
            next_fetch_id: 0,
            epoch: 0,
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    /// Slices of the query's thread intersecting `[start, end)`.
    ///
    /// Never blocks. On a miss this returns whatever the (possibly stale)
    /// entry holds and schedules a widened refetch; re-query after the
    /// generation counter moves. A query without both process and thread
    /// yields nothing.
    pub fn get_data(&mut self, query: &TraceDataQuery) -> &[Slice] {
        self.apply_completions();

        let Some(key) = query.key() else {
            return &[];
        };

        self.tick += 1;
        if self.is_covered(query) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            self.request(key, query);
        }

        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_used = self.tick;
                interval_index::query(&entry.slices, query.start, query.end)
            }
            None => &[],
        }
    }

    /// True when the cached window for the query's thread contains the range
    #[must_use]
    pub fn is_covered(&self, query: &TraceDataQuery) -> bool {
        query
            .key()
            .and_then(|key| self.entries.get(&key))
            .is_some_and(|entry| entry.covers(query.start, query.end))
    }

    fn request(&mut self, key: ThreadKey, query: &TraceDataQuery) {
        let (start, end) = self.config.widen(query.start, query.end);

        let already_pending = self
            .pending
            .get(&key)
            .is_some_and(|fetches| fetches.iter().any(|f| f.start <= query.start && f.end >= query.end));
        if already_pending {
            self.stats.fetches_deduplicated += 1;
            debug!("{key}: fetch for [{}, {}) already in flight", query.start, query.end);
            return;
        }

        let fetch = InFlight { id: self.next_fetch_id, start, end };
        self.next_fetch_id += 1;
        self.pending.entry(key).or_default().push(fetch);
        self.stats.fetches_issued += 1;
        debug!("{key}: fetching [{start}, {end})");

        let future = self.source.fetch_slices(key, start, end);
        let completions = self.completions_tx.clone();
        let changes = Arc::clone(&self.changes);
        let epoch = self.epoch;

        self.runtime.spawn(async move {
            let outcome = future.await;
            if completions.send(Completion { key, fetch, epoch, outcome }).is_ok() {
                changes.send_modify(|generation| *generation += 1);
            }
        });
    }

    /// Fold finished fetches into the cache; returns how many were applied.
    ///
    /// Called at the start of every [`get_data`](Self::get_data); call it
    /// directly to observe results without issuing a query.
    pub fn apply_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if completion.epoch == self.epoch {
                self.complete(completion);
                applied += 1;
            }
        }
        if applied > 0 {
            self.evict();
        }
        applied
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { key, fetch, outcome, .. } = completion;

        if let Some(fetches) = self.pending.get_mut(&key) {
            fetches.retain(|f| f.id != fetch.id);
            if fetches.is_empty() {
                self.pending.remove(&key);
            }
        }

        match outcome {
            Ok(slices) => {
                let entry = CacheEntry::from_fetch(fetch.start, fetch.end, slices, self.tick);
                debug!(
                    "{key}: cached {} slices over [{}, {})",
                    entry.slices.len(),
                    entry.start,
                    entry.end
                );
                self.entries.insert(key, entry);
                self.errors.remove(&key);
            }
            Err(e) => {
                warn!("{key}: fetch for [{}, {}) failed: {e}", fetch.start, fetch.end);
                self.stats.fetch_failures += 1;
                self.errors.insert(key, e.to_string());
            }
        }
    }

    fn evict(&mut self) {
        if self.config.max_entries == 0 {
            return;
        }
        while self.entries.len() > self.config.max_entries {
            let Some(oldest) =
                self.entries.iter().min_by_key(|(_, entry)| entry.last_used).map(|(key, _)| *key)
            else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
            debug!("{oldest}: evicted");
        }
    }

    /// Receiver of the data-changed generation counter.
    ///
    /// The counter moves after every finished fetch, successful or not.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Current value of the data-changed counter
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.changes.borrow()
    }

    /// True while any fetch is in flight
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// True while a fetch for `key` is in flight
    #[must_use]
    pub fn is_pending(&self, key: ThreadKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Error of the latest failed fetch for `key`, cleared by a later success
    #[must_use]
    pub fn fetch_error(&self, key: ThreadKey) -> Option<&str> {
        self.errors.get(&key).map(String::as_str)
    }

    /// Cached window for `key`
    #[must_use]
    pub fn cached_range(&self, key: ThreadKey) -> Option<(i64, i64)> {
        self.entries.get(&key).map(|entry| (entry.start, entry.end))
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Number of cached threads
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, error and pending marker.
    ///
    /// Fetches already in flight still complete but are discarded.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.errors.clear();
        self.pending.clear();
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Pid, SliceId, Tid};
    use std::sync::Mutex;

    fn slice(id: u64, start: i64, end: i64) -> Slice {
        Slice { id: SliceId(id), start, end, title: format!("s{id}"), color: None }
    }

    /// Serves a fixed slice list per thread and records every fetch
    #[derive(Default)]
    struct FakeSource {
        slices: Vec<Slice>,
        fail: bool,
        calls: Mutex<Vec<(ThreadKey, i64, i64)>>,
    }

    impl FakeSource {
        fn calls(&self) -> Vec<(ThreadKey, i64, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SliceSource for FakeSource {
        fn fetch_slices(&self, key: ThreadKey, start: i64, end: i64) -> FetchFuture {
            self.calls.lock().unwrap().push((key, start, end));
            let outcome = if self.fail {
                Err(EngineError::Remote("boom".to_string()))
            } else {
                Ok(self.slices.iter().filter(|s| s.intersects(start, end)).cloned().collect())
            };
            Box::pin(async move { outcome })
        }
    }

    fn key() -> ThreadKey {
        ThreadKey::new(Pid(1), Tid(1))
    }

    fn cache_with(source: &Arc<FakeSource>, config: CacheConfig) -> TraceDataCache {
        let source: Arc<dyn SliceSource> = Arc::clone(source) as Arc<dyn SliceSource>;
        TraceDataCache::new(source, Handle::current(), config)
    }

    async fn settle(cache: &mut TraceDataCache) {
        let mut changes = cache.subscribe();
        loop {
            cache.apply_completions();
            if !cache.has_pending() {
                return;
            }
            changes.changed().await.unwrap();
        }
    }

    fn ids(slices: &[Slice]) -> Vec<u64> {
        slices.iter().map(|s| s.id.0).collect()
    }

    #[tokio::test]
    async fn test_miss_returns_empty_and_fetches_widened_range() {
        let source = Arc::new(FakeSource { slices: vec![slice(0, 10, 20)], ..FakeSource::default() });
        let mut cache = cache_with(&source, CacheConfig::default());
        let q = TraceDataQuery::for_thread(key(), 0, 100);

        assert!(cache.get_data(&q).is_empty());
        assert_eq!(source.calls(), vec![(key(), -50, 150)]);

        settle(&mut cache).await;
        assert_eq!(ids(cache.get_data(&q)), vec![0]);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_query_without_thread_is_empty() {
        let source = Arc::new(FakeSource::default());
        let mut cache = cache_with(&source, CacheConfig::default());
        let q = TraceDataQuery { start: 0, end: 10, process: Some(Pid(1)), thread: None };

        assert!(cache.get_data(&q).is_empty());
        assert!(source.calls().is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_overlapping_triggers_fetch_once() {
        let source = Arc::new(FakeSource::default());
        let mut cache = cache_with(&source, CacheConfig::default());

        cache.get_data(&TraceDataQuery::for_thread(key(), 0, 100));
        cache.get_data(&TraceDataQuery::for_thread(key(), 10, 90));
        cache.get_data(&TraceDataQuery::for_thread(key(), 0, 100));

        assert_eq!(source.calls().len(), 1);
        assert_eq!(cache.stats().fetches_deduplicated, 2);
        assert!(cache.is_pending(key()));
    }

    #[tokio::test]
    async fn test_range_beyond_pending_fetch_issues_another() {
        let source = Arc::new(FakeSource::default());
        let mut cache = cache_with(&source, CacheConfig::default());

        cache.get_data(&TraceDataQuery::for_thread(key(), 0, 100));
        cache.get_data(&TraceDataQuery::for_thread(key(), 1_000, 1_100));
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_not_merge() {
        let source = Arc::new(FakeSource {
            slices: vec![slice(0, 0, 10), slice(1, 500, 510)],
            ..FakeSource::default()
        });
        let mut cache = cache_with(&source, CacheConfig { widen_percent: 0, max_entries: 0 });

        cache.get_data(&TraceDataQuery::for_thread(key(), 0, 100));
        settle(&mut cache).await;
        cache.get_data(&TraceDataQuery::for_thread(key(), 450, 550));
        settle(&mut cache).await;

        assert_eq!(cache.cached_range(key()), Some((450, 550)));
        // The first window is gone: querying it again is a miss
        let q = TraceDataQuery::for_thread(key(), 0, 100);
        assert!(!cache.is_covered(&q));
        assert!(cache.get_data(&q).is_empty());
    }

    #[tokio::test]
    async fn test_window_extends_to_straddling_slices() {
        let source = Arc::new(FakeSource { slices: vec![slice(0, -80, 20)], ..FakeSource::default() });
        let mut cache = cache_with(&source, CacheConfig::default());

        cache.get_data(&TraceDataQuery::for_thread(key(), 0, 100));
        settle(&mut cache).await;
        assert_eq!(cache.cached_range(key()), Some((-80, 150)));
    }

    #[tokio::test]
    async fn test_failure_clears_pending_and_keeps_entry() {
        let good = Arc::new(FakeSource { slices: vec![slice(0, 10, 20)], ..FakeSource::default() });
        let mut cache = cache_with(&good, CacheConfig::default());
        let q = TraceDataQuery::for_thread(key(), 0, 100);
        cache.get_data(&q);
        settle(&mut cache).await;

        // Swap in a failing source while keeping the resident entry
        let failing: Arc<dyn SliceSource> = Arc::new(FakeSource { fail: true, ..FakeSource::default() });
        cache.source = failing;
        let generation = cache.generation();
        let wide = TraceDataQuery::for_thread(key(), 0, 1_000);
        assert_eq!(ids(cache.get_data(&wide)), vec![0]);
        settle(&mut cache).await;

        assert!(!cache.has_pending());
        assert!(cache.generation() > generation);
        assert_eq!(cache.fetch_error(key()), Some("Query engine reported an error: boom"));
        assert_eq!(ids(cache.get_data(&q)), vec![0]);
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let source = Arc::new(FakeSource::default());
        let mut cache = cache_with(&source, CacheConfig { widen_percent: 50, max_entries: 2 });
        let keys: Vec<ThreadKey> = (1..=3).map(|t| ThreadKey::new(Pid(1), Tid(t))).collect();

        for k in &keys[..2] {
            cache.get_data(&TraceDataQuery::for_thread(*k, 0, 10));
        }
        settle(&mut cache).await;
        // Touch the first key so the second becomes least recently used
        cache.get_data(&TraceDataQuery::for_thread(keys[0], 0, 10));
        cache.get_data(&TraceDataQuery::for_thread(keys[2], 0, 10));
        settle(&mut cache).await;

        assert_eq!(cache.len(), 2);
        assert!(cache.cached_range(keys[0]).is_some());
        assert!(cache.cached_range(keys[1]).is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_clear_discards_in_flight_results() {
        let source = Arc::new(FakeSource { slices: vec![slice(0, 10, 20)], ..FakeSource::default() });
        let mut cache = cache_with(&source, CacheConfig::default());

        cache.get_data(&TraceDataQuery::for_thread(key(), 0, 100));
        cache.clear();
        assert!(!cache.has_pending());

        let mut changes = cache.subscribe();
        changes.changed().await.unwrap();
        assert_eq!(cache.apply_completions(), 0);
        assert!(cache.is_empty());
    }
}
