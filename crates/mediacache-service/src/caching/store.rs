use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::MediaCacheConfig;
use crate::download::{FetchError, MediaFetcher, ProgressFn};
use crate::handles::HandleProvider;
use crate::utils::futures::CallOnDrop;

use super::eviction::{EvictionOrder, EvictionReport, select_victims};
use super::hit_rate::HitRateWindow;
use super::janitor::CacheJanitor;
use super::CacheKey;

type FetchChannel<T> = Shared<oneshot::Receiver<Result<T, FetchError>>>;

/// A resident media item.
#[derive(Debug)]
pub(super) struct CacheEntry<T> {
    pub(super) handle: T,
    pub(super) created_at: Instant,
    pub(super) last_accessed_at: Instant,
    pub(super) size_bytes: u64,
    /// Insertion order, used to break ties between otherwise equal entries.
    pub(super) seq: u64,
}

/// Marks a fetch that is underway. At most one exists per key.
struct InFlight<T> {
    id: u64,
    channel: FetchChannel<T>,
    /// Set when the key was invalidated while fetching. The result will not be committed.
    stale: bool,
}

struct CacheState<T> {
    entries: HashMap<CacheKey, CacheEntry<T>>,
    in_flight: HashMap<CacheKey, InFlight<T>>,
    /// Always equal to the sum of `size_bytes` of all `entries`.
    total_bytes: u64,
    next_seq: u64,
    next_fetch_id: u64,
    hit_rate: HitRateWindow,
}

pub(super) struct CacheInner<H: HandleProvider> {
    config: MediaCacheConfig,
    fetcher: Arc<dyn MediaFetcher>,
    handles: H,
    state: Mutex<CacheState<H::Handle>>,
}

/// Why entries are removed in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    /// The media changed remotely. Running fetches of it are discarded too.
    Invalidated,
    /// The whole cache is reset.
    Cleared,
}

impl Removal {
    fn as_str(self) -> &'static str {
        match self {
            Self::Invalidated => "invalidated",
            Self::Cleared => "cleared",
        }
    }
}

/// Aggregate usage of a [`MediaCache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub item_count: usize,
    pub usage_percent: f64,
    pub in_flight: usize,
    pub hit_rate: f64,
    #[serde(with = "humantime_serde")]
    pub oldest_entry_age: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub newest_entry_age: Option<Duration>,
    pub largest_entry_bytes: Option<u64>,
    pub smallest_entry_bytes: Option<u64>,
}

/// An in-memory cache of fetched media, handed out as revocable handles.
///
/// Concurrent [`resolve`](Self::resolve) calls for the same key share a single fetch. The total
/// number of resident bytes is tracked exactly and kept under the configured capacity by
/// evicting least recently used entries.
///
/// Cloning is cheap; all clones share the same entries. When the last clone is dropped, every
/// resident handle is revoked.
pub struct MediaCache<H: HandleProvider> {
    inner: Arc<CacheInner<H>>,
}

impl<H: HandleProvider> Clone for MediaCache<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: HandleProvider> std::fmt::Debug for MediaCache<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (items, in_flight) = self
            .inner
            .state
            .try_lock()
            .map(|s| (s.entries.len(), s.in_flight.len()))
            .unwrap_or_default();
        f.debug_struct("MediaCache")
            .field("config", &self.inner.config)
            .field("items", &items)
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<H: HandleProvider> MediaCache<H> {
    /// Creates an empty cache.
    ///
    /// `config` is checked with [`MediaCacheConfig::validate`]. If it does not hold, the error
    /// is logged and the default thresholds and hit rate window are used instead.
    pub fn new(config: MediaCacheConfig, fetcher: Arc<dyn MediaFetcher>, handles: H) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(error) => {
                tracing::error!("Invalid cache configuration, using defaults: {:#}", error);
                let defaults = MediaCacheConfig::default();
                MediaCacheConfig {
                    cleanup_threshold: defaults.cleanup_threshold,
                    target_threshold: defaults.target_threshold,
                    hit_rate_window: defaults.hit_rate_window,
                    ..config
                }
            }
        };

        let state = CacheState {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            total_bytes: 0,
            next_seq: 0,
            next_fetch_id: 0,
            hit_rate: HitRateWindow::new(config.hit_rate_window),
        };
        Self {
            inner: Arc::new(CacheInner {
                config,
                fetcher,
                handles,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &MediaCacheConfig {
        &self.inner.config
    }

    pub fn handles(&self) -> &H {
        &self.inner.handles
    }

    /// Returns the handle for `key`, fetching the media if it is not resident.
    ///
    /// A live entry is returned without any I/O. If a fetch for `key` is already underway, this
    /// waits for it and returns its outcome instead of fetching again. Otherwise a new fetch is
    /// started and its result committed to the cache before this returns.
    ///
    /// `on_progress` only observes the transfer if this call starts it.
    ///
    /// The fetch runs as a separate task: it completes and commits its result even if the
    /// returned future is dropped.
    ///
    /// # Errors
    ///
    /// Fetch failures are returned verbatim to this and every deduplicated caller. No entry is
    /// created on failure, and the next call for `key` fetches again.
    pub async fn resolve(
        &self,
        key: CacheKey,
        on_progress: Option<ProgressFn>,
    ) -> Result<H::Handle, FetchError> {
        metric!(counter("caches.access") += 1);

        loop {
            let (channel, joined_stale) = {
                let mut state = self.inner.state.lock();
                if let Some(handle) = self.inner.lookup(&mut state, &key, Instant::now()) {
                    metric!(counter("caches.memory.hit") += 1);
                    return Ok(handle);
                }
                state.hit_rate.record(false);

                match state.in_flight.get(&key) {
                    Some(in_flight) => {
                        // A concurrent lookup was deduplicated.
                        metric!(counter("caches.channel.hit") += 1);
                        (in_flight.channel.clone(), in_flight.stale)
                    }
                    None => {
                        metric!(counter("caches.channel.miss") += 1);
                        let channel =
                            self.spawn_fetch(&mut state, key.clone(), on_progress.clone());
                        (channel, false)
                    }
                }
            };

            let result = channel
                .await
                .unwrap_or_else(|_canceled| Err(FetchError::InternalError));

            if !joined_stale {
                return result;
            }
            // The fetch we waited on was invalidated before we joined it. Now that it settled,
            // start over with a fresh lookup.
            tracing::trace!("Retrying {} after an invalidated fetch", key);
        }
    }

    /// Registers an in-flight marker for `key` and spawns the fetch.
    fn spawn_fetch(
        &self,
        state: &mut CacheState<H::Handle>,
        key: CacheKey,
        on_progress: Option<ProgressFn>,
    ) -> FetchChannel<H::Handle> {
        // An oversized entry committed last time may still be over budget.
        self.inner.evict_if_needed(state, None);

        let id = state.next_fetch_id;
        state.next_fetch_id += 1;

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        // Clears the marker if the task dies without settling, so later calls can retry.
        let abandon_token = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || {
                if let Some(inner) = Weak::upgrade(&inner) {
                    inner.clear_marker(&key, id);
                }
            })
        };

        let inner = Arc::clone(&self.inner);
        let fetch_key = key.clone();
        let task = async move {
            tracing::debug!("Fetching {}", fetch_key);
            metric!(counter("caches.fetch") += 1);

            let result = inner.fetcher.download(&fetch_key, on_progress).await;
            let result = inner.commit(&fetch_key, id, result);
            abandon_token.disarm();

            sender.send(result).ok();
        };
        tokio::spawn(task);

        let previous = state.in_flight.insert(
            key,
            InFlight {
                id,
                channel: channel.clone(),
                stale: false,
            },
        );
        debug_assert!(previous.is_none());

        channel
    }

    /// Whether a live, unexpired entry exists for `key`.
    ///
    /// Unlike [`resolve`](Self::resolve), this does not count as an access.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .is_some_and(|entry| !self.inner.is_expired(entry, Instant::now()))
    }

    /// Removes every entry of the media `media_id`, in any study.
    ///
    /// A running fetch of that media is discarded: its result is not committed and its callers
    /// get [`FetchError::Invalidated`].
    ///
    /// Returns the number of removed entries.
    pub fn invalidate(&self, media_id: &str) -> usize {
        self.inner
            .remove_matching(|key| key.media_id() == media_id, Removal::Invalidated)
    }

    /// Removes every entry of the study `study_id`.
    ///
    /// Running fetches within the study are discarded like in [`invalidate`](Self::invalidate).
    ///
    /// Returns the number of removed entries.
    pub fn invalidate_study(&self, study_id: &str) -> usize {
        self.inner
            .remove_matching(|key| key.study_id() == study_id, Removal::Invalidated)
    }

    /// Revokes every entry and resets the byte counter.
    ///
    /// Running fetches are left alone and commit their result once done.
    pub fn clear_all(&self) {
        let removed = self.inner.remove_matching(|_| true, Removal::Cleared);
        tracing::debug!("Cleared {} cache entries", removed);
    }

    /// Removes every entry older than the configured TTL.
    ///
    /// Returns the number of removed entries.
    pub fn sweep_expired(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.sweep_expired(&mut state, Instant::now())
    }

    /// Evicts least recently used entries until usage is at or below the target.
    pub fn evict_lru(&self) -> EvictionReport {
        self.evict(EvictionOrder::LeastRecentlyUsed)
    }

    /// Evicts the largest entries until usage is at or below the target.
    pub fn evict_largest(&self) -> EvictionReport {
        self.evict(EvictionOrder::LargestFirst)
    }

    /// Evicts the earliest created entries until usage is at or below the target.
    pub fn evict_oldest(&self) -> EvictionReport {
        self.evict(EvictionOrder::OldestFirst)
    }

    fn evict(&self, order: EvictionOrder) -> EvictionReport {
        let mut state = self.inner.state.lock();
        self.inner.evict_to_target(&mut state, order, None)
    }

    /// The rolling hit rate of [`resolve`](Self::resolve) calls.
    pub fn hit_rate(&self) -> f64 {
        self.inner.state.lock().hit_rate.rate()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        let now = Instant::now();
        let config = &self.inner.config;

        let usage_percent = match config.capacity_bytes {
            0 => 0.0,
            capacity => state.total_bytes as f64 / capacity as f64 * 100.0,
        };
        let entries = state.entries.values();
        let ages = entries.clone().map(|e| now.saturating_duration_since(e.created_at));
        let sizes = entries.map(|e| e.size_bytes);

        CacheStats {
            used_bytes: state.total_bytes,
            capacity_bytes: config.capacity_bytes,
            item_count: state.entries.len(),
            usage_percent,
            in_flight: state.in_flight.len(),
            hit_rate: state.hit_rate.rate(),
            oldest_entry_age: ages.clone().max(),
            newest_entry_age: ages.min(),
            largest_entry_bytes: sizes.clone().max(),
            smallest_entry_bytes: sizes.min(),
        }
    }

    /// Checks that the byte counter equals the sum of all entry sizes.
    pub fn check_accounting(&self) -> bool {
        let state = self.inner.state.lock();
        state.entries.values().map(|e| e.size_bytes).sum::<u64>() == state.total_bytes
    }

    /// Runs one round of background maintenance.
    ///
    /// Sweeps expired entries, evicts if over capacity, and verifies the byte accounting. If the
    /// accounting is found inconsistent, the whole cache is cleared so that every later lookup
    /// fetches fresh.
    pub fn run_maintenance(&self) {
        self.inner.run_maintenance();
    }

    /// Starts the background janitor that runs [`run_maintenance`](Self::run_maintenance) on the
    /// configured interval.
    pub fn start_janitor(&self) -> CacheJanitor {
        CacheJanitor::start(Arc::downgrade(&self.inner), self.inner.config.janitor_interval)
    }
}

impl<H: HandleProvider> CacheInner<H> {
    fn is_expired(&self, entry: &CacheEntry<H::Handle>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) > self.config.ttl
    }

    /// Returns the handle of a live entry and marks it as accessed.
    ///
    /// An expired entry is removed instead.
    fn lookup(
        &self,
        state: &mut CacheState<H::Handle>,
        key: &CacheKey,
        now: Instant,
    ) -> Option<H::Handle> {
        let entry = state.entries.get_mut(key)?;
        if now.saturating_duration_since(entry.created_at) > self.config.ttl {
            tracing::trace!("Dropping expired {}", key);
            self.remove_entry(state, key);
            return None;
        }

        entry.last_accessed_at = now;
        let handle = entry.handle.clone();
        state.hit_rate.record(true);
        tracing::trace!("Cache hit for {}", key);
        Some(handle)
    }

    /// Removes a single entry, revoking its handle and releasing its bytes.
    ///
    /// Every removal goes through here so the byte counter never drifts.
    fn remove_entry(&self, state: &mut CacheState<H::Handle>, key: &CacheKey) -> Option<u64> {
        let entry = state.entries.remove(key)?;
        state.total_bytes = match state.total_bytes.checked_sub(entry.size_bytes) {
            Some(total) => total,
            None => {
                tracing::error!(
                    total_bytes = state.total_bytes,
                    size_bytes = entry.size_bytes,
                    "Cache byte counter underflow"
                );
                0
            }
        };
        self.handles.revoke(&entry.handle);
        Some(entry.size_bytes)
    }

    fn remove_matching<F>(&self, predicate: F, removal: Removal) -> usize
    where
        F: Fn(&CacheKey) -> bool,
    {
        let mut state = self.state.lock();

        if removal == Removal::Invalidated {
            for (key, in_flight) in state.in_flight.iter_mut() {
                if predicate(key) && !in_flight.stale {
                    tracing::debug!("Discarding in-flight fetch of {}", key);
                    in_flight.stale = true;
                }
            }
        }
        let reason = removal.as_str();

        let keys: Vec<_> = state.entries.keys().filter(|&k| predicate(k)).cloned().collect();
        let mut freed_bytes = 0;
        for key in &keys {
            freed_bytes += self.remove_entry(&mut state, key).unwrap_or_default();
        }

        if !keys.is_empty() {
            tracing::debug!(
                "Removed {} entries totaling {} bytes ({})",
                keys.len(),
                freed_bytes,
                reason
            );
            metric!(counter("caches.removed") += keys.len() as i64, "reason" => reason);
        }
        keys.len()
    }

    fn sweep_expired(&self, state: &mut CacheState<H::Handle>, now: Instant) -> usize {
        let expired: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_entry(state, key);
        }

        if !expired.is_empty() {
            tracing::debug!("Swept {} expired entries", expired.len());
            metric!(counter("caches.removed") += expired.len() as i64, "reason" => "expired");
        }
        expired.len()
    }

    fn evict_to_target(
        &self,
        state: &mut CacheState<H::Handle>,
        order: EvictionOrder,
        protected: Option<&CacheKey>,
    ) -> EvictionReport {
        let victims = select_victims(
            &state.entries,
            state.total_bytes,
            self.config.target_bytes(),
            order,
            protected,
        );

        let mut report = EvictionReport::default();
        for key in &victims {
            if let Some(size) = self.remove_entry(state, key) {
                report.evicted += 1;
                report.freed_bytes += size;
            }
        }

        if report.evicted > 0 {
            tracing::debug!(
                "Evicted {} entries totaling {} bytes ({})",
                report.evicted,
                report.freed_bytes,
                order.as_str()
            );
            metric!(counter("caches.evicted") += report.evicted as i64, "order" => order.as_str());
        }
        report
    }

    /// Evicts least recently used entries if usage exceeds the cleanup threshold.
    ///
    /// The `protected` entry is kept even if that leaves usage above the target.
    fn evict_if_needed(
        &self,
        state: &mut CacheState<H::Handle>,
        protected: Option<&CacheKey>,
    ) -> Option<EvictionReport> {
        if state.total_bytes <= self.config.cleanup_bytes() {
            return None;
        }
        tracing::debug!(
            total_bytes = state.total_bytes,
            cleanup_bytes = self.config.cleanup_bytes(),
            "Cache capacity exceeded"
        );
        metric!(counter("caches.capacity_exceeded") += 1);
        Some(self.evict_to_target(state, EvictionOrder::LeastRecentlyUsed, protected))
    }

    /// Settles the fetch `id` for `key`: clears its marker and commits a successful result.
    fn commit(
        &self,
        key: &CacheKey,
        id: u64,
        result: Result<Bytes, FetchError>,
    ) -> Result<H::Handle, FetchError> {
        let mut state = self.state.lock();

        let stale = match state.in_flight.get(key) {
            Some(in_flight) if in_flight.id == id => {
                let stale = in_flight.stale;
                state.in_flight.remove(key);
                stale
            }
            _ => {
                tracing::error!("In-flight marker of {} went missing", key);
                true
            }
        };

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(error = &err as &dyn std::error::Error, "Failed to fetch {}", key);
                metric!(counter("caches.fetch.failed") += 1, "reason" => err.metrics_tag());
                return Err(err);
            }
        };

        if stale {
            tracing::debug!("Not committing invalidated {}", key);
            return Err(FetchError::Invalidated);
        }

        let size_bytes = bytes.len() as u64;
        metric!(time_raw("caches.fetch.size") = size_bytes);

        // Entries are only fetched while none is resident, but never leak a handle regardless.
        self.remove_entry(&mut state, key);

        let handle = self.handles.create(bytes);
        let now = Instant::now();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key.clone(),
            CacheEntry {
                handle: handle.clone(),
                created_at: now,
                last_accessed_at: now,
                size_bytes,
                seq,
            },
        );
        state.total_bytes += size_bytes;
        tracing::trace!("Committed {} ({} bytes)", key, size_bytes);

        // The handle is about to be returned, so the new entry itself is never a victim.
        self.evict_if_needed(&mut state, Some(key));

        Ok(handle)
    }

    /// Removes the marker of a fetch that was abandoned without settling.
    fn clear_marker(&self, key: &CacheKey, id: u64) {
        let mut state = self.state.lock();
        if state.in_flight.get(key).is_some_and(|f| f.id == id) {
            tracing::error!("Fetch of {} was abandoned", key);
            state.in_flight.remove(key);
        }
    }

    pub(super) fn run_maintenance(&self) {
        let mut state = self.state.lock();
        self.sweep_expired(&mut state, Instant::now());
        self.evict_if_needed(&mut state, None);

        let actual: u64 = state.entries.values().map(|e| e.size_bytes).sum();
        if actual != state.total_bytes {
            tracing::error!(
                total_bytes = state.total_bytes,
                actual_bytes = actual,
                "Cache accounting is inconsistent, clearing the cache"
            );
            metric!(counter("caches.accounting_mismatch") += 1);
            let keys: Vec<_> = state.entries.keys().cloned().collect();
            for key in &keys {
                self.remove_entry(&mut state, key);
            }
            state.total_bytes = 0;
        }

        metric!(gauge("caches.size.bytes") = state.total_bytes);
        metric!(gauge("caches.size.items") = state.entries.len() as u64);
    }

    #[cfg(test)]
    pub(super) fn corrupt_accounting(&self, delta: u64) {
        self.state.lock().total_bytes += delta;
    }
}

impl<H: HandleProvider> Drop for CacheInner<H> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, entry) in state.entries.drain() {
            self.handles.revoke(&entry.handle);
        }
        state.total_bytes = 0;
    }
}

#[cfg(test)]
impl<H: HandleProvider> MediaCache<H> {
    pub(super) fn corrupt_accounting(&self, delta: u64) {
        self.inner.corrupt_accounting(delta);
    }
}
