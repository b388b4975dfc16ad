pub mod fingerprint;
pub mod policy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::ReadError;
use crate::retry::RetryPolicy;

pub use fingerprint::{EntityKind, Fingerprint, Target};

pub type LoadFuture = BoxFuture<'static, Result<Value, ReadError>>;

/// Produces the current ledger value for a fingerprint.
pub trait Loader: Send + Sync + 'static {
    fn load(&self, fingerprint: &Fingerprint) -> LoadFuture;
}

impl<F> Loader for F
where
    F: Fn(&Fingerprint) -> LoadFuture + Send + Sync + 'static,
{
    fn load(&self, fingerprint: &Fingerprint) -> LoadFuture {
        self(fingerprint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FreshnessState {
    Empty,
    Fresh,
    Stale,
    Refetching,
    Error,
}

/// Read-only view of an entry, published to subscribers on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySnapshot {
    pub fingerprint: Fingerprint,
    pub value: Option<Value>,
    pub state: FreshnessState,
    #[serde(rename = "fetched_ms_ago", serialize_with = "serialize_age")]
    pub age: Option<Duration>,
    pub error: Option<String>,
}

fn serialize_age<S: serde::Serializer>(age: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match age {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

struct InFlight {
    generation: u64,
    started_seq: u64,
    abort: AbortHandle,
    /// Requesters without a value to fall back on wait here.
    done: broadcast::Sender<Result<Value, ReadError>>,
}

struct CacheEntry {
    value: Option<Value>,
    fetched_at: Option<Instant>,
    stale_after: Duration,
    state: FreshnessState,
    last_error: Option<ReadError>,
    loader: Option<Arc<dyn Loader>>,
    /// Bumped whenever a fetch starts; only the current generation may land.
    generation: u64,
    in_flight: Option<InFlight>,
    /// Sequence of the latest invalidation that raced an in-flight fetch.
    invalidated_seq: Option<u64>,
    /// Sequence of the latest confirmed write affecting this entry.
    confirmed_seq: Option<u64>,
    observers: usize,
    watch: watch::Sender<EntitySnapshot>,
}

impl CacheEntry {
    fn new(fp: &Fingerprint, stale_after: Duration) -> Self {
        let (watch, _) = watch::channel(EntitySnapshot {
            fingerprint: fp.clone(),
            value: None,
            state: FreshnessState::Empty,
            age: None,
            error: None,
        });
        Self {
            value: None,
            fetched_at: None,
            stale_after,
            state: FreshnessState::Empty,
            last_error: None,
            loader: None,
            generation: 0,
            in_flight: None,
            invalidated_seq: None,
            confirmed_seq: None,
            observers: 0,
            watch,
        }
    }

    fn snapshot(&self, fp: &Fingerprint, now: Instant) -> EntitySnapshot {
        EntitySnapshot {
            fingerprint: fp.clone(),
            value: self.value.clone(),
            state: self.state,
            age: self.fetched_at.map(|t| now.saturating_duration_since(t)),
            error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    fn publish(&self, fp: &Fingerprint, now: Instant) {
        self.watch.send_replace(self.snapshot(fp, now));
    }

    /// Lazily apply the staleness window.
    fn refresh(&mut self, fp: &Fingerprint, now: Instant) {
        if self.state == FreshnessState::Fresh
            && self
                .fetched_at
                .is_some_and(|t| now.saturating_duration_since(t) > self.stale_after)
        {
            self.state = FreshnessState::Stale;
            debug!(fingerprint = %fp, "entry expired");
            self.publish(fp, now);
        }
    }
}

struct Inner {
    entries: DashMap<Fingerprint, CacheEntry>,
    config: CacheConfig,
    retry: RetryPolicy,
    seq: AtomicU64,
}

/// The one shared cache of ledger-derived values.
///
/// All mutation happens inside synchronous methods; the only suspension
/// points are loader calls running in spawned fetch tasks. Cloning is cheap
/// and every clone shares the same entries.
#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<Inner>,
}

enum RequestPlan {
    Ready(Result<Value, ReadError>),
    Wait(broadcast::Receiver<Result<Value, ReadError>>),
}

impl ReadCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                retry: config.retry,
                config: config.clone(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn new_entry(&self, fp: &Fingerprint) -> CacheEntry {
        CacheEntry::new(fp, policy::resolve_stale_after(&self.inner.config, fp.kind))
    }

    /// Current value, if any. Never performs I/O, but does apply the
    /// staleness window.
    pub fn get(&self, fp: &Fingerprint) -> Option<Value> {
        let mut entry = self.inner.entries.get_mut(fp)?;
        entry.refresh(fp, Instant::now());
        entry.value.clone()
    }

    pub fn snapshot(&self, fp: &Fingerprint) -> Option<EntitySnapshot> {
        let now = Instant::now();
        let mut entry = self.inner.entries.get_mut(fp)?;
        entry.refresh(fp, now);
        Some(entry.snapshot(fp, now))
    }

    pub fn state(&self, fp: &Fingerprint) -> Option<FreshnessState> {
        self.snapshot(fp).map(|s| s.state)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Read through the cache.
    ///
    /// Fresh entries resolve immediately. Stale entries resolve immediately
    /// with their last value and refresh in the background. Otherwise the
    /// caller waits for a single shared load; concurrent callers for the same
    /// fingerprint never start a second one.
    pub async fn request(
        &self,
        fp: &Fingerprint,
        loader: Arc<dyn Loader>,
    ) -> Result<Value, ReadError> {
        let mut rx = match self.plan_request(fp, loader) {
            RequestPlan::Ready(result) => return result,
            RequestPlan::Wait(rx) => rx,
        };
        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Cancelled),
        }
    }

    /// Like [`request`](Self::request) but never waits: registers the loader
    /// and starts a load if the entry needs one.
    pub fn prefetch(&self, fp: &Fingerprint, loader: Arc<dyn Loader>) {
        let _ = self.plan_request(fp, loader);
    }

    fn plan_request(&self, fp: &Fingerprint, loader: Arc<dyn Loader>) -> RequestPlan {
        let now = Instant::now();
        let kind = fp.kind.as_str();
        let mut entry = self
            .inner
            .entries
            .entry(fp.clone())
            .or_insert_with(|| self.new_entry(fp));
        entry.loader = Some(loader);
        entry.refresh(fp, now);

        match (entry.state, entry.value.clone()) {
            (FreshnessState::Fresh, Some(value)) => {
                metrics::counter!("vaultsync_cache_hits_total", "kind" => kind).increment(1);
                RequestPlan::Ready(Ok(value))
            }
            (FreshnessState::Refetching, Some(value)) => {
                metrics::counter!("vaultsync_cache_coalesced_total", "kind" => kind).increment(1);
                RequestPlan::Ready(Ok(value))
            }
            (FreshnessState::Error, value)
                if matches!(entry.last_error, Some(ReadError::Permanent(_))) =>
            {
                // Permanent failures wait for an invalidation before retrying.
                match value {
                    Some(v) => RequestPlan::Ready(Ok(v)),
                    None => RequestPlan::Ready(Err(entry
                        .last_error
                        .clone()
                        .unwrap_or(ReadError::Cancelled))),
                }
            }
            (_, Some(value)) => {
                metrics::counter!("vaultsync_cache_stale_served_total", "kind" => kind)
                    .increment(1);
                self.start_fetch(fp, &mut entry);
                RequestPlan::Ready(Ok(value))
            }
            (_, None) => {
                metrics::counter!("vaultsync_cache_misses_total", "kind" => kind).increment(1);
                if entry.in_flight.is_none() {
                    self.start_fetch(fp, &mut entry);
                }
                match entry.in_flight.as_ref() {
                    Some(f) => RequestPlan::Wait(f.done.subscribe()),
                    None => RequestPlan::Ready(Err(ReadError::Cancelled)),
                }
            }
        }
    }

    /// Start (or restart) the fetch for an entry. A running fetch is
    /// superseded: it is aborted and its result would be discarded anyway.
    fn start_fetch(&self, fp: &Fingerprint, entry: &mut CacheEntry) -> bool {
        let Some(loader) = entry.loader.clone() else {
            return false;
        };
        entry.generation += 1;
        let generation = entry.generation;
        let done = match entry.in_flight.take() {
            Some(prev) => {
                prev.abort.abort();
                metrics::counter!("vaultsync_cache_superseded_total", "kind" => fp.kind.as_str())
                    .increment(1);
                prev.done
            }
            None => broadcast::channel(1).0,
        };

        let cache = self.clone();
        let key = fp.clone();
        let retry = self.inner.retry;
        let handle = tokio::spawn(async move {
            metrics::counter!("vaultsync_loader_calls_total", "kind" => key.kind.as_str())
                .increment(1);
            let result = retry.run(|| loader.load(&key)).await;
            cache.complete(&key, generation, result);
        });

        entry.in_flight = Some(InFlight {
            generation,
            started_seq: self.next_seq(),
            abort: handle.abort_handle(),
            done,
        });
        entry.state = FreshnessState::Refetching;
        debug!(fingerprint = %fp, generation, "fetch started");
        entry.publish(fp, Instant::now());
        true
    }

    fn complete(&self, fp: &Fingerprint, generation: u64, result: Result<Value, ReadError>) {
        let Some(mut entry) = self.inner.entries.get_mut(fp) else {
            return;
        };
        let in_flight = match entry.in_flight.take() {
            Some(f) if f.generation == generation => f,
            other => {
                entry.in_flight = other;
                debug!(fingerprint = %fp, generation, "discarding superseded result");
                metrics::counter!("vaultsync_cache_discarded_total", "kind" => fp.kind.as_str())
                    .increment(1);
                return;
            }
        };

        let now = Instant::now();
        match &result {
            Ok(_)
                if entry
                    .confirmed_seq
                    .is_some_and(|c| in_flight.started_seq < c) =>
            {
                // Started before a confirmed write; it cannot be trusted.
                debug!(fingerprint = %fp, "discarding pre-confirmation result");
                entry.state = FreshnessState::Stale;
            }
            Ok(value) => {
                entry.value = Some(value.clone());
                entry.fetched_at = Some(now);
                entry.last_error = None;
                entry.state = if entry
                    .invalidated_seq
                    .is_some_and(|s| s > in_flight.started_seq)
                {
                    FreshnessState::Stale
                } else {
                    FreshnessState::Fresh
                };
                debug!(fingerprint = %fp, state = ?entry.state, "fetch complete");
            }
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, has_value = entry.value.is_some(), "fetch failed");
                metrics::counter!("vaultsync_cache_fetch_errors_total", "kind" => fp.kind.as_str())
                    .increment(1);
                entry.last_error = Some(e.clone());
                entry.state = FreshnessState::Error;
            }
        }
        entry.publish(fp, now);
        let _ = in_flight.done.send(result);
    }

    fn invalidate_entry(&self, fp: &Fingerprint, entry: &mut CacheEntry, force: bool) -> bool {
        if entry.in_flight.is_some() {
            entry.invalidated_seq = Some(self.next_seq());
        }
        if force && self.start_fetch(fp, entry) {
            return true;
        }
        match entry.state {
            FreshnessState::Fresh | FreshnessState::Error => {
                entry.state = FreshnessState::Stale;
                entry.publish(fp, Instant::now());
                true
            }
            FreshnessState::Stale | FreshnessState::Empty | FreshnessState::Refetching => false,
        }
    }

    /// Mark matching entries stale; with `force_refetch`, also start their
    /// refetch now instead of waiting for the next request. Returns how many
    /// entries changed.
    pub fn invalidate(&self, target: &Target, force_refetch: bool) -> usize {
        match target {
            Target::Exact(fp) => match self.inner.entries.get_mut(fp) {
                Some(mut entry) => self.invalidate_entry(fp, &mut entry, force_refetch) as usize,
                None => 0,
            },
            Target::Kind(kind) => {
                let mut changed = 0;
                for mut item in self.inner.entries.iter_mut() {
                    if item.key().kind != *kind {
                        continue;
                    }
                    let fp = item.key().clone();
                    if self.invalidate_entry(&fp, item.value_mut(), force_refetch) {
                        changed += 1;
                    }
                }
                changed
            }
        }
    }

    /// Invalidate after a confirmed write. Any fetch that started before this
    /// call can no longer land, and a new one starts immediately.
    pub fn invalidate_confirmed(&self, fp: &Fingerprint) -> bool {
        self.confirm(fp, true)
    }

    /// Record a confirmed write without fetching: a fresh entry turns stale
    /// and no fetch started before this call can make it fresh again.
    pub fn mark_confirmed(&self, fp: &Fingerprint) -> bool {
        self.confirm(fp, false)
    }

    fn confirm(&self, fp: &Fingerprint, force: bool) -> bool {
        let seq = self.next_seq();
        match self.inner.entries.get_mut(fp) {
            Some(mut entry) => {
                entry.confirmed_seq = Some(seq);
                self.invalidate_entry(fp, &mut entry, force)
            }
            None => false,
        }
    }

    /// Mark fresh entries of `kinds` whose window has elapsed as stale,
    /// without fetching. Returns the number of entries that expired.
    pub fn expire(&self, kinds: &[EntityKind]) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for mut item in self.inner.entries.iter_mut() {
            if !kinds.contains(&item.key().kind) {
                continue;
            }
            let fp = item.key().clone();
            let entry = item.value_mut();
            let was_fresh = entry.state == FreshnessState::Fresh;
            entry.refresh(&fp, now);
            if was_fresh && entry.state == FreshnessState::Stale {
                expired += 1;
            }
        }
        expired
    }

    /// Wait until the entry has no fetch in flight and return its snapshot.
    pub async fn settled(&self, fp: &Fingerprint) -> Option<EntitySnapshot> {
        let mut rx = {
            let entry = self.inner.entries.get(fp)?;
            entry.watch.subscribe()
        };
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.state != FreshnessState::Refetching {
                return Some(snapshot);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Observe an entry reactively. Creates an empty entry if none exists.
    pub fn subscribe(&self, fp: &Fingerprint) -> EntitySubscription {
        let mut entry = self
            .inner
            .entries
            .entry(fp.clone())
            .or_insert_with(|| self.new_entry(fp));
        entry.observers += 1;
        EntitySubscription {
            rx: entry.watch.subscribe(),
            cache: self.clone(),
            fingerprint: fp.clone(),
        }
    }

    fn release(&self, fp: &Fingerprint) {
        let Some(mut entry) = self.inner.entries.get_mut(fp) else {
            return;
        };
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers > 0 {
            return;
        }
        let abandoned = entry
            .in_flight
            .as_ref()
            .is_some_and(|f| f.done.receiver_count() == 0);
        if abandoned && let Some(f) = entry.in_flight.take() {
            f.abort.abort();
            entry.state = if entry.value.is_some() {
                FreshnessState::Stale
            } else {
                FreshnessState::Empty
            };
            debug!(fingerprint = %fp, "last observer left, background fetch cancelled");
            entry.publish(fp, Instant::now());
        }
    }

    /// Remove an entry, cancelling any fetch in flight. Waiters see
    /// [`ReadError::Cancelled`].
    pub fn evict(&self, fp: &Fingerprint) -> bool {
        match self.inner.entries.remove(fp) {
            Some((_, entry)) => {
                if let Some(f) = entry.in_flight {
                    f.abort.abort();
                }
                debug!(fingerprint = %fp, "entry evicted");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, fp: &Fingerprint) -> bool {
        self.inner
            .entries
            .get(fp)
            .is_some_and(|e| e.in_flight.is_some())
    }
}

/// Reactive handle on one entry. Dropping the last handle cancels a
/// background refetch nobody is waiting for.
pub struct EntitySubscription {
    rx: watch::Receiver<EntitySnapshot>,
    cache: ReadCache,
    fingerprint: Fingerprint,
}

impl EntitySubscription {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn current(&self) -> EntitySnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next transition. `None` once the entry is evicted.
    pub async fn changed(&mut self) -> Option<EntitySnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl Drop for EntitySubscription {
    fn drop(&mut self) {
        self.cache.release(&self.fingerprint);
    }
}
