//! Turns invalidation signals into cache operations.
//!
//! Signals arriving within one coalescing window are folded into a single
//! batch and applied in one synchronous pass, so a fingerprint targeted by
//! several signals is refetched at most once. The strongest disposition
//! wins: a confirmed write beats an event, which beats a block tick.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::cache::{EntityKind, Fingerprint, ReadCache, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalSource {
    BlockTick,
    Event,
    ExplicitAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationSignal {
    pub source: SignalSource,
    pub targets: Vec<Target>,
}

/// What happens to one fingerprint at flush time. Ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Disposition {
    MarkStale,
    ForceRefetch,
    /// Forced refetch that also discards any fetch started before it.
    Confirmed,
}

#[derive(Debug, Default)]
pub struct Batch {
    /// Highest block height seen in this batch.
    pub height: Option<u64>,
    pub targets: HashMap<Target, Disposition>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Batch {
    pub fn add_tick(&mut self, height: u64) {
        self.height = Some(self.height.map_or(height, |h| h.max(height)));
    }

    pub fn add_signal(&mut self, signal: &InvalidationSignal) {
        let disposition = match signal.source {
            SignalSource::BlockTick => Disposition::MarkStale,
            SignalSource::Event => Disposition::ForceRefetch,
            SignalSource::ExplicitAction => Disposition::Confirmed,
        };
        for target in &signal.targets {
            self.add_target(target.clone(), disposition);
        }
    }

    pub fn add_target(&mut self, target: Target, disposition: Disposition) {
        self.targets
            .entry(target)
            .and_modify(|d| *d = (*d).max(disposition))
            .or_insert(disposition);
    }

    pub fn is_empty(&self) -> bool {
        self.height.is_none() && self.targets.is_empty()
    }
}

/// The resolved effect of a batch on the cache.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushPlan {
    pub expire: bool,
    pub actions: BTreeMap<Fingerprint, Disposition>,
}

/// Expand kind wildcards over the entries the cache currently holds and keep
/// the strongest disposition per fingerprint.
pub fn plan(batch: &Batch, known: &[Fingerprint]) -> FlushPlan {
    let mut actions: BTreeMap<Fingerprint, Disposition> = BTreeMap::new();
    let mut merge = |fp: &Fingerprint, d: Disposition| {
        actions
            .entry(fp.clone())
            .and_modify(|cur| *cur = (*cur).max(d))
            .or_insert(d);
    };
    for (target, disposition) in &batch.targets {
        match target {
            Target::Exact(fp) => merge(fp, *disposition),
            Target::Kind(kind) => known
                .iter()
                .filter(|fp| fp.kind == *kind)
                .for_each(|fp| merge(fp, *disposition)),
        }
    }
    FlushPlan {
        expire: batch.height.is_some(),
        actions,
    }
}

enum Command {
    Tick(u64),
    Signal(InvalidationSignal),
    Confirmed {
        fingerprints: Vec<Fingerprint>,
        applied: oneshot::Sender<()>,
    },
}

/// Cheap handle for feeding the router.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Command>,
}

impl RouterHandle {
    pub async fn on_block_tick(&self, height: u64) {
        let _ = self.tx.send(Command::Tick(height)).await;
    }

    pub async fn on_event(&self, signal: InvalidationSignal) {
        let _ = self.tx.send(Command::Signal(signal)).await;
    }

    /// Returns once the refetch of every fingerprint has been scheduled.
    pub async fn on_action_confirmed(&self, fingerprints: Vec<Fingerprint>) {
        let (applied, done) = oneshot::channel();
        let cmd = Command::Confirmed {
            fingerprints,
            applied,
        };
        if self.tx.send(cmd).await.is_ok() {
            let _ = done.await;
        }
    }
}

pub struct InvalidationRouter {
    cache: ReadCache,
    coalesce_window: Duration,
    block_sensitive: Vec<EntityKind>,
}

impl InvalidationRouter {
    pub fn new(cache: ReadCache, coalesce_window: Duration, block_sensitive: Vec<EntityKind>) -> Self {
        Self {
            cache,
            coalesce_window,
            block_sensitive,
        }
    }

    /// Start the router task and return a handle to it. The task stops once
    /// every handle is dropped.
    pub fn spawn(self) -> RouterHandle {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(self.run(rx));
        RouterHandle { tx }
    }

    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        info!(window_ms = %self.coalesce_window.as_millis(), "invalidation router started");
        while let Some(first) = rx.recv().await {
            let mut batch = Batch::default();
            add_command(&mut batch, first);

            let deadline = tokio::time::sleep(self.coalesce_window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => add_command(&mut batch, cmd),
                        None => break,
                    },
                }
            }
            self.flush(batch);
        }
        debug!("invalidation router stopped");
    }

    /// Apply a batch to the cache in one synchronous pass.
    pub fn flush(&self, mut batch: Batch) -> FlushPlan {
        let plan = plan(&batch, &self.cache.fingerprints());

        let expired = if plan.expire {
            self.cache.expire(&self.block_sensitive)
        } else {
            0
        };

        let mut refetches = 0;
        for (fp, disposition) in &plan.actions {
            let changed = match disposition {
                Disposition::MarkStale => self.cache.invalidate(&Target::Exact(fp.clone()), false) > 0,
                Disposition::ForceRefetch => {
                    self.cache.invalidate(&Target::Exact(fp.clone()), true) > 0
                }
                Disposition::Confirmed => self.cache.invalidate_confirmed(fp),
            };
            if changed && *disposition >= Disposition::ForceRefetch {
                refetches += 1;
            }
            trace!(fingerprint = %fp, ?disposition, changed, "routed");
        }

        debug!(
            height = ?batch.height,
            expired,
            targets = plan.actions.len(),
            refetches,
            "router flush"
        );
        metrics::counter!("vaultsync_router_flushes_total").increment(1);
        metrics::counter!("vaultsync_router_refetches_total").increment(refetches);

        for waiter in batch.waiters.drain(..) {
            let _ = waiter.send(());
        }
        plan
    }
}

fn add_command(batch: &mut Batch, cmd: Command) {
    match cmd {
        Command::Tick(height) => batch.add_tick(height),
        Command::Signal(signal) => batch.add_signal(&signal),
        Command::Confirmed {
            fingerprints,
            applied,
        } => {
            for fp in fingerprints {
                batch.add_target(Target::Exact(fp), Disposition::Confirmed);
            }
            batch.waiters.push(applied);
        }
    }
}
