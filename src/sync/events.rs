use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::cache::{Fingerprint, Target};
use crate::chain::abi::Signature;
use crate::chain::{LogEvent, LogFilter, SubscriptionTransport};
use crate::config::{EventConfig, TargetConfig};
use crate::sync::router::{InvalidationSignal, RouterHandle, SignalSource};
use crate::template::Bindings;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct EventRule {
    filter: LogFilter,
    targets: Vec<TargetConfig>,
}

/// Maps logs from watched `(contract, event)` pairs to cache targets.
pub struct EventResolver {
    rules: Vec<EventRule>,
    account: Option<String>,
}

impl EventResolver {
    pub fn from_config(events: &[EventConfig], account: Option<String>) -> anyhow::Result<Self> {
        let rules = events
            .iter()
            .map(|e| {
                let event: Signature = e
                    .event
                    .parse()
                    .map_err(|err| anyhow::anyhow!("event '{}': {err}", e.event))?;
                Ok(EventRule {
                    filter: LogFilter {
                        address: e.contract.to_ascii_lowercase(),
                        event,
                    },
                    targets: e.invalidates.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { rules, account })
    }

    /// One filter per configured pair, without duplicates.
    pub fn filters(&self) -> Vec<LogFilter> {
        let mut seen = HashSet::new();
        self.rules
            .iter()
            .filter(|rule| seen.insert(&rule.filter))
            .map(|rule| rule.filter.clone())
            .collect()
    }

    /// Targets for a log, or `None` if no rule watches it.
    pub fn resolve(&self, log: &LogEvent) -> Option<InvalidationSignal> {
        let mut targets = Vec::new();
        for rule in self.rules.iter().filter(|r| r.filter.matches(log)) {
            let bindings = Bindings {
                contract: Some(&log.address),
                account: self.account.as_deref(),
                log: Some(log),
                ..Default::default()
            };
            for target in &rule.targets {
                let resolved = resolve_target(target, &bindings);
                if !targets.contains(&resolved) {
                    targets.push(resolved);
                }
            }
        }
        if targets.is_empty() {
            return None;
        }
        Some(InvalidationSignal {
            source: SignalSource::Event,
            targets,
        })
    }
}

/// Resolve a target template. A template that cannot be filled from the
/// bindings widens to the whole kind rather than being dropped.
pub fn resolve_target(target: &TargetConfig, bindings: &Bindings<'_>) -> Target {
    let Some(identity) = &target.identity else {
        return Target::Kind(target.kind);
    };
    let resolved = identity.resolve(bindings).and_then(|id| {
        target
            .params
            .iter()
            .try_fold(Fingerprint::new(target.kind, id), |fp, p| {
                p.resolve(bindings).map(|v| fp.with_param(v))
            })
    });
    match resolved {
        Some(fp) => Target::Exact(fp),
        None => {
            debug!(kind = %target.kind, identity = %identity, "unresolvable target, widening to kind");
            Target::Kind(target.kind)
        }
    }
}

/// Keeps one subscription per watched pair alive and feeds resolved logs
/// into the router. Logs missed while disconnected are not replayed; block
/// polling covers the gap.
pub struct EventSubscriber {
    chain_name: String,
    transport: Arc<dyn SubscriptionTransport>,
    resolver: Arc<EventResolver>,
    router: RouterHandle,
}

impl EventSubscriber {
    pub fn new(
        chain_name: impl Into<String>,
        transport: Arc<dyn SubscriptionTransport>,
        resolver: Arc<EventResolver>,
        router: RouterHandle,
    ) -> Self {
        Self {
            chain_name: chain_name.into(),
            transport,
            resolver,
            router,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let filters = self.resolver.filters();
        info!(chain = %self.chain_name, pairs = filters.len(), "event subscriber started");
        let watchers = filters.into_iter().map(|filter| {
            let this = self.clone();
            async move { this.watch(filter).await }
        });
        futures_util::future::join_all(watchers).await;
    }

    /// Subscribe to one pair forever, resubscribing with backoff whenever
    /// the transport drops.
    async fn watch(&self, filter: LogFilter) {
        let mut backoff = MIN_BACKOFF;
        loop {
            match self.transport.subscribe(&filter).await {
                Ok(mut logs) => {
                    backoff = MIN_BACKOFF;
                    metrics::gauge!("vaultsync_subscriptions_active").increment(1.0);
                    while let Some(log) = logs.next().await {
                        self.handle_log(&log).await;
                    }
                    metrics::gauge!("vaultsync_subscriptions_active").decrement(1.0);
                    metrics::counter!("vaultsync_subscription_drops_total").increment(1);
                    warn!(
                        chain = %self.chain_name,
                        contract = %filter.address,
                        event = %filter.event,
                        "log subscription dropped"
                    );
                }
                Err(e) => {
                    warn!(
                        chain = %self.chain_name,
                        contract = %filter.address,
                        event = %filter.event,
                        error = %e,
                        "failed to subscribe"
                    );
                }
            }

            info!(chain = %self.chain_name, event = %filter.event, "resubscribing in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn handle_log(&self, log: &LogEvent) {
        match self.resolver.resolve(log) {
            Some(signal) => {
                trace!(
                    address = %log.address,
                    block = ?log.block_number,
                    targets = signal.targets.len(),
                    "log resolved"
                );
                metrics::counter!("vaultsync_events_resolved_total").increment(1);
                self.router.on_event(signal).await;
            }
            None => trace!(address = %log.address, "log matched no rule"),
        }
    }
}
