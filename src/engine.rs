//! `SyncEngine`: owns the cache and wires every producer of invalidations
//! into it.
//!
//! ```text
//! BlockWatcher ──ticks──┐
//!                       ├──> InvalidationRouter ──> ReadCache <── use_entity / read
//! EventSubscriber ──────┤                              ^
//! TransactionStateMachine ─(confirmed)─────────────────┘
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{EntitySnapshot, EntitySubscription, Fingerprint, Loader, ReadCache, policy};
use crate::catalog::Catalog;
use crate::chain::rpc::RpcClient;
use crate::chain::ws::WsTransport;
use crate::chain::{ReadProvider, SubscriptionTransport, WriteProvider};
use crate::config::Config;
use crate::error::{ActionError, ReadError};
use crate::sync::{BlockWatcher, EventResolver, EventSubscriber, InvalidationRouter, RouterHandle};
use crate::tx::{Preflight, RecordStream, TransactionRecord, TransactionStateMachine};

/// The ledger-facing collaborators the engine consumes.
#[derive(Clone)]
pub struct Providers {
    pub read: Arc<dyn ReadProvider>,
    pub write: Arc<dyn WriteProvider>,
    /// Without a transport only block polling invalidates the cache.
    pub transport: Option<Arc<dyn SubscriptionTransport>>,
}

impl Providers {
    /// JSON-RPC over HTTP for reads and writes, WebSocket for logs when
    /// `ws_url` is set.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let rpc = Arc::new(RpcClient::new(&config.chain, &config.transactions)?);
        let transport = config.chain.ws_url.as_ref().map(|url| {
            Arc::new(WsTransport::new(url.clone(), config.chain.name.clone()))
                as Arc<dyn SubscriptionTransport>
        });
        Ok(Self {
            read: rpc.clone(),
            write: rpc,
            transport,
        })
    }
}

pub struct SyncEngine {
    chain_name: String,
    cache: ReadCache,
    catalog: Arc<Catalog>,
    loader: Arc<dyn Loader>,
    router: RouterHandle,
    watcher: Arc<BlockWatcher>,
    subscriber: Option<Arc<EventSubscriber>>,
    transactions: TransactionStateMachine,
}

impl SyncEngine {
    /// Build every component. Must run inside a tokio runtime; the router
    /// task starts immediately, the watcher and subscriber on [`start`](Self::start).
    pub fn new(config: &Config, providers: Providers) -> anyhow::Result<Self> {
        let account = config.chain.account.clone();
        let cache = ReadCache::new(&config.cache);

        let catalog = Arc::new(Catalog::from_config(&config.entities, account.clone())?);
        let loader = catalog.loader(providers.read.clone());

        let router = InvalidationRouter::new(
            cache.clone(),
            config.router.coalesce_window,
            policy::block_sensitive_kinds(&config.cache),
        )
        .spawn();

        let (watcher, _) = BlockWatcher::new(
            config.chain.name.clone(),
            config.chain.poll_interval,
            providers.read.clone(),
        );

        let subscriber = match (&providers.transport, config.events.is_empty()) {
            (Some(transport), false) => {
                let resolver = Arc::new(EventResolver::from_config(&config.events, account.clone())?);
                Some(Arc::new(EventSubscriber::new(
                    config.chain.name.clone(),
                    transport.clone(),
                    resolver,
                    router.clone(),
                )))
            }
            (None, false) => {
                warn!(chain = %config.chain.name, "events configured without a ws_url, relying on block polling");
                None
            }
            _ => None,
        };

        let transactions = TransactionStateMachine::new(
            &config.actions,
            account,
            providers.write.clone(),
            cache.clone(),
            router.clone(),
            Preflight::new(cache.clone(), loader.clone()),
            config.transactions.clone(),
        )?;

        Ok(Self {
            chain_name: config.chain.name.clone(),
            cache,
            catalog,
            loader,
            router,
            watcher: Arc::new(watcher),
            subscriber,
            transactions,
        })
    }

    /// Spawn the block watcher, the tick pump into the router and the event
    /// subscriber.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let mut ticks = self.watcher.subscribe();
        let router = self.router.clone();
        let chain = self.chain_name.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match ticks.recv().await {
                    Ok(tick) => router.on_block_tick(tick.height).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(chain = %chain, skipped, "block ticks lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        let watcher = self.watcher.clone();
        tasks.push(tokio::spawn(async move { watcher.run().await }));

        if let Some(subscriber) = &self.subscriber {
            tasks.push(tokio::spawn(subscriber.clone().run()));
        }

        info!(
            chain = %self.chain_name,
            kinds = self.catalog.kinds().len(),
            actions = self.transactions.slots().len(),
            events = self.subscriber.is_some(),
            "sync engine started"
        );
        tasks
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn transactions(&self) -> &TransactionStateMachine {
        &self.transactions
    }

    pub fn watcher(&self) -> &BlockWatcher {
        &self.watcher
    }

    /// Observe an entity reactively. Loads it in the background if it is
    /// not fresh.
    pub fn use_entity(&self, fp: &Fingerprint) -> EntitySubscription {
        let subscription = self.cache.subscribe(fp);
        self.cache.prefetch(fp, self.loader.clone());
        subscription
    }

    /// Read through the cache and return the entry as it stands afterwards.
    pub async fn read(&self, fp: &Fingerprint) -> Result<EntitySnapshot, ReadError> {
        self.cache.request(fp, self.loader.clone()).await?;
        self.cache.snapshot(fp).ok_or(ReadError::Cancelled)
    }

    pub fn invoke_action(&self, slot: &str, payload: Value) -> Result<RecordStream, ActionError> {
        self.transactions.invoke(slot, payload)
    }

    pub fn reset_action(&self, slot: &str) -> Result<TransactionRecord, ActionError> {
        self.transactions.reset(slot)
    }

    pub fn evict(&self, fp: &Fingerprint) -> bool {
        self.cache.evict(fp)
    }
}
