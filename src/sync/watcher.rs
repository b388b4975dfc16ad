use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::chain::ReadProvider;

/// A new chain head was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTick {
    pub height: u64,
}

/// Polls the chain head on a fixed interval and emits a tick whenever the
/// height strictly increases. Equal and lower heights are suppressed.
pub struct BlockWatcher {
    chain_name: String,
    poll_interval: Duration,
    provider: Arc<dyn ReadProvider>,
    tick_tx: broadcast::Sender<BlockTick>,
    last_height: AtomicU64,
}

impl BlockWatcher {
    pub fn new(
        chain_name: impl Into<String>,
        poll_interval: Duration,
        provider: Arc<dyn ReadProvider>,
    ) -> (Self, broadcast::Receiver<BlockTick>) {
        let (tick_tx, tick_rx) = broadcast::channel(64);
        (
            Self {
                chain_name: chain_name.into(),
                poll_interval,
                provider,
                tick_tx,
                last_height: AtomicU64::new(0),
            },
            tick_rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockTick> {
        self.tick_tx.subscribe()
    }

    pub fn last_height(&self) -> Option<u64> {
        match self.last_height.load(Ordering::Relaxed) {
            0 => None,
            h => Some(h),
        }
    }

    pub async fn run(&self) {
        let mut tick = tokio::time::interval(self.poll_interval);
        info!(chain = %self.chain_name, interval_ms = %self.poll_interval.as_millis(), "block watcher started");

        loop {
            tick.tick().await;
            self.poll_once().await;
        }
    }

    /// Fetch the head once; returns the tick if one was emitted.
    pub async fn poll_once(&self) -> Option<BlockTick> {
        match self.provider.block_number().await {
            Ok(height) => self.observe(height),
            Err(e) => {
                warn!(chain = %self.chain_name, error = %e, "failed to fetch chain head");
                None
            }
        }
    }

    fn observe(&self, height: u64) -> Option<BlockTick> {
        let previous = self.last_height.fetch_max(height, Ordering::Relaxed);
        if height <= previous {
            if height < previous {
                debug!(chain = %self.chain_name, height, previous, "chain head moved backwards, ignored");
            }
            return None;
        }

        debug!(chain = %self.chain_name, height, "new block");
        metrics::gauge!("vaultsync_chain_head_block", "chain" => self.chain_name.clone())
            .set(height as f64);

        let tick = BlockTick { height };
        let _ = self.tick_tx.send(tick);
        Some(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Query;
    use crate::error::ReadError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Returns scripted heads in order, repeating the last one.
    struct ScriptedHead(Mutex<Vec<Result<u64, ReadError>>>);

    #[async_trait]
    impl ReadProvider for ScriptedHead {
        async fn call(&self, _: &str, _: &Query, _: &[String]) -> Result<Value, ReadError> {
            Err(ReadError::Permanent("not used".into()))
        }

        async fn block_number(&self) -> Result<u64, ReadError> {
            let mut heads = self.0.lock().unwrap();
            if heads.len() > 1 {
                heads.remove(0)
            } else {
                heads[0].clone()
            }
        }
    }

    fn watcher(heads: Vec<Result<u64, ReadError>>) -> (BlockWatcher, broadcast::Receiver<BlockTick>) {
        BlockWatcher::new(
            "test",
            Duration::from_secs(12),
            Arc::new(ScriptedHead(Mutex::new(heads))),
        )
    }

    #[tokio::test]
    async fn test_emits_on_increase() {
        let (w, mut rx) = watcher(vec![Ok(10), Ok(11)]);
        assert_eq!(w.poll_once().await, Some(BlockTick { height: 10 }));
        assert_eq!(w.poll_once().await, Some(BlockTick { height: 11 }));
        assert_eq!(rx.try_recv().unwrap().height, 10);
        assert_eq!(rx.try_recv().unwrap().height, 11);
        assert_eq!(w.last_height(), Some(11));
    }

    #[tokio::test]
    async fn test_suppresses_duplicate_and_lower_heights() {
        let (w, mut rx) = watcher(vec![Ok(10), Ok(10), Ok(9), Ok(12)]);
        for _ in 0..4 {
            w.poll_once().await;
        }
        assert_eq!(rx.try_recv().unwrap().height, 10);
        assert_eq!(rx.try_recv().unwrap().height, 12);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_provider_error_emits_nothing() {
        let (w, mut rx) = watcher(vec![Err(ReadError::Transient("timeout".into())), Ok(5)]);
        assert_eq!(w.poll_once().await, None);
        assert_eq!(w.last_height(), None);
        assert_eq!(w.poll_once().await, Some(BlockTick { height: 5 }));
        assert_eq!(rx.try_recv().unwrap().height, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval() {
        let (w, mut rx) = watcher(vec![Ok(1), Ok(2), Ok(3)]);
        let w = Arc::new(w);
        let runner = w.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        // First tick of an interval fires immediately.
        assert_eq!(rx.recv().await.unwrap().height, 1);
        let before = tokio::time::Instant::now();
        assert_eq!(rx.recv().await.unwrap().height, 2);
        assert!(before.elapsed() >= Duration::from_secs(12));
        handle.abort();
    }
}
