//! Transaction state machine: one user write at a time per action slot.
//!
//! ```text
//! idle -> submitting -> pending-inclusion -> confirmed -> settling -> done
//!              |                |
//!              +----> failed <--+
//! ```
//!
//! `done` and `failed` return to `idle` after the display window or an
//! explicit reset. Entering `confirmed` marks every affected entry as
//! confirmed in the cache before anything else can observe the new state,
//! then asks the router to refetch them.

pub mod preflight;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{Fingerprint, ReadCache, Target};
use crate::chain::abi::{self, Signature};
use crate::chain::{InclusionOutcome, TxHandle, WriteCall, WriteProvider};
use crate::config::{ActionConfig, PreflightCheck, TargetConfig, TransactionsConfig};
use crate::error::{ActionError, FailureCause};
use crate::sync::RouterHandle;
use crate::sync::events::resolve_target;
use crate::template::{Bindings, Template};

pub use preflight::{CheckResult, Preflight};

const HISTORY_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxState {
    Idle,
    Submitting,
    PendingInclusion,
    Confirmed,
    Settling,
    Done,
    Failed,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Done | TxState::Failed)
    }

    /// States from which a new invocation may start.
    pub fn accepts_invoke(&self) -> bool {
        matches!(self, TxState::Idle | TxState::Done | TxState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    Invoke,
    Submitted,
    Included,
    Settle,
    Settled,
    Fail,
    Reset,
}

/// The transition graph. `None` means the event is not allowed in `state`.
pub fn transition(state: TxState, event: TxEvent) -> Option<TxState> {
    use TxEvent as E;
    use TxState as S;
    match (state, event) {
        (S::Idle | S::Done | S::Failed, E::Invoke) => Some(S::Submitting),
        (S::Submitting, E::Submitted) => Some(S::PendingInclusion),
        (S::PendingInclusion, E::Included) => Some(S::Confirmed),
        (S::Confirmed, E::Settle) => Some(S::Settling),
        (S::Settling, E::Settled) => Some(S::Done),
        (S::Submitting | S::PendingInclusion, E::Fail) => Some(S::Failed),
        (S::Idle | S::Done | S::Failed, E::Reset) => Some(S::Idle),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    /// Unique per invocation; `None` while the slot is idle.
    pub action_id: Option<u64>,
    pub slot: String,
    pub state: TxState,
    pub handle: Option<TxHandle>,
    pub affected: Vec<Target>,
    pub failure: Option<FailureCause>,
    pub payload: Value,
}

impl TransactionRecord {
    fn idle(slot: &str) -> Self {
        Self {
            action_id: None,
            slot: slot.to_string(),
            state: TxState::Idle,
            handle: None,
            affected: Vec::new(),
            failure: None,
            payload: Value::Null,
        }
    }
}

/// A configured action with its signature parsed.
#[derive(Debug, Clone)]
pub struct ActionDefinition {
    pub slot: String,
    contract: Template,
    function: Signature,
    args: Vec<Template>,
    value: Option<Template>,
    affects: Vec<TargetConfig>,
    pub preflight: Vec<PreflightCheck>,
}

impl ActionDefinition {
    pub fn from_config(config: &ActionConfig) -> anyhow::Result<Self> {
        let function = config
            .function
            .parse()
            .map_err(|e| anyhow::anyhow!("action '{}': {e}", config.slot))?;
        Ok(Self {
            slot: config.slot.clone(),
            contract: config.contract.clone(),
            function,
            args: config.args.clone(),
            value: config.value.clone(),
            affects: config.affects.clone(),
            preflight: config.preflight.clone(),
        })
    }

    /// Build the write and its affected targets from a payload. Fails if a
    /// placeholder has no value or an argument does not encode.
    pub fn prepare(
        &self,
        payload: &Value,
        account: Option<&str>,
    ) -> Result<(WriteCall, Vec<Target>), ActionError> {
        let invalid = |reason: String| ActionError::InvalidPayload {
            slot: self.slot.clone(),
            reason,
        };
        let bindings = Bindings {
            account,
            payload: Some(payload),
            ..Default::default()
        };
        let missing = |t: &Template| invalid(format!("cannot resolve '{t}'"));
        let target = self
            .contract
            .resolve(&bindings)
            .ok_or_else(|| missing(&self.contract))?;
        let bindings = Bindings {
            contract: Some(&target),
            ..bindings
        };
        let args = self
            .args
            .iter()
            .map(|a| a.resolve(&bindings).ok_or_else(|| missing(a)))
            .collect::<Result<Vec<_>, _>>()?;
        abi::encode_call(&self.function, &args).map_err(|e| invalid(e.to_string()))?;
        let value = match &self.value {
            Some(t) => {
                let wei = t.resolve(&bindings).ok_or_else(|| missing(t))?;
                if wei.parse::<u128>().is_err() {
                    return Err(invalid(format!("value '{wei}' is not an amount in wei")));
                }
                Some(wei)
            }
            None => None,
        };

        let mut targets: Vec<Target> = Vec::new();
        for affect in &self.affects {
            let resolved = resolve_target(affect, &bindings);
            if !targets.contains(&resolved) {
                targets.push(resolved);
            }
        }

        let call = WriteCall {
            target,
            function: self.function.clone(),
            args,
            value,
        };
        Ok((call, targets))
    }
}

struct Slot {
    definition: ActionDefinition,
    record: watch::Sender<TransactionRecord>,
    /// Every transition, in order.
    history: broadcast::Sender<TransactionRecord>,
}

struct Inner {
    slots: HashMap<String, Slot>,
    writer: Arc<dyn WriteProvider>,
    cache: ReadCache,
    router: RouterHandle,
    preflight: Preflight,
    config: TransactionsConfig,
    account: Option<String>,
    next_id: AtomicU64,
}

/// Drives user writes from submission to a settled cache.
#[derive(Clone)]
pub struct TransactionStateMachine {
    inner: Arc<Inner>,
}

impl TransactionStateMachine {
    pub fn new(
        actions: &[ActionConfig],
        account: Option<String>,
        writer: Arc<dyn WriteProvider>,
        cache: ReadCache,
        router: RouterHandle,
        preflight: Preflight,
        config: TransactionsConfig,
    ) -> anyhow::Result<Self> {
        let mut slots = HashMap::new();
        for action in actions {
            let definition = ActionDefinition::from_config(action)?;
            let (record, _) = watch::channel(TransactionRecord::idle(&definition.slot));
            let (history, _) = broadcast::channel(HISTORY_CAPACITY);
            slots.insert(
                definition.slot.clone(),
                Slot {
                    definition,
                    record,
                    history,
                },
            );
        }
        Ok(Self {
            inner: Arc::new(Inner {
                slots,
                writer,
                cache,
                router,
                preflight,
                config,
                account,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn slots(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definition(&self, slot: &str) -> Result<&ActionDefinition, ActionError> {
        Ok(&self.inner.slot(slot)?.definition)
    }

    pub fn record(&self, slot: &str) -> Result<TransactionRecord, ActionError> {
        Ok(self.inner.slot(slot)?.record.borrow().clone())
    }

    /// Every future transition of the slot, across invocations.
    pub fn transitions(&self, slot: &str) -> Result<broadcast::Receiver<TransactionRecord>, ActionError> {
        Ok(self.inner.slot(slot)?.history.subscribe())
    }

    /// Start a write. Rejected without touching the record unless the slot
    /// is idle, done or failed.
    pub fn invoke(&self, slot_name: &str, payload: Value) -> Result<RecordStream, ActionError> {
        let slot = self.inner.slot(slot_name)?;
        let (call, targets) = slot
            .definition
            .prepare(&payload, self.inner.account.as_deref())?;

        let rx = slot.history.subscribe();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let started = TransactionRecord {
            action_id: Some(id),
            slot: slot_name.to_string(),
            state: TxState::Submitting,
            handle: None,
            affected: targets.clone(),
            failure: None,
            payload,
        };
        let accepted = slot.record.send_if_modified(|r| {
            if r.state.accepts_invoke() {
                *r = started.clone();
                true
            } else {
                false
            }
        });
        if !accepted {
            debug!(slot = %slot_name, "invoke rejected, transaction in flight");
            return Err(ActionError::Busy(slot_name.to_string()));
        }
        let _ = slot.history.send(started);
        info!(slot = %slot_name, action_id = id, target = %call.target, "action started");

        let inner = self.inner.clone();
        let name = slot_name.to_string();
        tokio::spawn(async move { inner.drive(name, id, call, targets).await });

        Ok(RecordStream {
            rx,
            action_id: id,
            finished: false,
        })
    }

    /// Return a terminal slot to idle. A no-op when already idle.
    pub fn reset(&self, slot_name: &str) -> Result<TransactionRecord, ActionError> {
        let slot = self.inner.slot(slot_name)?;
        let mut in_flight = false;
        let changed = slot.record.send_if_modified(|r| match r.state {
            TxState::Idle => false,
            s if s.is_terminal() => {
                *r = TransactionRecord::idle(slot_name);
                true
            }
            _ => {
                in_flight = true;
                false
            }
        });
        if in_flight {
            return Err(ActionError::NotResettable(slot_name.to_string()));
        }
        let current = slot.record.borrow().clone();
        if changed {
            let _ = slot.history.send(current.clone());
            debug!(slot = %slot_name, "slot reset");
        }
        Ok(current)
    }
}

impl Inner {
    fn slot(&self, name: &str) -> Result<&Slot, ActionError> {
        self.slots
            .get(name)
            .ok_or_else(|| ActionError::UnknownSlot(name.to_string()))
    }

    /// Apply `event` to the record of invocation `id`, if it is still the
    /// slot's current invocation and the graph allows it.
    fn advance(&self, slot: &Slot, id: u64, event: TxEvent, update: impl FnOnce(&mut TransactionRecord)) -> bool {
        let changed = slot.record.send_if_modified(|r| {
            if r.action_id != Some(id) {
                return false;
            }
            let Some(next) = transition(r.state, event) else {
                return false;
            };
            r.state = next;
            update(r);
            true
        });
        if changed {
            let record = slot.record.borrow().clone();
            debug!(slot = %record.slot, action_id = id, state = ?record.state, "transition");
            let _ = slot.history.send(record);
        } else {
            warn!(slot = %slot.definition.slot, action_id = id, ?event, "transition not allowed");
        }
        changed
    }

    async fn drive(self: Arc<Self>, name: String, id: u64, call: WriteCall, targets: Vec<Target>) {
        let Ok(slot) = self.slot(&name) else {
            return;
        };
        let started = Instant::now();
        match self.execute(slot, id, &call, &targets).await {
            Ok(()) => {
                info!(slot = %name, action_id = id, "action done");
                metrics::counter!("vaultsync_actions_total", "slot" => name.clone(), "outcome" => "done")
                    .increment(1);
            }
            Err(cause) => {
                warn!(slot = %name, action_id = id, cause = cause.label(), "action failed");
                metrics::counter!("vaultsync_actions_total", "slot" => name.clone(), "outcome" => cause.label())
                    .increment(1);
                self.advance(slot, id, TxEvent::Fail, |r| r.failure = Some(cause));
            }
        }
        metrics::histogram!("vaultsync_action_duration_seconds", "slot" => name.clone())
            .record(started.elapsed().as_secs_f64());

        tokio::time::sleep(self.config.display_window).await;
        let expired = slot.record.send_if_modified(|r| {
            if r.action_id == Some(id) && r.state.is_terminal() {
                *r = TransactionRecord::idle(&name);
                true
            } else {
                false
            }
        });
        if expired {
            let _ = slot.history.send(slot.record.borrow().clone());
            debug!(slot = %name, action_id = id, "display window elapsed, slot idle");
        }
    }

    async fn execute(
        &self,
        slot: &Slot,
        id: u64,
        call: &WriteCall,
        targets: &[Target],
    ) -> Result<(), FailureCause> {
        let issues = self.preflight.issues(&slot.definition.preflight).await;
        if !issues.is_empty() {
            return Err(FailureCause::PreconditionNotMet(issues));
        }

        let handle = self.writer.submit(call).await?;
        info!(slot = %slot.definition.slot, action_id = id, handle = %handle, "transaction submitted");
        self.advance(slot, id, TxEvent::Submitted, |r| r.handle = Some(handle.clone()));

        let outcome = tokio::time::timeout(
            self.config.inclusion_timeout,
            self.writer.await_inclusion(&handle),
        )
        .await
        .unwrap_or(InclusionOutcome::Timeout);
        match outcome {
            InclusionOutcome::Included => {}
            InclusionOutcome::Reverted => return Err(FailureCause::Reverted),
            InclusionOutcome::Timeout => return Err(FailureCause::Timeout),
        }

        // Marked before `confirmed` is published so no reader sees an entry
        // fresh from a fetch older than this write.
        let fingerprints = expand(targets, &self.cache.fingerprints());
        for fp in &fingerprints {
            self.cache.mark_confirmed(fp);
        }
        self.advance(slot, id, TxEvent::Included, |_| {});
        self.router.on_action_confirmed(fingerprints.clone()).await;

        self.advance(slot, id, TxEvent::Settle, |_| {});
        let settling = futures_util::future::join_all(fingerprints.iter().map(|fp| self.cache.settled(fp)));
        if tokio::time::timeout(self.config.settle_timeout, settling).await.is_err() {
            warn!(
                slot = %slot.definition.slot,
                action_id = id,
                entries = fingerprints.len(),
                "affected entries did not settle in time"
            );
        }
        self.advance(slot, id, TxEvent::Settled, |_| {});
        Ok(())
    }
}

/// Fingerprints named by `targets`, with kind wildcards expanded over the
/// entries currently cached.
fn expand(targets: &[Target], known: &[Fingerprint]) -> Vec<Fingerprint> {
    let mut out: Vec<Fingerprint> = Vec::new();
    for target in targets {
        let matched: Vec<&Fingerprint> = match target {
            Target::Exact(fp) => vec![fp],
            Target::Kind(_) => known.iter().filter(|fp| target.matches(fp)).collect(),
        };
        for fp in matched {
            if !out.contains(fp) {
                out.push(fp.clone());
            }
        }
    }
    out
}

/// Transitions of one invocation, ending with its terminal state.
#[derive(Debug)]
pub struct RecordStream {
    rx: broadcast::Receiver<TransactionRecord>,
    action_id: u64,
    finished: bool,
}

impl RecordStream {
    pub fn action_id(&self) -> u64 {
        self.action_id
    }

    pub async fn next(&mut self) -> Option<TransactionRecord> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(record) if record.action_id == Some(self.action_id) => {
                    if record.state.is_terminal() {
                        self.finished = true;
                    }
                    return Some(record);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(action_id = self.action_id, skipped, "record stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = TransactionRecord> + Send + 'static {
        futures_util::stream::unfold(self, |mut s| async move { s.next().await.map(|r| (r, s)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityKind, FreshnessState, LoadFuture, Loader};
    use crate::catalog::Catalog;
    use crate::config::{CacheConfig, Expectation};
    use crate::error::{ReadError, WriteError};
    use crate::retry::RetryPolicy;
    use crate::sync::InvalidationRouter;
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    const POOL: &str = "0x1111111111111111111111111111111111111111";
    const USER: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";

    /// Write provider with a scripted submit result and an inclusion that
    /// waits for `release` unless `auto` is set.
    struct ScriptedWriter {
        submit: Mutex<Result<TxHandle, WriteError>>,
        outcome: InclusionOutcome,
        auto: bool,
        release: Notify,
        submitted: Mutex<Vec<WriteCall>>,
    }

    impl ScriptedWriter {
        fn including() -> Self {
            Self::new(Ok(TxHandle("0xfeed".into())), InclusionOutcome::Included, true)
        }

        fn new(submit: Result<TxHandle, WriteError>, outcome: InclusionOutcome, auto: bool) -> Self {
            Self {
                submit: Mutex::new(submit),
                outcome,
                auto,
                release: Notify::new(),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WriteProvider for ScriptedWriter {
        async fn submit(&self, call: &WriteCall) -> Result<TxHandle, WriteError> {
            self.submitted.lock().unwrap().push(call.clone());
            self.submit.lock().unwrap().clone()
        }

        async fn await_inclusion(&self, _: &TxHandle) -> InclusionOutcome {
            if !self.auto {
                self.release.notified().await;
            }
            self.outcome
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl Loader for Counting {
        fn load(&self, fp: &Fingerprint) -> LoadFuture {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            let value = if fp.kind == EntityKind::ContractStatus {
                json!(false)
            } else {
                json!({ "deposit": 100 + 50 * n })
            };
            async move { Ok::<_, ReadError>(value) }.boxed()
        }
    }

    fn deposit() -> ActionConfig {
        ActionConfig {
            slot: "deposit".into(),
            contract: Template::Literal(POOL.into()),
            function: "deposit(uint256)".into(),
            args: vec!["$payload.amount".parse().unwrap()],
            value: None,
            affects: vec![
                TargetConfig {
                    kind: EntityKind::UserPosition,
                    identity: Some(Template::Account),
                    params: vec![],
                },
                TargetConfig {
                    kind: EntityKind::PoolAggregate,
                    identity: None,
                    params: vec![],
                },
            ],
            preflight: vec![],
        }
    }

    struct Fixture {
        machine: TransactionStateMachine,
        cache: ReadCache,
        loads: Arc<AtomicUsize>,
    }

    fn fixture(action: ActionConfig, writer: Arc<ScriptedWriter>) -> Fixture {
        let cache = ReadCache::new(&CacheConfig {
            retry: RetryPolicy::no_retry(),
            ..CacheConfig::default()
        });
        let loads = Arc::new(AtomicUsize::new(0));
        let router = InvalidationRouter::new(cache.clone(), Duration::from_millis(50), vec![]).spawn();
        let preflight = Preflight::new(cache.clone(), Arc::new(Counting(loads.clone())));
        let machine = TransactionStateMachine::new(
            &[action],
            Some(USER.into()),
            writer,
            cache.clone(),
            router,
            preflight,
            TransactionsConfig {
                inclusion_timeout: Duration::from_secs(180),
                receipt_poll_interval: Duration::from_secs(2),
                settle_timeout: Duration::from_secs(30),
                display_window: Duration::from_secs(5),
            },
        )
        .unwrap();
        Fixture {
            machine,
            cache,
            loads,
        }
    }

    async fn states(mut stream: RecordStream) -> Vec<TxState> {
        let mut out = Vec::new();
        while let Some(record) = stream.next().await {
            out.push(record.state);
        }
        out
    }

    #[test]
    fn test_transition_graph() {
        use TxEvent as E;
        use TxState as S;
        assert_eq!(transition(S::Idle, E::Invoke), Some(S::Submitting));
        assert_eq!(transition(S::Failed, E::Invoke), Some(S::Submitting));
        assert_eq!(transition(S::PendingInclusion, E::Invoke), None);
        assert_eq!(transition(S::Submitting, E::Fail), Some(S::Failed));
        assert_eq!(transition(S::PendingInclusion, E::Fail), Some(S::Failed));
        assert_eq!(transition(S::Confirmed, E::Fail), None);
        assert_eq!(transition(S::Settling, E::Settled), Some(S::Done));
        assert_eq!(transition(S::Settling, E::Reset), None);
        assert_eq!(transition(S::Done, E::Reset), Some(S::Idle));
    }

    #[test]
    fn test_prepare_resolves_payload_and_targets() {
        let def = ActionDefinition::from_config(&deposit()).unwrap();
        let (call, targets) = def.prepare(&json!({ "amount": 50 }), Some(USER)).unwrap();
        assert_eq!(call.target, POOL);
        assert_eq!(call.args, vec!["50".to_string()]);
        assert_eq!(
            targets,
            vec![
                Target::Exact(Fingerprint::new(EntityKind::UserPosition, USER)),
                Target::Kind(EntityKind::PoolAggregate),
            ]
        );

        let err = def.prepare(&json!({}), Some(USER)).unwrap_err();
        assert!(matches!(err, ActionError::InvalidPayload { .. }));
        let err = def.prepare(&json!({ "amount": "lots" }), Some(USER)).unwrap_err();
        assert!(matches!(err, ActionError::InvalidPayload { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposit_runs_to_done_and_refetches_position() {
        let f = fixture(deposit(), Arc::new(ScriptedWriter::including()));
        let position = Fingerprint::new(EntityKind::UserPosition, USER);
        let loader = Arc::new(Counting(f.loads.clone()));
        f.cache.request(&position, loader).await.unwrap();
        assert_eq!(f.cache.state(&position), Some(FreshnessState::Fresh));

        let stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        assert_eq!(
            states(stream).await,
            vec![
                TxState::Submitting,
                TxState::PendingInclusion,
                TxState::Confirmed,
                TxState::Settling,
                TxState::Done,
            ]
        );
        // Fresh before the write, refetched because of it.
        assert_eq!(f.loads.load(Ordering::SeqCst), 2);
        let snap = f.cache.snapshot(&position).unwrap();
        assert_eq!(snap.state, FreshnessState::Fresh);
        assert_eq!(snap.value, Some(json!({ "deposit": 150 })));

        let record = f.machine.record("deposit").unwrap();
        assert_eq!(record.handle, Some(TxHandle("0xfeed".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_while_pending_is_rejected() {
        let writer = Arc::new(ScriptedWriter::new(
            Ok(TxHandle("0x1".into())),
            InclusionOutcome::Included,
            false,
        ));
        let f = fixture(deposit(), writer.clone());
        let mut stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        assert_eq!(stream.next().await.unwrap().state, TxState::Submitting);
        assert_eq!(stream.next().await.unwrap().state, TxState::PendingInclusion);

        let before = f.machine.record("deposit").unwrap();
        let err = f.machine.invoke("deposit", json!({ "amount": 7 })).unwrap_err();
        assert_eq!(err, ActionError::Busy("deposit".into()));
        assert_eq!(f.machine.record("deposit").unwrap(), before);
        assert!(matches!(
            f.machine.reset("deposit"),
            Err(ActionError::NotResettable(_))
        ));

        writer.release.notify_one();
        let rest = states(stream).await;
        assert_eq!(rest.last(), Some(&TxState::Done));
        assert_eq!(writer.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_declined_fails_from_submitting() {
        let writer = Arc::new(ScriptedWriter::new(
            Err(WriteError::UserDeclined),
            InclusionOutcome::Included,
            true,
        ));
        let f = fixture(deposit(), writer);
        let mut stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        assert_eq!(stream.next().await.unwrap().state, TxState::Submitting);
        let failed = stream.next().await.unwrap();
        assert_eq!(failed.state, TxState::Failed);
        assert_eq!(failed.failure, Some(FailureCause::UserDeclined));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_leaves_cache_untouched() {
        let writer = Arc::new(ScriptedWriter::new(
            Ok(TxHandle("0x2".into())),
            InclusionOutcome::Reverted,
            true,
        ));
        let f = fixture(deposit(), writer);
        let position = Fingerprint::new(EntityKind::UserPosition, USER);
        f.cache
            .request(&position, Arc::new(Counting(f.loads.clone())))
            .await
            .unwrap();

        let stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        assert_eq!(
            states(stream).await,
            vec![TxState::Submitting, TxState::PendingInclusion, TxState::Failed]
        );
        assert_eq!(
            f.machine.record("deposit").unwrap().failure,
            Some(FailureCause::Reverted)
        );
        assert_eq!(f.cache.state(&position), Some(FreshnessState::Fresh));
        assert_eq!(f.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inclusion_timeout_fails_record() {
        let writer = Arc::new(ScriptedWriter::new(
            Ok(TxHandle("0x3".into())),
            InclusionOutcome::Included,
            false,
        ));
        let f = fixture(deposit(), writer);
        let stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        let states = states(stream).await;
        assert_eq!(states.last(), Some(&TxState::Failed));
        assert_eq!(
            f.machine.record("deposit").unwrap().failure,
            Some(FailureCause::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_preflight_skips_submission() {
        let mut action = deposit();
        action.preflight = vec![PreflightCheck {
            description: "no active vaults".into(),
            contract: POOL.into(),
            function: "activeVaultsList()".into(),
            returns: "address[]".into(),
            expect: Expectation::NonEmpty,
        }];
        let writer = Arc::new(ScriptedWriter::including());
        let f = fixture(action, writer.clone());
        // The counting loader answers status reads with `false`, which is
        // not a non-empty list.
        let stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        assert_eq!(
            states(stream).await,
            vec![TxState::Submitting, TxState::Failed]
        );
        let record = f.machine.record("deposit").unwrap();
        let Some(FailureCause::PreconditionNotMet(issues)) = record.failure else {
            panic!("expected precondition failure");
        };
        assert!(issues[0].starts_with("no active vaults"));
        assert!(writer.submitted.lock().unwrap().is_empty());
        assert!(
            f.cache
                .state(&Catalog::status_fingerprint(POOL, "activeVaultsList()", "address[]"))
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_window_returns_slot_to_idle() {
        let f = fixture(deposit(), Arc::new(ScriptedWriter::including()));
        let mut transitions = f.machine.transitions("deposit").unwrap();
        let stream = f.machine.invoke("deposit", json!({ "amount": 50 })).unwrap();
        states(stream).await;
        assert_eq!(f.machine.record("deposit").unwrap().state, TxState::Done);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.machine.record("deposit").unwrap().state, TxState::Idle);
        let mut last = None;
        while let Ok(record) = transitions.try_recv() {
            last = Some(record.state);
        }
        assert_eq!(last, Some(TxState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_reinvoke_ignore_stale_display_timer() {
        let f = fixture(deposit(), Arc::new(ScriptedWriter::including()));
        states(f.machine.invoke("deposit", json!({ "amount": 1 })).unwrap()).await;
        assert_eq!(f.machine.reset("deposit").unwrap().state, TxState::Idle);
        assert_eq!(f.machine.reset("deposit").unwrap().state, TxState::Idle);

        let mut second = f.machine.invoke("deposit", json!({ "amount": 2 })).unwrap();
        assert_eq!(second.next().await.unwrap().state, TxState::Submitting);
        // The first invocation's timer fires while the second is running.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_ne!(f.machine.record("deposit").unwrap().state, TxState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_slot_and_invalid_payload() {
        let f = fixture(deposit(), Arc::new(ScriptedWriter::including()));
        assert!(matches!(
            f.machine.invoke("withdraw", json!({})),
            Err(ActionError::UnknownSlot(_))
        ));
        let before = f.machine.record("deposit").unwrap();
        assert!(matches!(
            f.machine.invoke("deposit", json!({ "amount": -1 })),
            Err(ActionError::InvalidPayload { .. })
        ));
        assert_eq!(f.machine.record("deposit").unwrap(), before);
    }

    #[test]
    fn test_expand_wildcards_over_known_entries() {
        let known = vec![
            Fingerprint::new(EntityKind::PoolAggregate, "0x1"),
            Fingerprint::new(EntityKind::PoolAggregate, "0x2"),
            Fingerprint::new(EntityKind::UserPosition, USER),
        ];
        let targets = vec![
            Target::Exact(Fingerprint::new(EntityKind::UserPosition, USER)),
            Target::Kind(EntityKind::PoolAggregate),
        ];
        let fps = expand(&targets, &known);
        assert_eq!(fps.len(), 3);
        assert_eq!(fps[0].kind, EntityKind::UserPosition);
    }
}
