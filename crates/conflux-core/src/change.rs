//! Change Multiplexer — two-phase commit fan-out.
//!
//! A commit against a datastore runs its subscribers through ordered
//! phases:
//!
//! ```text
//! update (optional, editable diff)
//!    │ any failure ──► rejected (nothing installed, no abort fan-out)
//!    ▼
//! change (verification, descending priority)
//!    │ any failure ──► abort to prior confirmers (ascending priority)
//!    ▼
//! swap (atomic datastore install)
//!    ▼
//! done (best effort; failures are logged, never fatal)
//! ```
//!
//! The synthetic *enabled* phase replays the current configuration as
//! creates to a single newly registered subscription, followed by done.
//!
//! Transactions live in the [`ChangeArena`]; change callbacks read the
//! diff through their event's transaction id, which keeps records free of
//! owned payloads and the ownership graph acyclic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::data::{ChangeIter, ChangeOp, ChangeSet, DataTree, DatastoreKind};
use crate::errinfo::{ErrorCode, ErrorInfo, ErrorItem};
use crate::event::{
    EventPayload, EventPhase, EventRecord, EventState, SessionId, Verdict,
};
use crate::store::{EventStore, StoreError};
use crate::subscription::{GroupId, Subscription, SubscriptionRegistry};
use crate::xpath::XPathFilter;

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// Identifier of a change transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised inside change callbacks using the edit API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    /// Edits are only accepted during the update phase.
    #[error("the change set is not editable in this phase")]
    NotEditable,
}

/// Errors from a commit.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// A subscriber (or its timeout) rejected the transaction.
    #[error("commit rejected in {phase} phase: {errors}")]
    Rejected {
        /// Phase in which the rejection happened.
        phase: EventPhase,
        /// Collected subscriber errors.
        errors: ErrorInfo,
    },
    /// The datastore swap itself failed after verification.
    #[error("datastore swap failed: {0}")]
    Swap(ErrorItem),
    /// Event store failure while fanning out.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CommitError {
    /// Flattens the error into a chain for session attachment.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Rejected { errors, .. } => {
                let mut info = ErrorInfo::from_item(ErrorItem::new(
                    ErrorCode::OperationFailed,
                    "commit failed",
                ));
                info.merge(errors.clone());
                info
            }
            Self::Swap(item) => ErrorInfo::from_item(item.clone()),
            Self::Store(e) => {
                ErrorInfo::from_item(ErrorItem::new(ErrorCode::Internal, e.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TxnShared
// ---------------------------------------------------------------------------

/// Shared state of one transaction: the diff plus queued update-phase
/// edits.
pub struct TxnShared {
    set: RwLock<ChangeSet>,
    edits: Mutex<Vec<ChangeOp>>,
    editable: AtomicBool,
}

impl TxnShared {
    fn new(set: ChangeSet) -> Self {
        Self {
            set: RwLock::new(set),
            edits: Mutex::new(Vec::new()),
            editable: AtomicBool::new(false),
        }
    }

    /// Opens a restartable iterator over the current diff.
    #[must_use]
    pub fn snapshot_iter(&self, filter: Option<&XPathFilter>) -> ChangeIter {
        self.set.read().iter_filtered(filter)
    }

    /// Returns a clone of the current diff.
    #[must_use]
    pub fn snapshot(&self) -> ChangeSet {
        self.set.read().clone()
    }

    pub(crate) fn queue_edit(&self, op: ChangeOp) -> Result<(), ChangeError> {
        if !self.editable.load(Ordering::Acquire) {
            return Err(ChangeError::NotEditable);
        }
        self.edits.lock().push(op);
        Ok(())
    }

    fn open_edits(&self) {
        self.editable.store(true, Ordering::Release);
    }

    /// Closes the edit window and folds queued edits into the diff.
    fn seal_edits(&self) -> usize {
        self.editable.store(false, Ordering::Release);
        let edits: Vec<ChangeOp> = std::mem::take(&mut *self.edits.lock());
        let count = edits.len();
        if count > 0 {
            let mut set = self.set.write();
            for op in edits {
                set.push(op);
            }
        }
        count
    }

    fn touches(&self, filter: &XPathFilter) -> bool {
        self.set.read().touches(filter)
    }
}

// ---------------------------------------------------------------------------
// ChangeArena
// ---------------------------------------------------------------------------

/// Arena of in-flight transactions, keyed by [`TxnId`].
///
/// The pump resolves a change event's transaction id here when building
/// the callback context.
pub struct ChangeArena {
    inner: RwLock<FxHashMap<TxnId, Arc<TxnShared>>>,
    next: AtomicU64,
}

impl ChangeArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FxHashMap::default()),
            next: AtomicU64::new(1),
        }
    }

    /// Registers a change set, returning its transaction id and shared
    /// state.
    pub fn insert(&self, set: ChangeSet) -> (TxnId, Arc<TxnShared>) {
        let id = TxnId(self.next.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(TxnShared::new(set));
        self.inner.write().insert(id, Arc::clone(&shared));
        (id, shared)
    }

    /// Looks up a transaction.
    #[must_use]
    pub fn get(&self, id: TxnId) -> Option<Arc<TxnShared>> {
        self.inner.read().get(&id).cloned()
    }

    /// Drops a finished transaction.
    pub fn remove(&self, id: TxnId) {
        self.inner.write().remove(&id);
    }
}

impl Default for ChangeArena {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ChangeMultiplexer
// ---------------------------------------------------------------------------

/// Result of a successful commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    /// Transaction id assigned to the commit.
    pub txn: TxnId,
    /// `false` when the diff was empty and no events were emitted.
    pub changed: bool,
}

/// Outcome of one fan-out batch member.
struct PhaseVerdict {
    sub: Arc<Subscription>,
    state: EventState,
    verdict: Option<Verdict>,
}

/// Collected results of one phase.
struct PhaseResult {
    results: Vec<PhaseVerdict>,
    /// Failures from voting (non-passive) subscribers, publish failures
    /// included.
    errors: ErrorInfo,
}

impl PhaseResult {
    fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Subscribers that confirmed the phase with ok.
    fn confirmed(&self) -> Vec<Arc<Subscription>> {
        self.results
            .iter()
            .filter(|r| r.state == EventState::CompletedOk)
            .map(|r| Arc::clone(&r.sub))
            .collect()
    }
}

/// Couples datastore commits to change subscriptions.
pub struct ChangeMultiplexer {
    config: EngineConfig,
    store: Arc<EventStore>,
    registry: Arc<SubscriptionRegistry>,
    arena: Arc<ChangeArena>,
}

impl ChangeMultiplexer {
    /// Creates a multiplexer over the shared engine state.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<EventStore>,
        registry: Arc<SubscriptionRegistry>,
        arena: Arc<ChangeArena>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            arena,
        }
    }

    /// Runs a two-phase commit of `changes` against `datastore`.
    ///
    /// `swap` installs the final diff atomically; it runs only after every
    /// change subscriber confirmed, and its failure aborts exactly like a
    /// subscriber failure. The caller is expected to hold the datastore
    /// write lock across the whole call.
    ///
    /// # Errors
    ///
    /// See [`CommitError`]. On error the datastore was not swapped.
    pub fn commit<F>(
        &self,
        datastore: DatastoreKind,
        changes: ChangeSet,
        originator: SessionId,
        timeout: Option<Duration>,
        swap: F,
    ) -> Result<CommitOutcome, CommitError>
    where
        F: FnOnce(&ChangeSet) -> Result<(), ErrorItem>,
    {
        let (txn, shared) = self.arena.insert(changes);
        let result = self.run_commit(datastore, txn, &shared, originator, timeout, swap);
        self.arena.remove(txn);
        result
    }

    fn run_commit<F>(
        &self,
        datastore: DatastoreKind,
        txn: TxnId,
        shared: &Arc<TxnShared>,
        originator: SessionId,
        timeout: Option<Duration>,
        swap: F,
    ) -> Result<CommitOutcome, CommitError>
    where
        F: FnOnce(&ChangeSet) -> Result<(), ErrorItem>,
    {
        if shared.set.read().is_empty() {
            let final_set = shared.snapshot();
            swap(&final_set).map_err(CommitError::Swap)?;
            return Ok(CommitOutcome {
                txn,
                changed: false,
            });
        }

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let subs = self.registry.change_targets(datastore);
        debug!(txn = %txn, datastore = %datastore, subscribers = subs.len(), "commit");

        // update: only subscribers that asked for it; failures reject the
        // transaction before anything is installed, so no abort is sent.
        let update_targets: Vec<Arc<Subscription>> = subs
            .iter()
            .filter(|s| s.flags.update_phase && !s.flags.done_only && shared.touches(&s.filter))
            .cloned()
            .collect();
        if !update_targets.is_empty() {
            shared.open_edits();
            let result = self.fan_out(
                txn,
                EventPhase::Update,
                &order_descending(update_targets),
                originator,
                Instant::now() + timeout,
            );
            let edits = shared.seal_edits();
            if edits > 0 {
                debug!(txn = %txn, edits, "update phase amended the diff");
            }
            if !result.ok() {
                return Err(CommitError::Rejected {
                    phase: EventPhase::Update,
                    errors: result.errors,
                });
            }
        }

        // change: every matching subscriber verifies the final diff.
        let change_targets: Vec<Arc<Subscription>> = subs
            .iter()
            .filter(|s| !s.flags.done_only && shared.touches(&s.filter))
            .cloned()
            .collect();
        let change_result = self.fan_out(
            txn,
            EventPhase::Change,
            &order_descending(change_targets),
            originator,
            Instant::now() + timeout,
        );
        let confirmed = change_result.confirmed();
        if !change_result.ok() {
            self.abort(txn, &confirmed, originator, timeout);
            return Err(CommitError::Rejected {
                phase: EventPhase::Change,
                errors: change_result.errors,
            });
        }

        // Atomic install. A swap failure is treated like a subscriber
        // failure: confirmers are rolled back.
        let final_set = shared.snapshot();
        if let Err(item) = swap(&final_set) {
            self.abort(txn, &confirmed, originator, timeout);
            return Err(CommitError::Swap(item));
        }

        // done: confirmers plus done-only observers; best effort.
        let mut done_targets = confirmed;
        for s in &subs {
            if s.flags.done_only && shared.touches(&s.filter) {
                done_targets.push(Arc::clone(s));
            }
        }
        let done_result = self.fan_out(
            txn,
            EventPhase::Done,
            &order_descending(done_targets),
            originator,
            Instant::now() + timeout,
        );
        if !done_result.ok() {
            warn!(txn = %txn, "done phase reported errors: {}", done_result.errors);
        }

        Ok(CommitOutcome { txn, changed: true })
    }

    /// Rolls back confirmers of a failed transaction, in reverse of the
    /// change-phase order.
    fn abort(
        &self,
        txn: TxnId,
        confirmed: &[Arc<Subscription>],
        originator: SessionId,
        timeout: Duration,
    ) {
        if confirmed.is_empty() {
            return;
        }
        let targets = order_ascending(confirmed.to_vec());
        let result = self.fan_out(
            txn,
            EventPhase::Abort,
            &targets,
            originator,
            Instant::now() + timeout,
        );
        if !result.ok() {
            warn!(txn = %txn, "abort phase reported errors: {}", result.errors);
        }
    }

    /// Replays the current configuration of a datastore as creates to one
    /// freshly registered subscription, then delivers done.
    ///
    /// # Errors
    ///
    /// [`CommitError::Rejected`] if the enabled callback fails; the caller
    /// is expected to withdraw the subscription.
    pub fn run_enabled(
        &self,
        sub: &Arc<Subscription>,
        current: &DataTree,
        originator: SessionId,
        timeout: Option<Duration>,
    ) -> Result<(), CommitError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let (txn, _shared) = self.arena.insert(ChangeSet::as_creates(current));
        debug!(txn = %txn, sub = %sub.id, "enabled replay");

        let targets = vec![Arc::clone(sub)];
        let result = self.fan_out(
            txn,
            EventPhase::Enabled,
            &targets,
            originator,
            Instant::now() + timeout,
        );
        if !result.ok() {
            self.arena.remove(txn);
            return Err(CommitError::Rejected {
                phase: EventPhase::Enabled,
                errors: result.errors,
            });
        }

        let done = self.fan_out(
            txn,
            EventPhase::Done,
            &targets,
            originator,
            Instant::now() + timeout,
        );
        if !done.ok() {
            warn!(txn = %txn, "done after enabled reported errors: {}", done.errors);
        }
        self.arena.remove(txn);
        Ok(())
    }

    /// Publishes one phase to the ordered targets and waits for every
    /// verdict. Targets sharing a priority are published together; the
    /// next priority only starts once the previous batch is terminal.
    fn fan_out(
        &self,
        txn: TxnId,
        phase: EventPhase,
        targets: &[Arc<Subscription>],
        originator: SessionId,
        deadline: Instant,
    ) -> PhaseResult {
        let mut result = PhaseResult {
            results: Vec::new(),
            errors: ErrorInfo::new(),
        };

        let mut idx = 0;
        while idx < targets.len() {
            let priority = targets[idx].priority();
            let mut batch_end = idx;
            while batch_end < targets.len() && targets[batch_end].priority() == priority {
                batch_end += 1;
            }
            let batch = &targets[idx..batch_end];
            idx = batch_end;

            // Publish the whole batch, then wait for all of it.
            let mut published: Vec<(GroupId, Vec<crate::event::EventId>, Vec<Arc<Subscription>>)> =
                Vec::new();
            for sub in batch {
                let record = EventRecord::new(
                    sub.id,
                    phase,
                    EventPayload::Change { txn },
                    originator,
                    deadline,
                );
                match self.store.publish(sub.group, record) {
                    Ok(event_id) => {
                        match published.iter_mut().find(|(g, _, _)| *g == sub.group) {
                            Some((_, ids, subs)) => {
                                ids.push(event_id);
                                subs.push(Arc::clone(sub));
                            }
                            None => published.push((
                                sub.group,
                                vec![event_id],
                                vec![Arc::clone(sub)],
                            )),
                        }
                    }
                    Err(e) => {
                        warn!(txn = %txn, sub = %sub.id, "publish failed: {e}");
                        if !sub.flags.passive {
                            result.errors.push(ErrorItem::new(
                                match e {
                                    StoreError::NoSpace(_) => ErrorCode::NoMemory,
                                    _ => ErrorCode::Internal,
                                },
                                format!("delivering {phase} to {}: {e}", sub.id),
                            ));
                        }
                        result.results.push(PhaseVerdict {
                            sub: Arc::clone(sub),
                            state: EventState::CompletedFail,
                            verdict: None,
                        });
                    }
                }
            }

            for (group, ids, subs) in published {
                let states = match self.store.wait_terminal(group, &ids, deadline) {
                    Ok(states) => states,
                    Err(e) => {
                        warn!(txn = %txn, group = %group, "barrier failed: {e}");
                        result
                            .errors
                            .push(ErrorItem::new(ErrorCode::Internal, e.to_string()));
                        continue;
                    }
                };
                for ((event_id, state, verdict), sub) in states.into_iter().zip(subs) {
                    if !sub.flags.passive {
                        match state {
                            EventState::CompletedOk => {}
                            EventState::TimedOut => result.errors.push(ErrorItem::new(
                                ErrorCode::Timeout,
                                format!("{} timed out in {phase} ({event_id})", sub.id),
                            )),
                            _ => {
                                let item = verdict
                                    .as_ref()
                                    .and_then(|v| v.error.clone())
                                    .unwrap_or_else(|| {
                                        ErrorItem::new(
                                            ErrorCode::OperationFailed,
                                            format!("{} rejected {phase}", sub.id),
                                        )
                                    });
                                result.errors.push(item);
                            }
                        }
                    }
                    result.results.push(PhaseVerdict {
                        sub,
                        state,
                        verdict,
                    });
                }
                let _ = self.store.reap_terminal(group);
            }
        }

        result
    }
}

/// Change-phase order: descending priority, ties by id ascending.
fn order_descending(mut subs: Vec<Arc<Subscription>>) -> Vec<Arc<Subscription>> {
    subs.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id.cmp(&b.id)));
    subs
}

/// Abort order: exact reverse of the change-phase order.
fn order_ascending(subs: Vec<Arc<Subscription>>) -> Vec<Arc<Subscription>> {
    let mut subs = order_descending(subs);
    subs.reverse();
    subs
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::data::DataValue;
    use crate::event::CallbackOutcome;
    use crate::subscription::{change_fn, SubFlags, SubKind, SubscribeOptions};

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        mux: ChangeMultiplexer,
    }

    fn fixture() -> Fixture {
        let config = EngineConfig::builder()
            .default_timeout(Duration::from_secs(2))
            .shelve_retry(Duration::from_millis(5))
            .pump_idle(Duration::from_millis(10))
            .build()
            .unwrap();
        let store = Arc::new(EventStore::new());
        let arena = Arc::new(ChangeArena::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&arena),
        ));
        let mux = ChangeMultiplexer::new(config, store, Arc::clone(&registry), arena);
        Fixture { registry, mux }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.registry.shutdown();
        }
    }

    fn change_kind(priority: i32) -> SubKind {
        SubKind::Change {
            datastore: DatastoreKind::Running,
            priority,
        }
    }

    fn simple_diff() -> ChangeSet {
        let mut new = DataTree::new();
        new.set("/m:x/v", Some(DataValue::Int64(1))).unwrap();
        ChangeSet::from_trees(&DataTree::new(), &new)
    }

    type Log = Arc<StdMutex<Vec<(i32, EventPhase)>>>;

    /// Subscribes an engine-managed recorder that logs `(priority, phase)`
    /// and answers `change` per `ok_on_change`.
    fn recorder(fx: &Fixture, priority: i32, log: &Log, ok_on_change: bool) {
        let log = Arc::clone(log);
        fx.registry
            .subscribe(
                SubscribeOptions::new("m", "/m:x", change_kind(priority)),
                change_fn(move |ctx| {
                    log.lock().unwrap().push((priority, ctx.phase));
                    if ctx.phase == EventPhase::Change && !ok_on_change {
                        CallbackOutcome::fail(ErrorCode::OperationFailed, "refused")
                    } else {
                        CallbackOutcome::Ok
                    }
                }),
            )
            .unwrap();
    }

    // --- commit tests ---

    #[test]
    fn test_commit_success_runs_change_then_done() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&fx, 10, &log, true);
        recorder(&fx, 5, &log, true);

        let swapped = Arc::new(AtomicBool::new(false));
        let swapped2 = Arc::clone(&swapped);
        let outcome = fx
            .mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                move |_set| {
                    swapped2.store(true, Ordering::Release);
                    Ok(())
                },
            )
            .unwrap();
        assert!(outcome.changed);
        assert!(swapped.load(Ordering::Acquire));

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (10, EventPhase::Change),
                (5, EventPhase::Change),
                (10, EventPhase::Done),
                (5, EventPhase::Done),
            ]
        );
    }

    #[test]
    fn test_commit_abort_on_change_failure() {
        // Two-phase abort: A (10) confirms, B (5) refuses. A must see
        // abort, B must not, the datastore must stay untouched.
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&fx, 10, &log, true);
        recorder(&fx, 5, &log, false);

        let swapped = Arc::new(AtomicBool::new(false));
        let swapped2 = Arc::clone(&swapped);
        let err = fx
            .mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                move |_set| {
                    swapped2.store(true, Ordering::Release);
                    Ok(())
                },
            )
            .unwrap_err();

        match &err {
            CommitError::Rejected { phase, errors } => {
                assert_eq!(*phase, EventPhase::Change);
                assert_eq!(errors.first_code(), ErrorCode::OperationFailed);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.to_error_info().first_code(), ErrorCode::OperationFailed);
        assert!(!swapped.load(Ordering::Acquire));

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (10, EventPhase::Change),
                (5, EventPhase::Change),
                (10, EventPhase::Abort),
            ]
        );
    }

    #[test]
    fn test_commit_empty_diff_emits_nothing() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&fx, 0, &log, true);

        let outcome = fx
            .mux
            .commit(
                DatastoreKind::Running,
                ChangeSet::new(),
                SessionId(1),
                None,
                |_set| Ok(()),
            )
            .unwrap();
        assert!(!outcome.changed);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_commit_filter_mismatch_skips_subscriber() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            fx.registry
                .subscribe(
                    SubscribeOptions::new("m", "/m:unrelated", change_kind(0)),
                    change_fn(move |ctx| {
                        log.lock().unwrap().push((0, ctx.phase));
                        CallbackOutcome::Ok
                    }),
                )
                .unwrap();
        }

        fx.mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                |_set| Ok(()),
            )
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_commit_update_phase_edits_diff() {
        let fx = fixture();
        // Updater adds a second leaf during update.
        fx.registry
            .subscribe(
                SubscribeOptions::new("m", "/m:x", change_kind(7)).flags(SubFlags {
                    update_phase: true,
                    ..SubFlags::default()
                }),
                change_fn(move |ctx| {
                    if ctx.phase == EventPhase::Update {
                        ctx.edit(ChangeOp::Create {
                            path: "/m:x/amended".into(),
                            value: Some(DataValue::Bool(true)),
                        })
                        .unwrap();
                    }
                    CallbackOutcome::Ok
                }),
            )
            .unwrap();

        let final_paths: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let final_paths2 = Arc::clone(&final_paths);
        fx.mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                move |set| {
                    *final_paths2.lock().unwrap() =
                        set.ops().iter().map(|op| op.path().to_string()).collect();
                    Ok(())
                },
            )
            .unwrap();

        let paths = final_paths.lock().unwrap().clone();
        assert!(paths.contains(&"/m:x/amended".to_string()));
    }

    #[test]
    fn test_commit_update_failure_rejects_without_abort() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            fx.registry
                .subscribe(
                    SubscribeOptions::new("m", "/m:x", change_kind(1)).flags(SubFlags {
                        update_phase: true,
                        ..SubFlags::default()
                    }),
                    change_fn(move |ctx| {
                        log.lock().unwrap().push((1, ctx.phase));
                        if ctx.phase == EventPhase::Update {
                            CallbackOutcome::fail(ErrorCode::Validation, "bad proposal")
                        } else {
                            CallbackOutcome::Ok
                        }
                    }),
                )
                .unwrap();
        }

        let err = fx
            .mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                |_set| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CommitError::Rejected {
                phase: EventPhase::Update,
                ..
            }
        ));

        // Only the update event; no change, no abort.
        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec![(1, EventPhase::Update)]);
    }

    #[test]
    fn test_commit_done_only_subscriber() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            fx.registry
                .subscribe(
                    SubscribeOptions::new("m", "/m:x", change_kind(0)).flags(SubFlags {
                        done_only: true,
                        ..SubFlags::default()
                    }),
                    change_fn(move |ctx| {
                        log.lock().unwrap().push((0, ctx.phase));
                        CallbackOutcome::Ok
                    }),
                )
                .unwrap();
        }

        fx.mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                |_set| Ok(()),
            )
            .unwrap();
        assert_eq!(log.lock().unwrap().clone(), vec![(0, EventPhase::Done)]);
    }

    #[test]
    fn test_commit_passive_failure_does_not_abort() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&fx, 3, &log, true);
        {
            let log = Arc::clone(&log);
            fx.registry
                .subscribe(
                    SubscribeOptions::new("m", "/m:x", change_kind(9)).flags(SubFlags {
                        passive: true,
                        ..SubFlags::default()
                    }),
                    change_fn(move |ctx| {
                        log.lock().unwrap().push((9, ctx.phase));
                        CallbackOutcome::fail(ErrorCode::OperationFailed, "observer grumbles")
                    }),
                )
                .unwrap();
        }

        // Passive failure is ignored; the commit succeeds.
        fx.mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                |_set| Ok(()),
            )
            .unwrap();

        let events = log.lock().unwrap().clone();
        assert!(events.contains(&(3, EventPhase::Change)));
        assert!(events.contains(&(3, EventPhase::Done)));
        assert!(events.contains(&(9, EventPhase::Change)));
        // The passive observer failed change, so it is not a confirmer and
        // sees no done.
        assert!(!events.contains(&(9, EventPhase::Done)));
        assert!(!events.iter().any(|(_, p)| *p == EventPhase::Abort));
    }

    #[test]
    fn test_commit_swap_failure_aborts_confirmers() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&fx, 2, &log, true);

        let err = fx
            .mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                None,
                |_set| Err(ErrorItem::new(ErrorCode::System, "disk full")),
            )
            .unwrap_err();
        assert!(matches!(err, CommitError::Swap(_)));

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![(2, EventPhase::Change), (2, EventPhase::Abort)]
        );
    }

    #[test]
    fn test_commit_timeout_is_failure() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        recorder(&fx, 10, &log, true);
        {
            // This subscriber shelves forever and must time out.
            fx.registry
                .subscribe(
                    SubscribeOptions::new("m", "/m:x", change_kind(5)),
                    change_fn(move |ctx| {
                        if ctx.phase == EventPhase::Change {
                            CallbackOutcome::Shelve
                        } else {
                            CallbackOutcome::Ok
                        }
                    }),
                )
                .unwrap();
        }

        let err = fx
            .mux
            .commit(
                DatastoreKind::Running,
                simple_diff(),
                SessionId(1),
                Some(Duration::from_millis(100)),
                |_set| Ok(()),
            )
            .unwrap_err();
        match err {
            CommitError::Rejected { phase, errors } => {
                assert_eq!(phase, EventPhase::Change);
                assert_eq!(errors.first_code(), ErrorCode::Timeout);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The confirmer was rolled back.
        let events = log.lock().unwrap().clone();
        assert!(events.contains(&(10, EventPhase::Abort)));
    }

    // --- enabled tests ---

    #[test]
    fn test_enabled_replays_current_config() {
        let fx = fixture();
        let seen: Arc<StdMutex<Vec<(EventPhase, usize)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let id = fx
            .registry
            .subscribe(
                SubscribeOptions::new("m", "/m:x", change_kind(0)).flags(SubFlags {
                    enabled_phase: true,
                    ..SubFlags::default()
                }),
                change_fn(move |ctx| {
                    seen2
                        .lock()
                        .unwrap()
                        .push((ctx.phase, ctx.changes(None).len()));
                    CallbackOutcome::Ok
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let mut current = DataTree::new();
        current.set("/m:x/v", Some(DataValue::Int64(7))).unwrap();
        fx.mux
            .run_enabled(&sub, &current, SessionId(1), None)
            .unwrap();

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, EventPhase::Enabled);
        assert_eq!(events[0].1, 2); // /m:x and /m:x/v as creates
        assert_eq!(events[1].0, EventPhase::Done);
    }

    #[test]
    fn test_enabled_failure_propagates() {
        let fx = fixture();
        let id = fx
            .registry
            .subscribe(
                SubscribeOptions::new("m", "/m:x", change_kind(0)),
                change_fn(|_ctx| CallbackOutcome::fail(ErrorCode::Internal, "not ready")),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let err = fx
            .mux
            .run_enabled(&sub, &DataTree::new(), SessionId(1), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CommitError::Rejected {
                phase: EventPhase::Enabled,
                ..
            }
        ));
    }
}
