//! The event pump: draining groups and invoking callbacks.
//!
//! One pump pass re-queues shelved records, claims every pending record
//! whose deadline has not passed, invokes the matching callback, and
//! writes the verdict back to the store. Passes are serialized per group
//! by the group's process lock; callbacks therefore never run
//! concurrently within one group.
//!
//! Engine-managed groups run [`SubscriptionRegistry::process_events`]
//! from a dedicated worker thread blocking on the group's pipe;
//! caller-managed groups call it from their own thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errinfo::{ErrorCode, ErrorItem};
use crate::event::{CallbackOutcome, EventPayload, EventRecord, EventState, Verdict};
use crate::store::{EventPipe, StoreError};
use crate::subscription::callback::{ChangeContext, NotifContext, OperContext, RpcContext};
use crate::subscription::registry::{
    GroupId, RegistryError, Subscription, SubscriptionRegistry,
};
use crate::data::DataTree;

// ---------------------------------------------------------------------------
// PumpPass
// ---------------------------------------------------------------------------

/// Result of one pump pass.
#[derive(Debug, Clone, Copy)]
pub struct PumpPass {
    /// Records whose callback was invoked during this pass.
    pub processed: usize,
    /// Earliest deadline among records still resting in the group
    /// (pending or shelved); the caller should drain again no later than
    /// this.
    pub next_deadline: Option<Instant>,
}

impl SubscriptionRegistry {
    /// Drains one group: re-queues shelved records, claims pending ones,
    /// invokes callbacks, records verdicts.
    ///
    /// Reentrant-safe against concurrent publishers; one caller at a time
    /// per group (enforced by the group lock — a second caller blocks).
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownGroup`] if the group does not exist (any
    /// longer).
    pub fn process_events(&self, group: GroupId) -> Result<PumpPass, RegistryError> {
        let process_lock = {
            let inner = self.inner.read();
            let entry = inner
                .groups
                .get(&group)
                .ok_or(RegistryError::UnknownGroup(group))?;
            Arc::clone(&entry.process_lock)
        };
        let _guard = process_lock.lock();

        self.store.requeue_shelved(group)?;
        let claimed = self.store.claim_pending(group)?;
        let mut processed = 0;

        for rec in &claimed {
            let (state, verdict) = self.dispatch(rec);
            processed += 1;
            match self.store.update(group, rec.event_id, state, verdict) {
                Ok(()) => {}
                // The phase barrier may have timed the record out while
                // the callback was still running; the verdict is void.
                Err(StoreError::BadTransition { .. } | StoreError::UnknownEvent(_)) => {
                    warn!(group = %group, event = %rec.event_id, "verdict discarded, record already terminal");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let next_deadline = self.store.next_deadline(group)?;
        Ok(PumpPass {
            processed,
            next_deadline,
        })
    }

    /// Invokes the callback for one claimed record.
    fn dispatch(&self, rec: &EventRecord) -> (EventState, Option<Verdict>) {
        let Some(sub) = self.subscription(rec.subscription) else {
            warn!(event = %rec.event_id, sub = %rec.subscription, "record for a removed subscription");
            return (
                EventState::CompletedFail,
                Some(Verdict::fail(ErrorItem::new(
                    ErrorCode::NotFound,
                    "subscription removed while the event was queued",
                ))),
            );
        };

        debug!(event = %rec.event_id, sub = %sub.id, phase = %rec.phase, "dispatch");
        let outcome = self.invoke(&sub, rec);

        match outcome {
            Invoked::Outcome(CallbackOutcome::Ok, output) => {
                sub.counters.delivered.fetch_add(1, Ordering::Relaxed);
                let verdict = match output {
                    Some(tree) => Verdict::ok_with_output(tree),
                    None => Verdict::ok(),
                };
                (EventState::CompletedOk, Some(verdict))
            }
            Invoked::Outcome(CallbackOutcome::Fail(item), _) => {
                sub.counters.failed.fetch_add(1, Ordering::Relaxed);
                (EventState::CompletedFail, Some(Verdict::fail(item)))
            }
            Invoked::Outcome(CallbackOutcome::Shelve, _) => {
                sub.counters.shelved.fetch_add(1, Ordering::Relaxed);
                (EventState::Shelved, None)
            }
            Invoked::Panicked(msg) => {
                sub.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(sub = %sub.id, "callback panicked: {msg}");
                (
                    EventState::CompletedFail,
                    Some(Verdict::fail(ErrorItem::new(
                        ErrorCode::Internal,
                        format!("callback panicked: {msg}"),
                    ))),
                )
            }
        }
    }

    /// Runs the kind-matching callback method, catching panics.
    fn invoke(&self, sub: &Arc<Subscription>, rec: &EventRecord) -> Invoked {
        let result = catch_unwind(AssertUnwindSafe(|| match &rec.payload {
            EventPayload::Change { txn } => {
                let Some(shared) = self.arena.get(*txn) else {
                    return (
                        CallbackOutcome::fail(
                            ErrorCode::Internal,
                            "transaction vanished before dispatch",
                        ),
                        None,
                    );
                };
                let ctx = ChangeContext {
                    session: rec.originator,
                    module: &sub.module,
                    xpath: sub.filter.text(),
                    phase: rec.phase,
                    request: rec.event_id,
                    txn: &shared,
                };
                (sub.callback.on_change(&ctx), None)
            }
            EventPayload::Rpc { xpath, input } => {
                let ctx = RpcContext {
                    session: rec.originator,
                    xpath,
                    input,
                    phase: rec.phase,
                    request: rec.event_id,
                };
                let mut output = DataTree::new();
                let outcome = sub.callback.on_rpc(&ctx, &mut output);
                (outcome, Some(output))
            }
            EventPayload::Notif {
                path,
                data,
                timestamp_ms,
            } => {
                let ctx = NotifContext {
                    session: rec.originator,
                    phase: rec.phase,
                    xpath: path,
                    data,
                    timestamp_ms: *timestamp_ms,
                    request: rec.event_id,
                };
                sub.callback.on_notif(&ctx);
                // Notification verdicts are ignored by contract.
                (CallbackOutcome::Ok, None)
            }
            EventPayload::Oper {
                request_xpath,
                parent_path,
            } => {
                let ctx = OperContext {
                    session: rec.originator,
                    module: &sub.module,
                    provider_xpath: sub.filter.text(),
                    request_xpath,
                    request: rec.event_id,
                    parent_path,
                };
                match sub.callback.on_oper(&ctx) {
                    Ok(tree) => (CallbackOutcome::Ok, Some(tree)),
                    Err(item) => (CallbackOutcome::Fail(item), None),
                }
            }
        }));

        match result {
            Ok((outcome, output)) => Invoked::Outcome(outcome, output),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Invoked::Panicked(msg)
            }
        }
    }

    /// Spawns the worker thread of an engine-managed group.
    pub(crate) fn spawn_worker(
        self: &Arc<Self>,
        group: GroupId,
        pipe: Arc<EventPipe>,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("conflux-pump-{group}"))
            .spawn(move || {
                debug!(group = %group, "pump worker started");
                while !stop.load(Ordering::Acquire) {
                    let wait = registry.worker_wait(group);
                    pipe.wait_ready(Some(wait));
                    if stop.load(Ordering::Acquire) || pipe.is_closed() {
                        break;
                    }
                    match registry.process_events(group) {
                        Ok(_) => {}
                        Err(RegistryError::UnknownGroup(_) | RegistryError::Store(StoreError::UnknownGroup(_))) => break,
                        Err(e) => warn!(group = %group, "pump pass failed: {e}"),
                    }
                }
                debug!(group = %group, "pump worker stopped");
            })
            .expect("spawning a pump worker thread")
    }

    /// Computes how long the worker may sleep before the next pass.
    fn worker_wait(&self, group: GroupId) -> Duration {
        let mut wait = self.config.pump_idle;
        if self.store.shelved_count(group).unwrap_or(0) > 0 {
            wait = wait.min(self.config.shelve_retry);
        }
        if let Ok(Some(deadline)) = self.store.next_deadline(group) {
            let until = deadline.saturating_duration_since(Instant::now());
            wait = wait.min(until.max(Duration::from_millis(1)));
        }
        wait
    }
}

enum Invoked {
    Outcome(CallbackOutcome, Option<DataTree>),
    Panicked(String),
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use crate::change::ChangeArena;
    use crate::config::EngineConfig;
    use crate::data::{ChangeSet, DataValue, DatastoreKind};
    use crate::event::{EventPhase, SessionId};
    use crate::store::EventStore;
    use crate::subscription::callback::{change_fn, notif_fn, oper_fn, rpc_fn};
    use crate::subscription::registry::{SubFlags, SubKind, SubscribeOptions};

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        store: Arc<EventStore>,
        arena: Arc<ChangeArena>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(EventStore::new());
        let arena = Arc::new(ChangeArena::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            EngineConfig::default(),
            Arc::clone(&store),
            Arc::clone(&arena),
        ));
        Fixture {
            registry,
            store,
            arena,
        }
    }

    fn caller_managed(kind: SubKind, filter: &str) -> SubscribeOptions {
        SubscribeOptions::new("m", filter, kind).flags(SubFlags {
            no_thread: true,
            ..SubFlags::default()
        })
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    // --- dispatch tests ---

    #[test]
    fn test_pump_processes_rpc_record() {
        let fx = fixture();
        let id = fx
            .registry
            .subscribe(
                caller_managed(SubKind::Rpc { priority: 0 }, "/m:op"),
                rpc_fn(|_ctx, output| {
                    output
                        .set("/reply", Some(DataValue::Int64(1)))
                        .expect("valid path");
                    CallbackOutcome::Ok
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let ev = fx
            .store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::Rpc,
                    EventPayload::Rpc {
                        xpath: "/m:op".into(),
                        input: DataTree::new(),
                    },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        let pass = fx.registry.process_events(sub.group).unwrap();
        assert_eq!(pass.processed, 1);
        assert_eq!(pass.next_deadline, None);

        let states = fx.store.wait_terminal(sub.group, &[ev], far()).unwrap();
        assert_eq!(states[0].1, EventState::CompletedOk);
        let verdict = states[0].2.as_ref().unwrap();
        assert_eq!(
            verdict.output.as_ref().unwrap().get_value("/reply"),
            Some(&DataValue::Int64(1))
        );
        assert_eq!(fx.registry.metrics(id).unwrap().delivered, 1);
    }

    #[test]
    fn test_pump_change_record_iterates_arena() {
        let fx = fixture();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let id = fx
            .registry
            .subscribe(
                caller_managed(
                    SubKind::Change {
                        datastore: DatastoreKind::Running,
                        priority: 0,
                    },
                    "/m:x",
                ),
                change_fn(move |ctx| {
                    seen2.store(ctx.changes(None).len(), Ordering::Relaxed);
                    CallbackOutcome::Ok
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let mut new = DataTree::new();
        new.set("/m:x/v", Some(DataValue::Int64(1))).unwrap();
        let (txn, _shared) = fx.arena.insert(ChangeSet::from_trees(&DataTree::new(), &new));

        fx.store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::Change,
                    EventPayload::Change { txn },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        fx.registry.process_events(sub.group).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 2); // /m:x and /m:x/v
    }

    #[test]
    fn test_pump_shelve_then_success_counts_invocations() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let id = fx
            .registry
            .subscribe(
                caller_managed(SubKind::Rpc { priority: 0 }, "/m:op"),
                rpc_fn(move |_ctx, _out| {
                    if calls2.fetch_add(1, Ordering::Relaxed) < 2 {
                        CallbackOutcome::Shelve
                    } else {
                        CallbackOutcome::Ok
                    }
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let ev = fx
            .store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::Rpc,
                    EventPayload::Rpc {
                        xpath: "/m:op".into(),
                        input: DataTree::new(),
                    },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        // Shelve, shelve, then ok — three passes, three invocations.
        assert_eq!(fx.registry.process_events(sub.group).unwrap().processed, 1);
        assert_eq!(fx.registry.process_events(sub.group).unwrap().processed, 1);
        assert_eq!(fx.registry.process_events(sub.group).unwrap().processed, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 3);

        let states = fx.store.wait_terminal(sub.group, &[ev], far()).unwrap();
        assert_eq!(states[0].1, EventState::CompletedOk);
        assert_eq!(fx.registry.metrics(id).unwrap().shelved, 2);
    }

    #[test]
    fn test_pump_callback_panic_fails_record() {
        let fx = fixture();
        let id = fx
            .registry
            .subscribe(
                caller_managed(SubKind::Rpc { priority: 0 }, "/m:op"),
                rpc_fn(|_ctx, _out| panic!("deliberate test panic")),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let ev = fx
            .store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::Rpc,
                    EventPayload::Rpc {
                        xpath: "/m:op".into(),
                        input: DataTree::new(),
                    },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        fx.registry.process_events(sub.group).unwrap();
        let states = fx.store.wait_terminal(sub.group, &[ev], far()).unwrap();
        assert_eq!(states[0].1, EventState::CompletedFail);
        let verdict = states[0].2.as_ref().unwrap();
        assert_eq!(verdict.error.as_ref().unwrap().code, ErrorCode::Internal);
    }

    #[test]
    fn test_pump_notif_verdict_ignored() {
        let fx = fixture();
        let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let order2 = Arc::clone(&order);
        let id = fx
            .registry
            .subscribe(
                caller_managed(
                    SubKind::Notification {
                        start_time_ms: None,
                        stop_time_ms: None,
                    },
                    "/m:alarm",
                ),
                notif_fn(move |ctx| order2.lock().unwrap().push(ctx.timestamp_ms)),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        for ts in [10, 20] {
            fx.store
                .publish(
                    sub.group,
                    EventRecord::new(
                        id,
                        EventPhase::NotifRealtime,
                        EventPayload::Notif {
                            path: "/m:alarm".into(),
                            data: DataTree::new(),
                            timestamp_ms: ts,
                        },
                        SessionId(1),
                        far(),
                    ),
                )
                .unwrap();
        }

        let pass = fx.registry.process_events(sub.group).unwrap();
        assert_eq!(pass.processed, 2);
        assert_eq!(*order.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_pump_oper_record_returns_subtree() {
        let fx = fixture();
        let id = fx
            .registry
            .subscribe(
                caller_managed(SubKind::Operational { priority: 0 }, "/m:c/state"),
                oper_fn(|_ctx| {
                    let mut t = DataTree::new();
                    t.set("/state/up", Some(DataValue::Bool(true)))
                        .expect("valid path");
                    Ok(t)
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let ev = fx
            .store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::OperRequest,
                    EventPayload::Oper {
                        request_xpath: "/m:c".into(),
                        parent_path: "/m:c".into(),
                    },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        fx.registry.process_events(sub.group).unwrap();
        let states = fx.store.wait_terminal(sub.group, &[ev], far()).unwrap();
        let verdict = states[0].2.as_ref().unwrap();
        assert!(verdict.output.is_some());
    }

    // --- worker tests ---

    #[test]
    fn test_engine_managed_worker_drains() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        // Default flags: engine-managed, worker spawned on subscribe.
        let id = fx
            .registry
            .subscribe(
                SubscribeOptions::new("m", "/m:op", SubKind::Rpc { priority: 0 }),
                rpc_fn(move |_ctx, _out| {
                    calls2.fetch_add(1, Ordering::Relaxed);
                    CallbackOutcome::Ok
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        let ev = fx
            .store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::Rpc,
                    EventPayload::Rpc {
                        xpath: "/m:op".into(),
                        input: DataTree::new(),
                    },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        let states = fx.store.wait_terminal(sub.group, &[ev], far()).unwrap();
        assert_eq!(states[0].1, EventState::CompletedOk);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        fx.registry.shutdown();
    }

    #[test]
    fn test_unsubscribe_waits_for_running_callback() {
        let fx = fixture();
        let entered = Arc::new(std::sync::Barrier::new(2));
        let entered2 = Arc::clone(&entered);
        let id = fx
            .registry
            .subscribe(
                SubscribeOptions::new("m", "/m:op", SubKind::Rpc { priority: 0 }),
                rpc_fn(move |_ctx, _out| {
                    entered2.wait();
                    std::thread::sleep(Duration::from_millis(50));
                    CallbackOutcome::Ok
                }),
            )
            .unwrap();
        let sub = fx.registry.subscription(id).unwrap();

        fx.store
            .publish(
                sub.group,
                EventRecord::new(
                    id,
                    EventPhase::Rpc,
                    EventPayload::Rpc {
                        xpath: "/m:op".into(),
                        input: DataTree::new(),
                    },
                    SessionId(1),
                    far(),
                ),
            )
            .unwrap();

        entered.wait(); // callback is now running on the worker
        let start = Instant::now();
        fx.registry.unsubscribe(id).unwrap();
        // Unsubscribe must have blocked until the callback returned.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
