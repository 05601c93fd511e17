//! RPC Dispatcher — routing invocations to subscribed providers.
//!
//! Matching subscribers are executed one at a time, higher priority
//! first; the lowest-priority subscriber runs last, is designated the
//! *primary*, and owns the final output (each output overwrites the one
//! before it). On any failure the already-confirmed non-primary
//! subscribers are rolled back with an abort event in reverse invocation
//! order; the primary itself is never aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::data::DataTree;
use crate::errinfo::{ErrorCode, ErrorInfo, ErrorItem};
use crate::event::{EventPayload, EventPhase, EventRecord, EventState, SessionId};
use crate::store::{EventStore, StoreError};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::xpath::{parse_path, XPathError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from an RPC invocation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The invocation path failed to parse.
    #[error("invalid operation path: {0}")]
    Path(#[from] XPathError),
    /// No subscriber provides the operation; callers must not send it.
    #[error("no subscriber provides {0}")]
    NotFound(String),
    /// A provider (or its timeout) failed the invocation.
    #[error("invocation of {xpath} failed: {errors}")]
    Failed {
        /// Invoked path.
        xpath: String,
        /// Collected provider errors.
        errors: ErrorInfo,
    },
    /// Event store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RpcError {
    /// Flattens the error into a chain for session attachment.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Path(e) => {
                ErrorInfo::from_item(ErrorItem::new(ErrorCode::InvalidArgument, e.to_string()))
            }
            Self::NotFound(xpath) => ErrorInfo::from_item(ErrorItem::with_path(
                ErrorCode::NotFound,
                xpath.clone(),
                "no subscriber provides the operation",
            )),
            Self::Failed { errors, .. } => errors.clone(),
            Self::Store(e) => {
                ErrorInfo::from_item(ErrorItem::new(ErrorCode::Internal, e.to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RpcMetrics
// ---------------------------------------------------------------------------

/// Atomic counters for monitoring the dispatcher.
#[derive(Debug, Default)]
pub struct RpcMetrics {
    /// Invocations accepted (a matching subscriber existed).
    pub invocations: AtomicU64,
    /// Invocations that failed.
    pub failures: AtomicU64,
    /// Abort events delivered to confirmed subscribers.
    pub aborts: AtomicU64,
}

impl RpcMetrics {
    /// Total accepted invocations.
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Total failed invocations.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Total abort deliveries.
    #[must_use]
    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// RpcDispatcher
// ---------------------------------------------------------------------------

/// Routes RPC and action invocations to their providers.
pub struct RpcDispatcher {
    config: EngineConfig,
    store: Arc<EventStore>,
    registry: Arc<SubscriptionRegistry>,
    metrics: RpcMetrics,
}

impl RpcDispatcher {
    /// Creates a dispatcher over the shared engine state.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<EventStore>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            metrics: RpcMetrics::default(),
        }
    }

    /// Dispatcher metrics.
    #[must_use]
    pub fn metrics(&self) -> &RpcMetrics {
        &self.metrics
    }

    /// Invokes the operation at `xpath`, returning the primary's output.
    ///
    /// # Errors
    ///
    /// See [`RpcError`]. On error no output is returned and confirmed
    /// non-primary subscribers have been rolled back.
    pub fn invoke(
        &self,
        xpath: &str,
        input: &DataTree,
        originator: SessionId,
        timeout: Option<Duration>,
    ) -> Result<DataTree, RpcError> {
        parse_path(xpath)?;
        let mut targets = self.registry.rpc_targets(xpath);
        if targets.is_empty() {
            return Err(RpcError::NotFound(xpath.to_string()));
        }
        // Higher priority first; the last subscriber is the primary.
        targets.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id.cmp(&b.id)));
        self.metrics.invocations.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + timeout.unwrap_or(self.config.default_timeout);
        debug!(xpath, providers = targets.len(), "rpc invoke");

        let mut output = DataTree::new();
        let mut confirmed: Vec<Arc<Subscription>> = Vec::new();
        for (pos, sub) in targets.iter().enumerate() {
            let is_primary = pos == targets.len() - 1;
            let record = EventRecord::new(
                sub.id,
                EventPhase::Rpc,
                EventPayload::Rpc {
                    xpath: xpath.to_string(),
                    input: input.clone(),
                },
                originator,
                deadline,
            );
            let failure = match self.run_one(sub, record, deadline) {
                Ok(Some(out)) => {
                    output = out;
                    if !is_primary {
                        confirmed.push(Arc::clone(sub));
                    }
                    None
                }
                Ok(None) => Some(ErrorItem::with_path(
                    ErrorCode::Timeout,
                    xpath,
                    format!("{} timed out", sub.id),
                )),
                Err(item) => Some(item),
            };

            if let Some(item) = failure {
                let mut errors = ErrorInfo::from_item(item);
                self.abort_confirmed(xpath, input, &confirmed, originator, &mut errors);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return Err(RpcError::Failed {
                    xpath: xpath.to_string(),
                    errors,
                });
            }
        }

        Ok(output)
    }

    /// Publishes one event and waits for its verdict.
    ///
    /// `Ok(Some(output))` on success, `Ok(None)` on timeout, `Err` on a
    /// reported failure.
    fn run_one(
        &self,
        sub: &Arc<Subscription>,
        record: EventRecord,
        deadline: Instant,
    ) -> Result<Option<DataTree>, ErrorItem> {
        let event_id = self.store.publish(sub.group, record).map_err(|e| {
            ErrorItem::new(
                match e {
                    StoreError::NoSpace(_) => ErrorCode::NoMemory,
                    _ => ErrorCode::Internal,
                },
                format!("delivering to {}: {e}", sub.id),
            )
        })?;
        let states = self
            .store
            .wait_terminal(sub.group, &[event_id], deadline)
            .map_err(|e| ErrorItem::new(ErrorCode::Internal, e.to_string()))?;
        let _ = self.store.reap_terminal(sub.group);

        let (_, state, verdict) = &states[0];
        match state {
            EventState::CompletedOk => Ok(Some(
                verdict
                    .as_ref()
                    .and_then(|v| v.output.clone())
                    .unwrap_or_default(),
            )),
            EventState::TimedOut => Ok(None),
            _ => Err(verdict
                .as_ref()
                .and_then(|v| v.error.clone())
                .unwrap_or_else(|| {
                    ErrorItem::new(
                        ErrorCode::OperationFailed,
                        format!("{} rejected the invocation", sub.id),
                    )
                })),
        }
    }

    /// Rolls back confirmed non-primary subscribers in reverse invocation
    /// order.
    fn abort_confirmed(
        &self,
        xpath: &str,
        input: &DataTree,
        confirmed: &[Arc<Subscription>],
        originator: SessionId,
        errors: &mut ErrorInfo,
    ) {
        let abort_deadline = Instant::now() + self.config.default_timeout;
        for sub in confirmed.iter().rev() {
            let record = EventRecord::new(
                sub.id,
                EventPhase::Abort,
                EventPayload::Rpc {
                    xpath: xpath.to_string(),
                    input: input.clone(),
                },
                originator,
                abort_deadline,
            );
            match self.run_one(sub, record, abort_deadline) {
                Ok(Some(_)) => {
                    self.metrics.aborts.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {
                    warn!(sub = %sub.id, "rpc abort timed out");
                    errors.push(ErrorItem::new(
                        ErrorCode::Timeout,
                        format!("abort of {} timed out", sub.id),
                    ));
                }
                Err(item) => {
                    warn!(sub = %sub.id, "rpc abort failed: {item}");
                    errors.push(item);
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::change::ChangeArena;
    use crate::data::DataValue;
    use crate::event::CallbackOutcome;
    use crate::subscription::{rpc_fn, SubKind, SubscribeOptions};

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        dispatcher: RpcDispatcher,
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
            arena,
        ));
        let dispatcher = RpcDispatcher::new(config, store, Arc::clone(&registry));
        Fixture {
            registry,
            dispatcher,
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.registry.shutdown();
        }
    }

    type Log = Arc<StdMutex<Vec<(i32, EventPhase)>>>;

    /// Engine-managed provider logging `(priority, phase)`; answers with
    /// its priority as output unless `fail` is set.
    fn provider(fx: &Fixture, priority: i32, log: &Log, fail: bool) {
        let log = Arc::clone(log);
        fx.registry
            .subscribe(
                SubscribeOptions::new("m", "/m:op", SubKind::Rpc { priority }),
                rpc_fn(move |ctx, output| {
                    log.lock().unwrap().push((priority, ctx.phase));
                    if ctx.phase != EventPhase::Rpc {
                        return CallbackOutcome::Ok;
                    }
                    if fail {
                        CallbackOutcome::fail(ErrorCode::OperationFailed, "provider refused")
                    } else {
                        output
                            .set("/result", Some(DataValue::Int64(i64::from(priority))))
                            .expect("valid path");
                        CallbackOutcome::Ok
                    }
                }),
            )
            .unwrap();
    }

    // --- dispatch tests ---

    #[test]
    fn test_rpc_primary_output_wins() {
        // Providers at 10, 5, 1 all answer; the sender sees the output of
        // the lowest-priority one.
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        provider(&fx, 10, &log, false);
        provider(&fx, 5, &log, false);
        provider(&fx, 1, &log, false);

        let output = fx
            .dispatcher
            .invoke("/m:op", &DataTree::new(), SessionId(1), None)
            .unwrap();
        assert_eq!(output.get_value("/result"), Some(&DataValue::Int64(1)));

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (10, EventPhase::Rpc),
                (5, EventPhase::Rpc),
                (1, EventPhase::Rpc),
            ]
        );
        assert_eq!(fx.dispatcher.metrics().invocations(), 1);
        assert_eq!(fx.dispatcher.metrics().failures(), 0);
    }

    #[test]
    fn test_rpc_mid_failure_aborts_earlier_skips_later() {
        // 10 confirms, 5 fails: 10 is rolled back, 1 is never invoked.
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        provider(&fx, 10, &log, false);
        provider(&fx, 5, &log, true);
        provider(&fx, 1, &log, false);

        let err = fx
            .dispatcher
            .invoke("/m:op", &DataTree::new(), SessionId(1), None)
            .unwrap_err();
        match &err {
            RpcError::Failed { errors, .. } => {
                assert_eq!(errors.first_code(), ErrorCode::OperationFailed);
            }
            other => panic!("unexpected error: {other}"),
        }

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (10, EventPhase::Rpc),
                (5, EventPhase::Rpc),
                (10, EventPhase::Abort),
            ]
        );
        assert_eq!(fx.dispatcher.metrics().aborts(), 1);
    }

    #[test]
    fn test_rpc_primary_failure_aborts_confirmed() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        provider(&fx, 10, &log, false);
        provider(&fx, 1, &log, true);

        let err = fx
            .dispatcher
            .invoke("/m:op", &DataTree::new(), SessionId(1), None)
            .unwrap_err();
        assert!(matches!(err, RpcError::Failed { .. }));

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                (10, EventPhase::Rpc),
                (1, EventPhase::Rpc),
                (10, EventPhase::Abort),
            ]
        );
    }

    #[test]
    fn test_rpc_not_found() {
        let fx = fixture();
        let err = fx
            .dispatcher
            .invoke("/m:op", &DataTree::new(), SessionId(1), None)
            .unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));
        assert_eq!(err.to_error_info().first_code(), ErrorCode::NotFound);
        assert_eq!(fx.dispatcher.metrics().invocations(), 0);
    }

    #[test]
    fn test_rpc_predicate_filter_selects_provider() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            fx.registry
                .subscribe(
                    SubscribeOptions::new(
                        "m",
                        "/m:ifs/if[name='eth0']/reset",
                        SubKind::Rpc { priority: 0 },
                    ),
                    rpc_fn(move |ctx, _output| {
                        log.lock().unwrap().push((0, ctx.phase));
                        CallbackOutcome::Ok
                    }),
                )
                .unwrap();
        }

        // The predicate-matched instance reaches the provider...
        fx.dispatcher
            .invoke(
                "/m:ifs/if[name='eth0']/reset",
                &DataTree::new(),
                SessionId(1),
                None,
            )
            .unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);

        // ...another instance does not.
        let err = fx
            .dispatcher
            .invoke(
                "/m:ifs/if[name='eth1']/reset",
                &DataTree::new(),
                SessionId(1),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));
    }

    #[test]
    fn test_rpc_shelve_then_answer() {
        let fx = fixture();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        fx.registry
            .subscribe(
                SubscribeOptions::new("m", "/m:op", SubKind::Rpc { priority: 0 }),
                rpc_fn(move |_ctx, output| {
                    if calls2.fetch_add(1, Ordering::Relaxed) == 0 {
                        CallbackOutcome::Shelve
                    } else {
                        output
                            .set("/late", Some(DataValue::Bool(true)))
                            .expect("valid path");
                        CallbackOutcome::Ok
                    }
                }),
            )
            .unwrap();

        let output = fx
            .dispatcher
            .invoke("/m:op", &DataTree::new(), SessionId(1), None)
            .unwrap();
        assert_eq!(output.get_value("/late"), Some(&DataValue::Bool(true)));
        assert!(calls.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_rpc_timeout_fails_invocation() {
        let fx = fixture();
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        provider(&fx, 10, &log, false);
        {
            let log = Arc::clone(&log);
            fx.registry
                .subscribe(
                    SubscribeOptions::new("m", "/m:op", SubKind::Rpc { priority: 1 }),
                    rpc_fn(move |ctx, _output| {
                        log.lock().unwrap().push((1, ctx.phase));
                        if ctx.phase == EventPhase::Rpc {
                            CallbackOutcome::Shelve
                        } else {
                            CallbackOutcome::Ok
                        }
                    }),
                )
                .unwrap();
        }

        let err = fx
            .dispatcher
            .invoke(
                "/m:op",
                &DataTree::new(),
                SessionId(1),
                Some(Duration::from_millis(100)),
            )
            .unwrap_err();
        match &err {
            RpcError::Failed { errors, .. } => {
                assert_eq!(errors.first_code(), ErrorCode::Timeout);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The confirmed provider was rolled back.
        let events = log.lock().unwrap().clone();
        assert!(events.contains(&(10, EventPhase::Abort)));
    }
}
