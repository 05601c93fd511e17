//! Subscription descriptors, groups, and the registry.
//!
//! The registry is the arena that owns every [`Subscription`] and every
//! subscription group. Event records reference subscriptions by id
//! only; nothing in the engine holds a subscription alive except the
//! registry, which keeps the ownership graph acyclic.
//!
//! Groups share one pump. An engine-managed group runs a dedicated worker
//! thread blocking on the group's event pipe; a caller-managed group
//! (`no_thread`) leaves draining to the owning process, which polls the
//! pipe and calls [`SubscriptionRegistry::process_events`] itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::change::ChangeArena;
use crate::config::EngineConfig;
use crate::data::DatastoreKind;
use crate::store::{EventPipe, EventStore, StoreError};
use crate::subscription::callback::EngineCallback;
use crate::xpath::{XPathError, XPathFilter};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique subscription identifier, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Unique subscription-group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grp-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Kind, flags, pump mode
// ---------------------------------------------------------------------------

/// Per-kind subscription payload.
#[derive(Debug, Clone, Copy)]
pub enum SubKind {
    /// Configuration change subscription.
    Change {
        /// Datastore whose commits are observed.
        datastore: DatastoreKind,
        /// Higher priority is called earlier during change fan-out.
        priority: i32,
    },
    /// RPC / action subscription.
    Rpc {
        /// Higher priority is called earlier; the lowest-priority
        /// subscriber is the primary and owns the final output.
        priority: i32,
    },
    /// Notification subscription.
    Notification {
        /// Replay start (milliseconds since the epoch); a past value
        /// enables replay.
        start_time_ms: Option<i64>,
        /// Automatic stop time.
        stop_time_ms: Option<i64>,
    },
    /// Operational data provider.
    Operational {
        /// Sibling ordering among providers at equal nesting depth;
        /// lower runs earlier.
        priority: i32,
    },
}

impl SubKind {
    /// Returns the priority, or 0 for kinds without one.
    #[must_use]
    pub fn priority(&self) -> i32 {
        match self {
            Self::Change { priority, .. }
            | Self::Rpc { priority }
            | Self::Operational { priority } => *priority,
            Self::Notification { .. } => 0,
        }
    }

    /// Short name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Change { .. } => "change",
            Self::Rpc { .. } => "rpc",
            Self::Notification { .. } => "notification",
            Self::Operational { .. } => "operational",
        }
    }
}

/// Behavior flags of a subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubFlags {
    /// Deliver the pre-commit update phase.
    pub update_phase: bool,
    /// Replay the current configuration as a synthetic change at
    /// subscribe time.
    pub enabled_phase: bool,
    /// Skip the change phase; deliver done (and nothing to confirm).
    pub done_only: bool,
    /// Observe without a vote: verdicts never affect the transaction.
    pub passive: bool,
    /// Caller-managed pump: no worker thread is spawned for the group.
    pub no_thread: bool,
}

/// Who drives a group's pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// A dedicated engine thread drains the group.
    EngineManaged,
    /// The owning process polls the pipe and drains itself.
    CallerManaged,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Atomic per-subscription counters.
#[derive(Debug, Default)]
pub(crate) struct SubCounters {
    pub(crate) delivered: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) shelved: AtomicU64,
}

/// One logical consumer registered with the engine.
pub struct Subscription {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Owning group.
    pub group: GroupId,
    /// Target module name.
    pub module: String,
    /// Compiled path filter.
    pub filter: XPathFilter,
    /// Per-kind payload.
    pub kind: SubKind,
    /// Behavior flags.
    pub flags: SubFlags,
    /// Subscriber callback.
    pub callback: Arc<dyn EngineCallback>,
    /// Creation timestamp.
    pub created_at: Instant,
    suspended: AtomicBool,
    pub(crate) counters: SubCounters,
}

impl Subscription {
    /// Returns `true` while the subscription is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Returns the kind priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.kind.priority()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("module", &self.module)
            .field("filter", &self.filter.text())
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Point-in-time metrics snapshot for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionMetrics {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Target module.
    pub module: String,
    /// Kind name.
    pub kind: &'static str,
    /// Events completed ok.
    pub delivered: u64,
    /// Events completed with failure or timeout.
    pub failed: u64,
    /// Shelve returns observed.
    pub shelved: u64,
    /// Time since creation.
    pub age: Duration,
}

// ---------------------------------------------------------------------------
// SubscribeOptions
// ---------------------------------------------------------------------------

/// Parameters of a subscribe call.
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Target module name.
    pub module: String,
    /// Filter text, compiled at subscribe time.
    pub filter: String,
    /// Per-kind payload.
    pub kind: SubKind,
    /// Behavior flags.
    pub flags: SubFlags,
    /// Join this existing group instead of creating one.
    pub group: Option<GroupId>,
}

impl SubscribeOptions {
    /// Starts options for the given module and filter.
    #[must_use]
    pub fn new(module: impl Into<String>, filter: impl Into<String>, kind: SubKind) -> Self {
        Self {
            module: module.into(),
            filter: filter.into(),
            kind,
            flags: SubFlags::default(),
            group: None,
        }
    }

    /// Sets the behavior flags.
    #[must_use]
    pub fn flags(mut self, flags: SubFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Joins an existing group.
    #[must_use]
    pub fn group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The filter failed to compile.
    #[error("invalid filter: {0}")]
    Filter(#[from] XPathError),
    /// The referenced group does not exist.
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    /// The referenced subscription does not exist.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
    /// The joined group runs the other pump mode.
    #[error("group {group} is {mode:?}; the no_thread flag must match")]
    PumpModeMismatch {
        /// Group that was joined.
        group: GroupId,
        /// Its pump mode.
        mode: PumpMode,
    },
    /// Event store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The engine is shutting down.
    #[error("registry is shut down")]
    Shutdown,
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

pub(crate) struct GroupEntry {
    pub(crate) mode: PumpMode,
    pub(crate) members: Vec<SubscriptionId>,
    pub(crate) pipe: Arc<EventPipe>,
    /// Serializes `process_events`; unsubscribe blocks on it so a running
    /// callback always finishes before its subscription disappears.
    pub(crate) process_lock: Arc<Mutex<()>>,
    pub(crate) worker: Option<JoinHandle<()>>,
    pub(crate) worker_stop: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    pub(crate) groups: FxHashMap<GroupId, GroupEntry>,
    pub(crate) subs: FxHashMap<SubscriptionId, Arc<Subscription>>,
}

/// Owner of all subscriptions and groups.
pub struct SubscriptionRegistry {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<EventStore>,
    pub(crate) arena: Arc<ChangeArena>,
    pub(crate) inner: RwLock<RegistryInner>,
    next_sub: AtomicU64,
    next_group: AtomicU64,
    shutdown: AtomicBool,
}

impl SubscriptionRegistry {
    /// Creates an empty registry over the given store and change arena.
    #[must_use]
    pub fn new(config: EngineConfig, store: Arc<EventStore>, arena: Arc<ChangeArena>) -> Self {
        Self {
            config,
            store,
            arena,
            inner: RwLock::new(RegistryInner::default()),
            next_sub: AtomicU64::new(1),
            next_group: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Registers a subscription, creating or joining its group.
    ///
    /// The filter is compiled here; an invalid filter never enters the
    /// registry. For engine-managed groups (the default) the first
    /// subscribe of a new group spawns the group's pump worker.
    ///
    /// # Errors
    ///
    /// See [`RegistryError`].
    pub fn subscribe(
        self: &Arc<Self>,
        opts: SubscribeOptions,
        callback: Arc<dyn EngineCallback>,
    ) -> Result<SubscriptionId, RegistryError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RegistryError::Shutdown);
        }
        let filter = XPathFilter::parse(&opts.filter)?;
        let mode = if opts.flags.no_thread {
            PumpMode::CallerManaged
        } else {
            PumpMode::EngineManaged
        };

        let mut inner = self.inner.write();
        let group_id = match opts.group {
            Some(gid) => {
                let entry = inner
                    .groups
                    .get(&gid)
                    .ok_or(RegistryError::UnknownGroup(gid))?;
                if entry.mode != mode {
                    return Err(RegistryError::PumpModeMismatch {
                        group: gid,
                        mode: entry.mode,
                    });
                }
                gid
            }
            None => {
                let gid = GroupId(self.next_group.fetch_add(1, Ordering::Relaxed));
                let pipe = self.store.register_group(gid, self.config.group_capacity);
                let worker_stop = Arc::new(AtomicBool::new(false));
                let worker = if mode == PumpMode::EngineManaged {
                    Some(self.spawn_worker(gid, Arc::clone(&pipe), Arc::clone(&worker_stop)))
                } else {
                    None
                };
                inner.groups.insert(
                    gid,
                    GroupEntry {
                        mode,
                        members: Vec::new(),
                        pipe,
                        process_lock: Arc::new(Mutex::new(())),
                        worker,
                        worker_stop,
                    },
                );
                gid
            }
        };

        let id = SubscriptionId(self.next_sub.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscription {
            id,
            group: group_id,
            module: opts.module,
            filter,
            kind: opts.kind,
            flags: opts.flags,
            callback,
            created_at: Instant::now(),
            suspended: AtomicBool::new(false),
            counters: SubCounters::default(),
        });
        debug!(sub = %id, group = %group_id, kind = sub.kind.name(), filter = sub.filter.text(), "subscribe");
        inner.subs.insert(id, sub);
        inner
            .groups
            .get_mut(&group_id)
            .expect("group inserted above")
            .members
            .push(id);
        Ok(id)
    }

    /// Removes a subscription.
    ///
    /// Blocks until a callback currently running on the subscription's
    /// group has returned. The last member's removal destroys the group,
    /// stops its worker, and closes its pipe.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownSubscription`] if the id is not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), RegistryError> {
        let (group_id, process_lock, destroyed) = {
            let mut inner = self.inner.write();
            let sub = inner
                .subs
                .remove(&id)
                .ok_or(RegistryError::UnknownSubscription(id))?;
            let group_id = sub.group;
            let entry = inner
                .groups
                .get_mut(&group_id)
                .ok_or(RegistryError::UnknownGroup(group_id))?;
            entry.members.retain(|m| *m != id);
            let process_lock = Arc::clone(&entry.process_lock);
            let destroyed = if entry.members.is_empty() {
                let mut entry = inner.groups.remove(&group_id).expect("entry exists");
                entry.worker_stop.store(true, Ordering::Release);
                Some(entry.worker.take())
            } else {
                None
            };
            (group_id, process_lock, destroyed)
        };

        // Wait for an in-flight pump pass to finish.
        drop(process_lock.lock());

        if let Some(worker) = destroyed {
            debug!(sub = %id, group = %group_id, "destroying group");
            self.store.unregister_group(group_id);
            if let Some(handle) = worker {
                let _ = handle.join();
            }
        } else {
            debug!(sub = %id, group = %group_id, "unsubscribe");
        }
        Ok(())
    }

    /// Suspends a subscription: it is skipped by every fan-out until
    /// resumed. Returns `true` if it was active.
    pub fn suspend(&self, id: SubscriptionId) -> bool {
        match self.inner.read().subs.get(&id) {
            Some(sub) => !sub.suspended.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    /// Resumes a suspended subscription. Returns `true` if it was
    /// suspended.
    pub fn resume(&self, id: SubscriptionId) -> bool {
        match self.inner.read().subs.get(&id) {
            Some(sub) => sub.suspended.swap(false, Ordering::AcqRel),
            None => false,
        }
    }

    /// Looks up a subscription.
    #[must_use]
    pub fn subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.inner.read().subs.get(&id).cloned()
    }

    /// Returns the event pipe of a group (caller-managed pumps poll it).
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownGroup`] if the group does not exist.
    pub fn event_pipe(&self, group: GroupId) -> Result<Arc<EventPipe>, RegistryError> {
        self.inner
            .read()
            .groups
            .get(&group)
            .map(|e| Arc::clone(&e.pipe))
            .ok_or(RegistryError::UnknownGroup(group))
    }

    /// Returns the pump mode of a group.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownGroup`] if the group does not exist.
    pub fn pump_mode(&self, group: GroupId) -> Result<PumpMode, RegistryError> {
        self.inner
            .read()
            .groups
            .get(&group)
            .map(|e| e.mode)
            .ok_or(RegistryError::UnknownGroup(group))
    }

    /// All live change subscriptions on a datastore, unsuspended only.
    #[must_use]
    pub fn change_targets(&self, datastore: DatastoreKind) -> Vec<Arc<Subscription>> {
        self.collect(|s| {
            matches!(s.kind, SubKind::Change { datastore: ds, .. } if ds == datastore)
        })
    }

    /// All live RPC subscriptions whose filter matches the invocation
    /// path, unsuspended only.
    #[must_use]
    pub fn rpc_targets(&self, xpath: &str) -> Vec<Arc<Subscription>> {
        self.collect(|s| matches!(s.kind, SubKind::Rpc { .. }) && s.filter.matches(xpath))
    }

    /// All live notification subscriptions of a module, unsuspended only.
    #[must_use]
    pub fn notif_targets(&self, module: &str) -> Vec<Arc<Subscription>> {
        self.collect(|s| matches!(s.kind, SubKind::Notification { .. }) && s.module == module)
    }

    /// All live operational providers, unsuspended only.
    #[must_use]
    pub fn oper_targets(&self) -> Vec<Arc<Subscription>> {
        self.collect(|s| matches!(s.kind, SubKind::Operational { .. }))
    }

    fn collect(&self, pred: impl Fn(&Subscription) -> bool) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read();
        let mut out: Vec<Arc<Subscription>> = inner
            .subs
            .values()
            .filter(|s| !s.is_suspended() && pred(s))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.read().subs.len()
    }

    /// Number of live groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }

    /// Metrics snapshot for one subscription.
    #[must_use]
    pub fn metrics(&self, id: SubscriptionId) -> Option<SubscriptionMetrics> {
        let inner = self.inner.read();
        inner.subs.get(&id).map(|s| SubscriptionMetrics {
            id: s.id,
            module: s.module.clone(),
            kind: s.kind.name(),
            delivered: s.counters.delivered.load(Ordering::Relaxed),
            failed: s.counters.failed.load(Ordering::Relaxed),
            shelved: s.counters.shelved.load(Ordering::Relaxed),
            age: s.created_at.elapsed(),
        })
    }

    /// Stops every engine-managed worker and closes every pipe. Further
    /// subscribes fail with [`RegistryError::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let workers: Vec<(GroupId, Option<JoinHandle<()>>)> = {
            let mut inner = self.inner.write();
            inner
                .groups
                .iter_mut()
                .map(|(gid, entry)| {
                    entry.worker_stop.store(true, Ordering::Release);
                    (*gid, entry.worker.take())
                })
                .collect()
        };
        for (gid, worker) in workers {
            self.store.unregister_group(gid);
            if let Some(handle) = worker {
                let _ = handle.join();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
