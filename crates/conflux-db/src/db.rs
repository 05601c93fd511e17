//! The `Conflux` instance: datastores plus the subscription engine.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use conflux_core::change::{ChangeArena, ChangeMultiplexer};
use conflux_core::data::{AcceptAll, DataTree, DatastoreKind, SubtreeValidator};
use conflux_core::event::SessionId;
use conflux_core::notif::{BrokerMetrics, NotificationBroker};
use conflux_core::oper::OperationalComposer;
use conflux_core::rpc::{RpcDispatcher, RpcMetrics};
use conflux_core::store::{EventPipe, EventStore};
use conflux_core::subscription::{
    GroupId, PumpPass, SubscriptionId, SubscriptionMetrics, SubscriptionRegistry,
};
use conflux_core::EngineConfig;

use crate::config::ConfluxConfig;
use crate::error::DbError;
use crate::session::Session;

// ---------------------------------------------------------------------------
// DatastoreSet
// ---------------------------------------------------------------------------

/// The four datastore trees, each behind its own writer-priority lock.
///
/// A commit holds the target's write lock from the change phase through
/// done or abort; plain readers take the read lock. Operational
/// composition reads the pushed layer once and then runs lock-free.
pub(crate) struct DatastoreSet {
    running: RwLock<DataTree>,
    startup: RwLock<DataTree>,
    candidate: RwLock<DataTree>,
    oper_push: RwLock<DataTree>,
}

impl DatastoreSet {
    fn new() -> Self {
        Self {
            running: RwLock::new(DataTree::new()),
            startup: RwLock::new(DataTree::new()),
            candidate: RwLock::new(DataTree::new()),
            oper_push: RwLock::new(DataTree::new()),
        }
    }

    pub(crate) fn tree(&self, datastore: DatastoreKind) -> &RwLock<DataTree> {
        match datastore {
            DatastoreKind::Running => &self.running,
            DatastoreKind::Startup => &self.startup,
            DatastoreKind::Candidate => &self.candidate,
            DatastoreKind::Operational => &self.oper_push,
        }
    }
}

// ---------------------------------------------------------------------------
// Conflux
// ---------------------------------------------------------------------------

/// An embedded conflux instance.
///
/// Clients open [`Session`]s against one shared instance; sessions are
/// the originators of every engine operation and carry the error chain
/// of their last failed operation.
///
/// # Example
///
/// ```rust,ignore
/// let db = Conflux::open(ConfluxConfig::default())?;
/// let session = db.session();
/// session.set_item(DatastoreKind::Running, "/net:mtu", DataValue::Uint64(1500))?;
/// session.apply_changes(DatastoreKind::Running, None)?;
/// ```
pub struct Conflux {
    config: EngineConfig,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) mux: ChangeMultiplexer,
    pub(crate) rpc: RpcDispatcher,
    pub(crate) broker: NotificationBroker,
    pub(crate) composer: OperationalComposer,
    pub(crate) datastores: DatastoreSet,
    pub(crate) validator: Box<dyn SubtreeValidator>,
    next_session: AtomicU32,
    shutdown: AtomicBool,
}

impl Conflux {
    /// Opens an instance accepting any operational subtree (no schema
    /// context attached).
    ///
    /// # Errors
    ///
    /// [`DbError::Config`] for an invalid configuration.
    pub fn open(config: ConfluxConfig) -> Result<Arc<Self>, DbError> {
        Self::open_with_validator(config, Box::new(AcceptAll))
    }

    /// Opens an instance with a schema-backed subtree validator.
    ///
    /// # Errors
    ///
    /// [`DbError::Config`] for an invalid configuration.
    pub fn open_with_validator(
        config: ConfluxConfig,
        validator: Box<dyn SubtreeValidator>,
    ) -> Result<Arc<Self>, DbError> {
        let engine = config.resolved_engine();
        engine.validate().map_err(DbError::Config)?;

        let store = Arc::new(EventStore::new());
        let arena = Arc::new(ChangeArena::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            engine.clone(),
            Arc::clone(&store),
            Arc::clone(&arena),
        ));
        let mux = ChangeMultiplexer::new(
            engine.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            arena,
        );
        let rpc = RpcDispatcher::new(engine.clone(), Arc::clone(&store), Arc::clone(&registry));
        let broker =
            NotificationBroker::new(engine.clone(), Arc::clone(&store), Arc::clone(&registry));
        let composer =
            OperationalComposer::new(engine.clone(), Arc::clone(&store), Arc::clone(&registry));

        debug!("conflux instance opened");
        Ok(Arc::new(Self {
            config: engine,
            registry,
            mux,
            rpc,
            broker,
            composer,
            datastores: DatastoreSet::new(),
            validator,
            next_session: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Opens a new client session.
    #[must_use]
    pub fn session(self: &Arc<Self>) -> Session {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        Session::new(id, Arc::clone(self))
    }

    /// Returns `true` once the instance was shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The resolved engine configuration this instance runs with.
    #[must_use]
    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn check_open(&self) -> Result<(), DbError> {
        if self.is_shutdown() {
            return Err(DbError::Shutdown);
        }
        Ok(())
    }

    /// Enables notification replay for a module.
    ///
    /// # Errors
    ///
    /// [`DbError::Notif`] if the module's log cannot be opened.
    pub fn enable_notif_replay(&self, module: &str) -> Result<(), DbError> {
        self.check_open()?;
        self.broker.enable_replay(module)?;
        Ok(())
    }

    /// Drains one caller-managed group (see
    /// [`SubscriptionRegistry::process_events`]).
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] if the group does not exist.
    pub fn process_events(&self, group: GroupId) -> Result<PumpPass, DbError> {
        Ok(self.registry.process_events(group)?)
    }

    /// Returns the readiness pipe of a caller-managed group.
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] if the group does not exist.
    pub fn event_pipe(&self, group: GroupId) -> Result<Arc<EventPipe>, DbError> {
        Ok(self.registry.event_pipe(group)?)
    }

    /// Metrics snapshot of one subscription.
    #[must_use]
    pub fn subscription_metrics(&self, id: SubscriptionId) -> Option<SubscriptionMetrics> {
        self.registry.metrics(id)
    }

    /// Returns the group a subscription belongs to (callers of
    /// [`Conflux::process_events`] need it).
    #[must_use]
    pub fn subscription_group(&self, id: SubscriptionId) -> Option<GroupId> {
        self.registry.subscription(id).map(|s| s.group)
    }

    /// Notification broker metrics.
    #[must_use]
    pub fn notif_metrics(&self) -> &BrokerMetrics {
        self.broker.metrics()
    }

    /// RPC dispatcher metrics.
    #[must_use]
    pub fn rpc_metrics(&self) -> &RpcMetrics {
        self.rpc.metrics()
    }

    /// Stops every engine-managed pump and rejects further operations.
    ///
    /// Blocks until running callbacks have returned and the workers are
    /// joined. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("conflux instance shutting down");
        self.broker.sweep_stop_times(SessionId(0));
        self.registry.shutdown();
    }
}

impl Drop for Conflux {
    fn drop(&mut self) {
        self.shutdown();
    }
}
