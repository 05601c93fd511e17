//! # Conflux Core
//!
//! The subscription engine of the conflux configuration datastore:
//! couples datastore mutations and event sources to asynchronous
//! consumers.
//!
//! This crate provides:
//! - **Change Multiplexer**: ordered two-phase change propagation with
//!   abort recovery
//! - **RPC Dispatcher**: priority-ordered invocation with a primary
//!   output owner
//! - **Notification Broker**: real-time fan-out with per-module replay
//! - **Operational Composer**: on-demand state composition from nested
//!   providers
//! - **Registry & Pump**: subscription ownership, engine-managed worker
//!   threads or caller-managed draining, shelve/timeout semantics
//!
//! ## Design Principles
//!
//! 1. **Callbacks are synchronous** — one pump pass per group at a time,
//!    no two callbacks of a group ever run concurrently
//! 2. **Records, not references** — event records point at subscriptions
//!    by id; the registry is the only owner
//! 3. **Deadlines everywhere** — every event carries an absolute
//!    deadline; any observer past it may fence the record
//!
//! ## Example
//!
//! ```rust,ignore
//! use conflux_core::prelude::*;
//!
//! let registry = Arc::new(SubscriptionRegistry::new(config, store, arena));
//! let id = registry.subscribe(
//!     SubscribeOptions::new("net", "/net:ifs", SubKind::Change {
//!         datastore: DatastoreKind::Running,
//!         priority: 10,
//!     }),
//!     change_fn(|ctx| {
//!         for op in ctx.changes(None) {
//!             println!("{}: {:?}", ctx.phase, op);
//!         }
//!         CallbackOutcome::Ok
//!     }),
//! )?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod change;
pub mod config;
pub mod data;
pub mod errinfo;
pub mod event;
pub mod notif;
pub mod oper;
pub mod rpc;
pub mod store;
pub mod subscription;
pub mod xpath;

pub use config::EngineConfig;

/// Result type for conflux-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for conflux-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Path filter errors.
    #[error("xpath error: {0}")]
    Xpath(#[from] xpath::XPathError),

    /// Event store errors.
    #[error("event store error: {0}")]
    Store(#[from] store::StoreError),

    /// Subscription registry errors.
    #[error("registry error: {0}")]
    Registry(#[from] subscription::RegistryError),

    /// Commit errors.
    #[error("commit error: {0}")]
    Commit(#[from] change::CommitError),

    /// RPC dispatch errors.
    #[error("rpc error: {0}")]
    Rpc(#[from] rpc::RpcError),

    /// Notification errors.
    #[error("notification error: {0}")]
    Notif(#[from] notif::NotifError),

    /// Operational composition errors.
    #[error("operational error: {0}")]
    Oper(#[from] oper::OperError),
}

/// Convenience re-exports for embedding the engine.
pub mod prelude {
    pub use crate::change::{ChangeArena, ChangeMultiplexer, CommitError, TxnId};
    pub use crate::config::EngineConfig;
    pub use crate::data::{
        AcceptAll, ChangeIter, ChangeOp, ChangeSet, DataTree, DataValue, DatastoreKind,
        SubtreeValidator,
    };
    pub use crate::errinfo::{ErrorCode, ErrorInfo, ErrorItem};
    pub use crate::event::{CallbackOutcome, EventId, EventPhase, EventState, SessionId};
    pub use crate::notif::{NotificationBroker, NotifError};
    pub use crate::oper::{OperationalComposer, OperError};
    pub use crate::rpc::{RpcDispatcher, RpcError};
    pub use crate::store::{EventPipe, EventStore, StoreError};
    pub use crate::subscription::{
        change_fn, notif_fn, oper_fn, rpc_fn, EngineCallback, GroupId, PumpMode, PumpPass,
        SubFlags, SubKind, SubscribeOptions, Subscription, SubscriptionId, SubscriptionMetrics,
        SubscriptionRegistry,
    };
}
