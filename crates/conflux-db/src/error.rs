//! Error types for the `Conflux` facade.

use conflux_core::change::CommitError;
use conflux_core::notif::NotifError;
use conflux_core::oper::OperError;
use conflux_core::rpc::RpcError;
use conflux_core::store::StoreError;
use conflux_core::subscription::RegistryError;
use conflux_core::xpath::XPathError;

/// Errors from datastore operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Path parse error.
    #[error("path error: {0}")]
    Path(#[from] XPathError),

    /// Commit error.
    #[error("commit error: {0}")]
    Commit(#[from] CommitError),

    /// RPC error.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// Notification error.
    #[error("notification error: {0}")]
    Notif(#[from] NotifError),

    /// Operational read error.
    #[error("operational error: {0}")]
    Oper(#[from] OperError),

    /// Subscription registry error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Event store error.
    #[error("event store error: {0}")]
    Store(#[from] StoreError),

    /// A path without a module prefix where one is required.
    #[error("path '{0}' carries no module prefix")]
    NoModule(String),

    /// The instance is shut down.
    #[error("conflux instance is shut down")]
    Shutdown,
}
