//! The subscriber callback trait and per-kind invocation contexts.
//!
//! A subscription carries one [`EngineCallback`] trait object. The pump
//! invokes the method matching the subscription's kind; default
//! implementations reject events the subscriber did not sign up for, so a
//! callback type only implements what it needs.
//!
//! Closure adapters ([`change_fn`], [`rpc_fn`], [`notif_fn`], [`oper_fn`])
//! wrap plain functions for the common single-method case.

use std::sync::Arc;

use crate::change::{ChangeError, TxnShared};
use crate::data::{ChangeIter, ChangeOp, DataTree};
use crate::errinfo::{ErrorCode, ErrorItem};
use crate::event::{CallbackOutcome, EventId, EventPhase, SessionId};
use crate::xpath::XPathFilter;

// ---------------------------------------------------------------------------
// Invocation contexts
// ---------------------------------------------------------------------------

/// Context of a change-phase invocation (update / change / done / abort /
/// enabled).
pub struct ChangeContext<'a> {
    /// Session that originated the commit.
    pub session: SessionId,
    /// Module the subscription targets.
    pub module: &'a str,
    /// The subscription's filter text.
    pub xpath: &'a str,
    /// Phase being delivered.
    pub phase: EventPhase,
    /// Request id; the change iterator is opened against it.
    pub request: EventId,
    pub(crate) txn: &'a Arc<TxnShared>,
}

impl ChangeContext<'_> {
    /// Opens a restartable iterator over the transaction's changes,
    /// optionally narrowed by a filter.
    #[must_use]
    pub fn changes(&self, filter: Option<&XPathFilter>) -> ChangeIter {
        self.txn.snapshot_iter(filter)
    }

    /// Queues an additional operation into the proposed diff.
    ///
    /// Only legal during the update phase, before any subscriber has
    /// verified the change.
    ///
    /// # Errors
    ///
    /// [`ChangeError::NotEditable`] outside the update phase.
    pub fn edit(&self, op: ChangeOp) -> Result<(), ChangeError> {
        if self.phase != EventPhase::Update {
            return Err(ChangeError::NotEditable);
        }
        self.txn.queue_edit(op)
    }
}

/// Context of an RPC or action invocation (rpc / abort).
pub struct RpcContext<'a> {
    /// Session that sent the RPC.
    pub session: SessionId,
    /// Invoked operation path.
    pub xpath: &'a str,
    /// Input tree.
    pub input: &'a DataTree,
    /// [`EventPhase::Rpc`] for the call, [`EventPhase::Abort`] for the
    /// rollback of an already-confirmed subscriber.
    pub phase: EventPhase,
    /// Request id of the invocation.
    pub request: EventId,
}

/// Context of a notification delivery.
pub struct NotifContext<'a> {
    /// Session that emitted the notification (the broker for markers).
    pub session: SessionId,
    /// Delivery kind: realtime, replay, replay-complete, or stop.
    pub phase: EventPhase,
    /// Notification path; empty for markers.
    pub xpath: &'a str,
    /// Notification data; empty for markers.
    pub data: &'a DataTree,
    /// Notification timestamp (milliseconds since the epoch).
    pub timestamp_ms: i64,
    /// Request id of the delivery.
    pub request: EventId,
}

/// Context of an operational data request.
pub struct OperContext<'a> {
    /// Session performing the operational read.
    pub session: SessionId,
    /// Module the provider serves.
    pub module: &'a str,
    /// The provider's registered path.
    pub provider_xpath: &'a str,
    /// The reader's full request path.
    pub request_xpath: &'a str,
    /// Request id of the read.
    pub request: EventId,
    /// Concrete parent instance to fill data in under.
    pub parent_path: &'a str,
}

// ---------------------------------------------------------------------------
// EngineCallback
// ---------------------------------------------------------------------------

/// Subscriber callback, one method per subscription kind.
///
/// Callbacks are invoked synchronously on the group's pump; within one
/// group no two callbacks ever run concurrently. A callback must not
/// re-enter the engine on its own group (other groups are fine).
pub trait EngineCallback: Send + Sync {
    /// Handles a change-phase event.
    fn on_change(&self, _ctx: &ChangeContext<'_>) -> CallbackOutcome {
        CallbackOutcome::fail(ErrorCode::Unsupported, "change events not handled")
    }

    /// Handles an RPC invocation, writing the reply into `output`.
    fn on_rpc(&self, _ctx: &RpcContext<'_>, _output: &mut DataTree) -> CallbackOutcome {
        CallbackOutcome::fail(ErrorCode::Unsupported, "rpc events not handled")
    }

    /// Handles a notification delivery. The return value is ignored.
    fn on_notif(&self, _ctx: &NotifContext<'_>) {}

    /// Handles an operational data request, returning the subtree rooted
    /// under the context's parent instance.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorItem`] when the provider cannot supply data.
    fn on_oper(&self, _ctx: &OperContext<'_>) -> Result<DataTree, ErrorItem> {
        Err(ErrorItem::new(
            ErrorCode::Unsupported,
            "operational requests not handled",
        ))
    }
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

struct ChangeFn<F>(F);

impl<F> EngineCallback for ChangeFn<F>
where
    F: Fn(&ChangeContext<'_>) -> CallbackOutcome + Send + Sync,
{
    fn on_change(&self, ctx: &ChangeContext<'_>) -> CallbackOutcome {
        (self.0)(ctx)
    }
}

/// Wraps a closure into a change callback.
pub fn change_fn<F>(f: F) -> Arc<dyn EngineCallback>
where
    F: Fn(&ChangeContext<'_>) -> CallbackOutcome + Send + Sync + 'static,
{
    Arc::new(ChangeFn(f))
}

struct RpcFn<F>(F);

impl<F> EngineCallback for RpcFn<F>
where
    F: Fn(&RpcContext<'_>, &mut DataTree) -> CallbackOutcome + Send + Sync,
{
    fn on_rpc(&self, ctx: &RpcContext<'_>, output: &mut DataTree) -> CallbackOutcome {
        (self.0)(ctx, output)
    }
}

/// Wraps a closure into an RPC callback.
pub fn rpc_fn<F>(f: F) -> Arc<dyn EngineCallback>
where
    F: Fn(&RpcContext<'_>, &mut DataTree) -> CallbackOutcome + Send + Sync + 'static,
{
    Arc::new(RpcFn(f))
}

struct NotifFn<F>(F);

impl<F> EngineCallback for NotifFn<F>
where
    F: Fn(&NotifContext<'_>) + Send + Sync,
{
    fn on_notif(&self, ctx: &NotifContext<'_>) {
        (self.0)(ctx);
    }
}

/// Wraps a closure into a notification callback.
pub fn notif_fn<F>(f: F) -> Arc<dyn EngineCallback>
where
    F: Fn(&NotifContext<'_>) + Send + Sync + 'static,
{
    Arc::new(NotifFn(f))
}

struct OperFn<F>(F);

impl<F> EngineCallback for OperFn<F>
where
    F: Fn(&OperContext<'_>) -> Result<DataTree, ErrorItem> + Send + Sync,
{
    fn on_oper(&self, ctx: &OperContext<'_>) -> Result<DataTree, ErrorItem> {
        (self.0)(ctx)
    }
}

/// Wraps a closure into an operational provider callback.
pub fn oper_fn<F>(f: F) -> Arc<dyn EngineCallback>
where
    F: Fn(&OperContext<'_>) -> Result<DataTree, ErrorItem> + Send + Sync + 'static,
{
    Arc::new(OperFn(f))
}

// ===========================================================================
// Tests
// ===========================================================================
