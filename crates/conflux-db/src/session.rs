//! Client sessions.
//!
//! A [`Session`] is the handle through which one client edits
//! datastores, commits, invokes RPCs, emits notifications, reads
//! operational state, and manages its subscriptions. Edits are staged on
//! the session per datastore and only leave it on
//! [`Session::apply_changes`]. Every failed operation leaves its error
//! chain on the session, retrievable with [`Session::last_error`].

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::debug;

use conflux_core::data::{ChangeSet, DataTree, DataValue, DatastoreKind};
use conflux_core::errinfo::{ErrorCode, ErrorInfo, ErrorItem};
use conflux_core::event::SessionId;
use conflux_core::subscription::{
    EngineCallback, SubFlags, SubKind, SubscribeOptions, SubscriptionId,
};
use conflux_core::xpath::{parse_path, XPathFilter};

use crate::db::Conflux;
use crate::error::DbError;

// ---------------------------------------------------------------------------
// Staged edits
// ---------------------------------------------------------------------------

/// One staged edit operation.
#[derive(Debug, Clone)]
enum Edit {
    Set {
        path: String,
        value: Option<DataValue>,
    },
    Delete {
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One client's handle on a [`Conflux`] instance.
pub struct Session {
    id: SessionId,
    db: Arc<Conflux>,
    pending: Mutex<FxHashMap<DatastoreKind, Vec<Edit>>>,
    last_error: Mutex<Option<ErrorInfo>>,
}

impl Session {
    pub(crate) fn new(id: SessionId, db: Arc<Conflux>) -> Self {
        debug!(session = %id, "session opened");
        Self {
            id,
            db,
            pending: Mutex::new(FxHashMap::default()),
            last_error: Mutex::new(None),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Error chain of the last failed operation, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.last_error.lock().clone()
    }

    fn fail(&self, err: DbError, info: ErrorInfo) -> DbError {
        *self.last_error.lock() = Some(info);
        err
    }

    fn fail_simple(&self, err: DbError, code: ErrorCode) -> DbError {
        let info = ErrorInfo::from_item(ErrorItem::new(code, err.to_string()));
        self.fail(err, info)
    }

    // -- editing ----------------------------------------------------------

    /// Stages a value write.
    ///
    /// # Errors
    ///
    /// [`DbError::Path`] if the path cannot be parsed.
    pub fn set_item(
        &self,
        datastore: DatastoreKind,
        path: &str,
        value: DataValue,
    ) -> Result<(), DbError> {
        parse_path(path).map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        self.pending
            .lock()
            .entry(datastore)
            .or_default()
            .push(Edit::Set {
                path: path.to_string(),
                value: Some(value),
            });
        Ok(())
    }

    /// Stages a node (and subtree) deletion.
    ///
    /// # Errors
    ///
    /// [`DbError::Path`] if the path cannot be parsed.
    pub fn delete_item(&self, datastore: DatastoreKind, path: &str) -> Result<(), DbError> {
        parse_path(path).map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        self.pending
            .lock()
            .entry(datastore)
            .or_default()
            .push(Edit::Delete {
                path: path.to_string(),
            });
        Ok(())
    }

    /// Drops the staged edits of a datastore.
    pub fn discard_changes(&self, datastore: DatastoreKind) {
        self.pending.lock().remove(&datastore);
    }

    /// Commits the staged edits of a datastore through the two-phase
    /// subscriber protocol, swapping the tree on success.
    ///
    /// Staged edits survive a failed commit so they can be amended and
    /// retried (or discarded).
    ///
    /// # Errors
    ///
    /// [`DbError::Commit`] if a subscriber or its timeout rejected the
    /// transaction; the datastore is unchanged in that case.
    pub fn apply_changes(
        &self,
        datastore: DatastoreKind,
        timeout: Option<Duration>,
    ) -> Result<(), DbError> {
        self.db.check_open()?;
        let edits = match self.pending.lock().get(&datastore) {
            Some(edits) if !edits.is_empty() => edits.clone(),
            _ => return Ok(()),
        };

        let lock = self.db.datastores.tree(datastore);
        let mut guard = lock.write();
        let old = guard.clone();
        let mut new = old.clone();
        for edit in &edits {
            let result = match edit {
                Edit::Set { path, value } => new.set(path, value.clone()),
                Edit::Delete { path } => new.remove(path).map(|_| ()),
            };
            result.map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        }

        self.commit_locked(datastore, &mut guard, old, &new, timeout)?;
        drop(guard);
        self.pending.lock().remove(&datastore);
        Ok(())
    }

    /// Replaces the whole content of `target` with the content of
    /// `source`, through the normal two-phase commit on `target`.
    ///
    /// # Errors
    ///
    /// [`DbError::Commit`] if a subscriber rejected the transaction.
    pub fn copy_config(
        &self,
        target: DatastoreKind,
        source: DatastoreKind,
        timeout: Option<Duration>,
    ) -> Result<(), DbError> {
        self.db.check_open()?;
        if target == source {
            return Ok(());
        }
        let source_tree = self.db.datastores.tree(source).read().clone();

        let lock = self.db.datastores.tree(target);
        let mut guard = lock.write();
        let old = guard.clone();
        self.commit_locked(target, &mut guard, old, &source_tree, timeout)?;
        Ok(())
    }

    /// Runs the multiplexer for `old -> new` while the caller holds the
    /// datastore write lock, installing the final diff on success.
    fn commit_locked(
        &self,
        datastore: DatastoreKind,
        guard: &mut DataTree,
        old: DataTree,
        new: &DataTree,
        timeout: Option<Duration>,
    ) -> Result<(), DbError> {
        let changes = ChangeSet::from_trees(&old, new);
        let target: &mut DataTree = guard;
        let result = self
            .db
            .mux
            .commit(datastore, changes, self.id, timeout, move |final_set| {
                let mut tree = old;
                final_set
                    .apply(&mut tree)
                    .map_err(|e| ErrorItem::new(ErrorCode::Internal, e.to_string()))?;
                *target = tree;
                Ok(())
            });
        match result {
            Ok(outcome) => {
                if outcome.changed {
                    debug!(session = %self.id, datastore = %datastore, txn = %outcome.txn, "committed");
                }
                Ok(())
            }
            Err(err) => {
                let info = err.to_error_info();
                Err(self.fail(err.into(), info))
            }
        }
    }

    // -- reading ----------------------------------------------------------

    /// Reads the value at a path.
    ///
    /// # Errors
    ///
    /// [`DbError::Path`] if the path cannot be parsed.
    pub fn get_value(
        &self,
        datastore: DatastoreKind,
        path: &str,
    ) -> Result<Option<DataValue>, DbError> {
        parse_path(path).map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        Ok(self
            .db
            .datastores
            .tree(datastore)
            .read()
            .get_value(path)
            .cloned())
    }

    /// Returns a filtered copy of a configuration datastore.
    ///
    /// # Errors
    ///
    /// [`DbError::Path`] if the filter cannot be parsed.
    pub fn get_subtree(
        &self,
        datastore: DatastoreKind,
        filter: &str,
    ) -> Result<DataTree, DbError> {
        let filter = XPathFilter::parse(filter)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        Ok(self.db.datastores.tree(datastore).read().filtered(&filter))
    }

    /// Serves an operational read: pushed layer plus provider
    /// composition, pruned by the request.
    ///
    /// # Errors
    ///
    /// [`DbError::Oper`] on validation failure of a provider subtree.
    pub fn oper_read(&self, xpath: &str, timeout: Option<Duration>) -> Result<DataTree, DbError> {
        self.db.check_open()?;
        let base = self.db.datastores.tree(DatastoreKind::Operational).read().clone();
        self.db
            .composer
            .compose(xpath, base, self.db.validator.as_ref(), self.id, timeout)
            .map_err(|err| {
                let info = ErrorInfo::from_item(ErrorItem::new(
                    match err {
                        conflux_core::oper::OperError::Validation { .. } => ErrorCode::Validation,
                        conflux_core::oper::OperError::Request(_) => ErrorCode::InvalidArgument,
                        conflux_core::oper::OperError::Store(_) => ErrorCode::Internal,
                    },
                    err.to_string(),
                ));
                self.fail(err.into(), info)
            })
    }

    // -- rpc / notifications ----------------------------------------------

    /// Invokes the RPC or action at `xpath`, returning the primary
    /// provider's output.
    ///
    /// # Errors
    ///
    /// [`DbError::Rpc`]; see [`conflux_core::rpc::RpcError`].
    pub fn rpc_send(
        &self,
        xpath: &str,
        input: &DataTree,
        timeout: Option<Duration>,
    ) -> Result<DataTree, DbError> {
        self.db.check_open()?;
        self.db
            .rpc
            .invoke(xpath, input, self.id, timeout)
            .map_err(|err| {
                let info = err.to_error_info();
                self.fail(err.into(), info)
            })
    }

    /// Emits a notification. The module is derived from the path's root
    /// prefix; the timestamp defaults to now.
    ///
    /// Returns the timestamp actually recorded.
    ///
    /// # Errors
    ///
    /// [`DbError::NoModule`] for a path without a module prefix.
    pub fn notif_send(
        &self,
        path: &str,
        data: &DataTree,
        timestamp_ms: Option<i64>,
    ) -> Result<i64, DbError> {
        self.db.check_open()?;
        let filter = XPathFilter::parse(path)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        let Some(module) = filter.root_module().map(str::to_string) else {
            return Err(
                self.fail_simple(DbError::NoModule(path.to_string()), ErrorCode::InvalidArgument)
            );
        };
        let ts = self
            .db
            .broker
            .publish(&module, path, data, timestamp_ms, self.id)
            .map_err(|err| self.fail_simple(err.into(), ErrorCode::Internal))?;
        // Publishing is the natural moment to withdraw subscriptions
        // whose stop marker has been consumed.
        self.db.broker.sweep_stop_times(self.id);
        Ok(ts)
    }

    // -- subscriptions -----------------------------------------------------

    /// Subscribes to configuration changes of a datastore.
    ///
    /// With `enabled_phase` set, the current content of the datastore is
    /// replayed to the new subscriber as a synthetic change before this
    /// call returns; a failure there withdraws the subscription.
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] or [`DbError::Commit`] (enabled replay).
    pub fn subscribe_change(
        &self,
        datastore: DatastoreKind,
        module: &str,
        filter: &str,
        priority: i32,
        flags: SubFlags,
        callback: Arc<dyn EngineCallback>,
    ) -> Result<SubscriptionId, DbError> {
        self.db.check_open()?;
        let opts = SubscribeOptions::new(
            module,
            filter,
            SubKind::Change {
                datastore,
                priority,
            },
        )
        .flags(flags);
        let id = self
            .db
            .registry
            .subscribe(opts, callback)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;

        if flags.enabled_phase {
            let sub = self
                .db
                .registry
                .subscription(id)
                .expect("subscription registered above");
            let current = self.db.datastores.tree(datastore).read().clone();
            if let Err(err) = self.db.mux.run_enabled(&sub, &current, self.id, None) {
                let _ = self.db.registry.unsubscribe(id);
                let info = err.to_error_info();
                return Err(self.fail(err.into(), info));
            }
        }
        Ok(id)
    }

    /// Subscribes to an RPC or action path.
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] for an invalid filter.
    pub fn subscribe_rpc(
        &self,
        module: &str,
        xpath: &str,
        priority: i32,
        flags: SubFlags,
        callback: Arc<dyn EngineCallback>,
    ) -> Result<SubscriptionId, DbError> {
        self.db.check_open()?;
        let opts = SubscribeOptions::new(module, xpath, SubKind::Rpc { priority }).flags(flags);
        self.db
            .registry
            .subscribe(opts, callback)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))
    }

    /// Subscribes to notifications, optionally with replay and an
    /// automatic stop time.
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] or [`DbError::Notif`].
    pub fn subscribe_notif(
        &self,
        module: &str,
        filter: &str,
        start_time_ms: Option<i64>,
        stop_time_ms: Option<i64>,
        flags: SubFlags,
        callback: Arc<dyn EngineCallback>,
    ) -> Result<SubscriptionId, DbError> {
        self.db.check_open()?;
        let opts = SubscribeOptions::new(
            module,
            filter,
            SubKind::Notification {
                start_time_ms,
                stop_time_ms,
            },
        )
        .flags(flags);
        let id = self
            .db
            .registry
            .subscribe(opts, callback)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))?;
        let sub = self
            .db
            .registry
            .subscription(id)
            .expect("subscription registered above");
        if let Err(err) = self.db.broker.attach(&sub, self.id) {
            let _ = self.db.registry.unsubscribe(id);
            return Err(self.fail_simple(err.into(), ErrorCode::Internal));
        }
        Ok(id)
    }

    /// Registers an operational data provider.
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] for an invalid filter.
    pub fn subscribe_oper(
        &self,
        module: &str,
        xpath: &str,
        priority: i32,
        flags: SubFlags,
        callback: Arc<dyn EngineCallback>,
    ) -> Result<SubscriptionId, DbError> {
        self.db.check_open()?;
        let opts =
            SubscribeOptions::new(module, xpath, SubKind::Operational { priority }).flags(flags);
        self.db
            .registry
            .subscribe(opts, callback)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::InvalidArgument))
    }

    /// Withdraws a subscription.
    ///
    /// Blocks while a callback of the subscription's group is running.
    ///
    /// # Errors
    ///
    /// [`DbError::Registry`] for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), DbError> {
        self.db.broker.detach(id);
        self.db
            .registry
            .unsubscribe(id)
            .map_err(|e| self.fail_simple(e.into(), ErrorCode::NotFound))
    }

    /// Suspends a subscription (skipped by all fan-out until resumed).
    pub fn suspend(&self, id: SubscriptionId) -> bool {
        self.db.registry.suspend(id)
    }

    /// Resumes a suspended subscription.
    pub fn resume(&self, id: SubscriptionId) -> bool {
        self.db.registry.resume(id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(session = %self.id, "session closed");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
