//! # Notification Broker
//!
//! Fans out real-time notifications and serves replay for modules with a
//! persisted [`NotificationLog`]. Per subscriber the delivery sequence is
//! a small state machine:
//!
//! ```text
//! subscribe ──► replay (historical records, timestamp order)
//!                  │ log drained
//!                  ▼
//!               replay-complete ──► realtime ──► stop (stop-time reached)
//! ```
//!
//! Subscribers without a past start-time begin in realtime directly.
//! Real-time delivery is best effort: a full subscriber queue drops the
//! notification for that subscriber. Replay is loss-free: the cursor only
//! advances after a successful publish, so a failed publish is retried on
//! the next replay pass.

mod log;

pub use log::{unix_millis, LogRecord, NotifLogError, NotificationLog};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::data::DataTree;
use crate::event::{EventPayload, EventPhase, EventRecord, SessionId};
use crate::store::{EventStore, StoreError};
use crate::subscription::{
    RegistryError, SubKind, Subscription, SubscriptionId, SubscriptionRegistry,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum NotifError {
    /// Notification log failure.
    #[error(transparent)]
    Log(#[from] NotifLogError),
    /// Event store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The subscription is not a notification subscription.
    #[error("{0} is not a notification subscription")]
    NotNotification(SubscriptionId),
}

// ---------------------------------------------------------------------------
// BrokerMetrics
// ---------------------------------------------------------------------------

/// Atomic counters for monitoring the broker.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    /// Real-time notifications delivered (per subscriber).
    pub delivered: AtomicU64,
    /// Historical notifications delivered during replay.
    pub replayed: AtomicU64,
    /// Real-time notifications dropped on full queues.
    pub dropped: AtomicU64,
}

impl BrokerMetrics {
    /// Real-time deliveries so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Replay deliveries so far.
    #[must_use]
    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Drops so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Delivery state
// ---------------------------------------------------------------------------

/// Where one subscriber stands in the delivery sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    /// Serving historical records; `cursor_ms` is the last delivered
    /// timestamp.
    Replay {
        /// Last replayed timestamp.
        cursor_ms: i64,
    },
    /// Live fan-out; records at or before `floor_ms` were already seen
    /// through replay and are filtered to avoid duplicates.
    Realtime {
        /// Newest timestamp delivered through replay.
        floor_ms: i64,
    },
    /// Stop-time reached; nothing more is delivered.
    Stopped,
}

// ---------------------------------------------------------------------------
// NotificationBroker
// ---------------------------------------------------------------------------

/// Couples notification publishers to notification subscriptions.
pub struct NotificationBroker {
    config: EngineConfig,
    store: Arc<EventStore>,
    registry: Arc<SubscriptionRegistry>,
    /// Per-module logs; present only for replay-enabled modules. Lock
    /// order: `logs` before `states`.
    logs: Mutex<FxHashMap<String, NotificationLog>>,
    states: Mutex<FxHashMap<SubscriptionId, DeliveryState>>,
    metrics: BrokerMetrics,
}

impl NotificationBroker {
    /// Creates a broker over the shared engine state.
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
            logs: Mutex::new(FxHashMap::default()),
            states: Mutex::new(FxHashMap::default()),
            metrics: BrokerMetrics::default(),
        }
    }

    /// Enables replay for a module by opening its notification log.
    ///
    /// # Errors
    ///
    /// [`NotifError::Log`] if the log cannot be opened.
    pub fn enable_replay(&self, module: &str) -> Result<(), NotifError> {
        let mut logs = self.logs.lock();
        if !logs.contains_key(module) {
            let log = NotificationLog::open(
                module,
                self.config.notif_dir.as_deref(),
                self.config.notif_retention,
            )?;
            logs.insert(module.to_string(), log);
        }
        Ok(())
    }

    /// Returns `true` if the module persists notifications for replay.
    #[must_use]
    pub fn replay_enabled(&self, module: &str) -> bool {
        self.logs.lock().contains_key(module)
    }

    /// Broker metrics.
    #[must_use]
    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Attaches a freshly registered notification subscription, choosing
    /// its initial delivery state and running replay when due.
    ///
    /// # Errors
    ///
    /// [`NotifError::NotNotification`] for other subscription kinds.
    pub fn attach(
        &self,
        sub: &Arc<Subscription>,
        originator: SessionId,
    ) -> Result<(), NotifError> {
        let SubKind::Notification {
            start_time_ms,
            stop_time_ms,
        } = sub.kind
        else {
            return Err(NotifError::NotNotification(sub.id));
        };

        let now = unix_millis();
        if let Some(stop) = stop_time_ms {
            if stop <= now {
                debug!(sub = %sub.id, "stop-time already reached at subscribe");
                self.stop_subscriber(sub, originator);
                return Ok(());
            }
        }

        let replay = match start_time_ms {
            Some(start) if start <= now && self.replay_enabled(&sub.module) => Some(start),
            Some(start) if start <= now => {
                warn!(sub = %sub.id, module = %sub.module, "replay requested but not enabled for the module");
                None
            }
            _ => None,
        };

        match replay {
            Some(start) => {
                self.states.lock().insert(
                    sub.id,
                    DeliveryState::Replay {
                        cursor_ms: start - 1,
                    },
                );
                self.run_replay(sub, originator)?;
            }
            None => {
                self.states
                    .lock()
                    .insert(sub.id, DeliveryState::Realtime { floor_ms: i64::MIN });
            }
        }
        Ok(())
    }

    /// Detaches a subscription (on unsubscribe).
    pub fn detach(&self, sub: SubscriptionId) {
        self.states.lock().remove(&sub);
    }

    /// Drives one subscriber's replay until the log is drained, then
    /// delivers the replay-complete marker and switches to realtime.
    ///
    /// The cursor advances only after a successful publish; a publish
    /// timeout leaves it in place and the call can be retried.
    ///
    /// # Errors
    ///
    /// [`NotifError::Store`] if publishing times out; replay stays
    /// resumable in that case.
    pub fn run_replay(
        &self,
        sub: &Arc<Subscription>,
        originator: SessionId,
    ) -> Result<(), NotifError> {
        loop {
            let batch = {
                let logs = self.logs.lock();
                let states = self.states.lock();
                let Some(DeliveryState::Replay { cursor_ms }) = states.get(&sub.id).copied()
                else {
                    return Ok(());
                };
                let Some(log) = logs.get(&sub.module) else {
                    return Ok(());
                };
                let batch = log.range(cursor_ms, i64::MAX);
                if batch.is_empty() {
                    // Nothing newer while both locks are held: the stream
                    // is complete, and concurrent publishers will observe
                    // the realtime state from here on.
                    drop(states);
                    self.finish_replay(sub, originator, cursor_ms);
                    return Ok(());
                }
                batch
            };

            for record in batch {
                if sub.filter.covers(&record.path) {
                    let deadline = Instant::now() + self.config.default_timeout;
                    let event = EventRecord::new(
                        sub.id,
                        EventPhase::NotifReplay,
                        EventPayload::Notif {
                            path: record.path.clone(),
                            data: record.data.clone(),
                            timestamp_ms: record.timestamp_ms,
                        },
                        originator,
                        deadline,
                    );
                    self.store.publish_blocking(sub.group, event, deadline)?;
                    self.metrics.replayed.fetch_add(1, Ordering::Relaxed);
                }
                // The cursor advances past delivered and filtered-out
                // records alike, never past an undelivered one.
                self.states.lock().insert(
                    sub.id,
                    DeliveryState::Replay {
                        cursor_ms: record.timestamp_ms,
                    },
                );
            }
        }
    }

    /// Delivers replay-complete and flips the subscriber to realtime.
    /// Caller holds the `logs` lock so no publish can slip between the
    /// final drain check and the state flip.
    fn finish_replay(&self, sub: &Arc<Subscription>, originator: SessionId, floor_ms: i64) {
        let deadline = Instant::now() + self.config.default_timeout;
        let marker = EventRecord::new(
            sub.id,
            EventPhase::NotifReplayComplete,
            EventPayload::Notif {
                path: String::new(),
                data: DataTree::new(),
                timestamp_ms: unix_millis(),
            },
            originator,
            deadline,
        );
        if let Err(e) = self.store.publish_blocking(sub.group, marker, deadline) {
            warn!(sub = %sub.id, "replay-complete marker dropped: {e}");
        }
        self.states
            .lock()
            .insert(sub.id, DeliveryState::Realtime { floor_ms });
        debug!(sub = %sub.id, "replay complete");
    }

    /// Publishes a notification: persists it when the module replays,
    /// then fans it out to matching realtime subscribers.
    ///
    /// Returns the timestamp actually recorded (monotone-bumped for
    /// persisted modules).
    ///
    /// # Errors
    ///
    /// [`NotifError::Log`] if persisting fails; nothing was delivered in
    /// that case.
    pub fn publish(
        &self,
        module: &str,
        path: &str,
        data: &DataTree,
        timestamp_ms: Option<i64>,
        originator: SessionId,
    ) -> Result<i64, NotifError> {
        let now = unix_millis();
        let mut ts = timestamp_ms.unwrap_or(now);

        {
            let mut logs = self.logs.lock();
            if let Some(log) = logs.get_mut(module) {
                ts = log.append(path, data, ts)?;
            }
        }

        for sub in self.registry.notif_targets(module) {
            if !sub.filter.covers(path) {
                continue;
            }
            if let SubKind::Notification {
                stop_time_ms: Some(stop),
                ..
            } = sub.kind
            {
                if now >= stop {
                    self.stop_subscriber(&sub, originator);
                    continue;
                }
            }

            // A subscriber the facade never attached is treated as plain
            // realtime.
            let state = self
                .states
                .lock()
                .get(&sub.id)
                .copied()
                .unwrap_or(DeliveryState::Realtime { floor_ms: i64::MIN });
            match state {
                DeliveryState::Realtime { floor_ms } if ts > floor_ms => {
                    let deadline = Instant::now() + self.config.default_timeout;
                    let event = EventRecord::new(
                        sub.id,
                        EventPhase::NotifRealtime,
                        EventPayload::Notif {
                            path: path.to_string(),
                            data: data.clone(),
                            timestamp_ms: ts,
                        },
                        originator,
                        deadline,
                    );
                    match self.store.publish(sub.group, event) {
                        Ok(_) => {
                            self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Best effort: the subscriber loses this one.
                            warn!(sub = %sub.id, "realtime notification dropped: {e}");
                            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                DeliveryState::Realtime { .. } | DeliveryState::Stopped => {}
                DeliveryState::Replay { .. } => {
                    // The record is (being) persisted; replay will carry it.
                }
            }
        }
        Ok(ts)
    }

    /// Stops subscribers whose stop-time has passed, and withdraws
    /// stopped subscribers whose stop marker has been consumed.
    ///
    /// Withdrawal is deferred to this sweep (rather than done at stop
    /// time) so a queued stop marker is never dropped with its group.
    pub fn sweep_stop_times(&self, originator: SessionId) {
        let now = unix_millis();
        let attached: Vec<SubscriptionId> = self.states.lock().keys().copied().collect();
        for id in attached {
            let Some(sub) = self.registry.subscription(id) else {
                self.detach(id);
                continue;
            };
            let stopped = matches!(
                self.states.lock().get(&id),
                Some(DeliveryState::Stopped)
            );
            if stopped {
                // Withdraw once the marker left the queue.
                if !self.store.has_records_for(sub.group, id).unwrap_or(true) {
                    self.detach(id);
                    if let Err(e) = self.registry.unsubscribe(id) {
                        warn!(sub = %id, "withdrawing stopped subscription failed: {e}");
                    }
                }
                continue;
            }
            if let SubKind::Notification {
                stop_time_ms: Some(stop),
                ..
            } = sub.kind
            {
                if now >= stop {
                    self.stop_subscriber(&sub, originator);
                }
            }
        }
    }

    /// Emits the stop marker and marks the subscription stopped; the
    /// next sweep withdraws it.
    fn stop_subscriber(&self, sub: &Arc<Subscription>, originator: SessionId) {
        let already_stopped = {
            let mut states = self.states.lock();
            matches!(
                states.insert(sub.id, DeliveryState::Stopped),
                Some(DeliveryState::Stopped)
            )
        };
        if already_stopped {
            return;
        }

        let deadline = Instant::now() + self.config.default_timeout;
        let marker = EventRecord::new(
            sub.id,
            EventPhase::NotifStop,
            EventPayload::Notif {
                path: String::new(),
                data: DataTree::new(),
                timestamp_ms: unix_millis(),
            },
            originator,
            deadline,
        );
        if let Err(e) = self.store.publish(sub.group, marker) {
            warn!(sub = %sub.id, "stop marker dropped: {e}");
        }
        debug!(sub = %sub.id, "notification subscription stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
