//! Event Record Store and per-group transport.
//!
//! The store is the bounded mailbox between publishers (change
//! multiplexer, RPC dispatcher, notification broker, operational composer)
//! and consumers (the per-group pump). Each subscription group owns:
//!
//! - a record table with bounded capacity (publishing past it fails with
//!   [`StoreError::NoSpace`]),
//! - a monotone event-id counter,
//! - an [`EventPipe`] readiness handle that is raised while at least one
//!   record is `Pending` and cleared when none is.
//!
//! Publishers block on [`EventStore::wait_terminal`] to implement phase
//! barriers; the pump claims pending records and writes verdicts back via
//! [`EventStore::update`]. Wake-ups on the pipe may coalesce: readiness is
//! level-reliable, not a per-record signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::event::{EventId, EventRecord, EventState, Verdict};
use crate::subscription::GroupId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from event store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The group's record table is full.
    #[error("no space left in the event queue of group {0}")]
    NoSpace(GroupId),
    /// The group is not registered.
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    /// The record does not exist (already reaped?).
    #[error("unknown event {0}")]
    UnknownEvent(EventId),
    /// The requested state transition is illegal.
    #[error("illegal event state transition {from} -> {to}")]
    BadTransition {
        /// State the record was in.
        from: EventState,
        /// Requested state.
        to: EventState,
    },
    /// A blocking publish ran past its deadline.
    #[error("timed out publishing into group {0}")]
    PublishTimeout(GroupId),
}

// ---------------------------------------------------------------------------
// EventPipe
// ---------------------------------------------------------------------------

/// Level-reliable readiness handle of one subscription group.
///
/// Ready while the group has at least one `Pending` record; reads are
/// advisory — consumers must still call the pump to drain. Closing the
/// pipe (on group destruction) wakes all waiters permanently.
pub struct EventPipe {
    state: Mutex<PipeState>,
    cond: Condvar,
}

struct PipeState {
    ready: bool,
    closed: bool,
}

impl EventPipe {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                ready: false,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Returns `true` while pending work exists.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Returns `true` once the owning group has been destroyed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Blocks until the pipe is ready, closed, or the timeout elapses.
    ///
    /// Returns `true` if the pipe was ready when the wait ended.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !state.ready && !state.closed {
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut state, d).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        state.ready
    }

    fn set_ready(&self, ready: bool) {
        let mut state = self.state.lock();
        if state.ready != ready {
            state.ready = ready;
            if ready {
                self.cond.notify_all();
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

struct GroupSlot {
    queue: Mutex<Vec<EventRecord>>,
    /// Signaled on every record state change; used by phase barriers and
    /// blocked publishers.
    cond: Condvar,
    pipe: Arc<EventPipe>,
    capacity: usize,
    next_event_id: AtomicU64,
}

impl GroupSlot {
    /// Recomputes pipe readiness from the queue contents. Caller holds the
    /// queue lock.
    fn refresh_pipe(&self, queue: &[EventRecord]) {
        let ready = queue.iter().any(|r| r.state == EventState::Pending);
        self.pipe.set_ready(ready);
    }
}

/// Shared, bounded storage for in-flight event records, keyed by group.
pub struct EventStore {
    groups: RwLock<FxHashMap<GroupId, Arc<GroupSlot>>>,
}

impl EventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers a group with the given queue capacity, returning its
    /// readiness pipe. Re-registering an existing group returns the
    /// existing pipe.
    pub fn register_group(&self, group: GroupId, capacity: usize) -> Arc<EventPipe> {
        let mut groups = self.groups.write();
        let slot = groups.entry(group).or_insert_with(|| {
            Arc::new(GroupSlot {
                queue: Mutex::new(Vec::new()),
                cond: Condvar::new(),
                pipe: Arc::new(EventPipe::new()),
                capacity: capacity.max(1),
                next_event_id: AtomicU64::new(1),
            })
        });
        Arc::clone(&slot.pipe)
    }

    /// Removes a group, closing its pipe and dropping queued records.
    pub fn unregister_group(&self, group: GroupId) {
        let slot = self.groups.write().remove(&group);
        if let Some(slot) = slot {
            let mut queue = slot.queue.lock();
            if !queue.is_empty() {
                debug!(group = %group, dropped = queue.len(), "dropping records of destroyed group");
                queue.clear();
            }
            slot.pipe.close();
            slot.cond.notify_all();
        }
    }

    fn slot(&self, group: GroupId) -> Result<Arc<GroupSlot>, StoreError> {
        self.groups
            .read()
            .get(&group)
            .cloned()
            .ok_or(StoreError::UnknownGroup(group))
    }

    /// Returns the readiness pipe of a group.
    pub fn pipe(&self, group: GroupId) -> Result<Arc<EventPipe>, StoreError> {
        Ok(Arc::clone(&self.slot(group)?.pipe))
    }

    /// Publishes a record into a group's queue.
    ///
    /// Terminal leftovers are reaped first; if the queue is still full the
    /// publish fails with [`StoreError::NoSpace`]. On success the record
    /// receives the group's next monotone event id and the pipe is raised.
    pub fn publish(&self, group: GroupId, mut record: EventRecord) -> Result<EventId, StoreError> {
        let slot = self.slot(group)?;
        let mut queue = slot.queue.lock();
        queue.retain(|r| !r.state.is_terminal());
        if queue.len() >= slot.capacity {
            return Err(StoreError::NoSpace(group));
        }
        let id = EventId(slot.next_event_id.fetch_add(1, Ordering::Relaxed));
        record.event_id = id;
        record.state = EventState::Pending;
        debug!(group = %group, event = %id, phase = %record.phase, "publish");
        queue.push(record);
        slot.refresh_pipe(&queue);
        slot.cond.notify_all();
        Ok(id)
    }

    /// Publishes a record, waiting for queue space up to `deadline`.
    ///
    /// Used by replay, which must not drop records mid-stream.
    pub fn publish_blocking(
        &self,
        group: GroupId,
        record: EventRecord,
        deadline: Instant,
    ) -> Result<EventId, StoreError> {
        loop {
            match self.publish(group, record.clone()) {
                Err(StoreError::NoSpace(_)) => {}
                other => return other,
            }
            let slot = self.slot(group)?;
            let mut queue = slot.queue.lock();
            if queue.len() < slot.capacity {
                continue;
            }
            if slot.cond.wait_until(&mut queue, deadline).timed_out() {
                return Err(StoreError::PublishTimeout(group));
            }
        }
    }

    /// Re-queues shelved records as pending; expired ones become
    /// timed-out. Returns the number re-queued.
    pub fn requeue_shelved(&self, group: GroupId) -> Result<usize, StoreError> {
        let slot = self.slot(group)?;
        let mut queue = slot.queue.lock();
        let now = Instant::now();
        let mut requeued = 0;
        for rec in queue.iter_mut() {
            if rec.state == EventState::Shelved {
                if rec.is_expired(now) {
                    warn!(group = %group, event = %rec.event_id, "shelved record timed out");
                    rec.state = EventState::TimedOut;
                } else {
                    rec.state = EventState::Pending;
                    requeued += 1;
                }
            }
        }
        slot.refresh_pipe(&queue);
        slot.cond.notify_all();
        Ok(requeued)
    }

    /// Claims all pending, unexpired records, transitioning them to
    /// in-progress. Expired pending records become timed-out instead.
    pub fn claim_pending(&self, group: GroupId) -> Result<Vec<EventRecord>, StoreError> {
        let slot = self.slot(group)?;
        let mut queue = slot.queue.lock();
        let now = Instant::now();
        let mut claimed = Vec::new();
        for rec in queue.iter_mut() {
            if rec.state != EventState::Pending {
                continue;
            }
            if rec.is_expired(now) {
                warn!(group = %group, event = %rec.event_id, phase = %rec.phase, "pending record timed out");
                rec.state = EventState::TimedOut;
            } else {
                rec.state = EventState::InProgress;
                claimed.push(rec.clone());
            }
        }
        slot.refresh_pipe(&queue);
        slot.cond.notify_all();
        Ok(claimed)
    }

    /// Applies a state transition to a record, recording its verdict.
    pub fn update(
        &self,
        group: GroupId,
        event: EventId,
        to: EventState,
        verdict: Option<Verdict>,
    ) -> Result<(), StoreError> {
        let slot = self.slot(group)?;
        let mut queue = slot.queue.lock();
        let rec = queue
            .iter_mut()
            .find(|r| r.event_id == event)
            .ok_or(StoreError::UnknownEvent(event))?;
        if !rec.state.can_transition(to) {
            return Err(StoreError::BadTransition {
                from: rec.state,
                to,
            });
        }
        debug!(group = %group, event = %event, from = %rec.state, to = %to, "update");
        rec.state = to;
        if verdict.is_some() {
            rec.verdict = verdict;
        }
        slot.refresh_pipe(&queue);
        slot.cond.notify_all();
        Ok(())
    }

    /// Blocks until every listed record is terminal or `deadline` passes,
    /// then returns `(id, state, verdict)` per record. Records still live
    /// at the deadline are marked timed-out; records that vanished are
    /// reported as timed-out.
    pub fn wait_terminal(
        &self,
        group: GroupId,
        events: &[EventId],
        deadline: Instant,
    ) -> Result<Vec<(EventId, EventState, Option<Verdict>)>, StoreError> {
        let slot = self.slot(group)?;
        let mut queue = slot.queue.lock();
        loop {
            let all_terminal = events.iter().all(|id| {
                queue
                    .iter()
                    .find(|r| r.event_id == *id)
                    .map_or(true, |r| r.state.is_terminal())
            });
            if all_terminal {
                break;
            }
            if slot.cond.wait_until(&mut queue, deadline).timed_out() {
                for rec in queue.iter_mut() {
                    if events.contains(&rec.event_id) && !rec.state.is_terminal() {
                        warn!(group = %group, event = %rec.event_id, "phase barrier timed out");
                        rec.state = EventState::TimedOut;
                    }
                }
                slot.refresh_pipe(&queue);
                slot.cond.notify_all();
                break;
            }
        }

        let out = events
            .iter()
            .map(|id| {
                match queue.iter().find(|r| r.event_id == *id) {
                    Some(r) => (*id, r.state, r.verdict.clone()),
                    None => {
                        warn!(group = %group, event = %id, "record vanished before the barrier");
                        (*id, EventState::TimedOut, None)
                    }
                }
            })
            .collect();
        Ok(out)
    }

    /// Drops terminal records, returning how many were removed.
    pub fn reap_terminal(&self, group: GroupId) -> Result<usize, StoreError> {
        let slot = self.slot(group)?;
        let mut queue = slot.queue.lock();
        let before = queue.len();
        queue.retain(|r| !r.state.is_terminal());
        let reaped = before - queue.len();
        slot.refresh_pipe(&queue);
        if reaped > 0 {
            slot.cond.notify_all();
        }
        Ok(reaped)
    }

    /// Earliest deadline among pending and shelved records.
    pub fn next_deadline(&self, group: GroupId) -> Result<Option<Instant>, StoreError> {
        let slot = self.slot(group)?;
        let queue = slot.queue.lock();
        Ok(queue
            .iter()
            .filter(|r| matches!(r.state, EventState::Pending | EventState::Shelved))
            .map(|r| r.deadline)
            .min())
    }

    /// Returns `true` while any undelivered (non-terminal) record for the
    /// subscription sits in the group's queue.
    pub fn has_records_for(
        &self,
        group: GroupId,
        sub: crate::subscription::SubscriptionId,
    ) -> Result<bool, StoreError> {
        let slot = self.slot(group)?;
        let queue = slot.queue.lock();
        Ok(queue
            .iter()
            .any(|r| r.subscription == sub && !r.state.is_terminal()))
    }

    /// Number of shelved records resting in the group.
    pub fn shelved_count(&self, group: GroupId) -> Result<usize, StoreError> {
        let slot = self.slot(group)?;
        let queue = slot.queue.lock();
        Ok(queue
            .iter()
            .filter(|r| r.state == EventState::Shelved)
            .count())
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::change::TxnId;
    use crate::event::{EventPayload, EventPhase, SessionId};
    use crate::subscription::SubscriptionId;

    fn record(deadline: Instant) -> EventRecord {
        EventRecord::new(
            SubscriptionId(1),
            EventPhase::Change,
            EventPayload::Change { txn: TxnId(1) },
            SessionId(1),
            deadline,
        )
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    // --- publish / claim tests ---

    #[test]
    fn test_store_publish_assigns_monotone_ids() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 16);

        let a = store.publish(g, record(far())).unwrap();
        let b = store.publish(g, record(far())).unwrap();
        let c = store.publish(g, record(far())).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_store_publish_no_space() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 2);

        store.publish(g, record(far())).unwrap();
        store.publish(g, record(far())).unwrap();
        assert_eq!(
            store.publish(g, record(far())),
            Err(StoreError::NoSpace(g))
        );
    }

    #[test]
    fn test_store_publish_reaps_terminal_leftovers() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 1);

        let id = store.publish(g, record(far())).unwrap();
        store.claim_pending(g).unwrap();
        store
            .update(g, id, EventState::CompletedOk, Some(Verdict::ok()))
            .unwrap();

        // Full by count, but the completed record gives way.
        assert!(store.publish(g, record(far())).is_ok());
    }

    #[test]
    fn test_store_claim_transitions_and_skips_expired() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 16);

        store.publish(g, record(far())).unwrap();
        let expired = store
            .publish(g, record(Instant::now() - Duration::from_millis(1)))
            .unwrap();

        let claimed = store.claim_pending(g).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].state, EventState::InProgress);

        let states = store.wait_terminal(g, &[expired], far()).unwrap();
        assert_eq!(states[0].1, EventState::TimedOut);
    }

    #[test]
    fn test_store_unknown_group_and_event() {
        let store = EventStore::new();
        assert!(matches!(
            store.publish(GroupId(9), record(far())),
            Err(StoreError::UnknownGroup(_))
        ));

        let g = GroupId(1);
        store.register_group(g, 4);
        assert!(matches!(
            store.update(g, EventId(42), EventState::InProgress, None),
            Err(StoreError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_store_rejects_illegal_transition() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 4);
        let id = store.publish(g, record(far())).unwrap();

        assert!(matches!(
            store.update(g, id, EventState::CompletedOk, None),
            Err(StoreError::BadTransition { .. })
        ));
    }

    // --- pipe tests ---

    #[test]
    fn test_pipe_level_readiness() {
        let store = EventStore::new();
        let g = GroupId(1);
        let pipe = store.register_group(g, 4);
        assert!(!pipe.is_ready());

        let id = store.publish(g, record(far())).unwrap();
        assert!(pipe.is_ready());

        store.claim_pending(g).unwrap();
        // No pending records left while in progress.
        assert!(!pipe.is_ready());

        store
            .update(g, id, EventState::Shelved, None)
            .unwrap();
        assert!(!pipe.is_ready());

        store.requeue_shelved(g).unwrap();
        assert!(pipe.is_ready());
    }

    #[test]
    fn test_pipe_wait_with_timeout() {
        let store = EventStore::new();
        let g = GroupId(1);
        let pipe = store.register_group(g, 4);

        assert!(!pipe.wait_ready(Some(Duration::from_millis(10))));

        store.publish(g, record(far())).unwrap();
        assert!(pipe.wait_ready(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_pipe_closed_on_unregister() {
        let store = EventStore::new();
        let g = GroupId(1);
        let pipe = store.register_group(g, 4);

        store.unregister_group(g);
        assert!(pipe.is_closed());
        // A waiter returns immediately instead of blocking forever.
        assert!(!pipe.wait_ready(None));
    }

    // --- shelve / requeue tests ---

    #[test]
    fn test_requeue_shelved_preserves_deadline() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 4);

        let deadline = far();
        let id = store.publish(g, record(deadline)).unwrap();
        store.claim_pending(g).unwrap();
        store.update(g, id, EventState::Shelved, None).unwrap();

        assert_eq!(store.requeue_shelved(g).unwrap(), 1);
        let claimed = store.claim_pending(g).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].deadline, deadline);
    }

    #[test]
    fn test_requeue_expired_shelf_times_out() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 4);

        let id = store
            .publish(g, record(Instant::now() + Duration::from_millis(20)))
            .unwrap();
        store.claim_pending(g).unwrap();
        store.update(g, id, EventState::Shelved, None).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.requeue_shelved(g).unwrap(), 0);
        let states = store.wait_terminal(g, &[id], far()).unwrap();
        assert_eq!(states[0].1, EventState::TimedOut);
    }

    // --- barrier tests ---

    #[test]
    fn test_wait_terminal_blocks_until_updates() {
        let store = Arc::new(EventStore::new());
        let g = GroupId(1);
        store.register_group(g, 4);
        let id = store.publish(g, record(far())).unwrap();

        let worker = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                store.claim_pending(g).unwrap();
                store
                    .update(g, id, EventState::CompletedOk, Some(Verdict::ok()))
                    .unwrap();
            })
        };

        let states = store.wait_terminal(g, &[id], far()).unwrap();
        worker.join().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].0, id);
        assert_eq!(states[0].1, EventState::CompletedOk);
        assert!(states[0].2.is_some());
    }

    #[test]
    fn test_wait_terminal_deadline_marks_timeout() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 4);
        let id = store.publish(g, record(far())).unwrap();

        let states = store
            .wait_terminal(g, &[id], Instant::now() + Duration::from_millis(20))
            .unwrap();
        assert_eq!(states[0].1, EventState::TimedOut);
    }

    #[test]
    fn test_reap_terminal() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 8);

        let a = store.publish(g, record(far())).unwrap();
        let _b = store.publish(g, record(far())).unwrap();
        store.claim_pending(g).unwrap();
        store
            .update(g, a, EventState::CompletedFail, None)
            .unwrap();

        assert_eq!(store.reap_terminal(g).unwrap(), 1);
        assert_eq!(store.reap_terminal(g).unwrap(), 0);
    }

    #[test]
    fn test_next_deadline_and_shelved_count() {
        let store = EventStore::new();
        let g = GroupId(1);
        store.register_group(g, 8);
        assert_eq!(store.next_deadline(g).unwrap(), None);

        let near = Instant::now() + Duration::from_secs(1);
        let id = store.publish(g, record(near)).unwrap();
        store.publish(g, record(far())).unwrap();
        assert_eq!(store.next_deadline(g).unwrap(), Some(near));

        store.claim_pending(g).unwrap();
        store.update(g, id, EventState::Shelved, None).unwrap();
        assert_eq!(store.shelved_count(g).unwrap(), 1);
        // Shelved records still count towards the next deadline.
        assert_eq!(store.next_deadline(g).unwrap(), Some(near));
    }
}
