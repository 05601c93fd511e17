//! Event records — the work items delivered to subscriptions.
//!
//! Every fan-out in the engine (change phases, RPC invocations,
//! notifications, operational requests) is materialized as an
//! [`EventRecord`] published into the per-group event store. Records carry
//! an absolute deadline and walk a small state machine:
//!
//! ```text
//! pending ──► in-progress ──► completed-ok
//!    ▲              │     ├──► completed-fail
//!    │              │     └──► shelved ──┐
//!    └──────────────┴────────────────────┘   (re-queue, same deadline)
//! ```
//!
//! `timed-out` is terminal and may be set by any observer once the
//! deadline has passed.

use std::fmt;
use std::time::Instant;

use crate::change::TxnId;
use crate::data::DataTree;
use crate::errinfo::{ErrorCode, ErrorItem};
use crate::subscription::SubscriptionId;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of an originating client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Identifier of an event record, monotone within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EventPhase
// ---------------------------------------------------------------------------

/// The phase an event record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPhase {
    /// Pre-commit phase in which subscribers may still edit the diff.
    Update,
    /// Verification phase of a two-phase commit.
    Change,
    /// Post-commit confirmation (best effort).
    Done,
    /// Rollback of a failed commit or RPC.
    Abort,
    /// Synthetic replay of the current configuration at subscribe time.
    Enabled,
    /// RPC or action invocation.
    Rpc,
    /// Real-time notification delivery.
    NotifRealtime,
    /// Historical notification delivered during replay.
    NotifReplay,
    /// Marker: replay finished, real-time follows.
    NotifReplayComplete,
    /// Marker: the subscription's stop-time was reached.
    NotifStop,
    /// Operational data request to a provider.
    OperRequest,
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Update => "update",
            Self::Change => "change",
            Self::Done => "done",
            Self::Abort => "abort",
            Self::Enabled => "enabled",
            Self::Rpc => "rpc",
            Self::NotifRealtime => "notif-realtime",
            Self::NotifReplay => "notif-replay",
            Self::NotifReplayComplete => "notif-replay-complete",
            Self::NotifStop => "notif-stop",
            Self::OperRequest => "oper-request",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// EventState
// ---------------------------------------------------------------------------

/// Processing state of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    /// Published, waiting to be claimed by the pump.
    Pending,
    /// Claimed; the callback is running.
    InProgress,
    /// The callback returned ok.
    CompletedOk,
    /// The callback reported failure.
    CompletedFail,
    /// The callback asked for a re-queue; the record rests until the next
    /// pump pass.
    Shelved,
    /// The deadline elapsed. Terminal.
    TimedOut,
}

impl EventState {
    /// Returns `true` for states that end a record's processing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CompletedOk | Self::CompletedFail | Self::TimedOut)
    }

    /// Returns `true` if the transition `self -> to` is legal.
    #[must_use]
    pub fn can_transition(self, to: EventState) -> bool {
        match (self, to) {
            (Self::Pending, Self::InProgress | Self::TimedOut)
            | (
                Self::InProgress,
                Self::CompletedOk | Self::CompletedFail | Self::Shelved | Self::TimedOut,
            )
            | (Self::Shelved, Self::Pending | Self::TimedOut) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::CompletedOk => "completed-ok",
            Self::CompletedFail => "completed-fail",
            Self::Shelved => "shelved",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Per-kind payload of an event record.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A change-phase event referencing a transaction's change set.
    Change {
        /// Transaction whose change set the callback iterates.
        txn: TxnId,
    },
    /// An RPC invocation.
    Rpc {
        /// Invoked operation path.
        xpath: String,
        /// Input tree.
        input: DataTree,
    },
    /// A notification (real-time, replay, or marker).
    Notif {
        /// Notification path.
        path: String,
        /// Notification data.
        data: DataTree,
        /// Notification timestamp (milliseconds since the epoch).
        timestamp_ms: i64,
    },
    /// An operational data request.
    Oper {
        /// The reader's full request path.
        request_xpath: String,
        /// Concrete parent instance the provider fills in under.
        parent_path: String,
    },
}

// ---------------------------------------------------------------------------
// Verdict / CallbackOutcome
// ---------------------------------------------------------------------------

/// Result recorded against a processed event record.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Outcome code.
    pub code: ErrorCode,
    /// Output tree (RPC output, operational subtree).
    pub output: Option<DataTree>,
    /// Error detail for failed records.
    pub error: Option<ErrorItem>,
}

impl Verdict {
    /// A plain success verdict.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: ErrorCode::Ok,
            output: None,
            error: None,
        }
    }

    /// A success verdict carrying an output tree.
    #[must_use]
    pub fn ok_with_output(output: DataTree) -> Self {
        Self {
            code: ErrorCode::Ok,
            output: Some(output),
            error: None,
        }
    }

    /// A failure verdict.
    #[must_use]
    pub fn fail(error: ErrorItem) -> Self {
        Self {
            code: error.code,
            output: None,
            error: Some(error),
        }
    }
}

/// What a callback returned.
///
/// Shelving is a return code, never an unwind: the pump re-queues the
/// record and the callback will see the same event again on a later pass.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// The callback handled the event.
    Ok,
    /// The callback rejected the event.
    Fail(ErrorItem),
    /// Re-queue the event; the original deadline keeps counting.
    Shelve,
}

impl CallbackOutcome {
    /// Convenience failure constructor.
    #[must_use]
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Fail(ErrorItem::new(code, message))
    }
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// A work item for one subscription.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Record id, assigned at publish time, monotone per group.
    pub event_id: EventId,
    /// Target subscription.
    pub subscription: SubscriptionId,
    /// Phase this record belongs to.
    pub phase: EventPhase,
    /// Per-kind payload.
    pub payload: EventPayload,
    /// Session that caused the event.
    pub originator: SessionId,
    /// Absolute deadline; past it, any observer may mark the record
    /// timed out.
    pub deadline: Instant,
    /// Current processing state.
    pub state: EventState,
    /// Verdict, present once the record completed.
    pub verdict: Option<Verdict>,
}

impl EventRecord {
    /// Creates a pending record; the id is assigned by the store at
    /// publish time.
    #[must_use]
    pub fn new(
        subscription: SubscriptionId,
        phase: EventPhase,
        payload: EventPayload,
        originator: SessionId,
        deadline: Instant,
    ) -> Self {
        Self {
            event_id: EventId(0),
            subscription,
            phase,
            payload,
            originator,
            deadline,
            state: EventState::Pending,
            verdict: None,
        }
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // --- state machine tests ---

    #[test]
    fn test_state_legal_transitions() {
        use EventState::{CompletedFail, CompletedOk, InProgress, Pending, Shelved, TimedOut};

        assert!(Pending.can_transition(InProgress));
        assert!(Pending.can_transition(TimedOut));
        assert!(InProgress.can_transition(CompletedOk));
        assert!(InProgress.can_transition(CompletedFail));
        assert!(InProgress.can_transition(Shelved));
        assert!(InProgress.can_transition(TimedOut));
        assert!(Shelved.can_transition(Pending));
        assert!(Shelved.can_transition(TimedOut));
    }

    #[test]
    fn test_state_illegal_transitions() {
        use EventState::{CompletedFail, CompletedOk, InProgress, Pending, Shelved, TimedOut};

        // Terminal states never move.
        for terminal in [CompletedOk, CompletedFail, TimedOut] {
            assert!(terminal.is_terminal());
            for to in [Pending, InProgress, CompletedOk, CompletedFail, Shelved, TimedOut] {
                assert!(!terminal.can_transition(to));
            }
        }
        // No skipping the claim.
        assert!(!Pending.can_transition(CompletedOk));
        assert!(!Pending.can_transition(Shelved));
        // Shelved records must be re-queued, not completed in place.
        assert!(!Shelved.can_transition(CompletedOk));
    }

    #[test]
    fn test_record_expiry() {
        let now = Instant::now();
        let rec = EventRecord::new(
            SubscriptionId(1),
            EventPhase::Change,
            EventPayload::Change { txn: TxnId(1) },
            SessionId(1),
            now + Duration::from_secs(5),
        );
        assert!(!rec.is_expired(now));
        assert!(rec.is_expired(now + Duration::from_secs(5)));
        assert_eq!(rec.state, EventState::Pending);
        assert!(rec.verdict.is_none());
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(format!("{}", EventPhase::NotifReplayComplete), "notif-replay-complete");
        assert_eq!(format!("{}", EventState::CompletedFail), "completed-fail");
        assert_eq!(format!("{}", EventId(3)), "ev-3");
        assert_eq!(format!("{}", SessionId(9)), "sess-9");
    }
}
