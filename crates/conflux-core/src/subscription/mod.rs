//! # Subscription Registry & Pump
//!
//! Ownership and delivery for all four subscription kinds.
//!
//! ## Architecture
//!
//! ```text
//! Publishers                    Registry / Pump              Subscribers
//! ┌──────────────┐              ┌──────────────────┐         ┌───────────┐
//! │ change mux   │──publish──►  │ EventStore queue │──claim─►│ callback  │
//! │ rpc dispatch │              │ (per group)      │         │ (serial   │
//! │ notif broker │   pipe ◄─────│ process_events   │◄─verdict│  per group│
//! │ oper compose │              └──────────────────┘         └───────────┘
//! └──────────────┘
//! ```
//!
//! Groups either run an engine-owned worker thread (the default) or leave
//! draining to the caller (`no_thread`), which polls the group's
//! [`EventPipe`](crate::store::EventPipe) and calls
//! [`SubscriptionRegistry::process_events`].

mod callback;
mod pump;
mod registry;

pub use callback::{
    change_fn, notif_fn, oper_fn, rpc_fn, ChangeContext, EngineCallback, NotifContext,
    OperContext, RpcContext,
};
pub use pump::PumpPass;
pub use registry::{
    GroupId, PumpMode, RegistryError, SubFlags, SubKind, SubscribeOptions, Subscription,
    SubscriptionId, SubscriptionMetrics, SubscriptionRegistry,
};
