//! # Conflux
//!
//! Embedding facade for the conflux configuration and operational
//! datastore: datastore trees, client sessions, and the entry points
//! that couple commits, RPCs, notifications, and operational reads to
//! the subscription engine in [`conflux_core`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use conflux_db::{Conflux, ConfluxConfig};
//! use conflux_db::core::data::{DataValue, DatastoreKind};
//! use conflux_db::core::subscription::{change_fn, SubFlags};
//! use conflux_db::core::event::CallbackOutcome;
//!
//! let db = Conflux::open(ConfluxConfig::default())?;
//! let session = db.session();
//!
//! session.subscribe_change(
//!     DatastoreKind::Running,
//!     "net",
//!     "/net:interfaces",
//!     10,
//!     SubFlags::default(),
//!     change_fn(|ctx| {
//!         for op in ctx.changes(None) {
//!             tracing::info!("{}: {}", ctx.phase, op.path());
//!         }
//!         CallbackOutcome::Ok
//!     }),
//! )?;
//!
//! session.set_item(DatastoreKind::Running, "/net:interfaces/mtu", DataValue::Uint64(1500))?;
//! session.apply_changes(DatastoreKind::Running, None)?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod db;
mod error;
mod session;

pub use config::ConfluxConfig;
pub use db::Conflux;
pub use error::DbError;
pub use session::Session;

/// Re-export of the engine crate for direct access to its types.
pub use conflux_core as core;
