//! # fleetmgr
//!
//! A fleet coordinator for clusters of stateful entity hosts:
//! - dynamic membership with never-reused host ids
//! - least-loaded placement with debounced overload admission control
//! - cross-machine backup topology with two-phase transitions
//! - cycle-free voluntary retirement and crash repair
//! - ordered multi-stage fleet shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Coordinator                  │
//! │  (single-task event loop, no locks)      │
//! │   registry · placement · backup          │
//! │   retirement · liveness · shutdown       │
//! └──────────┬───────────────┬───────────────┘
//!            │ HTTP RPC      │ HTTP RPC
//!   ┌────────┴───┐   ┌───────┴────┐   ┌────────────┐
//!   │ Host 1     │   │ Host 2     │   │ Host 3     │
//!   │ (entities) │──▶│ (backups)  │──▶│ (backups)  │
//!   └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! Hosts self-report load, stream entity backups to the targets the
//! coordinator assigns, and acknowledge topology transitions before they
//! are committed. The peer coordinator for the read-only compute fleet,
//! the persistence service and the client gateway are external
//! collaborators reached over the same transport.
//!
//! ## Usage
//!
//! ```bash
//! fleetmgr-coord serve \
//!   --bind 0.0.0.0:7000 \
//!   --peer 10.0.0.5:7100 \
//!   --db 10.0.0.5:7200
//! ```

pub mod common;
pub mod coordinator;
pub mod transport;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
