//! snapquota - quota group control plane for snap services
//!
//! Groups snaps into named, optionally nested, memory-limited quota groups
//! and keeps the service manager's slices and service units in line with
//! the declared groups after every change.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  QuotaManager                    │
//! ├─────────────────────────────────────────────────┤
//! │  Mutations   │  Reconciliation  │   Restarts    │
//! ├─────────────────────────────────────────────────┤
//! │  Group model (quota)  │  State store (state)    │
//! ├─────────────────────────────────────────────────┤
//! │       Backend: registry, units, systemctl       │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod manager;
pub mod protocol;
pub mod quota;
pub mod state;

pub use manager::{
    all_quotas, get_quota, ControlConfig, QuotaError, QuotaGroupUpdate, QuotaManager, QuotaUpdate,
};
pub use quota::{GroupSet, QuotaGroup, Size};
pub use state::{SharedState, State};
