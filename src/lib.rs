//! Warm VM pool reconciliation core.
//!
//! Keeps configured pools of pre-provisioned VMs warm: a per-pool
//! reconciler walks every VM through discovered, pending, ready, running
//! and completed, while shared components bound clone concurrency, size
//! pools to demand, and shield the compute provider behind a circuit
//! breaker with adaptive deadlines. The [`supervisor::Supervisor`] wires
//! it all together and keeps the workers alive.

pub mod autoscaler;
pub mod breaker;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod provider;
pub mod rate;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod tasks;
pub mod timeout;

pub use error::{Error, Result};
pub use models::VmRecord;
