//! # Nyx Scheduler Core
//!
//! Heterogeneous (big.LITTLE) CPU scheduler: a real-time class with
//! bandwidth throttling and push/pull migration, a fair class with a
//! capacity and energy aware wakeup balancer, and the Fluid-RT placement
//! policy that spreads RT tasks by utilization across coregroups.
//!
//! ## Design Principles
//!
//! - **Platform-Agnostic**: capacities, idle states and task attributes come
//!   in through [`traits::Platform`]; nothing here touches hardware
//! - **Ordered Locking**: every lock has a fixed level (see [`sync`])
//! - **Lock-Free Reads**: remote CPUs read a published [`sched::RqStat`]
//!   snapshot instead of taking run-queue locks
//! - **Observable**: every placement decision is a [`trace::TraceEvent`]

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2024_compatibility)]

extern crate alloc;

#[macro_use]
mod error;

pub mod cpumask;
pub mod platform;
pub mod sched;
pub mod sync;
pub mod topology;
pub mod trace;
pub mod traits;

pub use cpumask::{CpuMask, NR_CPUS};
pub use error::{Result, SchedError};
pub use platform::{PlatformModel, TaskAttrs};
pub use sched::{Scheduler, TaskId, TaskSpec, Tunables};
pub use topology::{CoregroupSpec, Topology};
pub use trace::TraceEvent;
pub use traits::{EnergyModel, Platform};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
