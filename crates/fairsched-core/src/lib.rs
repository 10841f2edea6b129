//! # fairsched-core
//!
//! A lock-free, hierarchical workload-scheduling core: a token-guarded
//! concurrent bitmap for fast empty-queue discovery, an alpha/beta lock for
//! structural exclusion, and a generalized fair queueing (GFQ) qdisc tree
//! for weighted, virtual-time-ordered dequeue selection.
//!
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod bitmap;
pub mod config;
pub mod error;
pub mod qdisc;
pub mod queue;
pub mod sync;
pub mod timing;
pub mod workload;

pub use bitmap::ConcurrentBitmap;
pub use config::SchedulerConfig;
pub use queue::Fifo;
pub use sync::AlphaBetaLock;
pub use workload::Workload;
