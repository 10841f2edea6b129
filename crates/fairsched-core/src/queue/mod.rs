//! Concrete classless leaf qdiscs.
//!
//! The spec places FIFO/LIFO leaves out of scope as deliverables (§1,
//! "interchangeable leaves conforming to the child contract"), but the
//! child contract (C6) cannot be exercised or benchmarked without at
//! least one concrete leaf. `Fifo` is that scaffolding: the simplest
//! possible conforming implementation, not a tuned production queue.

pub mod fifo;

pub use fifo::Fifo;
