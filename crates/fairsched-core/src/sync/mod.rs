//! Synchronization primitives built on top of `parking_lot`: the alpha/beta
//! lock (C8) that the bitmap facade and GFQ use for structural exclusion.

pub mod alpha_beta;

pub use alpha_beta::AlphaBetaLock;
