//! # Bitswap Utils
//!
//! Concrete implementations of the `bitswap-interface` contracts: an
//! in-memory block store for tests and short-lived nodes, and a sled-backed
//! store for nodes that persist blocks across restarts.

pub mod blockstore;

pub use blockstore::*;
