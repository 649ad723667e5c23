//! # Bitswap Interface
//!
//! The contracts between the Bitswap engine and its external collaborators:
//! the block store that holds `cid -> bytes` mappings, the content routing
//! system that answers provider queries, and the shared error type.
//!
//! The engine itself lives in the `bitswap` crate; concrete block store
//! implementations live in `bitswap-utils`.

pub mod blocks;
pub mod errors;
pub mod routing;

use std::pin::Pin;

use futures::Stream;

pub use blocks::*;
pub use errors::*;
pub use routing::*;

/// Type alias for async iterables/streams
pub type AwaitIterable<T> = Pin<Box<dyn Stream<Item = T> + Send>>;
