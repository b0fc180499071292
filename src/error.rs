//! Error surface for the allocator core.
//!
//! Per §7 of SPEC_FULL.md only construction (`BadConfig`) and backing-memory
//! exhaustion (`OutOfMemory`) are fallible; the free path is infallible and
//! reports programmer errors through `debug_assert!` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("bad allocator config: {0}")]
    BadConfig(String),

    #[error("chunk provider could not supply {requested} bytes")]
    OutOfMemory { requested: usize },
}

pub type PoolResult<T> = Result<T, PoolError>;
