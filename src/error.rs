//! Crate-wide error type.
//!
//! Programming errors (violated preconditions, broken invariants) are not
//! represented here: per the error handling design, those are fatal
//! assertions at a debug boundary (`debug_assert!`/`panic!`), not recoverable
//! values. `ForestError` covers the remaining two kinds: resource
//! exhaustion and communication failures, both of which are collective and
//! fatal once they escape a single rank but still need a typed value to
//! carry a diagnostic up to the point where the process group aborts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForestError {
    #[error("allocation failed while growing {pool}")]
    ResourceExhausted { pool: &'static str },

    #[error("MPI operation failed: {0}")]
    Mpi(String),

    #[error("received {got} bytes from rank {rank}, which is not a multiple of the quadrant record size {record_size}")]
    MalformedMessage {
        rank: i32,
        got: usize,
        record_size: usize,
    },

    #[error("peer {rank} aborted during a collective balance/partition exchange")]
    PeerAborted { rank: i32 },
}

pub type ForestResult<T> = Result<T, ForestError>;
