//! Caller-facing error taxonomy
//!
//! Every public operation reports failure through [`P2pError`]; nothing in
//! this crate is fatal to the process, and the caller is always free to
//! retry registration or connection from scratch. Congestion never surfaces
//! here: it is a retry condition private to `send`.

use thiserror::Error;

use crate::engine::EngineError;
use crate::frame::FrameError;

/// Errors reported by the connection manager.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum P2pError {
    /// No free slot in a fixed-size pool; reported immediately, never after
    /// a wait.
    #[error("no free slot in the {0} pool")]
    PoolExhausted(&'static str),

    /// The caller handle does not (or no longer) name a record.
    #[error("unknown handle {0}")]
    UnknownHandle(u32),

    /// The engine rejected the command synchronously.
    #[error("engine rejected command: {0}")]
    Engine(#[from] EngineError),

    /// The engine signalled failure through its completion callback; the
    /// partially-created record has been freed.
    #[error("operation failed")]
    Failed,

    /// The connection was invalidated while the operation was in flight.
    #[error("connection is no longer established")]
    NotConnected,

    /// The subsystem is disabled; a blocked operation woke to find the
    /// stack torn down.
    #[error("peer-to-peer subsystem disabled")]
    Disabled,

    /// A legacy push tunnel is already active; only one may exist at a time.
    #[error("legacy push tunnel already active")]
    TunnelBusy,

    /// Malformed legacy push frame.
    #[error("bad push frame: {0}")]
    BadFrame(#[from] FrameError),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, P2pError>;
