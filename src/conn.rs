//! Per-connection record
//!
//! One [`P2pConnection`] exists per live caller-visible data link. The
//! caller handle is fixed at creation and never reused; the engine handle
//! is written by the engine's callback thread when the link is actually
//! established and reset to invalid on teardown, so every blocked operation
//! can detect invalidation when it wakes.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::engine::{EngineHandle, INVALID_ENGINE_HANDLE};
use crate::sync::SyncEvent;

/// State of one data-link connection.
pub struct P2pConnection {
    caller_handle: u32,
    engine_handle: AtomicU32,
    local_miu: u16,
    local_rw: u8,
    remote_miu: AtomicU16,
    remote_rw: AtomicU8,

    /// Signalled when data arrives on the link.
    pub data_ready: SyncEvent,
    /// Signalled when congestion clears (and on teardown, to unblock senders).
    pub congestion: SyncEvent,
    /// Signalled when the engine confirms the disconnect.
    pub disconnected: SyncEvent,
}

impl P2pConnection {
    /// Create a record for a pending connection. The engine handle stays
    /// invalid until the engine reports the link established.
    pub fn new(caller_handle: u32, local_miu: u16, local_rw: u8) -> Self {
        P2pConnection {
            caller_handle,
            engine_handle: AtomicU32::new(INVALID_ENGINE_HANDLE),
            local_miu,
            local_rw,
            remote_miu: AtomicU16::new(0),
            remote_rw: AtomicU8::new(0),
            data_ready: SyncEvent::new(),
            congestion: SyncEvent::new(),
            disconnected: SyncEvent::new(),
        }
    }

    /// Caller-facing identifier, stable for the life of the record.
    pub fn caller_handle(&self) -> u32 {
        self.caller_handle
    }

    /// Current engine handle; [`INVALID_ENGINE_HANDLE`] before establishment
    /// and after teardown.
    pub fn engine_handle(&self) -> EngineHandle {
        self.engine_handle.load(Ordering::Acquire)
    }

    /// Record the engine handle once the link is established.
    pub fn set_engine_handle(&self, handle: EngineHandle) {
        self.engine_handle.store(handle, Ordering::Release);
    }

    /// Reset the engine handle so waiters observe the teardown.
    pub fn invalidate(&self) {
        self.engine_handle.store(INVALID_ENGINE_HANDLE, Ordering::Release);
    }

    /// Whether the link is currently established.
    pub fn is_established(&self) -> bool {
        self.engine_handle() != INVALID_ENGINE_HANDLE
    }

    /// Locally requested maximum information unit.
    pub fn local_miu(&self) -> u16 {
        self.local_miu
    }

    /// Locally requested receive window.
    pub fn local_rw(&self) -> u8 {
        self.local_rw
    }

    /// Peer's negotiated maximum information unit.
    pub fn remote_miu(&self) -> u16 {
        self.remote_miu.load(Ordering::Acquire)
    }

    /// Peer's negotiated receive window.
    pub fn remote_rw(&self) -> u8 {
        self.remote_rw.load(Ordering::Acquire)
    }

    /// Record the peer's negotiated flow-control parameters.
    pub fn set_remote_params(&self, miu: u16, rw: u8) {
        self.remote_miu.store(miu, Ordering::Release);
        self.remote_rw.store(rw, Ordering::Release);
    }

    /// Wake every thread that may be parked on this connection.
    pub fn wake_all(&self) {
        self.congestion.notify_all();
        self.data_ready.notify_all();
        self.disconnected.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unestablished() {
        let conn = P2pConnection::new(7, 1980, 2);
        assert_eq!(conn.caller_handle(), 7);
        assert!(!conn.is_established());
        assert_eq!(conn.local_miu(), 1980);
        assert_eq!(conn.local_rw(), 2);
        assert_eq!(conn.remote_miu(), 0);
    }

    #[test]
    fn test_establish_and_invalidate() {
        let conn = P2pConnection::new(1, 128, 1);
        conn.set_engine_handle(0x0042);
        conn.set_remote_params(248, 4);
        assert!(conn.is_established());
        assert_eq!(conn.engine_handle(), 0x0042);
        assert_eq!(conn.remote_miu(), 248);
        assert_eq!(conn.remote_rw(), 4);

        conn.invalidate();
        assert!(!conn.is_established());
        assert_eq!(conn.engine_handle(), INVALID_ENGINE_HANDLE);
    }
}
