//! Outbound-connection endpoint
//!
//! A [`P2pClient`] is one outbound connection attempt: the client's engine
//! registration handle, the wrapped data-link connection, and the state
//! needed to tunnel legacy push data through the alternate protocol when
//! the peer does not speak the legacy push service.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::conn::P2pConnection;
use crate::engine::{EngineHandle, INVALID_ENGINE_HANDLE};
use crate::sync::SyncEvent;

/// Reassembly state for an outbound legacy push tunnel.
///
/// The caller sends the push message in frames; the first frame's header
/// advertises the total payload length. Payload bytes accumulate here until
/// complete, then go out as a single alternate-protocol put.
#[derive(Default)]
pub struct TunnelBuffer {
    /// Accumulated payload bytes.
    pub buf: Vec<u8>,
    /// Total payload length advertised by the frame header; 0 while no
    /// frame header has been seen.
    pub expected: usize,
}

impl TunnelBuffer {
    /// Drop any partially accumulated message.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = 0;
    }
}

/// One outbound connection attempt.
pub struct P2pClient {
    engine_handle: AtomicU32,
    connecting: AtomicBool,
    tunnel_ok: AtomicBool,

    /// The wrapped data-link connection.
    pub conn: Arc<P2pConnection>,
    /// Signalled when the engine completes the client registration.
    pub registration: SyncEvent,
    /// Signalled when the outbound connect completes (success or failure).
    pub connected: SyncEvent,
    /// Signalled when an alternate-protocol connect or put completes.
    pub tunnel_event: SyncEvent,
    /// Outbound tunnel reassembly buffer.
    pub tunnel_buf: Mutex<TunnelBuffer>,
}

impl P2pClient {
    /// Create a client record pending engine registration.
    pub fn new(conn_handle: u32, miu: u16, rw: u8) -> Self {
        P2pClient {
            engine_handle: AtomicU32::new(INVALID_ENGINE_HANDLE),
            connecting: AtomicBool::new(false),
            tunnel_ok: AtomicBool::new(false),
            conn: Arc::new(P2pConnection::new(conn_handle, miu, rw)),
            registration: SyncEvent::new(),
            connected: SyncEvent::new(),
            tunnel_event: SyncEvent::new(),
            tunnel_buf: Mutex::new(TunnelBuffer::default()),
        }
    }

    /// Engine registration handle; invalid until registration completes.
    pub fn engine_handle(&self) -> EngineHandle {
        self.engine_handle.load(Ordering::Acquire)
    }

    /// Record the registration result.
    pub fn set_engine_handle(&self, handle: EngineHandle) {
        self.engine_handle.store(handle, Ordering::Release);
    }

    /// Reset the registration handle on teardown.
    pub fn invalidate(&self) {
        self.engine_handle.store(INVALID_ENGINE_HANDLE, Ordering::Release);
    }

    /// Whether registration has completed.
    pub fn is_registered(&self) -> bool {
        self.engine_handle() != INVALID_ENGINE_HANDLE
    }

    /// Whether a connect is currently in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    /// Mark the start or end of a connect attempt.
    pub fn set_connecting(&self, connecting: bool) {
        self.connecting.store(connecting, Ordering::Release);
    }

    /// Result of the last alternate-protocol operation.
    pub fn tunnel_ok(&self) -> bool {
        self.tunnel_ok.load(Ordering::Acquire)
    }

    /// Record the result of an alternate-protocol operation.
    pub fn set_tunnel_ok(&self, ok: bool) {
        self.tunnel_ok.store(ok, Ordering::Release);
    }

    /// Wake every thread that may be parked on this client.
    pub fn wake_all(&self) {
        self.registration.notify_all();
        self.connected.notify_all();
        self.tunnel_event.notify_all();
        self.conn.wake_all();
    }
}
