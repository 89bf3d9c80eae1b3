//! Listening-service endpoint
//!
//! A [`P2pServer`] is one registered listening service with a bounded set
//! of connection slots. Re-registering the same service name is idempotent:
//! the record is reused and only its caller handle is updated. Slots hold
//! `Arc<P2pConnection>` so callers can park on a connection's events
//! without pinning the slot lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::conn::P2pConnection;
use crate::engine::{EngineHandle, INVALID_ENGINE_HANDLE};
use crate::error::P2pError;
use crate::pool::Pool;
use crate::sync::SyncEvent;

/// Caller handle value meaning "established by the engine, not yet claimed
/// by an accept call".
pub const UNCLAIMED: u32 = 0;

/// A registered listening service.
pub struct P2pServer {
    service_name: String,
    caller_handle: AtomicU32,
    engine_handle: AtomicU32,

    /// Signalled when the engine completes the service registration.
    pub registration: SyncEvent,
    /// Signalled when a connection request (or a tunneled push replay)
    /// arrives for this service.
    pub conn_request: SyncEvent,

    slots: Mutex<Pool<Arc<P2pConnection>>>,
}

impl P2pServer {
    /// Create a server record pending engine registration.
    pub fn new(caller_handle: u32, service_name: &str, slot_capacity: usize) -> Self {
        P2pServer {
            service_name: service_name.to_owned(),
            caller_handle: AtomicU32::new(caller_handle),
            engine_handle: AtomicU32::new(INVALID_ENGINE_HANDLE),
            registration: SyncEvent::new(),
            conn_request: SyncEvent::new(),
            slots: Mutex::new(Pool::new(slot_capacity)),
        }
    }

    /// The service name this server listens on.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Current caller handle; updated on idempotent re-registration.
    pub fn caller_handle(&self) -> u32 {
        self.caller_handle.load(Ordering::Acquire)
    }

    /// Adopt the most recent caller on re-registration.
    pub fn set_caller_handle(&self, handle: u32) {
        self.caller_handle.store(handle, Ordering::Release);
    }

    /// Engine handle assigned once registration completes.
    pub fn engine_handle(&self) -> EngineHandle {
        self.engine_handle.load(Ordering::Acquire)
    }

    /// Record the registration result.
    pub fn set_engine_handle(&self, handle: EngineHandle) {
        self.engine_handle.store(handle, Ordering::Release);
    }

    /// Reset the engine handle on teardown.
    pub fn invalidate(&self) {
        self.engine_handle.store(INVALID_ENGINE_HANDLE, Ordering::Release);
    }

    /// Allocate a free slot for a pending accept, tagged with the caller's
    /// connection handle. Fails immediately when all slots are busy.
    pub fn allocate_slot(
        &self,
        conn_handle: u32,
        miu: u16,
        rw: u8,
    ) -> Result<Arc<P2pConnection>, P2pError> {
        let conn = Arc::new(P2pConnection::new(conn_handle, miu, rw));
        self.slots
            .lock()
            .insert(Arc::clone(&conn))
            .map_err(|_| P2pError::PoolExhausted("connection slot"))?;
        Ok(conn)
    }

    /// Store an engine-established connection that no accept call has
    /// claimed yet. Used when the connection request beats the accept.
    pub fn store_unclaimed(&self, conn: Arc<P2pConnection>) -> Result<(), P2pError> {
        self.slots
            .lock()
            .insert(conn)
            .map(|_| ())
            .map_err(|_| P2pError::PoolExhausted("connection slot"))
    }

    /// First slot still waiting for the engine to fill it (pending accept).
    pub fn find_pending_slot(&self) -> Option<Arc<P2pConnection>> {
        self.slots
            .lock()
            .find(|conn| !conn.is_established() && conn.caller_handle() != UNCLAIMED)
            .cloned()
    }

    /// Claim an established-but-unclaimed connection for `conn_handle`.
    ///
    /// Connections stored by [`store_unclaimed`](Self::store_unclaimed)
    /// carry caller handle [`UNCLAIMED`]; claiming replaces the record with
    /// one owned by the caller.
    pub fn claim_unclaimed(&self, conn_handle: u32) -> Option<Arc<P2pConnection>> {
        let mut slots = self.slots.lock();
        let unclaimed =
            slots.remove_where(|conn| conn.is_established() && conn.caller_handle() == UNCLAIMED)?;
        let claimed = Arc::new(P2pConnection::new(
            conn_handle,
            unclaimed.local_miu(),
            unclaimed.local_rw(),
        ));
        claimed.set_engine_handle(unclaimed.engine_handle());
        claimed.set_remote_params(unclaimed.remote_miu(), unclaimed.remote_rw());
        // The pool had a free slot a moment ago (we just emptied one); a
        // racing allocate can still steal it, in which case the claim fails.
        match slots.insert(Arc::clone(&claimed)) {
            Ok(_) => Some(claimed),
            Err(_) => {
                drop(slots);
                self.store_unclaimed(unclaimed).ok();
                None
            }
        }
    }

    /// Find a slot connection by its caller handle.
    pub fn find_by_caller(&self, conn_handle: u32) -> Option<Arc<P2pConnection>> {
        self.slots.lock().find(|conn| conn.caller_handle() == conn_handle).cloned()
    }

    /// Find a slot connection by its engine handle.
    pub fn find_by_engine(&self, handle: EngineHandle) -> Option<Arc<P2pConnection>> {
        if handle == INVALID_ENGINE_HANDLE {
            return None;
        }
        self.slots.lock().find(|conn| conn.engine_handle() == handle).cloned()
    }

    /// Free the slot owned by `conn_handle`.
    pub fn remove_by_caller(&self, conn_handle: u32) -> Option<Arc<P2pConnection>> {
        self.slots.lock().remove_where(|conn| conn.caller_handle() == conn_handle)
    }

    /// Snapshot of every live slot connection.
    pub fn connections(&self) -> Vec<Arc<P2pConnection>> {
        self.slots.lock().iter().cloned().collect()
    }

    /// Free every slot.
    pub fn clear_slots(&self) {
        self.slots.lock().clear();
    }
}
