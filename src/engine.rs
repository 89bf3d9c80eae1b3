//! Protocol-engine boundary
//!
//! The connection manager drives an external, callback-driven LLCP engine.
//! Commands are issued synchronously through the [`P2pEngine`] trait and
//! either fail on the spot ([`EngineError`]) or complete later with an
//! [`EngineEvent`] delivered on the engine's own thread via
//! [`PeerToPeer::on_engine_event`](crate::PeerToPeer::on_engine_event).
//!
//! For a single connection the engine guarantees that a `Connected` event
//! precedes any `DataReady` or `Disconnected` event; there is no ordering
//! guarantee across connections.

use std::fmt;

// ============================================================================
// Handles and service access points
// ============================================================================

/// Identifier assigned by the engine to a server, client registration, or
/// data-link connection. Meaningful only after the corresponding completion
/// event; [`INVALID_ENGINE_HANDLE`] everywhere else.
pub type EngineHandle = u32;

/// The engine handle value meaning "not assigned" or "torn down".
pub const INVALID_ENGINE_HANDLE: EngineHandle = 0xFFFF_FFFF;

/// LLCP service access point number.
pub type Sap = u8;

/// Request a dynamically assigned SAP.
pub const SAP_DYNAMIC: Sap = 0x00;

/// Reserved SAP for the service discovery protocol.
pub const SAP_SDP: Sap = 0x01;

/// Reserved SAP for the simple NDEF exchange protocol.
pub const SAP_SNEP: Sap = 0x04;

/// Well-known service name for service discovery.
pub const SDP_SERVICE_NAME: &str = "urn:nfc:sn:sdp";

/// Well-known service name for the newer transfer protocol, used as the
/// tunnel carrier for legacy pushes.
pub const SNEP_SERVICE_NAME: &str = "urn:nfc:sn:snep";

/// Service name of the legacy push protocol. Connections to this name are
/// tunneled through the alternate protocol when the peer supports it.
pub const LEGACY_PUSH_SERVICE_NAME: &str = "com.android.npp";

/// Map a well-known service name to its reserved SAP, if it has one.
/// Everything else gets a dynamically assigned SAP.
pub fn well_known_sap(service_name: &str) -> Option<Sap> {
    match service_name {
        SDP_SERVICE_NAME => Some(SAP_SDP),
        SNEP_SERVICE_NAME => Some(SAP_SNEP),
        _ => None,
    }
}

// ============================================================================
// Command results
// ============================================================================

/// Outcome of a synchronous send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Data queued for transmission.
    Sent,
    /// The link is congested; retry after the congestion clears.
    Congested,
}

/// Synchronous rejection of an engine command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused the command outright.
    Rejected,
    /// The engine cannot take the command right now.
    Busy,
    /// The handle does not name a live engine resource.
    InvalidHandle,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Rejected => write!(f, "command rejected"),
            EngineError::Busy => write!(f, "engine busy"),
            EngineError::InvalidHandle => write!(f, "invalid engine handle"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Result of issuing an engine command.
pub type EngineResult<T> = Result<T, EngineError>;

// ============================================================================
// Commands
// ============================================================================

/// Command interface of the external protocol engine.
///
/// All methods only *issue* a command; completion arrives later as an
/// [`EngineEvent`] on the engine's thread, except for [`read`](Self::read)
/// which is a synchronous, non-blocking attempt. Implementations must not
/// deliver events re-entrantly from inside a command call.
pub trait P2pEngine: Send + Sync {
    /// Enable or disable peer-to-peer listen mode.
    fn set_listen_enabled(&self, enabled: bool) -> EngineResult<()>;

    /// Register a listening service. Completion: [`EngineEvent::ServerRegistered`].
    fn register_server(&self, sap: Sap, service_name: &str) -> EngineResult<()>;

    /// Deregister a listening service.
    fn deregister_server(&self, server: EngineHandle) -> EngineResult<()>;

    /// Register an outbound client. Completion: [`EngineEvent::ClientRegistered`].
    fn register_client(&self) -> EngineResult<()>;

    /// Connect a registered client to a service by name.
    /// Completion: [`EngineEvent::Connected`], or [`EngineEvent::Disconnected`]
    /// carrying the client registration handle on failure.
    fn connect_by_name(
        &self,
        client: EngineHandle,
        service_name: &str,
        miu: u16,
        rw: u8,
    ) -> EngineResult<()>;

    /// Connect a registered client to a service access point.
    fn connect_by_sap(&self, client: EngineHandle, sap: Sap, miu: u16, rw: u8)
        -> EngineResult<()>;

    /// Accept an incoming connection request.
    fn accept(&self, conn: EngineHandle, miu: u16, rw: u8) -> EngineResult<()>;

    /// Queue data on an established connection. May report congestion, in
    /// which case [`EngineEvent::Congestion`] signals the relief.
    fn send(&self, conn: EngineHandle, data: &[u8]) -> EngineResult<SendOutcome>;

    /// Read available bytes without blocking. Zero bytes is a valid result
    /// and does not mean end-of-data.
    fn read(&self, conn: EngineHandle, buf: &mut [u8]) -> EngineResult<usize>;

    /// Tear down an established connection.
    /// Completion: [`EngineEvent::Disconnected`].
    fn disconnect(&self, conn: EngineHandle) -> EngineResult<()>;

    /// Open the alternate-protocol session used for legacy push tunneling.
    /// Completion: [`EngineEvent::AltConnected`].
    fn alt_connect(&self) -> EngineResult<()>;

    /// Put one whole message through the alternate protocol.
    /// Completion: [`EngineEvent::AltPutDone`].
    fn alt_put(&self, data: &[u8]) -> EngineResult<()>;
}

// ============================================================================
// Events
// ============================================================================

/// Asynchronous completions and indications delivered by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A listening-service registration completed. `handle` is
    /// [`INVALID_ENGINE_HANDLE`] when the registration failed.
    ServerRegistered { service_name: String, handle: EngineHandle },

    /// A client registration completed. `handle` is
    /// [`INVALID_ENGINE_HANDLE`] when the registration failed.
    ClientRegistered { handle: EngineHandle },

    /// A peer requests a connection to a registered server.
    ConnRequested {
        server_handle: EngineHandle,
        conn_handle: EngineHandle,
        remote_miu: u16,
        remote_rw: u8,
    },

    /// An outbound connect completed. `client_handle` is the registration
    /// handle the connect was issued on.
    Connected {
        client_handle: EngineHandle,
        conn_handle: EngineHandle,
        remote_miu: u16,
        remote_rw: u8,
    },

    /// A connection was torn down, or, when `handle` is a client
    /// registration handle with a connect in flight, that connect failed.
    Disconnected { handle: EngineHandle },

    /// Data is available to read on a connection.
    DataReady { handle: EngineHandle },

    /// Congestion state of a connection changed.
    Congestion { handle: EngineHandle, congested: bool },

    /// The peer-to-peer link itself dropped; every connection is dead.
    LinkLost,

    /// The alternate protocol is available to the current peer.
    AltLinkUp { handle: EngineHandle },

    /// The alternate protocol is no longer available.
    AltLinkDown,

    /// Result of [`P2pEngine::alt_connect`].
    AltConnected { ok: bool },

    /// Result of [`P2pEngine::alt_put`].
    AltPutDone { ok: bool },

    /// A whole message arrived on the alternate protocol and should be
    /// replayed to the legacy push service.
    AltMessage { data: Vec<u8> },
}
