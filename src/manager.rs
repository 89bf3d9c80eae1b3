//! Peer-to-peer connection manager
//!
//! [`PeerToPeer`] multiplexes an arbitrary number of listening services and
//! outbound connection attempts over the single asynchronous protocol
//! engine, and presents each one to callers as an independent, blocking,
//! thread-safe connection identified by a caller handle.
//!
//! ```text
//! caller threads                PeerToPeer                engine thread
//!   register/accept ──► look up / allocate record
//!   connect/send    ──► issue engine command
//!   receive/disconnect  park on the record's SyncEvent
//!                                   ▲
//!                                   │ record result fields, notify
//!                       on_engine_event ◄── callbacks by engine handle
//! ```
//!
//! Locking model: the server and client pools each sit behind their own
//! mutex, records are `Arc`-shared so no pool lock is ever held across a
//! wait, and each connection's events carry their own lock — a blocked send
//! on one connection never contends with a blocked receive on another. The
//! disconnect path additionally serializes on a process-wide teardown lock
//! because the engine's own disconnect callback can race an
//! application-initiated disconnect for the same connection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::P2pClient;
use crate::conn::P2pConnection;
use crate::engine::{
    well_known_sap, EngineEvent, EngineHandle, P2pEngine, Sap, SendOutcome,
    INVALID_ENGINE_HANDLE, LEGACY_PUSH_SERVICE_NAME, SAP_DYNAMIC,
};
use crate::error::{P2pError, Result};
use crate::frame;
use crate::pool::Pool;
use crate::server::{P2pServer, UNCLAIMED};

// ============================================================================
// Configuration
// ============================================================================

/// Caller handle value meaning "no active tunnel / no replay target".
/// Caller handles are allocated from 1, so 0 never names a record.
const NO_HANDLE: u32 = 0;

/// Pool sizes and default link parameters.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Maximum simultaneously registered listening services.
    pub max_servers: usize,
    /// Maximum simultaneous outbound connection attempts.
    pub max_clients: usize,
    /// Connection slots per server (simultaneous incoming connections).
    pub max_conns_per_server: usize,
    /// Maximum information unit offered when the caller does not specify one.
    pub default_miu: u16,
    /// Receive window offered when the caller does not specify one.
    pub default_rw: u8,
}

impl Default for P2pConfig {
    fn default() -> Self {
        P2pConfig {
            max_servers: 10,
            max_clients: 10,
            max_conns_per_server: 5,
            default_miu: 1980,
            default_rw: 2,
        }
    }
}

// ============================================================================
// Inbound tunnel replay
// ============================================================================

/// A whole message received over the alternate protocol, framed and waiting
/// to be replayed byte-for-byte to the legacy push service.
#[derive(Default)]
struct ReplayBuffer {
    /// Caller connection handle the replay is assigned to; [`NO_HANDLE`]
    /// while no accept has claimed it.
    target: u32,
    /// Framed message bytes.
    buf: Vec<u8>,
    /// Read position within `buf`.
    offset: usize,
}

impl ReplayBuffer {
    fn pending(&self) -> bool {
        !self.buf.is_empty()
    }

    fn load(&mut self, framed: Vec<u8>) {
        self.buf = framed;
        self.offset = 0;
        self.target = NO_HANDLE;
    }

    fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buf.len() - self.offset);
        out[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
        self.offset += n;
        n
    }

    fn is_drained(&self) -> bool {
        self.offset >= self.buf.len()
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.offset = 0;
        self.target = NO_HANDLE;
    }
}

/// Target of an outbound connect.
enum ConnectTarget<'a> {
    Name(&'a str),
    Sap(Sap),
}

// ============================================================================
// Manager
// ============================================================================

/// The connection manager. Explicitly constructed and shared (typically via
/// `Arc`) between caller threads and the engine's callback thread; every
/// method takes `&self` and is safe to call concurrently.
pub struct PeerToPeer {
    engine: Arc<dyn P2pEngine>,
    config: P2pConfig,

    servers: Mutex<Pool<Arc<P2pServer>>>,
    clients: Mutex<Pool<Arc<P2pClient>>>,

    /// Caller-handle allocator; dedicated lock, handles are never reused.
    next_handle: Mutex<u32>,
    /// Serializes application-initiated and engine-initiated teardown of
    /// the same connection.
    teardown: Mutex<()>,

    enabled: AtomicBool,
    listening: AtomicBool,

    /// Alternate-protocol session handle; invalid while the peer has not
    /// negotiated the alternate protocol.
    alt_link: AtomicU32,
    /// Caller handle of the single active outbound tunnel ([`NO_HANDLE`]
    /// when none).
    active_tunnel: Mutex<u32>,
    /// Inbound tunnel replay state.
    replay: Mutex<ReplayBuffer>,
}

impl PeerToPeer {
    /// Create a manager driving `engine`.
    pub fn new(engine: Arc<dyn P2pEngine>, config: P2pConfig) -> Self {
        PeerToPeer {
            engine,
            servers: Mutex::new(Pool::new(config.max_servers)),
            clients: Mutex::new(Pool::new(config.max_clients)),
            config,
            next_handle: Mutex::new(1),
            teardown: Mutex::new(()),
            enabled: AtomicBool::new(true),
            listening: AtomicBool::new(false),
            alt_link: AtomicU32::new(INVALID_ENGINE_HANDLE),
            active_tunnel: Mutex::new(NO_HANDLE),
            replay: Mutex::new(ReplayBuffer::default()),
        }
    }

    /// Allocate a fresh caller handle. Handles start at 1, increase
    /// monotonically, and are never reused for the life of the process.
    pub fn next_caller_handle(&self) -> u32 {
        let mut next = self.next_handle.lock();
        let handle = *next;
        *next += 1;
        handle
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    // ========================================================================
    // Server registration
    // ========================================================================

    /// Register a listening service. Blocks until the engine completes the
    /// registration. Re-registering an existing name is idempotent: the
    /// record is reused and its caller handle updated.
    pub fn register_server(&self, caller_handle: u32, service_name: &str) -> Result<()> {
        log::debug!("register_server: '{}' caller {}", service_name, caller_handle);
        if !self.enabled() {
            return Err(P2pError::Disabled);
        }

        let server = {
            let mut servers = self.servers.lock();
            if let Some(existing) = servers.find(|s| s.service_name() == service_name) {
                existing.set_caller_handle(caller_handle);
                log::info!(
                    "register_server: '{}' already registered, caller handle updated to {}",
                    service_name,
                    caller_handle
                );
                return Ok(());
            }
            let server = Arc::new(P2pServer::new(
                caller_handle,
                service_name,
                self.config.max_conns_per_server,
            ));
            servers
                .insert(Arc::clone(&server))
                .map_err(|_| P2pError::PoolExhausted("server"))?;
            server
        };

        let sap = well_known_sap(service_name).unwrap_or(SAP_DYNAMIC);
        let mut guard = server.registration.start();
        if let Err(err) = self.engine.register_server(sap, service_name) {
            drop(guard);
            self.remove_server(&server);
            return Err(err.into());
        }
        guard.wait();
        drop(guard);

        if server.engine_handle() == INVALID_ENGINE_HANDLE {
            log::warn!("register_server: engine failed registration of '{}'", service_name);
            self.remove_server(&server);
            return Err(P2pError::Failed);
        }
        log::info!(
            "register_server: '{}' registered, engine handle {:#x}",
            service_name,
            server.engine_handle()
        );
        Ok(())
    }

    /// Deregister a listening service, releasing every connection slot and
    /// waking any thread blocked waiting for a connection request.
    pub fn deregister_server(&self, server_handle: u32) -> Result<()> {
        let server = self
            .find_server_by_caller(server_handle)
            .ok_or(P2pError::UnknownHandle(server_handle))?;
        log::info!("deregister_server: '{}'", server.service_name());

        for conn in server.connections() {
            if conn.is_established() {
                if let Err(err) = self.engine.disconnect(conn.engine_handle()) {
                    log::warn!(
                        "deregister_server: disconnect of conn {} failed: {}",
                        conn.caller_handle(),
                        err
                    );
                }
            }
            conn.invalidate();
            conn.wake_all();
        }
        server.clear_slots();
        server.conn_request.notify_all();

        if server.engine_handle() != INVALID_ENGINE_HANDLE {
            if let Err(err) = self.engine.deregister_server(server.engine_handle()) {
                log::warn!("deregister_server: engine deregister failed: {}", err);
            }
        }
        server.invalidate();
        self.remove_server(&server);
        Ok(())
    }

    // ========================================================================
    // Accept
    // ========================================================================

    /// Accept one incoming connection on a registered server. Blocks until
    /// a connection request arrives, then issues the engine accept with the
    /// caller's flow-control parameters. Fails immediately when all of the
    /// server's connection slots are busy.
    pub fn accept(&self, server_handle: u32, conn_handle: u32, miu: u16, rw: u8) -> Result<()> {
        let server = self
            .find_server_by_caller(server_handle)
            .ok_or(P2pError::UnknownHandle(server_handle))?;
        log::debug!(
            "accept: server '{}' conn {} miu {} rw {}",
            server.service_name(),
            conn_handle,
            miu,
            rw
        );

        // A connection request may have arrived before anyone was accepting.
        if let Some(conn) = server.claim_unclaimed(conn_handle) {
            return self.issue_accept(&server, &conn, miu, rw);
        }

        let conn = server.allocate_slot(conn_handle, miu, rw)?;
        let mut guard = server.conn_request.start();
        loop {
            // A tunneled push replay claims the accept instead of a real
            // connection: free the slot and redirect the replay target.
            if server.service_name() == LEGACY_PUSH_SERVICE_NAME {
                let mut replay = self.replay.lock();
                if replay.pending() && replay.target == NO_HANDLE {
                    replay.target = conn_handle;
                    drop(replay);
                    drop(guard);
                    server.remove_by_caller(conn_handle);
                    log::info!("accept: conn {} redirected to tunneled push replay", conn_handle);
                    return Ok(());
                }
            }
            if conn.is_established() {
                break;
            }
            if !self.enabled() {
                drop(guard);
                server.remove_by_caller(conn_handle);
                return Err(P2pError::Disabled);
            }
            if server.find_by_caller(conn_handle).is_none() {
                // Slot swept by a concurrent deregistration.
                return Err(P2pError::Failed);
            }
            guard.wait();
        }
        drop(guard);
        self.issue_accept(&server, &conn, miu, rw)
    }

    fn issue_accept(
        &self,
        server: &Arc<P2pServer>,
        conn: &Arc<P2pConnection>,
        miu: u16,
        rw: u8,
    ) -> Result<()> {
        if !conn.is_established() {
            server.remove_by_caller(conn.caller_handle());
            return Err(P2pError::Failed);
        }
        if let Err(err) = self.engine.accept(conn.engine_handle(), miu, rw) {
            log::warn!("accept: engine rejected accept of conn {}: {}", conn.caller_handle(), err);
            server.remove_by_caller(conn.caller_handle());
            conn.invalidate();
            return Err(err.into());
        }
        log::info!(
            "accept: conn {} established, engine handle {:#x} remote miu {} rw {}",
            conn.caller_handle(),
            conn.engine_handle(),
            conn.remote_miu(),
            conn.remote_rw()
        );
        Ok(())
    }

    // ========================================================================
    // Outbound connect
    // ========================================================================

    /// Create an outbound client. Blocks until the engine completes the
    /// client registration; on failure the record is freed.
    pub fn create_client(&self, conn_handle: u32, miu: u16, rw: u8) -> Result<()> {
        log::debug!("create_client: conn {} miu {} rw {}", conn_handle, miu, rw);
        if !self.enabled() {
            return Err(P2pError::Disabled);
        }

        let client = Arc::new(P2pClient::new(conn_handle, miu, rw));
        self.clients
            .lock()
            .insert(Arc::clone(&client))
            .map_err(|_| P2pError::PoolExhausted("client"))?;

        let mut guard = client.registration.start();
        if let Err(err) = self.engine.register_client() {
            drop(guard);
            self.remove_client(conn_handle);
            return Err(err.into());
        }
        guard.wait();
        drop(guard);

        if !client.is_registered() {
            log::warn!("create_client: engine failed registration of conn {}", conn_handle);
            self.remove_client(conn_handle);
            return Err(P2pError::Failed);
        }
        log::info!(
            "create_client: conn {} registered, engine handle {:#x}",
            conn_handle,
            client.engine_handle()
        );
        Ok(())
    }

    /// Connect a created client to a service by name. Blocks until the
    /// engine reports the link established or failed; on failure the client
    /// record is removed. A connect to the legacy push service is tunneled
    /// through the alternate protocol when the peer supports it.
    pub fn connect_by_name(&self, conn_handle: u32, service_name: &str) -> Result<()> {
        self.connect(conn_handle, ConnectTarget::Name(service_name))
    }

    /// Connect a created client to a service access point.
    pub fn connect_by_sap(&self, conn_handle: u32, sap: Sap) -> Result<()> {
        self.connect(conn_handle, ConnectTarget::Sap(sap))
    }

    fn connect(&self, conn_handle: u32, target: ConnectTarget<'_>) -> Result<()> {
        let client = self
            .find_client_by_caller(conn_handle)
            .ok_or(P2pError::UnknownHandle(conn_handle))?;

        if let ConnectTarget::Name(name) = &target {
            log::debug!("connect: conn {} to '{}'", conn_handle, name);
            let alt_available = self.alt_link.load(Ordering::Acquire) != INVALID_ENGINE_HANDLE;
            if *name == LEGACY_PUSH_SERVICE_NAME && alt_available {
                match self.connect_tunnel(&client, conn_handle) {
                    Ok(()) => return Ok(()),
                    Err(P2pError::TunnelBusy) => return Err(P2pError::TunnelBusy),
                    Err(err) => {
                        log::warn!(
                            "connect: tunnel attempt for conn {} failed ({}), using native connect",
                            conn_handle,
                            err
                        );
                    }
                }
            }
        }

        if !client.is_registered() {
            return Err(P2pError::Failed);
        }
        client.set_connecting(true);
        let mut guard = client.connected.start();
        let issued = match &target {
            ConnectTarget::Name(name) => self.engine.connect_by_name(
                client.engine_handle(),
                name,
                client.conn.local_miu(),
                client.conn.local_rw(),
            ),
            ConnectTarget::Sap(sap) => self.engine.connect_by_sap(
                client.engine_handle(),
                *sap,
                client.conn.local_miu(),
                client.conn.local_rw(),
            ),
        };
        if let Err(err) = issued {
            drop(guard);
            client.set_connecting(false);
            self.remove_client(conn_handle);
            return Err(err.into());
        }

        loop {
            if client.conn.is_established() {
                break;
            }
            if !self.enabled() {
                drop(guard);
                self.remove_client(conn_handle);
                return Err(P2pError::Disabled);
            }
            if !client.is_connecting() {
                drop(guard);
                self.remove_client(conn_handle);
                log::warn!("connect: conn {} failed", conn_handle);
                return Err(P2pError::Failed);
            }
            guard.wait();
        }
        drop(guard);
        client.set_connecting(false);
        log::info!(
            "connect: conn {} established, engine handle {:#x} remote miu {} rw {}",
            conn_handle,
            client.conn.engine_handle(),
            client.conn.remote_miu(),
            client.conn.remote_rw()
        );
        Ok(())
    }

    /// Open the alternate-protocol tunnel for a legacy push connect. At
    /// most one tunnel may be active process-wide; a second attempt fails
    /// outright rather than disturbing the first tunnel's buffer.
    fn connect_tunnel(&self, client: &Arc<P2pClient>, conn_handle: u32) -> Result<()> {
        {
            let mut active = self.active_tunnel.lock();
            if *active != NO_HANDLE {
                log::warn!(
                    "connect: tunnel busy (conn {} active), rejecting conn {}",
                    *active,
                    conn_handle
                );
                return Err(P2pError::TunnelBusy);
            }
            *active = conn_handle;
        }

        client.set_tunnel_ok(false);
        let mut guard = client.tunnel_event.start();
        if let Err(err) = self.engine.alt_connect() {
            drop(guard);
            *self.active_tunnel.lock() = NO_HANDLE;
            return Err(err.into());
        }
        guard.wait();
        drop(guard);

        if !client.tunnel_ok() {
            *self.active_tunnel.lock() = NO_HANDLE;
            return Err(P2pError::Failed);
        }
        log::info!("connect: conn {} tunneled through alternate protocol", conn_handle);
        Ok(())
    }

    // ========================================================================
    // Send / receive / disconnect
    // ========================================================================

    /// Send data on an established connection. Congestion is waited out and
    /// the send retried; the operation fails without retrying once the
    /// connection is invalidated.
    pub fn send(&self, conn_handle: u32, data: &[u8]) -> Result<()> {
        if *self.active_tunnel.lock() == conn_handle {
            return self.send_tunnel(conn_handle, data);
        }

        let conn = self
            .find_connection(conn_handle)
            .ok_or(P2pError::UnknownHandle(conn_handle))?;
        let mut guard = conn.congestion.start();
        loop {
            let handle = conn.engine_handle();
            if handle == INVALID_ENGINE_HANDLE {
                return Err(P2pError::NotConnected);
            }
            match self.engine.send(handle, data) {
                Ok(SendOutcome::Sent) => {
                    log::trace!("send: {} bytes on conn {}", data.len(), conn_handle);
                    return Ok(());
                }
                Ok(SendOutcome::Congested) => {
                    log::debug!("send: conn {} congested, waiting", conn_handle);
                    guard.wait();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Tunnel one legacy push frame: accumulate payload until the total
    /// advertised by the frame header is reached, then put the whole
    /// message through the alternate protocol and wait for completion.
    fn send_tunnel(&self, conn_handle: u32, data: &[u8]) -> Result<()> {
        let client = self
            .find_client_by_caller(conn_handle)
            .ok_or(P2pError::UnknownHandle(conn_handle))?;

        let message = {
            let mut tunnel = client.tunnel_buf.lock();
            if tunnel.expected == 0 {
                let payload_len = frame::parse_header(data)?;
                tunnel.expected = payload_len as usize;
                tunnel.buf.clear();
                tunnel.buf.extend_from_slice(&data[frame::HEADER_LEN..]);
            } else {
                tunnel.buf.extend_from_slice(data);
            }
            if tunnel.buf.len() > tunnel.expected {
                tunnel.reset();
                return Err(P2pError::BadFrame(frame::FrameError::LengthMismatch));
            }
            if tunnel.buf.len() < tunnel.expected {
                log::trace!(
                    "send: tunnel conn {} accumulated {}/{} bytes",
                    conn_handle,
                    tunnel.buf.len(),
                    tunnel.expected
                );
                return Ok(());
            }
            tunnel.expected = 0;
            std::mem::take(&mut tunnel.buf)
        };

        log::debug!("send: tunnel conn {} putting {} bytes", conn_handle, message.len());
        client.set_tunnel_ok(false);
        let mut guard = client.tunnel_event.start();
        self.engine.alt_put(&message)?;
        guard.wait();
        drop(guard);

        if client.tunnel_ok() {
            Ok(())
        } else {
            Err(P2pError::Failed)
        }
    }

    /// Receive available data on a connection, blocking until at least one
    /// byte arrives. Zero-length engine reads are not end-of-data; the wait
    /// resumes. Fails once the connection is invalidated.
    pub fn receive(&self, conn_handle: u32, buf: &mut [u8]) -> Result<usize> {
        {
            let mut replay = self.replay.lock();
            if replay.target != NO_HANDLE && replay.target == conn_handle {
                let n = replay.drain_into(buf);
                if replay.is_drained() {
                    log::info!("receive: tunneled push replay to conn {} complete", conn_handle);
                    replay.reset();
                }
                return Ok(n);
            }
        }

        let conn = self
            .find_connection(conn_handle)
            .ok_or(P2pError::UnknownHandle(conn_handle))?;
        let mut guard = conn.data_ready.start();
        loop {
            let handle = conn.engine_handle();
            if handle == INVALID_ENGINE_HANDLE {
                return Err(P2pError::NotConnected);
            }
            let n = self.engine.read(handle, buf)?;
            if n > 0 {
                log::trace!("receive: {} bytes on conn {}", n, conn_handle);
                return Ok(n);
            }
            guard.wait();
        }
    }

    /// Disconnect a connection. Threads blocked in `send` or `receive` on
    /// the same connection are woken first so they cannot deadlock; the
    /// record is then removed under the teardown lock. Disconnecting a
    /// handle that is already torn down is a no-op.
    pub fn disconnect(&self, conn_handle: u32) -> Result<()> {
        let Some(conn) = self.find_connection(conn_handle) else {
            log::debug!("disconnect: conn {} already torn down", conn_handle);
            return Ok(());
        };
        log::info!("disconnect: conn {}", conn_handle);

        // Unblock senders and receivers before any teardown command;
        // otherwise a thread parked on congestion or data-ready would wait
        // forever for an event that can no longer arrive.
        conn.congestion.notify_all();
        conn.data_ready.notify_all();

        if conn.is_established() {
            let mut guard = conn.disconnected.start();
            match self.engine.disconnect(conn.engine_handle()) {
                Ok(()) => {
                    while conn.is_established() && self.enabled() {
                        guard.wait();
                    }
                }
                Err(err) => {
                    log::warn!("disconnect: engine disconnect of conn {} failed: {}", conn_handle, err);
                    // Senders woken earlier may have re-parked by now; wake
                    // them again after invalidation so they observe it.
                    conn.invalidate();
                    conn.wake_all();
                }
            }
        }

        let _teardown = self.teardown.lock();
        self.remove_connection_record(conn_handle);
        Ok(())
    }

    // ========================================================================
    // Link parameters
    // ========================================================================

    /// Peer's negotiated maximum information unit for a connection.
    pub fn remote_miu(&self, conn_handle: u32) -> Result<u16> {
        let conn = self
            .find_connection(conn_handle)
            .ok_or(P2pError::UnknownHandle(conn_handle))?;
        Ok(conn.remote_miu())
    }

    /// Peer's negotiated receive window for a connection.
    pub fn remote_rw(&self, conn_handle: u32) -> Result<u8> {
        let conn = self
            .find_connection(conn_handle)
            .ok_or(P2pError::UnknownHandle(conn_handle))?;
        Ok(conn.remote_rw())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Enable or disable peer-to-peer listen mode.
    pub fn set_listening(&self, enabled: bool) -> Result<()> {
        self.engine.set_listen_enabled(enabled)?;
        self.listening.store(enabled, Ordering::Release);
        log::info!("set_listening: {}", enabled);
        Ok(())
    }

    /// Whether listen mode is currently enabled.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Global NFC on/off hook. Enabling resets the pools; disabling
    /// invalidates every record and signals every event a blocked thread
    /// could be parked on, so all waits fail promptly instead of hanging
    /// while the engine is torn down.
    pub fn handle_nfc_on_off(&self, is_on: bool) {
        log::info!("handle_nfc_on_off: {}", if is_on { "on" } else { "off" });
        if is_on {
            self.servers.lock().clear();
            self.clients.lock().clear();
            self.alt_link.store(INVALID_ENGINE_HANDLE, Ordering::Release);
            *self.active_tunnel.lock() = NO_HANDLE;
            self.replay.lock().reset();
            self.enabled.store(true, Ordering::Release);
            return;
        }

        self.enabled.store(false, Ordering::Release);
        self.alt_link.store(INVALID_ENGINE_HANDLE, Ordering::Release);

        let servers: Vec<_> = self.servers.lock().iter().cloned().collect();
        for server in servers {
            server.invalidate();
            for conn in server.connections() {
                conn.invalidate();
                conn.wake_all();
            }
            server.registration.notify_all();
            server.conn_request.notify_all();
        }

        let clients: Vec<_> = self.clients.lock().iter().cloned().collect();
        for client in clients {
            client.invalidate();
            client.set_connecting(false);
            client.conn.invalidate();
            client.wake_all();
        }

        *self.active_tunnel.lock() = NO_HANDLE;
        self.replay.lock().reset();
    }

    // ========================================================================
    // Engine event routing
    // ========================================================================

    /// Entry point for the engine's callback thread. Routes each event to
    /// the record it belongs to, records result fields, and notifies the
    /// record's event so the blocked caller wakes and re-checks its state.
    pub fn on_engine_event(&self, event: EngineEvent) {
        log::trace!("engine event: {:?}", event);
        match event {
            EngineEvent::ServerRegistered { service_name, handle } => {
                self.on_server_registered(&service_name, handle)
            }
            EngineEvent::ClientRegistered { handle } => self.on_client_registered(handle),
            EngineEvent::ConnRequested { server_handle, conn_handle, remote_miu, remote_rw } => {
                self.on_conn_requested(server_handle, conn_handle, remote_miu, remote_rw)
            }
            EngineEvent::Connected { client_handle, conn_handle, remote_miu, remote_rw } => {
                self.on_connected(client_handle, conn_handle, remote_miu, remote_rw)
            }
            EngineEvent::Disconnected { handle } => self.on_disconnected(handle),
            EngineEvent::DataReady { handle } => {
                if let Some(conn) = self.find_connection_by_engine(handle) {
                    conn.data_ready.notify_all();
                }
            }
            EngineEvent::Congestion { handle, congested } => {
                if !congested {
                    if let Some(conn) = self.find_connection_by_engine(handle) {
                        log::debug!("congestion cleared on conn {}", conn.caller_handle());
                        conn.congestion.notify_all();
                    }
                }
            }
            EngineEvent::LinkLost => self.on_link_lost(),
            EngineEvent::AltLinkUp { handle } => {
                log::info!("alternate protocol available, handle {:#x}", handle);
                self.alt_link.store(handle, Ordering::Release);
            }
            EngineEvent::AltLinkDown => {
                log::info!("alternate protocol unavailable");
                self.alt_link.store(INVALID_ENGINE_HANDLE, Ordering::Release);
                self.on_alt_result(false);
            }
            EngineEvent::AltConnected { ok } => self.on_alt_result(ok),
            EngineEvent::AltPutDone { ok } => self.on_alt_result(ok),
            EngineEvent::AltMessage { data } => self.on_alt_message(data),
        }
    }

    fn on_server_registered(&self, service_name: &str, handle: EngineHandle) {
        let Some(server) = self.find_server_by_name(service_name) else {
            log::warn!("registration completed for unknown service '{}'", service_name);
            return;
        };
        server.set_engine_handle(handle);
        server.registration.notify_all();
    }

    fn on_client_registered(&self, handle: EngineHandle) {
        let clients: Vec<_> = self.clients.lock().iter().cloned().collect();
        let Some(client) = clients.into_iter().find(|c| !c.is_registered()) else {
            log::warn!("client registration completed with no client pending");
            return;
        };
        if handle != INVALID_ENGINE_HANDLE {
            client.set_engine_handle(handle);
        }
        client.registration.notify_all();
    }

    fn on_conn_requested(
        &self,
        server_handle: EngineHandle,
        conn_handle: EngineHandle,
        remote_miu: u16,
        remote_rw: u8,
    ) {
        let Some(server) = self.find_server_by_engine(server_handle) else {
            log::warn!("connection request for unknown server handle {:#x}", server_handle);
            return;
        };
        if let Some(conn) = server.find_pending_slot() {
            conn.set_remote_params(remote_miu, remote_rw);
            conn.set_engine_handle(conn_handle);
            log::debug!(
                "connection request on '{}' fills pending conn {}",
                server.service_name(),
                conn.caller_handle()
            );
        } else {
            // Nobody accepting yet; park the request so a later accept can
            // claim it.
            let conn = Arc::new(P2pConnection::new(
                UNCLAIMED,
                self.config.default_miu,
                self.config.default_rw,
            ));
            conn.set_remote_params(remote_miu, remote_rw);
            conn.set_engine_handle(conn_handle);
            if server.store_unclaimed(conn).is_err() {
                log::warn!(
                    "connection request dropped: no free slot on '{}'",
                    server.service_name()
                );
                return;
            }
        }
        server.conn_request.notify_all();
    }

    fn on_connected(
        &self,
        client_handle: EngineHandle,
        conn_handle: EngineHandle,
        remote_miu: u16,
        remote_rw: u8,
    ) {
        let Some(client) = self.find_client_by_engine(client_handle) else {
            log::warn!("connect completed for unknown client handle {:#x}", client_handle);
            return;
        };
        client.conn.set_remote_params(remote_miu, remote_rw);
        client.conn.set_engine_handle(conn_handle);
        client.connected.notify_all();
    }

    fn on_disconnected(&self, handle: EngineHandle) {
        // A disconnect on a client registration handle is a failed connect.
        if let Some(client) = self.find_client_by_engine(handle) {
            if client.is_connecting() {
                log::debug!("connect failed for conn {}", client.conn.caller_handle());
                client.set_connecting(false);
                client.connected.notify_all();
            }
            return;
        }

        let Some(conn) = self.find_connection_by_engine(handle) else {
            log::debug!("disconnect event for unknown engine handle {:#x}", handle);
            return;
        };
        let caller_handle = conn.caller_handle();
        log::info!("engine disconnected conn {}", caller_handle);
        conn.invalidate();
        conn.wake_all();

        // Engine-initiated teardown races an application disconnect for the
        // same connection; whichever removes second finds nothing to do.
        let _teardown = self.teardown.lock();
        self.remove_connection_record(caller_handle);
    }

    fn on_link_lost(&self) {
        log::warn!("peer-to-peer link lost, invalidating all connections");
        self.alt_link.store(INVALID_ENGINE_HANDLE, Ordering::Release);

        let servers: Vec<_> = self.servers.lock().iter().cloned().collect();
        for server in servers {
            for conn in server.connections() {
                conn.invalidate();
                conn.wake_all();
            }
            server.conn_request.notify_all();
        }
        let clients: Vec<_> = self.clients.lock().iter().cloned().collect();
        for client in clients {
            client.set_connecting(false);
            client.conn.invalidate();
            client.wake_all();
        }
        *self.active_tunnel.lock() = NO_HANDLE;
        self.replay.lock().reset();
    }

    fn on_alt_result(&self, ok: bool) {
        let target = *self.active_tunnel.lock();
        if target == NO_HANDLE {
            return;
        }
        let Some(client) = self.find_client_by_caller(target) else {
            log::warn!("alternate-protocol completion for unknown conn {}", target);
            return;
        };
        client.set_tunnel_ok(ok);
        client.tunnel_event.notify_all();
    }

    fn on_alt_message(&self, data: Vec<u8>) {
        let Some(server) = self.find_server_by_name(LEGACY_PUSH_SERVICE_NAME) else {
            log::warn!("dropping tunneled push: no legacy push service registered");
            return;
        };
        {
            let mut replay = self.replay.lock();
            if replay.pending() {
                log::warn!("dropping tunneled push: replay buffer busy");
                return;
            }
            log::info!("tunneled push of {} bytes queued for replay", data.len());
            replay.load(frame::encode_frame(&data));
        }
        server.conn_request.notify_all();
    }

    // ========================================================================
    // Lookup helpers
    // ========================================================================

    fn find_server_by_name(&self, service_name: &str) -> Option<Arc<P2pServer>> {
        self.servers.lock().find(|s| s.service_name() == service_name).cloned()
    }

    fn find_server_by_caller(&self, server_handle: u32) -> Option<Arc<P2pServer>> {
        self.servers.lock().find(|s| s.caller_handle() == server_handle).cloned()
    }

    fn find_server_by_engine(&self, handle: EngineHandle) -> Option<Arc<P2pServer>> {
        if handle == INVALID_ENGINE_HANDLE {
            return None;
        }
        self.servers.lock().find(|s| s.engine_handle() == handle).cloned()
    }

    fn find_client_by_caller(&self, conn_handle: u32) -> Option<Arc<P2pClient>> {
        self.clients.lock().find(|c| c.conn.caller_handle() == conn_handle).cloned()
    }

    fn find_client_by_engine(&self, handle: EngineHandle) -> Option<Arc<P2pClient>> {
        if handle == INVALID_ENGINE_HANDLE {
            return None;
        }
        self.clients.lock().find(|c| c.engine_handle() == handle).cloned()
    }

    /// Find a connection record by caller handle across server slots and
    /// clients.
    fn find_connection(&self, conn_handle: u32) -> Option<Arc<P2pConnection>> {
        let servers: Vec<_> = self.servers.lock().iter().cloned().collect();
        for server in servers {
            if let Some(conn) = server.find_by_caller(conn_handle) {
                return Some(conn);
            }
        }
        self.find_client_by_caller(conn_handle).map(|client| Arc::clone(&client.conn))
    }

    fn find_connection_by_engine(&self, handle: EngineHandle) -> Option<Arc<P2pConnection>> {
        if handle == INVALID_ENGINE_HANDLE {
            return None;
        }
        let servers: Vec<_> = self.servers.lock().iter().cloned().collect();
        for server in servers {
            if let Some(conn) = server.find_by_engine(handle) {
                return Some(conn);
            }
        }
        let clients: Vec<_> = self.clients.lock().iter().cloned().collect();
        clients
            .into_iter()
            .find(|c| c.conn.engine_handle() == handle)
            .map(|client| Arc::clone(&client.conn))
    }

    fn remove_server(&self, server: &Arc<P2pServer>) {
        self.servers.lock().remove_where(|s| Arc::ptr_eq(s, server));
    }

    fn remove_client(&self, conn_handle: u32) {
        self.clients.lock().remove_where(|c| c.conn.caller_handle() == conn_handle);
    }

    /// Remove the record owning `conn_handle` from its server or the client
    /// pool, and clear any tunnel state bound to it. Idempotent.
    fn remove_connection_record(&self, conn_handle: u32) {
        let servers: Vec<_> = self.servers.lock().iter().cloned().collect();
        let mut removed = false;
        for server in servers {
            if server.remove_by_caller(conn_handle).is_some() {
                removed = true;
                break;
            }
        }
        if !removed {
            self.remove_client(conn_handle);
        }

        {
            let mut active = self.active_tunnel.lock();
            if *active == conn_handle {
                *active = NO_HANDLE;
            }
        }
        {
            let mut replay = self.replay.lock();
            if replay.target == conn_handle {
                replay.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_buffer_drain() {
        let mut replay = ReplayBuffer::default();
        replay.load(vec![1, 2, 3, 4, 5]);
        replay.target = 9;

        let mut out = [0u8; 3];
        assert_eq!(replay.drain_into(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert!(!replay.is_drained());

        let mut out = [0u8; 8];
        assert_eq!(replay.drain_into(&mut out), 2);
        assert_eq!(&out[..2], &[4, 5]);
        assert!(replay.is_drained());

        replay.reset();
        assert!(!replay.pending());
        assert_eq!(replay.target, NO_HANDLE);
    }

    #[test]
    fn test_caller_handles_monotonic() {
        struct NullEngine;
        impl P2pEngine for NullEngine {
            fn set_listen_enabled(&self, _: bool) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn register_server(&self, _: Sap, _: &str) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn deregister_server(&self, _: EngineHandle) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn register_client(&self) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn connect_by_name(
                &self,
                _: EngineHandle,
                _: &str,
                _: u16,
                _: u8,
            ) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn connect_by_sap(
                &self,
                _: EngineHandle,
                _: Sap,
                _: u16,
                _: u8,
            ) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn accept(&self, _: EngineHandle, _: u16, _: u8) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn send(
                &self,
                _: EngineHandle,
                _: &[u8],
            ) -> crate::engine::EngineResult<SendOutcome> {
                Ok(SendOutcome::Sent)
            }
            fn read(&self, _: EngineHandle, _: &mut [u8]) -> crate::engine::EngineResult<usize> {
                Ok(0)
            }
            fn disconnect(&self, _: EngineHandle) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn alt_connect(&self) -> crate::engine::EngineResult<()> {
                Ok(())
            }
            fn alt_put(&self, _: &[u8]) -> crate::engine::EngineResult<()> {
                Ok(())
            }
        }

        let manager = Arc::new(PeerToPeer::new(Arc::new(NullEngine), P2pConfig::default()));
        let mut handles = vec![];
        let mut workers = vec![];
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            workers.push(std::thread::spawn(move || {
                (0..100).map(|_| manager.next_caller_handle()).collect::<Vec<_>>()
            }));
        }
        for worker in workers {
            handles.extend(worker.join().unwrap());
        }
        let count = handles.len();
        handles.sort_unstable();
        handles.dedup();
        // No two allocations ever share a handle, and 0 is never issued.
        assert_eq!(handles.len(), count);
        assert!(!handles.contains(&0));
    }
}
