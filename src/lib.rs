//! NFC peer-to-peer connection management
//!
//! This crate multiplexes listening services and outbound connection
//! attempts over a single asynchronous, callback-driven LLCP protocol
//! engine, and presents each connection to callers as an independent,
//! blocking, thread-safe object supporting connect, accept, send, receive
//! and disconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Module Structure                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  sync.rs     - SyncEvent: callback-to-blocking-call bridging   │
//! │  pool.rs     - fixed-capacity slot arenas                      │
//! │  frame.rs    - legacy push-frame codec                         │
//! │  engine.rs   - protocol-engine commands and events             │
//! │  error.rs    - caller-facing error taxonomy                    │
//! │  conn.rs     - per-connection record                           │
//! │  server.rs   - listening-service endpoint                      │
//! │  client.rs   - outbound-connection endpoint                    │
//! │  manager.rs  - PeerToPeer: pools, handles, event routing       │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Caller threads invoke blocking operations on [`PeerToPeer`]; the engine
//! delivers completions on its own thread through
//! [`PeerToPeer::on_engine_event`], which records result fields on the
//! right record and wakes the blocked caller. The LLCP/SNEP protocol
//! itself lives in the external engine behind the [`P2pEngine`] trait.

pub mod client;
pub mod conn;
pub mod engine;
pub mod error;
pub mod frame;
pub mod manager;
pub mod pool;
pub mod server;
pub mod sync;

pub use engine::{
    well_known_sap, EngineError, EngineEvent, EngineHandle, EngineResult, P2pEngine, Sap,
    SendOutcome, INVALID_ENGINE_HANDLE, LEGACY_PUSH_SERVICE_NAME, SAP_DYNAMIC, SAP_SDP, SAP_SNEP,
    SDP_SERVICE_NAME, SNEP_SERVICE_NAME,
};
pub use error::{P2pError, Result};
pub use manager::{P2pConfig, PeerToPeer};
pub use sync::{SyncEvent, SyncEventGuard};
