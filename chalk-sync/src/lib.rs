//! # chalk-sync — Real-time synchronization for collaborative whiteboards
//!
//! Reconciles concurrent, out-of-order stroke submissions from many clients
//! into one convergent canvas per whiteboard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Convergence │                     │ Coordinator │
//! │ Engine      │                     │ (registry)  │
//! │ (replica)   │                     └──────┬──────┘
//! └─────────────┘                            │ one actor per whiteboard
//!                                    ┌───────┴────────┐
//!                                    │WhiteboardActor │── OperationLog ── Persistence
//!                                    │ (single writer)│── ConvergenceEngine
//!                                    └────────────────┘
//! ```
//!
//! A stroke flows client → server → actor, which appends it to the
//! operation log, applies it to the authoritative engine, acknowledges the
//! author and broadcasts it with its LSN to every other session.
//!
//! ## Modules
//!
//! - [`stroke`] — Stroke model, validation and the merge order key
//! - [`clock`] — Vector clocks
//! - [`canvas`] — Ordered stroke set, deltas and digests
//! - [`spatial`] — Grid index over stroke bounds
//! - [`engine`] — Convergence engine (deterministic merge)
//! - [`oplog`] — Per-whiteboard operation log with gap-free LSNs
//! - [`storage`] — Snapshots and the durable log (RocksDB or in-memory)
//! - [`protocol`] — Versioned JSON wire protocol
//! - [`coordinator`] — Sessions, broadcast, catch-up and heartbeats
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with a local replica

pub mod canvas;
pub mod client;
pub mod clock;
pub mod coordinator;
pub mod engine;
pub mod membership;
pub mod oplog;
pub mod protocol;
pub mod server;
pub mod session;
pub mod spatial;
pub mod storage;
pub mod stroke;
mod whiteboard;

// Re-exports for convenience
pub use canvas::{CanvasDelta, CanvasState};
pub use client::{ClientConfig, ClientError, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use clock::{ClockOrdering, VectorClock};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorStats};
pub use engine::{ApplyOutcome, ConvergenceEngine, EngineError, EngineState};
pub use membership::{Membership, OpenMembership, StaticMembership};
pub use oplog::{LogEntry, Lsn, OperationLog};
pub use protocol::{ErrorKind, Message, ProtocolError, PROTOCOL_VERSION};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{Outbound, SessionHandle, SessionId};
pub use storage::{
    MemoryStore, Persistence, PersistenceError, RocksStore, Snapshot, StoreConfig,
    WhiteboardMetadata,
};
pub use stroke::{BoundingBox, Color, OrderKey, Point, Stroke, StrokeId, Tool, ValidationError};
pub use whiteboard::WhiteboardStatus;
