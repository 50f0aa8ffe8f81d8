//! # folio-broker: Document broker for a collaborative office server
//!
//! Sits between browser clients and rendering engines. Many clients may
//! view and edit the same document; each open document gets one broker that
//! owns the document's single engine, its tile cache and its save policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws   ┌──────────────┐        ┌──────────────────┐   ws   ┌────────┐
//! │ Client A │ ◄───► │              │        │  DocumentBroker  │ ◄────► │ Engine │
//! └──────────┘       │ DocumentServer│ ─────► │  ┌────────────┐  │        └────────┘
//! ┌──────────┐  ws   │  + Registry  │        │  │ TileCache  │  │
//! │ Client B │ ◄───► │              │        │  └────────────┘  │
//! └──────────┘       └──────────────┘        └────────┬─────────┘
//!                                                      │
//!                                               ┌──────▼──────┐
//!                                               │   Storage   │
//!                                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Text command grammar shared by clients and engines
//! - [`tile`]: Tile descriptors, batches and invalidation regions
//! - [`tile_cache`]: Rendered-tile cache with render coalescing
//! - [`session`]: Per-connection state and command gating
//! - [`engine`]: Engine channel, engine pool and a recording engine
//! - [`storage`]: Where documents live (local filesystem, in-memory)
//! - [`broker`]: One task per open document
//! - [`registry`]: Map from document to its running broker
//! - [`server`]: WebSocket listeners for clients and engines

pub mod broker;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod tile;
pub mod tile_cache;

// Re-exports for convenience
pub use broker::{
    BrokerConfig, BrokerError, BrokerEvent, BrokerHandle, BrokerStats, DocumentBroker,
    DocumentState,
};
pub use engine::{
    EngineChannel, EngineError, EngineMessage, EnginePool, EngineProvider, RecordingEngine,
};
pub use protocol::{ClientCommand, CommandClass, ProtocolError};
pub use registry::{DocKey, DocumentRegistry, RegistryError};
pub use server::{DocumentServer, ServerConfig, ServerError, ServerStats};
pub use session::{ClientSession, OutboundFrame, SessionId, SessionState, UserInfo};
pub use storage::{
    Credentials, FileInfo, LocalStorage, MemoryStorage, SaveResult, Storage, StorageError,
};
pub use tile::{InvalidateRegion, TileBatch, TileDesc, TileKey};
pub use tile_cache::TileCache;
