//! # Realtime Session Server Library
//!
//! A long-lived connection server: clients hold a WebSocket open and
//! exchange JSON envelopes `{"value": <code>, "args": {...}}` with it. The
//! integer code selects a handler; the handler runs only when the sender's
//! session is in one of the states the handler allows.
//!
//! ## Core Responsibilities
//!
//! ### Session Tracking
//! Every open connection gets a session holding an opaque logic state and,
//! after login, an identity. The registry keeps the identity binding unique:
//! at most one connection holds a given identity.
//!
//! ### State-Gated Dispatch
//! Providers register their routes into a static table at startup. Frames
//! that are empty, malformed, unknown or not permitted in the current state
//! are dropped without an answer.
//!
//! ### Ordered Delivery
//! Handlers never write to sockets. Outbound frames and close requests go
//! into one FIFO queue drained by a single task, so a notice queued before a
//! close always reaches the client first.
//!
//! ### Write-Back Persistence
//! Player records live in a cache in front of a durable store. Changes are
//! flushed periodically and once more at shutdown.
//!
//! ## Module Organization
//!
//! - [`registry`]: sessions, states and identity bindings
//! - [`dispatch`]: routes, providers and the dispatch table
//! - [`runtime`]: connection lifecycle and the handler API
//! - [`delivery`]: the outbound queue and the transport trait
//! - [`scheduler`]: delayed, periodic and per-session tasks
//! - [`cache`] and [`store`]: write-back cache and entity storage
//! - [`handlers`]: echo, login/heartbeat and player providers
//! - [`network`]: WebSocket transport and accept loop
//! - [`config`]: command line configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Config;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let table = server::default_table(&config)?;
//!
//!     // Runs provider init hooks, then accepts connections until Ctrl+C
//!     let server = Server::bind(&config, table).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod network;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;

use config::Config;
use dispatch::DispatchTable;
use error::ServerError;
use handlers::player::PlayerStore;
use handlers::{AuthProvider, EchoProvider, PlayerProvider};
use log::info;
use std::sync::Arc;
use store::{FileStore, MemoryStore};

/// Dispatch table with every bundled provider
///
/// Player records go to `data_dir` when one is configured and stay in
/// memory otherwise.
pub fn default_table(config: &Config) -> Result<DispatchTable, ServerError> {
    let store: PlayerStore = match &config.data_dir {
        Some(dir) => {
            info!("storing players in {}", dir.display());
            Box::new(FileStore::open(dir)?)
        }
        None => {
            info!("no data directory configured, players are kept in memory");
            Box::new(MemoryStore::new())
        }
    };

    let table = DispatchTable::builder()
        .provider(Arc::new(EchoProvider))?
        .provider(Arc::new(AuthProvider::new(
            config.secret.clone(),
            config.heartbeat(),
        )))?
        .provider(Arc::new(PlayerProvider::new(store, config.flush_interval())))?
        .build();
    Ok(table)
}
