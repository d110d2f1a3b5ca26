//! `ide-mcp-bridge`: a loopback WebSocket MCP endpoint for local
//! tool-automation clients.
//!
//! This crate is the protocol core only (spec.md §1): the TCP listener, the
//! WebSocket handshake and frame codec, the per-client connection state
//! machine, the JSON-RPC dispatcher (with support for deferred, long-running
//! tool responses) and the keepalive supervisor. Host-editor integration —
//! the tool implementations themselves, configuration loading, the outer
//! process lifecycle — is injected by the embedder through [`ToolRegistry`]
//! and [`Callbacks`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ide_mcp_bridge::{Callbacks, EmptyToolRegistry, ServerConfig};
//!
//! # async fn run() -> ide_mcp_bridge::Result<()> {
//! let handle = ide_mcp_bridge::start(
//!     ServerConfig::default(),
//!     Arc::new(EmptyToolRegistry),
//!     Callbacks::default(),
//! )
//! .await?;
//! println!("listening on port {}", handle.port());
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

mod clock;
mod connection;
mod dispatcher;
mod error;
mod frame;
mod handshake;
mod ids;
mod keepalive;
mod registry;
mod server;

pub use clock::{Clock, FakeClock, SystemClock};
pub use connection::{ClientState, ConnectionEvent};
pub use dispatcher::{DispatchOutcome, JsonRpcError, JsonRpcId};
pub use error::{Error, Result};
pub use ids::ClientId;
pub use registry::{DeferredCompletion, DeferredSink, EmptyToolRegistry, HandlerOutcome, ToolCall, ToolDescriptor, ToolRegistry};
pub use server::{start, start_with_clock, Callbacks, ServerConfig, ServerHandle};
