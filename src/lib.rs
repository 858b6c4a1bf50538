//! # Sockudo-Negotiator: WebSocket upgrade negotiation
//!
//! The decision step of a WebSocket server: given an upgrade request, accept
//! or reject it, select a subprotocol and extensions, produce the frame
//! handler for the connection, and fix the session limits before the first
//! frame is exchanged.
//!
//! ## Pieces
//!
//! - [`Negotiation`]: per-request context with write-once decisions
//! - [`WebSocketNegotiator`]: the pluggable policy, returning a tagged
//!   [`Negotiated`] result instead of a nullable handler
//! - [`ExtensionRegistry`]: extension factories consulted during negotiation
//! - [`SessionLimits`] / [`CoreSession`]: limits applied by `customize`
//! - [`handshake`] / [`server`]: HTTP/1.1 boundary on Tokio
//!
//! ## Example
//!
//! ```ignore
//! use sockudo_negotiator::prelude::*;
//! use sockudo_negotiator::server::WebSocketServer;
//!
//! let negotiator = DefaultNegotiator::new(|_: &Negotiation| EchoHandler::default())
//!     .subprotocols(["chat"])
//!     .limits(SessionLimits::builder().max_frame_size(128 * 1024).build()?);
//!
//! let server = WebSocketServer::new(negotiator, Config::default());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9001").await?;
//! server.serve(listener, |stream, upgraded| async move {
//!     // hand `stream` and `upgraded.handler` to the frame loop
//! }).await?;
//! ```

use std::time::Duration;

pub mod error;
pub mod extension;
pub mod handshake;
pub mod headers;
pub mod negotiation;
pub mod negotiator;
pub mod pool;
pub mod session;

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

#[cfg(feature = "tokio-runtime")]
pub mod server;

pub use error::{Error, Rejection, Result};
pub use extension::{Extension, ExtensionConfig, ExtensionFactory, ExtensionRegistry};
pub use headers::HeaderMap;
pub use negotiation::Negotiation;
pub use negotiator::{DefaultNegotiator, Negotiated, Outcome, WebSocketNegotiator};
pub use pool::BufferPool;
pub use session::{CoreSession, Frame, FrameHandler, OpCode, SessionLimits};

#[cfg(feature = "permessage-deflate")]
pub use deflate::{DeflateConfig, PerMessageDeflateFactory};

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum HTTP request head size (8KB should be enough for any reasonable request)
pub const MAX_REQUEST_SIZE: usize = 8192;

/// Default handshake timeout (30 seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport configuration for the upgrade handshake
///
/// Session limits are not part of this; negotiators set them per
/// connection in `customize`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_negotiator::Config;
///
/// let config = Config::builder()
///     .max_request_size(16 * 1024)
///     .handshake_timeout(Duration::from_secs(5))
///     .build();
/// assert_eq!(config.max_request_size, 16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest accepted request head in bytes (default: 8KB)
    pub max_request_size: usize,
    /// Time allowed for the client to send its request head (default: 30s)
    pub handshake_timeout: Duration,
    /// Disable Nagle's algorithm on accepted TCP connections (default: true)
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_request_size: MAX_REQUEST_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for handshake configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum request head size
    pub fn max_request_size(mut self, size: usize) -> Self {
        self.config.max_request_size = size;
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{Error, Rejection, Result};
    pub use crate::extension::{ExtensionConfig, ExtensionRegistry};
    pub use crate::negotiation::Negotiation;
    pub use crate::negotiator::{DefaultNegotiator, Negotiated, WebSocketNegotiator};
    pub use crate::pool::BufferPool;
    pub use crate::session::{CoreSession, Frame, FrameHandler, SessionLimits};
}
