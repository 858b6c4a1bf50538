//! WebSocket server driving the negotiator over HTTP/1.1
//!
//! # Example
//!
//! ```ignore
//! use sockudo_negotiator::server::WebSocketServer;
//! use sockudo_negotiator::prelude::*;
//! use tokio::net::TcpListener;
//!
//! let negotiator = DefaultNegotiator::new(|_: &Negotiation| EchoHandler::default());
//! let server = WebSocketServer::new(negotiator, Config::default());
//!
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! server.serve(listener, |stream, upgraded| async move {
//!     println!("Connection to {}", upgraded.session.path());
//! }).await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::Config;
use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeOutcome, Upgraded};
use crate::negotiator::WebSocketNegotiator;

/// HTTP/1.1 WebSocket server around a negotiator
pub struct WebSocketServer<N> {
    config: Config,
    negotiator: Arc<N>,
}

impl<N> WebSocketServer<N>
where
    N: WebSocketNegotiator + 'static,
{
    /// Create a new server with the given negotiator and configuration
    pub fn new(negotiator: N, config: Config) -> Self {
        Self {
            config,
            negotiator: Arc::new(negotiator),
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn negotiator(&self) -> &N {
        &self.negotiator
    }

    /// Run the upgrade handshake on an existing stream
    ///
    /// Returns the stream together with the outcome. On rejection the error
    /// response has already been written and the stream should be dropped.
    pub async fn accept<S>(&self, mut stream: S) -> Result<(S, HandshakeOutcome<N::Handler>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome =
            handshake::server_handshake(&mut stream, self.negotiator.as_ref(), &self.config)
                .await?;
        Ok((stream, outcome))
    }

    /// Serve WebSocket connections from a TCP listener
    ///
    /// Each connection is negotiated on its own task. `on_upgrade` runs for
    /// accepted connections only; rejections and failures are logged.
    pub async fn serve<F, Fut>(&self, listener: TcpListener, on_upgrade: F) -> Result<()>
    where
        F: Fn(TcpStream, Upgraded<N::Handler>) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let (stream, peer) = listener.accept().await.map_err(Error::Io)?;

            if self.config.tcp_nodelay {
                stream.set_nodelay(true).ok();
            }

            let on_upgrade = on_upgrade.clone();
            let server = self.clone();

            tokio::spawn(async move {
                match server.accept(stream).await {
                    Ok((stream, HandshakeOutcome::Accepted(upgraded))) => {
                        tracing::debug!(%peer, path = upgraded.session.path(), "websocket connection upgraded");
                        on_upgrade(stream, upgraded).await;
                    }
                    Ok((_, HandshakeOutcome::Rejected(rejection))) => {
                        tracing::debug!(%peer, %rejection, "websocket upgrade rejected");
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "websocket handshake error");
                    }
                }
            });
        }
    }
}

impl<N> Clone for WebSocketServer<N> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            negotiator: Arc::clone(&self.negotiator),
        }
    }
}
