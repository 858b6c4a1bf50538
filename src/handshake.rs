//! HTTP/1.1 upgrade handshake around the negotiator
//!
//! This module is the transport boundary:
//! - parses the upgrade request (`httparse`)
//! - computes `Sec-WebSocket-Accept`
//! - writes either the 101 response carrying the negotiated headers, or an
//!   error response carrying the rejection status
//! - orders the steps so limits are fixed before the handler sees the session

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::extension::Extension;
use crate::headers::HeaderMap;
use crate::negotiation::Negotiation;

/// Maximum number of request headers
const MAX_HEADERS: usize = 64;

/// Parsed WebSocket upgrade request (server-side)
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// The request path
    pub path: String,
    /// The Sec-WebSocket-Key header
    pub key: String,
    /// Every request header, including the WebSocket ones
    pub headers: HeaderMap,
}

/// Parse a WebSocket upgrade request
///
/// Returns the request and the number of bytes consumed, or `None` if the
/// buffer does not yet hold a complete request head.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if req.method != Some("GET") {
                return Err(Error::InvalidHttp("method must be GET"));
            }

            let mut map = HeaderMap::new();
            for header in req.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| Error::InvalidHttp("invalid header value"))?;
                map.append(header.name, value)
                    .map_err(|_| Error::InvalidHttp("invalid header"))?;
            }

            let upgrade = map
                .get_all("upgrade")
                .any(|v| v.to_ascii_lowercase().contains("websocket"));
            if !upgrade {
                return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
            }

            let connection_upgrade = map
                .get_all("connection")
                .any(|v| v.to_ascii_lowercase().contains("upgrade"));
            if !connection_upgrade {
                return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
            }

            let key = map
                .get("sec-websocket-key")
                .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?
                .trim()
                .to_string();
            let version = map
                .get("sec-websocket-version")
                .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Version"))?;

            if version.trim() != "13" {
                return Err(Error::HandshakeFailed("unsupported WebSocket version"));
            }

            let path = req.path.unwrap_or("/").to_string();

            Ok(Some((
                UpgradeRequest {
                    path,
                    key,
                    headers: map,
                },
                len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(httparse::Error::TooManyHeaders) => Err(Error::InvalidHttp("too many headers")),
        Err(_) => Err(Error::InvalidHttp("failed to parse HTTP request")),
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Build the 101 response for an accepted negotiation
///
/// Negotiator headers come first, then the subprotocol and the extension
/// stack's response entries.
pub fn build_response(
    accept_key: &str,
    negotiation: &Negotiation,
    extensions: &[Box<dyn Extension>],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in negotiation.response_headers().iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(proto) = negotiation.subprotocol() {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if !extensions.is_empty() {
        let value = extensions
            .iter()
            .map(|ext| ext.negotiated_config().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build an error response that refuses the upgrade
///
/// An empty reason falls back to the canonical reason phrase.
pub fn build_error_response(status: StatusCode, reason: &str) -> Bytes {
    let reason = if reason.is_empty() {
        status.canonical_reason().unwrap_or("")
    } else {
        reason
    };

    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");
    if status == StatusCode::BAD_REQUEST {
        // tell clients speaking another protocol version what we support
        buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
    }
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-Length: 0\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(feature = "tokio-runtime")]
pub use self::runtime::{HandshakeOutcome, Upgraded, server_handshake};

#[cfg(feature = "tokio-runtime")]
mod runtime {
    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    use super::{
        UpgradeRequest, build_error_response, build_response, generate_accept_key, parse_request,
    };
    use crate::Config;
    use crate::error::{Error, Rejection, Result};
    use crate::extension::Extension;
    use crate::negotiation::Negotiation;
    use crate::negotiator::{self, Outcome, WebSocketNegotiator};
    use crate::session::{CoreSession, FrameHandler};

    /// An accepted connection, ready for frame I/O
    #[derive(Debug)]
    pub struct Upgraded<H> {
        /// Handler that receives the connection's frames
        pub handler: H,
        /// Session with its limits already fixed
        pub session: CoreSession,
        /// Extension stack announced in the 101 response
        pub extensions: Vec<Box<dyn Extension>>,
        /// Bytes the client sent after the request head
        pub leftover: Option<Bytes>,
    }

    /// Result of a handshake that produced a response
    #[derive(Debug)]
    pub enum HandshakeOutcome<H> {
        Accepted(Upgraded<H>),
        /// The negotiator refused; the error response was written
        Rejected(Rejection),
    }

    async fn read_request<S>(
        stream: &mut S,
        buf: &mut BytesMut,
        max_request_size: usize,
    ) -> Result<(UpgradeRequest, usize)>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            // only the head counts against the limit; trailing bytes are frame data
            match parse_request(buf)? {
                Some((_, consumed)) if consumed > max_request_size => {
                    return Err(Error::InvalidHttp("request too large"));
                }
                Some(parsed) => return Ok(parsed),
                None if buf.len() > max_request_size => {
                    return Err(Error::InvalidHttp("request too large"));
                }
                None => {}
            }

            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    async fn write_all<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Answer a failed handshake and hand the error back
    async fn fail<S, T>(stream: &mut S, error: Error) -> Result<T>
    where
        S: AsyncWrite + Unpin,
    {
        if let Some(status) = error.status_code() {
            let response = build_error_response(status, "");
            // the peer may already be gone; the handshake error is what gets reported
            write_all(stream, &response).await.ok();
        }
        Err(error)
    }

    /// Perform the server side of the upgrade with a negotiator
    ///
    /// Steps, in order: read and parse the request, run the negotiator once,
    /// answer a rejection with its status, otherwise build the session and
    /// customize it, write the 101 response, then call the handler's
    /// `on_open`. Malformed requests get a 400, negotiator failures a 500,
    /// and a request that does not arrive within the handshake timeout a 408.
    pub async fn server_handshake<S, N>(
        stream: &mut S,
        negotiator: &N,
        config: &Config,
    ) -> Result<HandshakeOutcome<N::Handler>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        N: WebSocketNegotiator + ?Sized,
    {
        let pool = negotiator.buffer_pool();
        let mut buf = pool.get();

        let read = tokio::time::timeout(
            config.handshake_timeout,
            read_request(stream, &mut buf, config.max_request_size),
        )
        .await;

        let (request, consumed) = match read {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "invalid websocket upgrade request");
                return fail(stream, e).await;
            }
            Err(_) => {
                tracing::warn!(timeout = ?config.handshake_timeout, "websocket handshake timed out");
                return fail(stream, Error::Timeout).await;
            }
        };

        // the buffer returns to the pool at full capacity
        let leftover = (consumed < buf.len()).then(|| Bytes::copy_from_slice(&buf[consumed..]));
        pool.put(buf);

        let UpgradeRequest { path, key, headers } = request;
        let mut negotiation = match Negotiation::new(path, headers) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "invalid websocket upgrade request");
                return fail(stream, e).await;
            }
        };

        let (handler, extensions) = match negotiator::negotiate(negotiator, &mut negotiation) {
            Ok(Outcome::Accepted {
                handler,
                extensions,
            }) => (handler, extensions),
            Ok(Outcome::Rejected(rejection)) => {
                let response = build_error_response(rejection.status(), rejection.reason());
                write_all(stream, &response).await?;
                return Ok(HandshakeOutcome::Rejected(rejection));
            }
            Err(e) => return fail(stream, e).await,
        };

        let mut session = CoreSession::new(
            negotiation.path(),
            negotiation.subprotocol().map(String::from),
            extensions.iter().map(|ext| ext.negotiated_config()).collect(),
            pool.clone(),
        );
        if let Err(e) = negotiator::customize(negotiator, &mut session) {
            return fail(stream, e).await;
        }

        let response = build_response(&generate_accept_key(&key), &negotiation, &extensions);
        write_all(stream, &response).await?;

        let mut handler = handler;
        handler.on_open(&session)?;

        Ok(HandshakeOutcome::Accepted(Upgraded {
            handler,
            session,
            extensions,
            leftover,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Protocol: chat, superchat\r\n\
        X-Marker: hello\r\n\
        \r\n";

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_request() {
        let (req, len) = parse_request(REQUEST).unwrap().unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(req.headers.get("x-marker"), Some("hello"));
        assert_eq!(len, REQUEST.len());
    }

    #[test]
    fn test_parse_request_partial() {
        let request = b"GET /chat HTTP/1.1\r\n\
            Host: server.example.com\r\n";

        assert!(parse_request(request).unwrap().is_none());
    }

    #[test]
    fn test_parse_request_invalid() {
        let post = b"POST /chat HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(matches!(parse_request(post), Err(Error::InvalidHttp(_))));

        let no_upgrade = b"GET /chat HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(matches!(
            parse_request(no_upgrade),
            Err(Error::HandshakeFailed(_))
        ));

        let old_version = b"GET / HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 8\r\n\
            \r\n";
        assert!(matches!(
            parse_request(old_version),
            Err(Error::HandshakeFailed("unsupported WebSocket version"))
        ));
    }

    #[test]
    fn test_build_response() {
        let (req, _) = parse_request(REQUEST).unwrap().unwrap();
        let mut negotiation = Negotiation::new(req.path, req.headers).unwrap();
        negotiation
            .set_response_header("X-Marker", "OK:hello")
            .unwrap();
        negotiation.set_subprotocol("chat").unwrap();

        let response = build_response(&generate_accept_key(&req.key), &negotiation, &[]);
        let response_str = std::str::from_utf8(&response).unwrap();

        assert!(response_str.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response_str.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response_str.contains("x-marker: OK:hello\r\n"));
        assert!(response_str.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(!response_str.contains("Sec-WebSocket-Extensions"));
        assert!(response_str.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_build_error_response() {
        let response = build_error_response(StatusCode::UNAUTHORIZED, "Some Auth reason");
        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(response_str.starts_with("HTTP/1.1 401 Some Auth reason\r\n"));
        assert!(response_str.contains("Content-Length: 0\r\n"));

        let response = build_error_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(response_str.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }
}
