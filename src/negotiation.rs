//! Per-handshake negotiation context
//!
//! A [`Negotiation`] is built from one upgrade request and lent mutably to
//! the negotiator for the duration of a single `negotiate` call. It holds
//! what the client offered and accumulates what the server decides: custom
//! response headers, the subprotocol, the accepted extensions, or a
//! rejection.
//!
//! Write-once rules are enforced at runtime and violations surface as
//! [`Error::NegotiationState`]:
//!
//! - `reject` succeeds at most once, and never after a handler was chosen.
//! - the subprotocol is decided at most once; repeating the same decision is
//!   a no-op.
//!
//! Rejecting discards every response header set so far. The error response
//! carries only the rejection status and reason, and headers cannot be set
//! once the context is rejected.

use http::StatusCode;

use crate::error::{Error, Rejection, Result};
use crate::extension::{ExtensionConfig, is_token};
use crate::headers::HeaderMap;

pub const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "sec-websocket-extensions";

/// Headers written by the handshake itself; negotiators may not set them
const RESERVED_RESPONSE_HEADERS: [&str; 5] = [
    "sec-websocket-accept",
    SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_EXTENSIONS,
    "upgrade",
    "connection",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Negotiating,
    Rejected,
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubprotocolChoice {
    Undecided,
    NoProtocol,
    Protocol(String),
}

/// Negotiation context for one upgrade attempt
#[derive(Debug)]
pub struct Negotiation {
    path: String,
    request_headers: HeaderMap,
    response_headers: HeaderMap,
    offered_extensions: Vec<ExtensionConfig>,
    offered_subprotocols: Vec<String>,
    accepted_extensions: Vec<ExtensionConfig>,
    subprotocol: SubprotocolChoice,
    rejection: Option<Rejection>,
    state: State,
}

impl Negotiation {
    /// Build the context from the request path and headers
    ///
    /// Fails if a `Sec-WebSocket-Extensions` header is malformed or an
    /// offered subprotocol is not a token.
    pub fn new(path: impl Into<String>, request_headers: HeaderMap) -> Result<Self> {
        let mut offered_extensions = Vec::new();
        for value in request_headers.get_all(SEC_WEBSOCKET_EXTENSIONS) {
            offered_extensions.extend(ExtensionConfig::parse_list(value)?);
        }

        let mut offered_subprotocols = Vec::new();
        for value in request_headers.get_all(SEC_WEBSOCKET_PROTOCOL) {
            for protocol in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                if !is_token(protocol) {
                    return Err(Error::HandshakeFailed("invalid subprotocol name"));
                }
                offered_subprotocols.push(protocol.to_string());
            }
        }

        Ok(Self {
            path: path.into(),
            request_headers,
            response_headers: HeaderMap::new(),
            offered_extensions,
            offered_subprotocols,
            accepted_extensions: Vec::new(),
            subprotocol: SubprotocolChoice::Undecided,
            rejection: None,
            state: State::Negotiating,
        })
    }

    /// Request path of the upgrade
    pub fn path(&self) -> &str {
        &self.path
    }

    /// First value of a request header (case-insensitive)
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name)
    }

    /// Every value of a request header, in arrival order
    pub fn request_header_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.request_headers.get_all(name)
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    fn ensure_negotiating(&self) -> Result<()> {
        match self.state {
            State::Negotiating => Ok(()),
            State::Rejected => Err(Error::NegotiationState("negotiation already rejected")),
            State::Accepted => Err(Error::NegotiationState("negotiation already completed")),
        }
    }

    fn check_response_header_name(name: &str) -> Result<()> {
        if RESERVED_RESPONSE_HEADERS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
        {
            return Err(Error::InvalidHeader(format!(
                "{} is set by the handshake",
                name
            )));
        }
        Ok(())
    }

    /// Set a response header, replacing earlier values
    pub fn set_response_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_negotiating()?;
        Self::check_response_header_name(name)?;
        self.response_headers.insert(name, value)
    }

    /// Add a response header value, keeping earlier values
    pub fn append_response_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_negotiating()?;
        Self::check_response_header_name(name)?;
        self.response_headers.append(name, value)
    }

    /// Custom headers for the upgrade response
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Refuse the upgrade with a 3xx-5xx status
    ///
    /// Returns the [`Rejection`] the negotiator hands back as
    /// [`Negotiated::Reject`](crate::negotiator::Negotiated::Reject).
    pub fn reject(&mut self, status: u16, reason: impl Into<String>) -> Result<Rejection> {
        match self.state {
            State::Negotiating => {}
            State::Rejected => return Err(Error::NegotiationState("negotiation rejected twice")),
            State::Accepted => {
                return Err(Error::NegotiationState(
                    "cannot reject after a frame handler was chosen",
                ));
            }
        }

        if !(300..=599).contains(&status) {
            return Err(Error::InvalidStatus(status));
        }
        let status = StatusCode::from_u16(status).map_err(|_| Error::InvalidStatus(status))?;

        let reason = reason.into();
        if reason.chars().any(|c| c.is_control()) {
            return Err(Error::InvalidHeader(
                "reason phrase contains control characters".into(),
            ));
        }

        let rejection = Rejection::new(status, reason);
        self.response_headers.clear();
        self.rejection = Some(rejection.clone());
        self.state = State::Rejected;
        Ok(rejection)
    }

    pub fn is_rejected(&self) -> bool {
        self.state == State::Rejected
    }

    pub fn is_accepted(&self) -> bool {
        self.state == State::Accepted
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        self.rejection.as_ref()
    }

    /// Extensions offered by the client, in offer order
    pub fn offered_extensions(&self) -> &[ExtensionConfig] {
        &self.offered_extensions
    }

    /// Subprotocols offered by the client, in preference order
    pub fn offered_subprotocols(&self) -> &[String] {
        &self.offered_subprotocols
    }

    fn decide_subprotocol(&mut self, choice: SubprotocolChoice) -> Result<()> {
        self.ensure_negotiating()?;
        if self.subprotocol == SubprotocolChoice::Undecided {
            self.subprotocol = choice;
            Ok(())
        } else if self.subprotocol == choice {
            Ok(())
        } else {
            Err(Error::NegotiationState("subprotocol already selected"))
        }
    }

    /// Select one of the offered subprotocols
    ///
    /// Selecting the same name again is a no-op; any other second decision
    /// fails. Names are matched exactly.
    pub fn set_subprotocol(&mut self, name: &str) -> Result<()> {
        if !self.offered_subprotocols.iter().any(|p| p == name) {
            return Err(Error::NegotiationState("subprotocol was not offered"));
        }
        self.decide_subprotocol(SubprotocolChoice::Protocol(name.to_string()))
    }

    /// Explicitly negotiate no subprotocol
    pub fn set_no_subprotocol(&mut self) -> Result<()> {
        self.decide_subprotocol(SubprotocolChoice::NoProtocol)
    }

    /// Selected subprotocol; `None` when none was (or has yet been) chosen
    pub fn subprotocol(&self) -> Option<&str> {
        match &self.subprotocol {
            SubprotocolChoice::Protocol(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_subprotocol_decided(&self) -> bool {
        self.subprotocol != SubprotocolChoice::Undecided
    }

    /// Replace the set of accepted extensions
    ///
    /// Every entry must name an offered extension, at most once. Parameters
    /// may differ from the offer; the registry factory validates them.
    pub fn set_accepted_extensions(&mut self, extensions: Vec<ExtensionConfig>) -> Result<()> {
        self.ensure_negotiating()?;

        for (i, ext) in extensions.iter().enumerate() {
            if !self.offered_extensions.iter().any(|o| o.same_extension(ext)) {
                return Err(Error::NegotiationState("accepted extension was not offered"));
            }
            if extensions[..i].iter().any(|prev| prev.same_extension(ext)) {
                return Err(Error::NegotiationState("extension accepted twice"));
            }
        }

        self.accepted_extensions = extensions;
        Ok(())
    }

    /// Extensions the negotiator accepted, in stack order
    pub fn accepted_extensions(&self) -> &[ExtensionConfig] {
        &self.accepted_extensions
    }

    /// Close negotiation with a handler; an undecided subprotocol becomes none
    pub(crate) fn mark_accepted(&mut self) -> Result<()> {
        match self.state {
            State::Negotiating => {}
            State::Rejected => {
                return Err(Error::NegotiationState(
                    "frame handler returned after rejection",
                ));
            }
            State::Accepted => return Err(Error::NegotiationState("negotiation already completed")),
        }

        if self.subprotocol == SubprotocolChoice::Undecided {
            self.subprotocol = SubprotocolChoice::NoProtocol;
        }
        self.state = State::Accepted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiation(headers: &[(&str, &str)]) -> Negotiation {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name, value).unwrap();
        }
        Negotiation::new("/chat", map).unwrap()
    }

    #[test]
    fn test_offers_parsed() {
        let n = negotiation(&[
            ("Sec-WebSocket-Protocol", "chat, superchat"),
            ("Sec-WebSocket-Protocol", "v2.chat"),
            ("Sec-WebSocket-Extensions", "permessage-deflate; client_max_window_bits"),
            ("Sec-WebSocket-Extensions", "x-custom"),
        ]);

        assert_eq!(n.offered_subprotocols(), &["chat", "superchat", "v2.chat"]);
        let names: Vec<_> = n.offered_extensions().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["permessage-deflate", "x-custom"]);
        assert_eq!(n.path(), "/chat");
    }

    #[test]
    fn test_malformed_extensions() {
        let mut map = HeaderMap::new();
        map.append("Sec-WebSocket-Extensions", "bad name").unwrap();
        assert!(matches!(
            Negotiation::new("/", map),
            Err(Error::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_malformed_subprotocols() {
        for bad in ["chat;x", "chat, super chat", "\"chat\""] {
            let mut map = HeaderMap::new();
            map.append("Sec-WebSocket-Protocol", bad).unwrap();
            assert!(matches!(
                Negotiation::new("/", map),
                Err(Error::HandshakeFailed("invalid subprotocol name"))
            ));
        }
    }

    #[test]
    fn test_no_subprotocol_offered() {
        let n = negotiation(&[]);
        assert!(n.offered_subprotocols().is_empty());
        assert_eq!(n.subprotocol(), None);
    }

    #[test]
    fn test_subprotocol_write_once() {
        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "x, y")]);

        n.set_subprotocol("x").unwrap();
        n.set_subprotocol("x").unwrap();
        assert_eq!(n.subprotocol(), Some("x"));

        let err = n.set_subprotocol("y").unwrap_err();
        assert!(matches!(err, Error::NegotiationState(_)));
        assert!(n.set_no_subprotocol().is_err());
        assert_eq!(n.subprotocol(), Some("x"));
    }

    #[test]
    fn test_explicit_no_subprotocol() {
        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "x")]);
        n.set_no_subprotocol().unwrap();
        n.set_no_subprotocol().unwrap();
        assert!(n.is_subprotocol_decided());
        assert!(n.set_subprotocol("x").is_err());
    }

    #[test]
    fn test_subprotocol_must_be_offered() {
        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "chat")]);
        assert!(n.set_subprotocol("Chat").is_err());
        assert!(!n.is_subprotocol_decided());
    }

    #[test]
    fn test_response_header_overwrite() {
        let mut n = negotiation(&[]);
        n.set_response_header("X-Reply", "one").unwrap();
        n.set_response_header("x-reply", "two").unwrap();
        assert_eq!(n.response_headers().get("X-Reply"), Some("two"));
        assert_eq!(n.response_headers().len(), 1);
    }

    #[test]
    fn test_reserved_response_header() {
        let mut n = negotiation(&[]);
        assert!(matches!(
            n.set_response_header("Sec-WebSocket-Protocol", "chat"),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_reject_discards_headers() {
        let mut n = negotiation(&[("X-Marker", "abort")]);
        n.set_response_header("X-Marker", "OK:abort").unwrap();

        let rejection = n.reject(401, "Some Auth reason").unwrap();
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(rejection.reason(), "Some Auth reason");
        assert!(n.is_rejected());
        assert!(n.response_headers().is_empty());

        assert!(matches!(
            n.set_response_header("X-Late", "1"),
            Err(Error::NegotiationState(_))
        ));
    }

    #[test]
    fn test_reject_twice() {
        let mut n = negotiation(&[]);
        n.reject(403, "Forbidden").unwrap();
        let err = n.reject(401, "again").unwrap_err();
        assert!(matches!(err, Error::NegotiationState(_)));
        assert_eq!(n.rejection().unwrap().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_reject_status_range() {
        let mut n = negotiation(&[]);
        assert!(matches!(n.reject(200, "ok"), Err(Error::InvalidStatus(200))));
        assert!(matches!(n.reject(600, "x"), Err(Error::InvalidStatus(600))));
        assert!(n.reject(400, "bad\r\nheader").is_err());
        assert!(!n.is_rejected());
        n.reject(302, "Found").unwrap();
    }

    #[test]
    fn test_reject_after_accept() {
        let mut n = negotiation(&[]);
        n.mark_accepted().unwrap();
        assert!(matches!(
            n.reject(401, "late"),
            Err(Error::NegotiationState(_))
        ));
        assert!(n.is_accepted());
    }

    #[test]
    fn test_accept_after_reject() {
        let mut n = negotiation(&[]);
        n.reject(401, "no").unwrap();
        assert!(matches!(n.mark_accepted(), Err(Error::NegotiationState(_))));
    }

    #[test]
    fn test_accept_defaults_subprotocol_to_none() {
        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "chat")]);
        n.mark_accepted().unwrap();
        assert!(n.is_subprotocol_decided());
        assert_eq!(n.subprotocol(), None);
    }

    #[test]
    fn test_accepted_extensions_validated() {
        let mut n = negotiation(&[(
            "Sec-WebSocket-Extensions",
            "permessage-deflate, x-custom",
        )]);

        n.set_accepted_extensions(vec![ExtensionConfig::new("x-custom")])
            .unwrap();
        assert_eq!(n.accepted_extensions().len(), 1);

        assert!(n
            .set_accepted_extensions(vec![ExtensionConfig::new("x-unknown")])
            .is_err());
        assert!(n
            .set_accepted_extensions(vec![
                ExtensionConfig::new("x-custom"),
                ExtensionConfig::new("X-Custom"),
            ])
            .is_err());
        // failed calls leave the previous set in place
        assert_eq!(n.accepted_extensions()[0].name(), "x-custom");
    }
}
