//! The negotiator contract and the driver that enforces it
//!
//! A [`WebSocketNegotiator`] decides, once per upgrade attempt, whether to
//! accept the connection and with which frame handler. The transport never
//! calls `negotiate` directly; it goes through [`negotiate`], which checks the
//! result against the context, builds the extension stack, and turns policy
//! failures into errors that cannot be mistaken for deliberate rejections.
//!
//! # Example
//!
//! ```ignore
//! use sockudo_negotiator::prelude::*;
//!
//! struct Auth { registry: ExtensionRegistry, pool: BufferPool }
//!
//! impl WebSocketNegotiator for Auth {
//!     type Handler = ChatHandler;
//!
//!     fn negotiate(&self, n: &mut Negotiation) -> Result<Negotiated<ChatHandler>> {
//!         if n.request_header("Authorization").is_none() {
//!             return Ok(Negotiated::Reject(n.reject(401, "Unauthorized")?));
//!         }
//!         if n.offered_subprotocols().iter().any(|p| p == "chat") {
//!             n.set_subprotocol("chat")?;
//!         }
//!         Ok(Negotiated::Accept(ChatHandler::default()))
//!     }
//!
//!     fn extension_registry(&self) -> &ExtensionRegistry { &self.registry }
//!     fn buffer_pool(&self) -> &BufferPool { &self.pool }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::{Error, Rejection, Result};
use crate::extension::{Extension, ExtensionConfig, ExtensionRegistry};
use crate::negotiation::Negotiation;
use crate::pool::BufferPool;
use crate::session::{CoreSession, FrameHandler, SessionLimits};

/// Decision returned by [`WebSocketNegotiator::negotiate`]
pub enum Negotiated<H> {
    /// Accept the upgrade; frames go to this handler
    Accept(H),
    /// Refuse the upgrade with the status from [`Negotiation::reject`]
    Reject(Rejection),
}

impl<H> fmt::Debug for Negotiated<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Negotiated::Accept(_) => f.write_str("Accept(..)"),
            Negotiated::Reject(r) => f.debug_tuple("Reject").field(r).finish(),
        }
    }
}

/// Server-side upgrade policy
pub trait WebSocketNegotiator: Send + Sync {
    type Handler: FrameHandler;

    /// Inspect the request and decide
    ///
    /// May read request headers and set response headers any number of
    /// times, choose accepted extensions and a subprotocol, and either reject
    /// through the context or return a handler. Returning `Err` is treated as
    /// an internal failure, never as a rejection.
    fn negotiate(&self, negotiation: &mut Negotiation) -> Result<Negotiated<Self::Handler>>;

    /// Fix session limits for an accepted connection
    ///
    /// Runs once, after `negotiate` accepted and before any frame is read.
    fn customize(&self, session: &mut CoreSession) -> Result<()> {
        session.set_limits(SessionLimits::default())
    }

    /// Extensions this server can instantiate
    fn extension_registry(&self) -> &ExtensionRegistry;

    /// Pool handed to every accepted session
    fn buffer_pool(&self) -> &BufferPool;
}

/// Result of a completed negotiation
pub enum Outcome<H> {
    Accepted {
        handler: H,
        /// Extension stack, in the order the negotiator accepted them
        extensions: Vec<Box<dyn Extension>>,
    },
    Rejected(Rejection),
}

impl<H> Outcome<H> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(r) => Some(r),
            Outcome::Accepted { .. } => None,
        }
    }
}

impl<H> fmt::Debug for Outcome<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Accepted { extensions, .. } => f
                .debug_struct("Accepted")
                .field("extensions", extensions)
                .finish_non_exhaustive(),
            Outcome::Rejected(r) => f.debug_tuple("Rejected").field(r).finish(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Run a negotiator once and validate its decision
///
/// - A handler returned after `reject` is a [`Error::NegotiationState`].
/// - A handler with an accepted extension the registry cannot build fails
///   the negotiation.
/// - Any other error or panic from the negotiator becomes
///   [`Error::NegotiationFailed`]; contract violations pass through as is.
pub fn negotiate<N>(negotiator: &N, negotiation: &mut Negotiation) -> Result<Outcome<N::Handler>>
where
    N: WebSocketNegotiator + ?Sized,
{
    let decision = match catch_unwind(AssertUnwindSafe(|| negotiator.negotiate(negotiation))) {
        Ok(decision) => decision,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(path = negotiation.path(), panic = msg, "websocket negotiator panicked");
            return Err(Error::NegotiationFailed(format!("negotiator panicked: {}", msg)));
        }
    };

    match decision {
        Ok(Negotiated::Accept(handler)) => {
            if negotiation.is_rejected() {
                tracing::error!(
                    path = negotiation.path(),
                    "websocket negotiator returned a handler after rejecting"
                );
                return Err(Error::NegotiationState("frame handler returned after rejection"));
            }

            let extensions = build_extension_stack(
                negotiator.extension_registry(),
                negotiation.accepted_extensions(),
            )?;
            negotiation.mark_accepted()?;

            tracing::debug!(
                path = negotiation.path(),
                subprotocol = negotiation.subprotocol().unwrap_or("-"),
                extensions = %ExtensionConfig::format_list(negotiation.accepted_extensions()),
                "websocket negotiation accepted"
            );
            Ok(Outcome::Accepted {
                handler,
                extensions,
            })
        }
        Ok(Negotiated::Reject(rejection)) => {
            if negotiation.rejection() != Some(&rejection) {
                tracing::error!(
                    path = negotiation.path(),
                    "websocket negotiator returned a foreign rejection"
                );
                return Err(Error::NegotiationState(
                    "rejection does not belong to this negotiation",
                ));
            }

            tracing::info!(
                path = negotiation.path(),
                status = rejection.status().as_u16(),
                reason = rejection.reason(),
                "websocket negotiation rejected"
            );
            Ok(Outcome::Rejected(rejection))
        }
        Err(e) if e.is_contract_violation() => {
            tracing::error!(path = negotiation.path(), error = %e, "websocket negotiator broke its contract");
            Err(e)
        }
        Err(e) => {
            tracing::warn!(path = negotiation.path(), error = %e, "websocket negotiation failed");
            match e {
                Error::NegotiationFailed(_) => Err(e),
                other => Err(Error::NegotiationFailed(other.to_string())),
            }
        }
    }
}

fn build_extension_stack(
    registry: &ExtensionRegistry,
    accepted: &[ExtensionConfig],
) -> Result<Vec<Box<dyn Extension>>> {
    accepted
        .iter()
        .map(|config| {
            let factory = registry.lookup(config.name()).ok_or(Error::NegotiationState(
                "accepted extension is not registered",
            ))?;
            factory.create(config)
        })
        .collect()
}

/// Apply the negotiator's session customization
///
/// Falls back to [`SessionLimits::default`] when `customize` returns without
/// setting limits, so a session never starts unconfigured.
pub fn customize<N>(negotiator: &N, session: &mut CoreSession) -> Result<()>
where
    N: WebSocketNegotiator + ?Sized,
{
    negotiator.customize(session).inspect_err(|e| {
        tracing::error!(path = session.path(), error = %e, "websocket session customization failed");
    })?;

    if !session.is_customized() {
        tracing::debug!(path = session.path(), "no session limits set, using defaults");
        session.set_limits(SessionLimits::default())?;
    }
    Ok(())
}

/// Ready-made policy
///
/// - accepts every offered extension the registry can build, first offer per
///   name, in client order
/// - picks the first offered subprotocol that is supported (any offered one
///   when no supported list is configured), otherwise none
/// - builds handlers with a factory closure
/// - applies fixed session limits
pub struct DefaultNegotiator<F, H> {
    factory: F,
    subprotocols: Vec<String>,
    registry: ExtensionRegistry,
    buffer_pool: BufferPool,
    limits: SessionLimits,
    _handler: PhantomData<fn() -> H>,
}

impl<F, H> DefaultNegotiator<F, H>
where
    F: Fn(&Negotiation) -> H + Send + Sync,
    H: FrameHandler,
{
    /// Create a negotiator with the default registry, pool, and limits
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            subprotocols: Vec::new(),
            registry: ExtensionRegistry::with_defaults(),
            buffer_pool: BufferPool::default(),
            limits: SessionLimits::default(),
            _handler: PhantomData,
        }
    }

    /// Only negotiate these subprotocols
    pub fn subprotocols<I, S>(mut self, supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = supported.into_iter().map(Into::into).collect();
        self
    }

    pub fn registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.buffer_pool = pool;
        self
    }

    pub fn limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    fn select_subprotocol<'a>(&self, offered: &'a [String]) -> Option<&'a str> {
        offered
            .iter()
            .find(|p| self.subprotocols.is_empty() || self.subprotocols.contains(*p))
            .map(String::as_str)
    }
}

impl<F, H> WebSocketNegotiator for DefaultNegotiator<F, H>
where
    F: Fn(&Negotiation) -> H + Send + Sync,
    H: FrameHandler,
{
    type Handler = H;

    fn negotiate(&self, negotiation: &mut Negotiation) -> Result<Negotiated<H>> {
        let mut accepted: Vec<ExtensionConfig> = Vec::new();
        for offer in negotiation.offered_extensions() {
            if !accepted.iter().any(|a| a.same_extension(offer)) && self.registry.accepts(offer) {
                accepted.push(offer.clone());
            }
        }
        negotiation.set_accepted_extensions(accepted)?;

        match self
            .select_subprotocol(negotiation.offered_subprotocols())
            .map(String::from)
        {
            Some(protocol) => negotiation.set_subprotocol(&protocol)?,
            None => negotiation.set_no_subprotocol()?,
        }

        Ok(Negotiated::Accept((self.factory)(&*negotiation)))
    }

    fn customize(&self, session: &mut CoreSession) -> Result<()> {
        session.set_limits(self.limits)
    }

    fn extension_registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::IdentityExtension;
    use crate::headers::HeaderMap;
    use crate::session::Frame;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct NullHandler;

    impl FrameHandler for NullHandler {
        fn on_frame(&mut self, _frame: Frame) -> Result<()> {
            Ok(())
        }
    }

    fn negotiation(headers: &[(&str, &str)]) -> Negotiation {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(name, value).unwrap();
        }
        Negotiation::new("/ws", map).unwrap()
    }

    /// Test policy driven by a closure over the context
    struct Scripted<P> {
        policy: P,
        registry: ExtensionRegistry,
        pool: BufferPool,
    }

    impl<P> Scripted<P>
    where
        P: Fn(&mut Negotiation) -> Result<Negotiated<NullHandler>> + Send + Sync,
    {
        fn new(policy: P) -> Self {
            Self {
                policy,
                registry: ExtensionRegistry::new(),
                pool: BufferPool::default(),
            }
        }
    }

    impl<P> WebSocketNegotiator for Scripted<P>
    where
        P: Fn(&mut Negotiation) -> Result<Negotiated<NullHandler>> + Send + Sync,
    {
        type Handler = NullHandler;

        fn negotiate(&self, negotiation: &mut Negotiation) -> Result<Negotiated<NullHandler>> {
            (self.policy)(negotiation)
        }

        fn extension_registry(&self) -> &ExtensionRegistry {
            &self.registry
        }

        fn buffer_pool(&self) -> &BufferPool {
            &self.pool
        }
    }

    #[test]
    fn test_empty_subprotocols_accepted() {
        let negotiator = DefaultNegotiator::new(|_: &Negotiation| NullHandler);
        let mut n = negotiation(&[]);

        let outcome = negotiate(&negotiator, &mut n).unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(n.subprotocol(), None);
        assert!(n.is_accepted());
    }

    #[test]
    fn test_first_preference_is_deterministic() {
        let negotiator = DefaultNegotiator::new(|_: &Negotiation| NullHandler);
        for _ in 0..10 {
            let mut n = negotiation(&[("Sec-WebSocket-Protocol", "a, b")]);
            negotiate(&negotiator, &mut n).unwrap();
            assert_eq!(n.subprotocol(), Some("a"));
        }
    }

    #[test]
    fn test_supported_subprotocol_list() {
        let negotiator =
            DefaultNegotiator::new(|_: &Negotiation| NullHandler).subprotocols(["superchat"]);

        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "chat, superchat")]);
        negotiate(&negotiator, &mut n).unwrap();
        assert_eq!(n.subprotocol(), Some("superchat"));

        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "chat")]);
        negotiate(&negotiator, &mut n).unwrap();
        assert_eq!(n.subprotocol(), None);
    }

    #[test]
    fn test_handler_after_reject() {
        let negotiator = Scripted::new(|n: &mut Negotiation| {
            n.reject(401, "nope")?;
            Ok(Negotiated::Accept(NullHandler))
        });
        let mut n = negotiation(&[]);

        let err = negotiate(&negotiator, &mut n).unwrap_err();
        assert!(matches!(err, Error::NegotiationState(_)));
        assert!(!n.is_accepted());
    }

    #[test]
    fn test_reject_passes_through() {
        let negotiator = Scripted::new(|n: &mut Negotiation| {
            Ok(Negotiated::Reject(n.reject(403, "Forbidden")?))
        });
        let mut n = negotiation(&[]);

        let outcome = negotiate(&negotiator, &mut n).unwrap();
        assert_eq!(outcome.rejection().unwrap().status().as_u16(), 403);
    }

    #[test]
    fn test_foreign_rejection() {
        let negotiator = Scripted::new(|_: &mut Negotiation| {
            let mut other = Negotiation::new("/other", HeaderMap::new())?;
            Ok(Negotiated::Reject(other.reject(401, "elsewhere")?))
        });
        let mut n = negotiation(&[]);
        assert!(matches!(
            negotiate(&negotiator, &mut n),
            Err(Error::NegotiationState(_))
        ));
    }

    #[test]
    fn test_policy_error_is_failure() {
        let negotiator = Scripted::new(|_: &mut Negotiation| {
            Err(Error::negotiation_failed("auth backend unavailable"))
        });
        let mut n = negotiation(&[]);

        let err = negotiate(&negotiator, &mut n).unwrap_err();
        assert!(matches!(err, Error::NegotiationFailed(_)));
        assert_eq!(err.status_code().map(|s| s.as_u16()), Some(500));
    }

    #[test]
    fn test_policy_panic_is_failure() {
        let negotiator = Scripted::new(|_: &mut Negotiation| panic!("policy bug"));
        let mut n = negotiation(&[]);

        match negotiate(&negotiator, &mut n) {
            Err(Error::NegotiationFailed(msg)) => assert!(msg.contains("policy bug")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_double_subprotocol_surfaces() {
        let negotiator = Scripted::new(|n: &mut Negotiation| {
            n.set_subprotocol("x")?;
            n.set_subprotocol("y")?;
            Ok(Negotiated::Accept(NullHandler))
        });
        let mut n = negotiation(&[("Sec-WebSocket-Protocol", "x, y")]);

        assert!(matches!(
            negotiate(&negotiator, &mut n),
            Err(Error::NegotiationState(_))
        ));
    }

    #[test]
    fn test_unregistered_extension_refused() {
        let negotiator = Scripted::new(|n: &mut Negotiation| {
            n.set_accepted_extensions(vec![ExtensionConfig::new("x-custom")])?;
            Ok(Negotiated::Accept(NullHandler))
        });
        let mut n = negotiation(&[("Sec-WebSocket-Extensions", "x-custom")]);

        assert!(matches!(
            negotiate(&negotiator, &mut n),
            Err(Error::NegotiationState(_))
        ));
    }

    #[test]
    fn test_default_policy_filters_extensions() {
        let mut registry = ExtensionRegistry::new();
        registry.register("x-custom", IdentityExtension::factory());
        let negotiator =
            DefaultNegotiator::new(|_: &Negotiation| NullHandler).registry(registry);

        let mut n = negotiation(&[(
            "Sec-WebSocket-Extensions",
            "x-custom; a=1, x-other, x-custom; a=2",
        )]);
        match negotiate(&negotiator, &mut n).unwrap() {
            Outcome::Accepted { extensions, .. } => {
                assert_eq!(extensions.len(), 1);
                assert_eq!(extensions[0].negotiated_config().to_string(), "x-custom; a=1");
            }
            Outcome::Rejected(r) => panic!("rejected: {}", r),
        }
    }

    #[test]
    fn test_customize_applies_limits() {
        let limits = SessionLimits::builder()
            .idle_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let negotiator = DefaultNegotiator::new(|_: &Negotiation| NullHandler).limits(limits);

        let mut session = CoreSession::new("/ws", None, Vec::new(), BufferPool::default());
        customize(&negotiator, &mut session).unwrap();
        assert_eq!(session.limits(), Some(&limits));

        // a second customization is refused
        assert!(customize(&negotiator, &mut session).is_err());
    }

    #[test]
    fn test_customize_falls_back_to_defaults() {
        struct Forgetful(ExtensionRegistry, BufferPool);

        impl WebSocketNegotiator for Forgetful {
            type Handler = NullHandler;

            fn negotiate(&self, _: &mut Negotiation) -> Result<Negotiated<NullHandler>> {
                Ok(Negotiated::Accept(NullHandler))
            }

            fn customize(&self, _: &mut CoreSession) -> Result<()> {
                Ok(())
            }

            fn extension_registry(&self) -> &ExtensionRegistry {
                &self.0
            }

            fn buffer_pool(&self) -> &BufferPool {
                &self.1
            }
        }

        let negotiator = Forgetful(ExtensionRegistry::new(), BufferPool::default());
        let mut session = CoreSession::new("/", None, Vec::new(), BufferPool::default());
        customize(&negotiator, &mut session).unwrap();
        assert_eq!(session.limits(), Some(&SessionLimits::default()));
    }
}
