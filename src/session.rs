//! Session limits and the per-connection session handed to frame handlers
//!
//! Limits are fixed once, by the negotiator's `customize` step, after the
//! handshake is accepted and before the first frame is delivered. Nothing
//! can change them for the rest of the connection.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::extension::ExtensionConfig;
use crate::pool::BufferPool;

/// Default idle timeout (120 seconds)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default maximum message size (64MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default maximum frame size (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Connection-lifetime bounds
///
/// `None` means no idle timeout, or no size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    idle_timeout: Option<Duration>,
    max_text_message_size: Option<usize>,
    max_binary_message_size: Option<usize>,
    max_frame_size: Option<usize>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_text_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            max_binary_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
        }
    }
}

impl SessionLimits {
    /// Create a limits builder starting from the defaults
    pub fn builder() -> SessionLimitsBuilder {
        SessionLimitsBuilder::new()
    }

    /// No timeout and no size limits
    pub fn unbounded() -> Self {
        Self {
            idle_timeout: None,
            max_text_message_size: None,
            max_binary_message_size: None,
            max_frame_size: None,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn max_text_message_size(&self) -> Option<usize> {
        self.max_text_message_size
    }

    pub fn max_binary_message_size(&self) -> Option<usize> {
        self.max_binary_message_size
    }

    pub fn max_frame_size(&self) -> Option<usize> {
        self.max_frame_size
    }
}

/// Builder for [`SessionLimits`]; values are validated in [`build`](Self::build)
///
/// Every bound must be positive. Zero is refused rather than read as
/// "unbounded": lift a bound with [`no_idle_timeout`](Self::no_idle_timeout)
/// or the `unbounded_*` setters instead.
#[derive(Debug, Clone)]
pub struct SessionLimitsBuilder {
    limits: SessionLimits,
}

impl SessionLimitsBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            limits: SessionLimits::default(),
        }
    }

    /// Close the connection after this long without traffic (must be non-zero)
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.limits.idle_timeout = Some(timeout);
        self
    }

    /// Never close the connection for inactivity
    pub fn no_idle_timeout(mut self) -> Self {
        self.limits.idle_timeout = None;
        self
    }

    /// Set maximum text message size in bytes (must be non-zero)
    pub fn max_text_message_size(mut self, size: usize) -> Self {
        self.limits.max_text_message_size = Some(size);
        self
    }

    pub fn unbounded_text_messages(mut self) -> Self {
        self.limits.max_text_message_size = None;
        self
    }

    /// Set maximum binary message size in bytes (must be non-zero)
    pub fn max_binary_message_size(mut self, size: usize) -> Self {
        self.limits.max_binary_message_size = Some(size);
        self
    }

    pub fn unbounded_binary_messages(mut self) -> Self {
        self.limits.max_binary_message_size = None;
        self
    }

    /// Set maximum frame payload size in bytes (must be non-zero)
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.limits.max_frame_size = Some(size);
        self
    }

    pub fn unbounded_frames(mut self) -> Self {
        self.limits.max_frame_size = None;
        self
    }

    /// Validate and build the limits
    ///
    /// A zero timeout or a zero size would make every connection unusable,
    /// so both are configuration errors; use the `no_`/`unbounded_` setters
    /// to lift a limit instead.
    pub fn build(self) -> Result<SessionLimits> {
        let limits = self.limits;

        if limits.idle_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("idle timeout must be positive"));
        }
        if limits.max_text_message_size == Some(0) {
            return Err(Error::Config("max text message size must be positive"));
        }
        if limits.max_binary_message_size == Some(0) {
            return Err(Error::Config("max binary message size must be positive"));
        }
        if limits.max_frame_size == Some(0) {
            return Err(Error::Config("max frame size must be positive"));
        }

        Ok(limits)
    }
}

impl Default for SessionLimitsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

/// A decoded frame as delivered to a [`FrameHandler`]
#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: OpCode,
    pub fin: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, fin: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            fin,
            payload: payload.into(),
        }
    }
}

/// Receives the frames of one accepted connection
///
/// Instances are produced by a negotiator. `on_open` runs after the
/// session limits are fixed and before any frame is delivered.
pub trait FrameHandler: Send + 'static {
    fn on_open(&mut self, _session: &CoreSession) -> Result<()> {
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<()>;
}

/// Per-connection state after a successful handshake
#[derive(Debug)]
pub struct CoreSession {
    path: String,
    subprotocol: Option<String>,
    extensions: Vec<ExtensionConfig>,
    limits: Option<SessionLimits>,
    buffer_pool: BufferPool,
}

impl CoreSession {
    pub fn new(
        path: impl Into<String>,
        subprotocol: Option<String>,
        extensions: Vec<ExtensionConfig>,
        buffer_pool: BufferPool,
    ) -> Self {
        Self {
            path: path.into(),
            subprotocol,
            extensions,
            limits: None,
            buffer_pool,
        }
    }

    /// Fix the session limits; they can only be set once
    pub fn set_limits(&mut self, limits: SessionLimits) -> Result<()> {
        if self.limits.is_some() {
            return Err(Error::NegotiationState("session limits already set"));
        }
        self.limits = Some(limits);
        Ok(())
    }

    /// Limits in force, or `None` before customization
    pub fn limits(&self) -> Option<&SessionLimits> {
        self.limits.as_ref()
    }

    pub fn is_customized(&self) -> bool {
        self.limits.is_some()
    }

    /// Request path of the upgrade
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Extensions announced in the upgrade response, in stack order
    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Check a frame payload length against `max_frame_size`
    pub fn frame_within_limits(&self, len: usize) -> bool {
        self.limits
            .and_then(|l| l.max_frame_size)
            .is_none_or(|max| len <= max)
    }

    /// Check an assembled message length against the limit for its opcode
    pub fn message_within_limits(&self, opcode: OpCode, len: usize) -> bool {
        let max = self.limits.and_then(|l| match opcode {
            OpCode::Text => l.max_text_message_size,
            OpCode::Binary => l.max_binary_message_size,
            _ => None,
        });
        max.is_none_or(|max| len <= max)
    }
}
