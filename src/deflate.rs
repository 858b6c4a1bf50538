//! Per-Message Deflate parameter negotiation (RFC 7692)
//!
//! Only the handshake half of permessage-deflate lives here: validating a
//! client offer and computing the parameters the server answers with. The
//! compressor itself belongs to the frame codec.

use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionConfig, ExtensionFactory};

/// Registered extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// permessage-deflate parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server's maximum LZ77 window bits (for compression when server, decompression when client)
    pub server_max_window_bits: u8,
    /// Client's maximum LZ77 window bits (for compression when client, decompression when server)
    pub client_max_window_bits: u8,
    /// If true, server must reset compression context after each message
    pub server_no_context_takeover: bool,
    /// If true, client must reset compression context after each message
    pub client_no_context_takeover: bool,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

impl DeflateConfig {
    /// Server preferences that keep per-connection compression state small
    pub fn low_memory() -> Self {
        Self {
            server_max_window_bits: 10, // 1KB window
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: true,
        }
    }

    /// Parse the parameters of a client offer
    ///
    /// Returns the requested parameters and whether the client announced
    /// `client_max_window_bits` (which the server may only answer if offered).
    pub fn from_params(params: &[(&str, Option<&str>)]) -> Result<(Self, bool)> {
        let mut config = Self::default();
        let mut seen: Vec<&str> = Vec::with_capacity(params.len());
        let mut client_window_offered = false;

        for (name, value) in params {
            if seen.contains(name) {
                return Err(Error::Extension(format!(
                    "duplicate permessage-deflate parameter {}",
                    name
                )));
            }
            seen.push(*name);

            match *name {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::Extension(
                            "server_no_context_takeover must not have a value".into(),
                        ));
                    }
                    config.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::Extension(
                            "client_no_context_takeover must not have a value".into(),
                        ));
                    }
                    config.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let v = value.ok_or_else(|| {
                        Error::Extension("server_max_window_bits requires a value".into())
                    })?;
                    config.server_max_window_bits = parse_window_bits(name, v)?;
                }
                "client_max_window_bits" => {
                    client_window_offered = true;
                    // No value: client only indicates support
                    if let Some(v) = value {
                        config.client_max_window_bits = parse_window_bits(name, v)?;
                    }
                }
                other => {
                    return Err(Error::Extension(format!(
                        "unknown permessage-deflate parameter {}",
                        other
                    )));
                }
            }
        }

        Ok((config, client_window_offered))
    }

    /// Combine a client offer with these server preferences
    ///
    /// Flags requested by either side are kept, and each window is the
    /// smaller of the two. `client_max_window_bits` only shrinks when the
    /// client offered it.
    pub fn accept_offer(&self, offer: &DeflateConfig, client_window_offered: bool) -> DeflateConfig {
        DeflateConfig {
            server_max_window_bits: offer.server_max_window_bits.min(self.server_max_window_bits),
            client_max_window_bits: if client_window_offered {
                offer.client_max_window_bits.min(self.client_max_window_bits)
            } else {
                DEFAULT_WINDOW_BITS
            },
            server_no_context_takeover: offer.server_no_context_takeover
                || self.server_no_context_takeover,
            client_no_context_takeover: offer.client_no_context_takeover
                || self.client_no_context_takeover,
        }
    }

    /// Response entry for the server's `Sec-WebSocket-Extensions` header
    pub fn to_extension_config(&self) -> ExtensionConfig {
        let mut config = ExtensionConfig::new(EXTENSION_NAME);

        if self.server_no_context_takeover {
            config = config.with_param("server_no_context_takeover", None);
        }
        if self.client_no_context_takeover {
            config = config.with_param("client_no_context_takeover", None);
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            config = config.with_param(
                "server_max_window_bits",
                Some(&self.server_max_window_bits.to_string()),
            );
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            config = config.with_param(
                "client_max_window_bits",
                Some(&self.client_max_window_bits.to_string()),
            );
        }

        config
    }
}

fn parse_window_bits(name: &str, value: &str) -> Result<u8> {
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::Extension(format!("invalid {} value", name)))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::Extension(format!("{} out of range (8-15)", name)));
    }
    Ok(bits)
}

/// Negotiated permessage-deflate instance
#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    config: DeflateConfig,
}

impl PerMessageDeflate {
    pub fn config(&self) -> &DeflateConfig {
        &self.config
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn negotiated_config(&self) -> ExtensionConfig {
        self.config.to_extension_config()
    }
}

/// Registry factory for permessage-deflate, holding the server preferences
#[derive(Debug, Clone, Default)]
pub struct PerMessageDeflateFactory {
    preferences: DeflateConfig,
}

impl PerMessageDeflateFactory {
    pub fn new(preferences: DeflateConfig) -> Self {
        Self { preferences }
    }
}

impl ExtensionFactory for PerMessageDeflateFactory {
    fn create(&self, offer: &ExtensionConfig) -> Result<Box<dyn Extension>> {
        let (requested, client_window_offered) = DeflateConfig::from_params(&offer.param_refs())?;
        let config = self.preferences.accept_offer(&requested, client_window_offered);
        Ok(Box::new(PerMessageDeflate { config }))
    }
}
