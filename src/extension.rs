//! WebSocket extension descriptors and the extension registry
//!
//! Offers arrive in `Sec-WebSocket-Extensions` headers as comma separated
//! entries, each an extension token followed by `;`-separated parameters:
//!
//! ```text
//! Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits, x-custom; level="2"
//! ```
//!
//! The registry maps extension names to factories. Negotiators consult it to
//! decide which offers they can accept, and the handshake driver uses it to
//! build the extension stack for an accepted connection. It is read-only
//! while connections negotiate and can be shared across tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// One extension entry: a name plus ordered parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    name: String,
    params: Vec<(String, Option<String>)>,
}

impl ExtensionConfig {
    /// Create an entry without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter (`None` for a bare flag)
    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push((name.into(), value.map(String::from)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters in offer order
    pub fn params(&self) -> &[(String, Option<String>)] {
        &self.params
    }

    /// Parameters as borrowed pairs
    pub fn param_refs(&self) -> Vec<(&str, Option<&str>)> {
        self.params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
            .collect()
    }

    /// Look up a parameter; `Some(None)` means present without a value
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Check whether two entries name the same extension
    pub fn same_extension(&self, other: &ExtensionConfig) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }

    /// Parse a single entry such as `permessage-deflate; server_max_window_bits=10`
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = split_outside_quotes(value, ';').into_iter();

        let name = parts.next().map(str::trim).unwrap_or_default();
        if !is_token(name) {
            return Err(Error::HandshakeFailed("invalid extension name"));
        }

        let mut config = ExtensionConfig::new(name);
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if !is_token(key) {
                        return Err(Error::HandshakeFailed("invalid extension parameter"));
                    }
                    let value = value.trim().trim_matches('"');
                    config.params.push((key.to_string(), Some(value.to_string())));
                }
                None => {
                    if !is_token(part) {
                        return Err(Error::HandshakeFailed("invalid extension parameter"));
                    }
                    config.params.push((part.to_string(), None));
                }
            }
        }

        Ok(config)
    }

    /// Parse a full header value into entries, keeping client order
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        split_outside_quotes(value, ',')
            .into_iter()
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Render entries as a header value
    pub fn format_list(configs: &[ExtensionConfig]) -> String {
        configs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ExtensionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (key, value) in &self.params {
            match value {
                Some(v) if v.chars().all(is_token_char) && !v.is_empty() => {
                    write!(f, "; {}={}", key, v)?
                }
                Some(v) => write!(f, "; {}=\"{}\"", key, v)?,
                None => write!(f, "; {}", key)?,
            }
        }
        Ok(())
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// RFC 7230 token: non-empty, no separators or whitespace
pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_token_char)
}

fn split_outside_quotes(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;

    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// An extension instance in a connection's extension stack
///
/// Frame transformation is done by the codec layer; the negotiation layer
/// only needs to know what to announce in the upgrade response.
pub trait Extension: Send + fmt::Debug {
    /// Registered extension name
    fn name(&self) -> &str;

    /// Entry announced back to the client
    fn negotiated_config(&self) -> ExtensionConfig;
}

/// Builds extension instances from an accepted offer
pub trait ExtensionFactory: Send + Sync {
    /// Create an instance, or fail if the offer's parameters are unacceptable
    fn create(&self, offer: &ExtensionConfig) -> Result<Box<dyn Extension>>;
}

impl<F> ExtensionFactory for F
where
    F: Fn(&ExtensionConfig) -> Result<Box<dyn Extension>> + Send + Sync,
{
    fn create(&self, offer: &ExtensionConfig) -> Result<Box<dyn Extension>> {
        self(offer)
    }
}

/// Extension that accepts any parameters and echoes the offer unchanged
#[derive(Debug, Clone)]
pub struct IdentityExtension {
    config: ExtensionConfig,
}

impl IdentityExtension {
    pub fn new(config: ExtensionConfig) -> Self {
        Self { config }
    }

    /// Factory for registering arbitrary pass-through extensions
    pub fn factory() -> impl ExtensionFactory {
        |offer: &ExtensionConfig| -> Result<Box<dyn Extension>> {
            Ok(Box::new(IdentityExtension::new(offer.clone())))
        }
    }
}

impl Extension for IdentityExtension {
    fn name(&self) -> &str {
        self.config.name()
    }

    fn negotiated_config(&self) -> ExtensionConfig {
        self.config.clone()
    }
}

/// Name-indexed set of extension factories
///
/// Names are matched case-insensitively.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    factories: HashMap<String, Arc<dyn ExtensionFactory>>,
}

impl ExtensionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in extensions
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "permessage-deflate")]
        registry.register(
            crate::deflate::EXTENSION_NAME,
            crate::deflate::PerMessageDeflateFactory::default(),
        );
        registry
    }

    /// Register a factory, replacing any previous one for the same name
    pub fn register(&mut self, name: &str, factory: impl ExtensionFactory + 'static) {
        self.factories
            .insert(name.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Remove a factory
    pub fn unregister(&mut self, name: &str) {
        self.factories.remove(&name.to_ascii_lowercase());
    }

    /// Find the factory for `name`
    pub fn lookup(&self, name: &str) -> Option<&dyn ExtensionFactory> {
        self.factories
            .get(&name.to_ascii_lowercase())
            .map(|f| f.as_ref())
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Check whether an offer can be instantiated as given
    pub fn accepts(&self, offer: &ExtensionConfig) -> bool {
        self.lookup(offer.name())
            .is_some_and(|factory| factory.create(offer).is_ok())
    }

    /// Instantiate an extension for an accepted offer
    pub fn new_instance(&self, offer: &ExtensionConfig) -> Result<Box<dyn Extension>> {
        let factory = self
            .lookup(offer.name())
            .ok_or_else(|| Error::Extension(format!("unsupported extension {}", offer.name())))?;
        factory.create(offer)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("names", &self.names())
            .finish()
    }
}
