//! Case-insensitive header map used on both sides of the handshake
//!
//! Backed by [`http::HeaderMap`]. Lookups ignore ASCII case. When a header
//! appears more than once, [`HeaderMap::get`] returns the first value in
//! arrival order; [`HeaderMap::get_all`] yields every value in arrival order.
//! Values that are not visible ASCII are skipped by the `&str` accessors.

use http::header::{HeaderName, HeaderValue};

use crate::error::Result;

/// Ordered, case-insensitive header collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    inner: http::HeaderMap,
}

impl HeaderMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, keeping earlier values for the same name
    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.inner.append(name, value);
        Ok(())
    }

    /// Set a value, replacing every earlier value for the same name
    pub fn insert(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.inner.insert(name, value);
        Ok(())
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).and_then(|v| v.to_str().ok())
    }

    /// All values for `name`, in arrival order
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .get_all(name)
            .into_iter()
            .filter_map(|v| v.to_str().ok())
    }

    /// Check whether `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Remove every value for `name`
    pub fn remove(&mut self, name: &str) {
        self.inner.remove(name);
    }

    /// Remove every header
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of values stored
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate `(name, value)` pairs; names are lowercase
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
    }

    /// Underlying `http` header map
    pub fn as_http(&self) -> &http::HeaderMap {
        &self.inner
    }
}

impl From<http::HeaderMap> for HeaderMap {
    fn from(inner: http::HeaderMap) -> Self {
        Self { inner }
    }
}
