use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use sha1::{Digest, Sha1};
use url::Url;

/// HTTP method of a resource, carrying the JSON payload for POSTs.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Get,
    Post(Option<serde_json::Value>),
}

/// Descriptor of one fetchable endpoint plus its response parser.
///
/// A resource is pure data: it never issues a request itself. Parsing
/// returns `None` on malformed bytes; the caller decides what that means.
pub struct Resource<T> {
    url: Url,
    method: Method,
    parse: Arc<dyn Fn(&[u8]) -> Option<T> + Send + Sync>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            method: self.method.clone(),
            parse: Arc::clone(&self.parse),
        }
    }
}

impl<T> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl<T> Resource<T> {
    pub fn new(
        url: Url,
        method: Method,
        parse: impl Fn(&[u8]) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            url,
            method,
            parse: Arc::new(parse),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn parse(&self, bytes: &[u8]) -> Option<T> {
        (self.parse)(bytes)
    }

    /// Stable cache address for this resource: hex SHA-1 of the URL string.
    pub fn cache_key(&self) -> String {
        hex::encode(Sha1::digest(self.url.as_str().as_bytes()))
    }
}

impl<T: DeserializeOwned + 'static> Resource<T> {
    /// Resource whose body is JSON deserialized into `T`.
    pub fn json(url: Url, method: Method) -> Self {
        Self::new(url, method, |bytes| serde_json::from_slice(bytes).ok())
    }
}

impl Resource<Bytes> {
    /// Resource that keeps the raw response bytes.
    pub fn bytes(url: Url, method: Method) -> Self {
        Self::new(url, method, |bytes| Some(Bytes::copy_from_slice(bytes)))
    }
}
