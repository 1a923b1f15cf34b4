use bytes::Bytes;
use serde::Deserialize;
use url::Url;

use super::resource::{Method, Resource};

/// Environment for the backing API, injected by the caller.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: Url,
}

impl Config {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.split('/'));
        }
        url
    }
}

/// One episode as served by the episodes listing endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Episode {
    pub id: String,
    pub title: String,
    pub season: u32,
    pub number: u32,
    pub subscription_only: bool,
    #[serde(default)]
    pub synopsis: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    /// Unix timestamp of the last server-side update.
    pub updated_at: i64,
    /// Unix timestamp, absent for unreleased episodes.
    #[serde(default)]
    pub released_at: Option<i64>,
    pub poster_url: Url,
    pub media_url: Url,
    /// Duration in seconds.
    #[serde(default)]
    pub media_duration: Option<f64>,
}

impl Episode {
    /// The full episode listing.
    pub fn all(config: &Config) -> Resource<Vec<Episode>> {
        Resource::json(config.endpoint("episodes.json"), Method::Get)
    }

    /// Raw poster image bytes. Decoding is the UI's concern.
    pub fn thumbnail(&self) -> Resource<Bytes> {
        Resource::bytes(self.poster_url.clone(), Method::Get)
    }
}

/// Opaque bearer credential attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Short-lived device-pairing code the user enters in their browser,
/// plus the polling token used to check whether they have done so.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub token: String,
}

impl AuthCode {
    /// Asks the server to mint a fresh auth code.
    pub fn request(config: &Config) -> Resource<AuthCode> {
        Resource::json(config.endpoint("tokens"), Method::Post(None))
    }

    /// Polls whether the user has registered this code in their browser.
    pub fn verify(&self, config: &Config) -> Resource<AuthResponse> {
        let mut url = config.endpoint("tokens/poll");
        url.query_pairs_mut().append_pair("token", &self.token);
        Resource::json(url, Method::Get)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthResponse {
    pub token: AuthToken,
}
