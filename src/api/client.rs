use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use super::models::AuthToken;
use super::resource::{Method, Resource};

/// HTTP 401 is the sole distinguished failure; everything else
/// (transport, non-2xx body, parse) collapses into `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebserviceError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("request failed: {0}")]
    Other(String),
}

pub type TokenSender = watch::Sender<Option<AuthToken>>;
pub type TokenReceiver = watch::Receiver<Option<AuthToken>>;

/// Channel over which the login layer publishes the current bearer token.
/// The webservice reads the receiving end on every request.
pub fn auth_channel() -> (TokenSender, TokenReceiver) {
    watch::channel(None)
}

/// Executes resources over HTTP. One attempt per call, no retries;
/// the caller decides whether to retry.
#[derive(Clone)]
pub struct Webservice {
    client: Client,
    token: TokenReceiver,
}

impl Webservice {
    pub fn new(token: TokenReceiver) -> Self {
        Self {
            client: Client::new(),
            token,
        }
    }

    /// Loads a resource. A 401 always yields `NotAuthenticated`, with or
    /// without a body. Any other response is handed to the resource's
    /// parser; bytes that do not parse yield `Other`.
    pub async fn load<T>(&self, resource: &Resource<T>) -> Result<T, WebserviceError> {
        let mut request = match resource.method() {
            Method::Get => self.client.get(resource.url().clone()),
            Method::Post(payload) => {
                let request = self.client.post(resource.url().clone());
                match payload {
                    Some(payload) => request.json(payload),
                    None => request,
                }
            }
        };
        if let Some(token) = self.token.borrow().clone() {
            request = request.bearer_auth(token.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|err| WebserviceError::Other(err.to_string()))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(WebserviceError::NotAuthenticated);
        }
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| WebserviceError::Other(err.to_string()))?;

        resource.parse(&body).ok_or_else(|| {
            debug!(url = %resource.url(), %status, "response body did not parse");
            WebserviceError::Other(format!("unparseable response (status {status})"))
        })
    }
}
