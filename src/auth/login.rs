use parking_lot::Mutex;
use tracing::info;

use crate::api::{
    AuthCode, AuthToken, Config, TokenSender, Webservice, WebserviceError,
};

use super::token_store::TokenStore;

/// Where the user is in the device-authorization sign-in flow. Exactly one
/// token is derivable per state: `SignedIn` carries it, all others imply none.
#[derive(Debug, Clone)]
pub enum LoginState {
    SignedOut,
    /// Sign-in begun; a fresh auth code has been requested from the server.
    RequestingAuthCode,
    RequestingAuthCodeFailed(WebserviceError),
    /// The server returned a code the user must now enter in their browser
    /// on another device.
    ReceivedAuthCode(AuthCode),
    SignedIn(AuthToken),
}

impl LoginState {
    pub fn auth_token(&self) -> Option<&AuthToken> {
        match self {
            LoginState::SignedIn(token) => Some(token),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, LoginState::SignedIn(_))
    }
}

/// Failure payloads are ignored: re-entering the failed state with a
/// different underlying error is not a state change.
impl PartialEq for LoginState {
    fn eq(&self, other: &Self) -> bool {
        use LoginState::*;
        match (self, other) {
            (SignedOut, SignedOut) => true,
            (RequestingAuthCode, RequestingAuthCode) => true,
            (RequestingAuthCodeFailed(_), RequestingAuthCodeFailed(_)) => true,
            (ReceivedAuthCode(a), ReceivedAuthCode(b)) => a == b,
            (SignedIn(a), SignedIn(b)) => a == b,
            _ => false,
        }
    }
}

type StateObserver = Box<dyn Fn(&LoginState) + Send + Sync>;

/// Mediates device-code sign-in, persists the token, and republishes it to
/// the network layer on every transition.
///
/// The in-memory state is the source of truth while the process runs; the
/// token store is the source of truth across restarts.
pub struct Login {
    webservice: Webservice,
    config: Config,
    store: Box<dyn TokenStore>,
    token_tx: TokenSender,
    state: Mutex<LoginState>,
    observer: Mutex<Option<StateObserver>>,
}

impl Login {
    /// Initial state is `SignedIn` when the store already holds a token.
    pub fn new(
        webservice: Webservice,
        config: Config,
        store: Box<dyn TokenStore>,
        token_tx: TokenSender,
    ) -> Self {
        let initial = match store.read().ok().flatten() {
            Some(token) => LoginState::SignedIn(AuthToken::new(token)),
            None => LoginState::SignedOut,
        };
        token_tx.send_replace(initial.auth_token().cloned());
        Self {
            webservice,
            config,
            store,
            token_tx,
            state: Mutex::new(initial),
            observer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoginState {
        self.state.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().is_authenticated()
    }

    /// Registers the observer notified on every effective state change.
    /// Redundant transitions do not notify.
    pub fn on_state_change(&self, observer: impl Fn(&LoginState) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Box::new(observer));
    }

    fn transition(&self, new: LoginState) {
        // The token is persisted or cleared on every transition, redundant
        // ones included. A failing store is unrecoverable.
        match new.auth_token() {
            Some(token) => self.store.write(token.as_str()).expect("token store write failed"),
            None => self.store.clear().expect("token store clear failed"),
        }
        self.token_tx.send_replace(new.auth_token().cloned());

        let changed = {
            let mut state = self.state.lock();
            if *state == new {
                false
            } else {
                *state = new.clone();
                true
            }
        };
        if changed {
            info!(state = ?new, "login state changed");
            if let Some(observer) = self.observer.lock().as_ref() {
                observer(&new);
            }
        }
    }

    /// Asks the server for a fresh auth code. Legal whenever the user is
    /// signed out, including retries after a failed request and requesting
    /// a replacement for an unverified code.
    pub async fn request_auth_code(&self) {
        self.transition(LoginState::RequestingAuthCode);
        match self.webservice.load(&AuthCode::request(&self.config)).await {
            Ok(code) => self.transition(LoginState::ReceivedAuthCode(code)),
            Err(err) => self.transition(LoginState::RequestingAuthCodeFailed(err)),
        }
    }

    /// Polls the server once to check whether the user has registered the
    /// code in their browser. Failure leaves the state unchanged; the caller
    /// presents the returned error transiently and may poll again.
    pub async fn verify_auth_code(&self, code: &AuthCode) -> Result<(), WebserviceError> {
        let response = self.webservice.load(&code.verify(&self.config)).await?;
        self.transition(LoginState::SignedIn(response.token));
        Ok(())
    }

    pub fn sign_out(&self) {
        self.transition(LoginState::SignedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth_channel;
    use crate::auth::token_store::FileTokenStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use url::Url;

    fn login_against(server: &mockito::ServerGuard, store: FileTokenStore) -> Login {
        let (tx, rx) = auth_channel();
        let config = Config::new(Url::parse(&server.url()).unwrap());
        Login::new(Webservice::new(rx), config, Box::new(store), tx)
    }

    #[tokio::test]
    async fn prepopulated_store_starts_signed_in() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("token"));
        store.write("T").unwrap();

        let login = login_against(&server, store);
        assert_eq!(login.state(), LoginState::SignedIn(AuthToken::new("T")));
        assert!(login.is_authenticated());
    }

    #[tokio::test]
    async fn empty_store_starts_signed_out() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let login = login_against(&server, FileTokenStore::new(dir.path().join("token")));
        assert_eq!(login.state(), LoginState::SignedOut);
        assert!(!login.is_authenticated());
    }

    #[tokio::test]
    async fn auth_code_flow_reaches_signed_in_and_persists() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body(r#"{"code": "123", "token": "tok"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/tokens/poll")
            .match_query(mockito::Matcher::UrlEncoded("token".into(), "tok".into()))
            .with_status(200)
            .with_body(r#"{"token": "abc"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("token");
        let login = login_against(&server, FileTokenStore::new(&store_path));

        login.request_auth_code().await;
        let code = AuthCode {
            code: "123".into(),
            token: "tok".into(),
        };
        assert_eq!(login.state(), LoginState::ReceivedAuthCode(code.clone()));

        login.verify_auth_code(&code).await.unwrap();
        assert_eq!(login.state(), LoginState::SignedIn(AuthToken::new("abc")));
        let persisted = FileTokenStore::new(&store_path).read().unwrap();
        assert_eq!(persisted, Some("abc".to_string()));
    }

    #[tokio::test]
    async fn failed_code_request_enters_failed_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tokens")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let login = login_against(&server, FileTokenStore::new(dir.path().join("token")));
        login.request_auth_code().await;
        assert!(matches!(
            login.state(),
            LoginState::RequestingAuthCodeFailed(_)
        ));
    }

    #[tokio::test]
    async fn failed_verification_leaves_state_unchanged() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokens/poll")
            .match_query(mockito::Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let login = login_against(&server, FileTokenStore::new(dir.path().join("token")));
        let code = AuthCode {
            code: "123".into(),
            token: "tok".into(),
        };

        let result = login.verify_auth_code(&code).await;
        assert_eq!(result, Err(WebserviceError::NotAuthenticated));
        assert_eq!(login.state(), LoginState::SignedOut);
    }

    #[tokio::test]
    async fn sign_out_clears_the_store_and_published_token() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("token");
        let store = FileTokenStore::new(&store_path);
        store.write("T").unwrap();

        let (tx, rx) = auth_channel();
        let config = Config::new(Url::parse(&server.url()).unwrap());
        let login = Login::new(Webservice::new(rx.clone()), config, Box::new(store), tx);
        assert_eq!(*rx.borrow(), Some(AuthToken::new("T")));

        login.sign_out();
        assert_eq!(login.state(), LoginState::SignedOut);
        assert_eq!(*rx.borrow(), None);
        assert_eq!(FileTokenStore::new(&store_path).read().unwrap(), None);
    }

    #[tokio::test]
    async fn redundant_failed_transitions_do_not_notify() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tokens")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let login = login_against(&server, FileTokenStore::new(dir.path().join("token")));
        let notifications = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notifications);
        login.on_state_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        login.request_auth_code().await;
        // RequestingAuthCode, then RequestingAuthCodeFailed.
        assert_eq!(notifications.load(Ordering::SeqCst), 2);

        // Re-entering the failed state with a fresh error payload is not a
        // state change and does not notify.
        login.transition(LoginState::RequestingAuthCodeFailed(
            WebserviceError::Other("different".into()),
        ));
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_state_equality_ignores_the_payload() {
        let a = LoginState::RequestingAuthCodeFailed(WebserviceError::Other("x".into()));
        let b = LoginState::RequestingAuthCodeFailed(WebserviceError::NotAuthenticated);
        assert_eq!(a, b);
        assert_ne!(a, LoginState::SignedOut);
    }
}
