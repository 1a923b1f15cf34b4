//! Data and download layer for a video streaming client.
//!
//! The crate covers four concerns the UI builds on: a typed REST client
//! ([`Webservice`] executing [`Resource`]s), an on-disk response cache with
//! cache-then-refresh composition ([`DiskCache`], [`CachedWebservice`]),
//! resumable background downloads ([`DownloadManager`]), and the device-code
//! sign-in state machine ([`Login`]) that owns credential persistence and
//! republishes bearer tokens to the network layer.

pub mod api;
pub mod application;
pub mod auth;
pub mod cache;
pub mod utils;

pub use api::{
    auth_channel, AuthCode, AuthResponse, AuthToken, Config, Episode, Method, Resource,
    TokenReceiver, TokenSender, Webservice, WebserviceError,
};
pub use application::{DownloadManager, DownloadPhase, DownloadState};
pub use auth::{FileTokenStore, Login, LoginState, TokenStore};
pub use cache::{CachedWebservice, DiskCache};
