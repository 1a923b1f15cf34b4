pub mod client;
pub mod models;
pub mod resource;

pub use client::{auth_channel, TokenReceiver, TokenSender, Webservice, WebserviceError};
pub use models::{AuthCode, AuthResponse, AuthToken, Config, Episode};
pub use resource::{Method, Resource};
