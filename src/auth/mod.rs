pub mod login;
pub mod token_store;

pub use login::{Login, LoginState};
pub use token_store::{FileTokenStore, TokenStore};
