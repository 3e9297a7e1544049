pub mod auth;

pub use auth::{api_key_auth, parse_authorization};
