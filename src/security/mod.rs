//! Security Module
//!
//! Secret storage and HMAC authorization of modifying/admin commands.

pub mod auth;
pub mod secrets;

pub use auth::{sign, verify, Authorizer};
pub use secrets::SecretStore;
