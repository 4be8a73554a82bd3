//! # Leadflow Security
//! Secret sources (environment, JSON file, layered) and HMAC-SHA256
//! webhook signatures.

pub mod secrets;
pub mod signature;

pub use secrets::{EnvSecrets, FileSecrets, LayeredSecrets, secrets_from_config};
pub use signature::{SIGNATURE_HEADER, sign, verify};
