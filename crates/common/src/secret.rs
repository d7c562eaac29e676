//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`] types. `SecretString` and `SecretBox<T>` implement
//! `Debug` with redaction, so a struct that derives `Debug` while holding a
//! secret stays safe to print with `{:?}` or through `tracing`. Secrets are
//! zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct GatewayCredentials {
//!     url: String,
//!     api_secret: SecretString,
//! }
//!
//! let creds = GatewayCredentials {
//!     url: "ws://janus:8188/janus".to_string(),
//!     api_secret: SecretString::from("janusrocks"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("janusrocks"));
//! let secret: &str = creds.api_secret.expose_secret();
//! assert_eq!(secret, "janusrocks");
//! ```
//!
//! # Usage in the signaling service
//!
//! Use `SecretString` for:
//! - Database connection URLs (they embed passwords)
//! - Gateway API secrets and admin keys
//! - Join tokens while they are being validated

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
