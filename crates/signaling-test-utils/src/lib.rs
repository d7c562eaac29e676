//! # Signaling Test Utilities
//!
//! Shared test utilities for the signaling service.
//!
//! ## Modules
//!
//! - `mock_janus` - Mock Janus gateway over a real WebSocket
//! - `server_harness` - Real signaling server on a random port
//! - `client` - Signaling WebSocket client
//! - `fixtures` - Pre-configured test data (rooms, participants, tokens)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let janus = MockJanusServer::start().await;
//!     let server = TestSignalingServer::with_janus(&janus).await.unwrap();
//!
//!     let room = TestRoom::random();
//!     let alice = room.participant("alice");
//!     server.admit(&alice).await;
//!
//!     let mut client = SignalingClient::connect(&server.ws_url(Some(&alice.token)))
//!         .await
//!         .unwrap();
//!     client.recv_type("joined").await;
//! }
//! ```

pub mod client;
pub mod fixtures;
pub mod mock_janus;
pub mod server_harness;

// Re-export commonly used items
pub use client::{Closed, SignalingClient};
pub use fixtures::*;
pub use mock_janus::MockJanusServer;
pub use server_harness::{fast_gateway_settings, TestSignalingServer};

// In-memory participant store lives with the service behind `test-utils`
pub use signaling_service::store::MemoryParticipantStore;
