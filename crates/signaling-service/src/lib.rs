//! Signaling Service Library
//!
//! Coordinates multi-party real-time sessions in front of a Janus
//! video-room gateway:
//!
//! - Admits signaling WebSocket connections against single-use join tokens
//! - Opens a publisher handle per participant and subscriber handles per
//!   remote feed on one shared gateway control session
//! - Relays SDP and trickle ICE between clients and the gateway
//! - Fans presence and chat events out to room members
//!
//! # Architecture
//!
//! ```text
//! GatewayConnectionManager (singleton, reconnects forever)
//! └── control session
//!     ├── PublisherSession (one per participant)
//!     └── SubscriberSession (one per participant per remote feed)
//!
//! Registry (rooms -> participants -> sessions)
//! └── ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Modules
//!
//! - [`gateway`] - Gateway protocol, transport and connection manager
//! - [`sessions`] - Publisher and subscriber sessions
//! - [`registry`] - Room and participant bookkeeping
//! - [`signaling`] - Client protocol, WebSocket endpoint, connection actor
//! - [`store`] - Participant store, room-state hook, AI dispatch
//! - [`observability`] - Health probes and metrics
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing codes

pub mod config;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod registry;
pub mod sessions;
pub mod signaling;
pub mod store;
