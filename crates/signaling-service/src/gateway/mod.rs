//! Media gateway control plane.
//!
//! [`GatewayConnectionManager`] owns the single control session. Publisher
//! and subscriber sessions borrow it through [`GatewaySession`] and never
//! close it.

pub mod janus;
pub mod manager;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod protocol;
pub mod transport;

pub use janus::JanusConnector;
pub use manager::{
    ConnectionStatus, GatewayConnectionManager, GatewayEvent, GatewaySettings, RoomOptions,
};
pub use protocol::{IceCandidate, Jsep};
pub use transport::{GatewayConnector, GatewaySession, HandleEvent};
