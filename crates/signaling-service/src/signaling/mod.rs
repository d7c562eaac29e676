//! Signaling Router: client WebSocket endpoint, message dispatch and
//! room fan-out.

pub mod connection;
pub mod protocol;
pub mod router;

pub use connection::{admit, ConnectionActor};
pub use protocol::{ClientMessage, ErrorMessage, ServerMessage, Usage};
pub use router::{signaling_router, AppState};
