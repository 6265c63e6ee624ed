//! TCP transport: framed connections, the sender's reconnecting link and
//! the receiver's session server.

pub mod connection;
pub mod inbound;
pub mod outbound;
mod session;

pub use connection::{Connection, Endpoint};
pub use inbound::InboundServer;
pub use outbound::{LinkSnapshot, OutboundLink};
pub use session::SessionInfo;
