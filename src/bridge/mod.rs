//! The protocol bridge: capability negotiation, message framing and
//! routing of remote tool calls through the dispatcher.

pub mod capability;
pub mod codec;
pub mod message;
pub mod providers;
pub mod session;
pub mod transport;

pub use capability::CapabilitySet;
pub use session::{ProtocolBridge, SessionInfo, SessionState};
