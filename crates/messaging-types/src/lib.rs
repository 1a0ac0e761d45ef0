//! Core type definitions shared across the messaging cluster: the
//! [`Message`] entity, vector clocks, conversation ids, node identifiers,
//! and the crate-wide error type.

mod conversation;
mod error;
mod message;
mod node_id;
mod vector_clock;

pub use conversation::conversation_id;
pub use error::{Error, Result};
pub use message::Message;
pub use node_id::{validate_port, NodeId, MAX_PORT, MIN_PORT, PORT_BASE};
pub use vector_clock::{ClockOrdering, VectorClock};
