//! The `Message` entity (spec §3).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::vector_clock::VectorClock;

/// A single user message, stamped with a hybrid physical/logical timestamp.
///
/// `id`, `sender`, `receiver`, and `content` are immutable once constructed.
/// `physical_ts` and `logical_ts` may be overwritten by the time service
/// during ingestion and ordering correction (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: String,
    sender: String,
    receiver: String,
    content: String,
    physical_ts: i64,
    logical_ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_clock: Option<VectorClockWire>,
}

/// Wire form of a [`VectorClock`] (serde can't derive through the opaque
/// `BTreeMap` wrapper without exposing it, so we round-trip through the
/// `key:value;...` text form used on the wire elsewhere in the system).
type VectorClockWire = String;

impl Message {
    /// Constructs a new message with a fresh id and the current wall clock
    /// as its provisional `physical_ts`. `logical_ts` starts at 0 and is set
    /// by the time service during ingestion.
    ///
    /// Rejects blank `sender`, `receiver`, or `content` per spec §7
    /// `InvalidInput`.
    pub fn new(sender: &str, receiver: &str, content: &str) -> Result<Self> {
        let sender = non_blank("sender", sender)?;
        let receiver = non_blank("receiver", receiver)?;
        let content = non_blank("content", content)?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            sender,
            receiver,
            content,
            physical_ts: wall_clock_ms(),
            logical_ts: 0,
            vector_clock: None,
        })
    }

    /// Reconstructs a message for read paths / tests where the id is
    /// already known (e.g. replayed from a replica store).
    pub fn with_id(id: &str, sender: &str, receiver: &str, content: &str) -> Result<Self> {
        if id.trim().is_empty() {
            return Err(Error::BlankMessageId);
        }
        let mut message = Self::new(sender, receiver, content)?;
        message.id = id.to_string();
        Ok(message)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn physical_ts(&self) -> i64 {
        self.physical_ts
    }

    pub fn logical_ts(&self) -> u64 {
        self.logical_ts
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.vector_clock
            .as_deref()
            .map(VectorClock::deserialize)
            .unwrap_or_default()
    }

    pub fn set_vector_clock(&mut self, clock: &VectorClock) {
        self.vector_clock = Some(clock.serialize());
    }

    /// Overwrites the physical timestamp. Used by the time service's
    /// `correctTimestamp` (spec §4.4).
    pub fn correct_physical_ts(&mut self, ts: i64) {
        self.physical_ts = ts;
    }

    /// Overwrites the logical timestamp. Used by the time service during
    /// ingestion (spec §4.4/§3).
    pub fn set_logical_ts(&mut self, ts: u64) {
        self.logical_ts = ts;
    }
}

impl PartialEq for Message {
    /// Equality is by `id` alone, per spec §3.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Message {}

fn non_blank(field: &'static str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::BlankField { field })
    } else {
        Ok(trimmed.to_string())
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_has_positive_physical_ts_and_zero_logical_ts() {
        let message = Message::new("alice", "bob", "hi").unwrap();
        assert!(message.physical_ts() > 0);
        assert_eq!(message.logical_ts(), 0);
    }

    #[test]
    fn rejects_blank_fields() {
        assert!(Message::new("", "bob", "hi").is_err());
        assert!(Message::new("alice", "  ", "hi").is_err());
        assert!(Message::new("alice", "bob", "\t\n").is_err());
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let message = Message::new("  alice ", "bob", " hi  ").unwrap();
        assert_eq!(message.sender(), "alice");
        assert_eq!(message.content(), "hi");
    }

    #[test]
    fn equality_is_by_id_only() {
        let a = Message::with_id("m1", "alice", "bob", "hi").unwrap();
        let b = Message::with_id("m1", "carol", "dave", "bye").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn vector_clock_round_trips_through_the_message() {
        let mut message = Message::new("alice", "bob", "hi").unwrap();
        let mut clock = VectorClock::new();
        clock.increment("node-1");
        message.set_vector_clock(&clock);
        assert_eq!(message.vector_clock(), clock);
    }

    #[test]
    fn serializes_to_json_and_back_for_transport_over_the_wire() {
        let message = Message::with_id("m1", "alice", "bob", "hi").unwrap();
        let json = serde_json::to_string(&message).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id(), message.id());
        assert_eq!(restored.sender(), message.sender());
        assert_eq!(restored.receiver(), message.receiver());
        assert_eq!(restored.content(), message.content());
        assert_eq!(restored.physical_ts(), message.physical_ts());
        assert_eq!(restored.logical_ts(), message.logical_ts());
    }
}
