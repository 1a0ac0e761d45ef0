//! The coordinator's connection/election state machine (spec §4.1).

/// States in the coordinator lifecycle.
///
/// `REGISTERED -> LEADER` when this node's own candidate is smallest;
/// `FOLLOWER -> LEADER` when the watched predecessor is deleted and this
/// node's candidate becomes smallest; `LEADER -> FOLLOWER` is possible only
/// after a session re-entry (the original leader's session expired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Disconnected,
    Connecting,
    Registered,
    Leader,
    Follower,
    Closed,
}
