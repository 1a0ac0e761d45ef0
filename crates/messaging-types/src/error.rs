//! Error types shared across the messaging cluster crates.

use thiserror::Error;

/// Input-validation and parsing errors raised at system boundaries.
///
/// These correspond to spec §7's `InvalidInput` taxonomy entry: rejected at
/// the boundary, with no state change on either side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A message id was null, blank, or otherwise not a usable identifier.
    #[error("message id must not be blank")]
    BlankMessageId,

    /// Sender, receiver, or content was empty after trimming.
    #[error("{field} must not be blank")]
    BlankField {
        /// Name of the offending field (`sender`, `receiver`, or `content`).
        field: &'static str,
    },

    /// A node id did not match `node-[1-9][0-9]*`.
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    /// A port fell outside `[1024, 65535]`.
    #[error("invalid port: {0} (must be in 1024..=65535)")]
    InvalidPort(u32),
}

/// Result alias used throughout the messaging-cluster crates.
pub type Result<T> = std::result::Result<T, Error>;
