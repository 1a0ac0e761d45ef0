//! Error types for cluster coordination.

use thiserror::Error;

/// Coordinator errors. Per spec §7, the coordinator itself never surfaces
/// these to ordinary callers (`is_leader`, `current_leader`, `live_nodes`,
/// `store_message_metadata` all degrade to a default value and log); this
/// type exists for `connect`/`close`, the two calls a caller can't sensibly
/// ignore the failure of.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying coordination-service session could not be established
    /// or was lost and could not be rebuilt.
    #[error("coordination service session error: {0}")]
    Session(String),

    /// A required base path could not be created.
    #[error("failed to create base path {path}: {source}")]
    BasePath { path: String, source: String },

    /// This node's own election candidate vanished from `/leader`'s
    /// children between creation and the first listing (spec §7
    /// `InternalInvariantViolation`).
    #[error("own election candidate missing from /leader children")]
    OwnCandidateMissing,
}

/// Result alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;
