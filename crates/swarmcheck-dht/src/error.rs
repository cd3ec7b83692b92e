//! Error types for the DHT model.

use thiserror::Error;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Precondition failures raised by the metric, selectors and predictor.
///
/// None of these are transient: each means the computation cannot be
/// carried out against the inputs it was given.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Two addresses of different widths were compared.
    #[error("address length mismatch: {left} vs {right} bytes")]
    LengthMismatch { left: usize, right: usize },

    /// A closest search was asked to pick from nothing.
    #[error("empty candidate set")]
    EmptyCandidateSet,

    /// Replica prediction against a snapshot with no nodes.
    #[error("topology snapshot has no nodes")]
    EmptyTopology,

    /// Too few distinct nodes for the requested selection.
    #[error("insufficient topology: {known} distinct nodes known, need at least {needed}")]
    InsufficientTopology { known: usize, needed: usize },

    /// Every candidate pair is connected, so no farthest unconnected pair exists.
    #[error("full connectivity: no pair of unconnected nodes around the anchor")]
    FullConnectivity,

    /// An address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
