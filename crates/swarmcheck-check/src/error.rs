//! Error types for consistency checks.

use thiserror::Error;

use crate::node::NodeError;
use crate::report::CheckReport;
use swarmcheck_dht::Address;

/// Result type for check operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while arranging, running or asserting a check.
#[derive(Debug, Error)]
pub enum Error {
    /// Precondition failure from the DHT model.
    #[error(transparent)]
    Dht(#[from] swarmcheck_dht::Error),

    /// A collaborator call against a node failed.
    #[error("node {node}: {source}")]
    Node {
        node: String,
        #[source]
        source: NodeError,
    },

    /// The retry budget ran out before the expected state was observed.
    #[error("exceeded retry budget after {attempts} attempts{}", describe_last(.last))]
    ExceededRetries {
        attempts: usize,
        last: Option<Box<Error>>,
    },

    /// The deadline governing the check invocation expired.
    #[error("check deadline exceeded")]
    DeadlineExceeded,

    /// Replica prediction produced no holders for a chunk.
    #[error("no designated replicators for chunk {chunk}")]
    NoDesignatedReplicators { chunk: Address },

    /// Target-hinted retrieval did not bring the chunk back.
    #[error("chunk recovery failed for {chunk}: {reason}")]
    RecoveryFailed { chunk: Address, reason: String },

    /// Downloaded data differs from what was uploaded.
    #[error("data mismatch for chunk {chunk} from node {node}")]
    DataMismatch { chunk: Address, node: String },

    /// The cluster cannot host the check.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Check options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// One or more assertions failed; the report enumerates them.
    #[error("{0}")]
    CheckFailed(Box<CheckReport>),

    /// Report serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether a retry loop may treat this error as "not yet".
    ///
    /// Collaborator failures are transient; everything else is a
    /// precondition, an invariant violation or the deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Node { .. })
    }

    /// Whether this error stops the whole check rather than one chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DeadlineExceeded | Error::Dht(_) | Error::Precondition(_))
    }
}

fn describe_last(last: &Option<Box<Error>>) -> String {
    last.as_ref().map(|e| format!(": last error: {e}")).unwrap_or_default()
}

/// Attach the node name to collaborator errors.
pub trait NodeResultExt<T> {
    fn on(self, node: &str) -> Result<T>;
}

impl<T> NodeResultExt<T> for std::result::Result<T, NodeError> {
    fn on(self, node: &str) -> Result<T> {
        self.map_err(|source| Error::Node {
            node: node.to_string(),
            source,
        })
    }
}
