//! Error types for the metadata self-heal subsystem.

use thiserror::Error;

use crate::heal::HealPhase;
use crate::mask::ReplicaMask;
use crate::types::ObjectId;

/// Failure of a single operation against a single replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    /// The replica could not be reached.
    #[error("replica disconnected")]
    Disconnected,

    /// A lock is held by another owner.
    #[error("lock contended")]
    Contended,

    /// The operation did not complete in time.
    #[error("operation timed out")]
    TimedOut,

    /// The object does not exist on the replica.
    #[error("object not found")]
    NotFound,

    /// Any other replica-side failure.
    #[error("{op} failed: {reason}")]
    Failed {
        /// Operation name (e.g. "setattr").
        op: &'static str,
        /// Replica-provided reason.
        reason: String,
    },
}

/// Result type for a single replica operation.
pub type ReplicaResult<T> = std::result::Result<T, ReplicaError>;

/// Errors that abort a metadata heal attempt.
#[derive(Debug, Error)]
pub enum HealError {
    /// Fewer replicas than the quorum could be locked. Retry later.
    #[error("not enough connectivity in {phase}: locked {locked} of {required} required replicas")]
    InsufficientQuorum {
        /// Phase where the lock count fell short.
        phase: HealPhase,
        /// Replicas actually locked.
        locked: usize,
        /// Minimum required.
        required: usize,
    },

    /// Replicas disagree and no source can be derived; forced heal is off.
    #[error("metadata split brain on {object}")]
    SplitBrain {
        /// Object in split brain.
        object: ObjectId,
    },

    /// The changelog classifier could not determine heal direction.
    #[error("classification failed: {reason}")]
    Classification {
        /// Classifier-provided reason.
        reason: String,
    },

    /// Fresh metadata could not be discovered under lock.
    #[error("discovery failed: {reason}")]
    Discovery {
        /// Reason for the failure.
        reason: String,
    },

    /// No replica survived source finalization.
    #[error("no usable source for {object}")]
    NoSource {
        /// Object being healed.
        object: ObjectId,
    },

    /// The chosen source's extended attributes could not be read.
    #[error("source replica {replica} unreadable: {source}")]
    SourceUnreadable {
        /// Source replica index.
        replica: usize,
        /// Underlying replica failure.
        #[source]
        source: ReplicaError,
    },

    /// Pending markers could not be updated after repair.
    #[error("pending marker commit failed: {reason} (healed sinks {healed_sinks})")]
    Commit {
        /// Committer-provided reason.
        reason: String,
        /// Sinks whose metadata was already repaired.
        healed_sinks: ReplicaMask,
    },

    /// Invalid heal configuration.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },
}

impl HealError {
    /// True when the caller should simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HealError::InsufficientQuorum { .. })
    }

    /// True when the condition requires operator intervention.
    pub fn needs_operator(&self) -> bool {
        matches!(self, HealError::SplitBrain { .. })
    }
}

/// Result type alias for heal operations.
pub type Result<T> = std::result::Result<T, HealError>;
