//! Changelog marker commit after a heal, consumed as an external contract.

use async_trait::async_trait;

use crate::classify::TransactionKind;
use crate::error::Result;
use crate::mask::ReplicaMask;
use crate::types::{MetadataSnapshot, ObjectRef};

/// Everything the committer needs to reconcile pending markers with what
/// actually converged.
#[derive(Debug, Clone, Copy)]
pub struct PendingUpdate<'a> {
    /// Changelog being reconciled.
    pub kind: TransactionKind,
    /// Final sources.
    pub sources: &'a ReplicaMask,
    /// Final sinks.
    pub sinks: &'a ReplicaMask,
    /// Sinks repaired by this attempt.
    pub healed_sinks: &'a ReplicaMask,
    /// Snapshots captured under the transaction lock.
    pub snapshots: &'a [Option<MetadataSnapshot>],
    /// Replicas that held the transaction lock.
    pub locked_on: &'a ReplicaMask,
}

/// Updates or clears pending markers once a heal has run.
///
/// Markers blaming a sink in `healed_sinks` are cleared; sinks that did not
/// converge keep theirs so a later attempt picks them up again.
#[async_trait]
pub trait PendingCommitter: Send + Sync {
    /// Commits the heal outcome to the changelog.
    async fn commit_pending(&self, obj: &ObjectRef, update: PendingUpdate<'_>) -> Result<()>;
}
