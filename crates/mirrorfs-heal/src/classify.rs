//! Changelog-based heal direction, consumed as an external contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mask::ReplicaMask;
use crate::types::{MetadataSnapshot, ObjectRef};

/// Which changelog a heal reads and clears.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// File contents.
    Data,
    /// Ownership, permissions, type and extended attributes.
    Metadata,
    /// Directory entries.
    Entry,
}

/// Authoritative and lagging replicas, as derived from changelogs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Direction {
    /// Replicas whose metadata is authoritative.
    pub sources: ReplicaMask,
    /// Replicas whose metadata lags.
    pub sinks: ReplicaMask,
}

impl Direction {
    /// Creates a direction from the two masks.
    pub fn new(sources: ReplicaMask, sinks: ReplicaMask) -> Self {
        Self { sources, sinks }
    }
}

/// Classifies replicas into sources and sinks from pending-update counters.
///
/// Implementations only mark replicas that are set in `locked_on`; a
/// replica may be neither source nor sink. Indeterminate changelog state is
/// reported as [`crate::error::HealError::Classification`].
#[async_trait]
pub trait DirectionClassifier: Send + Sync {
    /// Computes sources and sinks for `kind`.
    async fn classify(
        &self,
        obj: &ObjectRef,
        snapshots: &[Option<MetadataSnapshot>],
        locked_on: &ReplicaMask,
        kind: TransactionKind,
    ) -> Result<Direction>;
}
