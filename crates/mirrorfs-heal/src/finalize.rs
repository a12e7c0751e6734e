//! Source finalization.
//!
//! The changelog classifier can leave zero sources (split brain) or several
//! sources whose raw attributes still disagree. This module narrows that to
//! a single canonical source, demoting every disagreeing candidate to sink.

use serde::{Deserialize, Serialize};

use crate::classify::Direction;
use crate::config::SplitBrainPolicy;
use crate::error::{HealError, Result};
use crate::mask::ReplicaMask;
use crate::types::{MetadataSnapshot, ObjectId};

/// Outcome of source finalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSelection {
    /// Index of the canonical source.
    pub source: usize,
    /// True when split brain was resolved by promoting a sink.
    pub forced: bool,
    /// Former sources moved to sinks because their metadata disagreed.
    pub demoted: ReplicaMask,
}

/// Picks exactly one source, mutating `direction` in place.
///
/// Split brain is declared when every locked replica is a sink or there is
/// no source at all. Under [`SplitBrainPolicy::ForceLowestIndex`] the
/// lowest-indexed replica that is locked, a sink and has a snapshot becomes
/// the source;
/// this is an arbitrary tie-break, not a quality judgement.
///
/// The lowest-indexed source with a snapshot is the canonical baseline. Any
/// other source whose type, uid, gid or mode differs from it, or that has
/// no snapshot, is demoted to sink.
pub fn finalize_source(
    object: ObjectId,
    policy: SplitBrainPolicy,
    direction: &mut Direction,
    locked_on: &ReplicaMask,
    snapshots: &[Option<MetadataSnapshot>],
) -> Result<SourceSelection> {
    let replicas = locked_on.len();
    let locked_count = locked_on.count();
    let sources_count = direction.sources.count();
    let sinks_count = direction.sinks.count();

    let mut forced = false;
    if locked_count == sinks_count || sources_count == 0 {
        match policy {
            SplitBrainPolicy::Report => {
                tracing::warn!(
                    object = %object,
                    sources = %direction.sources,
                    sinks = %direction.sinks,
                    locked_on = %locked_on,
                    "metadata split brain"
                );
                return Err(HealError::SplitBrain { object });
            }
            SplitBrainPolicy::ForceLowestIndex => {
                let candidate = (0..replicas).find(|&i| {
                    locked_on.get(i)
                        && direction.sinks.get(i)
                        && snapshots.get(i).and_then(Option::as_ref).is_some()
                });
                if let Some(i) = candidate {
                    direction.sources.set(i);
                    direction.sinks.clear(i);
                    forced = true;
                    tracing::info!(
                        object = %object,
                        replica = i,
                        "metadata split brain, forcing lowest-indexed sink as source"
                    );
                }
            }
        }
    }

    let mut demoted = ReplicaMask::new(replicas);
    let mut canonical: Option<(usize, &MetadataSnapshot)> = None;

    let candidates: Vec<usize> = direction.sources.iter_set().collect();
    for i in candidates {
        let snapshot = snapshots.get(i).and_then(Option::as_ref);
        let keep = match (canonical, snapshot) {
            (_, None) => false,
            (None, Some(snap)) => {
                canonical = Some((i, snap));
                true
            }
            (Some((_, first)), Some(snap)) => first.attr.same_metadata(&snap.attr),
        };

        if !keep {
            direction.sources.clear(i);
            direction.sinks.set(i);
            demoted.set(i);
            tracing::info!(
                object = %object,
                replica = i,
                "demoting source whose metadata disagrees with canonical source"
            );
        }
    }

    match canonical {
        Some((source, _)) => Ok(SourceSelection {
            source,
            forced,
            demoted,
        }),
        None => Err(HealError::NoSource { object }),
    }
}
