//! Metadata self-heal orchestration.
//!
//! One heal attempt walks these phases:
//!
//! 1. `Probing`: try-lock the shared self-heal domain. Fewer than quorum
//!    replicas means another healer owns the object or connectivity is
//!    short; abort.
//! 2. `Locking`: take the metadata transaction lock on the sentinel range.
//! 3. `Preparing`: discover fresh snapshots, classify, finalize the source,
//!    then release the transaction lock.
//! 4. `Healing`: copy the source's metadata onto the healable sinks.
//! 5. `Committing`: reconcile pending markers with what converged.
//! 6. `Done` or `Aborted`, after releasing the probe lock.
//!
//! Every lock taken is released before `heal` returns, on every path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::classify::{Direction, DirectionClassifier, TransactionKind};
use crate::config::HealConfig;
use crate::error::{HealError, Result};
use crate::executor::HealExecutor;
use crate::finalize::{finalize_source, SourceSelection};
use crate::lock::{InodeLocker, LockCoordinator, LockOwner, LockRange};
use crate::mask::ReplicaMask;
use crate::metrics::HealMetrics;
use crate::pending::{PendingCommitter, PendingUpdate};
use crate::replica::ReplicaAccessor;
use crate::types::{MetadataSnapshot, ObjectId, ObjectRef};

/// Phases of a heal attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealPhase {
    /// Not started.
    Idle,
    /// Taking the outer probe lock.
    Probing,
    /// Taking the metadata transaction lock.
    Locking,
    /// Discovering, classifying and picking a source under lock.
    Preparing,
    /// Repairing sinks.
    Healing,
    /// Updating pending markers.
    Committing,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Aborted,
}

impl fmt::Display for HealPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealPhase::Idle => "idle",
            HealPhase::Probing => "probing",
            HealPhase::Locking => "locking",
            HealPhase::Preparing => "preparing",
            HealPhase::Healing => "healing",
            HealPhase::Committing => "committing",
            HealPhase::Done => "done",
            HealPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Summary of what a successful attempt achieved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealOutcome {
    /// Replicas already agreed; nothing to heal.
    Clean,
    /// Every sink converged.
    Healed,
    /// Some sinks did not converge and keep their pending markers.
    Partial {
        /// Sinks left for a later attempt.
        unhealed: ReplicaMask,
    },
}

/// Result of a completed heal attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealReport {
    /// Object healed.
    pub object: ObjectId,
    /// Canonical source replica.
    pub source: usize,
    /// Final sources after finalization.
    pub sources: ReplicaMask,
    /// Final sinks after finalization.
    pub sinks: ReplicaMask,
    /// Sinks that converged this attempt.
    pub healed_sinks: ReplicaMask,
    /// Replicas that held the transaction lock.
    pub locked_on: ReplicaMask,
    /// Sources demoted for disagreeing with the canonical source.
    pub demoted: ReplicaMask,
    /// True when split brain was resolved by forced selection.
    pub forced: bool,
}

impl HealReport {
    /// Sinks that did not converge, including unlocked ones.
    pub fn unhealed_sinks(&self) -> ReplicaMask {
        self.sinks.difference(&self.healed_sinks)
    }

    /// Classifies the attempt.
    pub fn outcome(&self) -> HealOutcome {
        if !self.sinks.any() {
            return HealOutcome::Clean;
        }
        let unhealed = self.unhealed_sinks();
        if unhealed.any() {
            HealOutcome::Partial { unhealed }
        } else {
            HealOutcome::Healed
        }
    }
}

struct Prepared {
    direction: Direction,
    selection: SourceSelection,
    snapshots: Vec<Option<MetadataSnapshot>>,
    healed_sinks: ReplicaMask,
}

/// Drives metadata self-heal for objects of one replica set.
///
/// Holds no per-object state; heals of different objects may run
/// concurrently on the same healer.
pub struct MetadataHealer {
    config: HealConfig,
    replicas: Arc<dyn ReplicaAccessor>,
    classifier: Arc<dyn DirectionClassifier>,
    committer: Arc<dyn PendingCommitter>,
    locks: LockCoordinator,
    executor: HealExecutor,
    metrics: Arc<HealMetrics>,
}

impl MetadataHealer {
    /// Creates a healer after validating `config`.
    pub fn new(
        config: HealConfig,
        replicas: Arc<dyn ReplicaAccessor>,
        locker: Arc<dyn InodeLocker>,
        classifier: Arc<dyn DirectionClassifier>,
        committer: Arc<dyn PendingCommitter>,
    ) -> Result<Self> {
        Self::with_owner(config, replicas, locker, classifier, committer, LockOwner::random())
    }

    /// Creates a healer that locks as `owner`.
    pub fn with_owner(
        config: HealConfig,
        replicas: Arc<dyn ReplicaAccessor>,
        locker: Arc<dyn InodeLocker>,
        classifier: Arc<dyn DirectionClassifier>,
        committer: Arc<dyn PendingCommitter>,
        owner: LockOwner,
    ) -> Result<Self> {
        config.validate()?;
        let locks = LockCoordinator::with_owner(
            locker,
            replicas.replica_count(),
            Duration::from_millis(config.lock_wait_ms),
            owner,
        );
        let executor = HealExecutor::new(Arc::clone(&replicas), config.xattr_filter());
        Ok(Self {
            config,
            replicas,
            classifier,
            committer,
            locks,
            executor,
            metrics: Arc::new(HealMetrics::new()),
        })
    }

    /// Shares `metrics` with other healers.
    pub fn with_metrics(mut self, metrics: Arc<HealMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Heal counters.
    pub fn metrics(&self) -> &Arc<HealMetrics> {
        &self.metrics
    }

    /// Active configuration.
    pub fn config(&self) -> &HealConfig {
        &self.config
    }

    /// Runs one metadata heal attempt on `obj`.
    pub async fn heal(&self, obj: &ObjectRef) -> Result<HealReport> {
        let span = tracing::info_span!("metadata_heal", object = %obj.id);
        async {
            self.metrics.inc_attempts();
            let result = self.probe_and_heal(obj).await;
            self.record(&result);
            match &result {
                Ok(report) => {
                    enter(HealPhase::Done);
                    tracing::info!(
                        source = report.source,
                        sinks = %report.sinks,
                        healed_sinks = %report.healed_sinks,
                        "metadata heal finished"
                    );
                }
                Err(e) => {
                    enter(HealPhase::Aborted);
                    tracing::info!(error = %e, "metadata heal aborted");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn probe_and_heal(&self, obj: &ObjectRef) -> Result<HealReport> {
        enter(HealPhase::Probing);
        let probe = self.locks.try_lock(obj, &self.config.probe_domain).await;

        let result = if probe.count() < self.config.quorum {
            Err(HealError::InsufficientQuorum {
                phase: HealPhase::Probing,
                locked: probe.count(),
                required: self.config.quorum,
            })
        } else {
            self.heal_under_probe(obj).await
        };

        probe.release().await;
        result
    }

    async fn heal_under_probe(&self, obj: &ObjectRef) -> Result<HealReport> {
        enter(HealPhase::Locking);
        let txn = self
            .locks
            .lock(obj, &self.config.metadata_domain, LockRange::METADATA)
            .await;
        let locked_on = txn.locked_on().clone();

        let prepared = if txn.count() < self.config.quorum {
            Err(HealError::InsufficientQuorum {
                phase: HealPhase::Locking,
                locked: txn.count(),
                required: self.config.quorum,
            })
        } else {
            self.prepare(obj, &locked_on).await
        };

        // Only the decision needs the transaction lock.
        txn.release().await;
        let Prepared {
            direction,
            selection,
            snapshots,
            mut healed_sinks,
        } = prepared?;

        let source = selection.source;
        if healed_sinks.any() {
            enter(HealPhase::Healing);
            let source_attr = snapshots
                .get(source)
                .and_then(Option::as_ref)
                .map(|s| s.attr.clone())
                .ok_or(HealError::NoSource { object: obj.id })?;
            self.executor
                .heal(obj, source, &source_attr, &mut healed_sinks)
                .await?;
        }

        enter(HealPhase::Committing);
        let update = PendingUpdate {
            kind: TransactionKind::Metadata,
            sources: &direction.sources,
            sinks: &direction.sinks,
            healed_sinks: &healed_sinks,
            snapshots: &snapshots,
            locked_on: &locked_on,
        };
        self.committer
            .commit_pending(obj, update)
            .await
            .map_err(|e| match e {
                HealError::Commit { .. } => e,
                other => HealError::Commit {
                    reason: other.to_string(),
                    healed_sinks: healed_sinks.clone(),
                },
            })?;

        Ok(HealReport {
            object: obj.id,
            source,
            sources: direction.sources,
            sinks: direction.sinks,
            healed_sinks,
            locked_on,
            demoted: selection.demoted,
            forced: selection.forced,
        })
    }

    async fn prepare(&self, obj: &ObjectRef, locked_on: &ReplicaMask) -> Result<Prepared> {
        enter(HealPhase::Preparing);
        let snapshots = self.replicas.discover(obj).await?;

        let mut direction = self
            .classifier
            .classify(obj, &snapshots, locked_on, TransactionKind::Metadata)
            .await?;

        let selection = finalize_source(
            obj.id,
            self.config.split_brain_policy(),
            &mut direction,
            locked_on,
            &snapshots,
        )?;

        // Optimistic: narrowed as sink repairs fail.
        let healed_sinks = direction.sinks.and(locked_on);

        tracing::debug!(
            source = selection.source,
            sources = %direction.sources,
            sinks = %direction.sinks,
            healed_sinks = %healed_sinks,
            "heal direction decided"
        );

        Ok(Prepared {
            direction,
            selection,
            snapshots,
            healed_sinks,
        })
    }

    fn record(&self, result: &Result<HealReport>) {
        match result {
            Ok(report) => {
                match report.outcome() {
                    HealOutcome::Clean => self.metrics.inc_clean(),
                    HealOutcome::Healed => self.metrics.inc_healed(),
                    HealOutcome::Partial { .. } => self.metrics.inc_partial(),
                }
                if report.forced {
                    self.metrics.inc_forced_split_brain();
                }
                self.metrics.add_sinks(
                    report.healed_sinks.count() as u64,
                    report.unhealed_sinks().count() as u64,
                );
            }
            Err(HealError::InsufficientQuorum { .. }) => self.metrics.inc_insufficient_quorum(),
            Err(HealError::SplitBrain { .. }) => self.metrics.inc_split_brain(),
            Err(HealError::SourceUnreadable { .. }) => self.metrics.inc_source_failures(),
            Err(HealError::Commit { .. }) => self.metrics.inc_commit_failures(),
            Err(_) => self.metrics.inc_decision_failures(),
        }
    }
}

fn enter(phase: HealPhase) {
    tracing::debug!(phase = %phase, "heal phase");
}
