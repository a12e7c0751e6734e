//! End-to-end metadata heal scenarios against an in-memory replica set.
//!
//! These tests drive the full lock, classify, finalize, repair and commit
//! sequence and check what ends up on each replica.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TestCluster;
use mirrorfs_heal::error::ReplicaResult;
use mirrorfs_heal::lock::{LockCoordinator, LockRange};
use mirrorfs_heal::memory::{pending_key, MemoryCluster, ReplicaFaults};
use mirrorfs_heal::replica::ReplicaAccessor;
use mirrorfs_heal::types::{AttrMask, XattrMap};
use mirrorfs_heal::{
    HealConfig, HealError, HealOutcome, HealPhase, MetadataHealer, ObjectAttr, ObjectRef,
    ReplicaMask,
};

#[tokio::test]
async fn test_quorum_gate_leaves_metadata_untouched() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 7, 3, 0o644);
    tc.blame(0, 1);
    tc.cluster.set_down(1, true);
    tc.cluster.set_down(2, true);
    let before: Vec<ObjectAttr> = (0..3).map(|i| tc.attr(i)).collect();

    let healer = tc.healer(HealConfig::default());
    let err = healer.heal(&tc.obj).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        HealError::InsufficientQuorum {
            phase: HealPhase::Probing,
            ..
        }
    ));

    let after: Vec<ObjectAttr> = (0..3).map(|i| tc.attr(i)).collect();
    assert_eq!(before, after);
    assert_eq!(tc.mutations(3), vec![0, 0, 0]);
    assert_eq!(tc.cluster.held_locks(), 0);
}

#[tokio::test]
async fn test_quorum_gate_scales_with_replica_count() {
    let tc = TestCluster::new(5);
    for i in 1..5 {
        tc.cluster.set_down(i, true);
    }
    let healer = tc.healer(HealConfig::default());
    assert!(matches!(
        healer.heal(&tc.obj).await,
        Err(HealError::InsufficientQuorum { locked: 1, .. })
    ));

    // Two reachable replicas out of five are enough to proceed.
    tc.cluster.set_down(1, false);
    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.locked_on, ReplicaMask::from_indices(5, &[0, 1]));
}

#[tokio::test]
async fn test_transaction_lock_contention_aborts() {
    let tc = TestCluster::new(3);
    tc.blame(0, 1);

    // Another metadata transaction holds two of three replicas.
    let other = LockCoordinator::new(tc.cluster.clone(), 3, Duration::from_millis(50));
    let held = other
        .lock(&tc.obj, "mirrorfs.metadata", LockRange::METADATA)
        .await;
    assert_eq!(held.count(), 3);
    other
        .unlock(
            &tc.obj,
            "mirrorfs.metadata",
            LockRange::METADATA,
            &ReplicaMask::from_indices(3, &[0]),
        )
        .await;

    let healer = tc.healer(HealConfig {
        lock_wait_ms: 30,
        ..HealConfig::default()
    });
    match healer.heal(&tc.obj).await {
        Err(HealError::InsufficientQuorum {
            phase: HealPhase::Locking,
            locked: 1,
            ..
        }) => {}
        other => panic!("expected transaction InsufficientQuorum, got {:?}", other),
    }
    assert_eq!(tc.mutations(3), vec![0, 0, 0]);

    held.release().await;
    assert_eq!(tc.cluster.held_locks(), 0);
}

#[tokio::test]
async fn test_concurrent_healer_is_turned_away_by_probe() {
    let tc = TestCluster::new(3);
    tc.blame(0, 2);

    let other = LockCoordinator::new(tc.cluster.clone(), 3, Duration::from_millis(50));
    let probe = other.try_lock(&tc.obj, "mirrorfs.self-heal").await;
    assert_eq!(probe.count(), 3);

    let healer = tc.healer(HealConfig::default());
    assert!(matches!(
        healer.heal(&tc.obj).await,
        Err(HealError::InsufficientQuorum {
            phase: HealPhase::Probing,
            locked: 0,
            ..
        })
    ));
    assert_eq!(tc.pending(0, 2), 1);

    probe.release().await;
    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.outcome(), HealOutcome::Healed);
}

#[tokio::test]
async fn test_convergence_onto_stale_sinks() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 7, 3, 0o644);
    tc.set_xattr(0, "user.author", b"alice");
    tc.set_xattr(0, "user.project", b"mirrorfs");
    tc.set_attr(1, 1, 1, 0o600);
    tc.set_xattr(1, "user.author", b"bob");
    tc.set_attr(2, 0, 0, 0o777);
    tc.blame(0, 1);
    tc.blame(0, 2);

    let healer = tc.healer(HealConfig::default());
    let report = healer.heal(&tc.obj).await.unwrap();

    assert_eq!(report.source, 0);
    assert_eq!(report.sinks, ReplicaMask::from_indices(3, &[1, 2]));
    assert_eq!(report.healed_sinks, report.sinks);
    assert_eq!(report.outcome(), HealOutcome::Healed);

    let source = tc.attr(0);
    for sink in 1..3 {
        assert!(tc.attr(sink).same_metadata(&source));
        assert_eq!(tc.user_xattrs(sink), tc.user_xattrs(0));
        // The source's own changelog markers never travel.
        assert!(!tc.xattrs(sink).contains_key(&pending_key(1)));
        assert!(!tc.xattrs(sink).contains_key(&pending_key(2)));
    }
    assert_eq!(tc.pending(0, 1), 0);
    assert_eq!(tc.pending(0, 2), 0);
    assert_eq!(tc.cluster.held_locks(), 0);
}

#[tokio::test]
async fn test_second_heal_is_a_noop() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 7, 3, 0o644);
    tc.set_xattr(0, "user.tag", b"x");
    tc.blame(0, 1);
    tc.blame(0, 2);

    let healer = tc.healer(HealConfig::default());
    healer.heal(&tc.obj).await.unwrap();
    let mutations = tc.mutations(3);
    let before: Vec<_> = (0..3).map(|i| tc.xattrs(i)).collect();

    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.outcome(), HealOutcome::Clean);
    assert!(!report.sinks.any());
    assert_eq!(report.sources, ReplicaMask::full(3));
    assert_eq!(tc.mutations(3), mutations);
    let after: Vec<_> = (0..3).map(|i| tc.xattrs(i)).collect();
    assert_eq!(before, after);

    let metrics = healer.metrics().snapshot();
    assert_eq!(metrics.healed, 1);
    assert_eq!(metrics.clean, 1);
}

#[tokio::test]
async fn test_stale_xattr_removed_from_sink() {
    let tc = TestCluster::new(2);
    tc.set_xattr(0, "user.keep", b"1");
    tc.set_xattr(1, "user.keep", b"old");
    tc.set_xattr(1, "user.stale", b"gone");
    tc.set_xattr(1, "trusted.mirrorfs.gfid-hint", b"internal");
    tc.blame(0, 1);

    let healer = tc.healer(HealConfig::default());
    healer.heal(&tc.obj).await.unwrap();

    let sink = tc.xattrs(1);
    assert!(!sink.contains_key("user.stale"));
    assert_eq!(sink.get("user.keep").map(Vec::as_slice), Some(&b"1"[..]));
    // Reserved keys on the sink are outside heal's reach.
    assert_eq!(
        sink.get("trusted.mirrorfs.gfid-hint").map(Vec::as_slice),
        Some(&b"internal"[..])
    );
}

#[tokio::test]
async fn test_security_label_never_propagated_or_removed() {
    let tc = TestCluster::new(3);
    tc.set_xattr(0, "security.selinux", b"system_u:object_r:src_t");
    tc.set_xattr(0, "user.a", b"1");
    tc.set_xattr(1, "security.selinux", b"system_u:object_r:sink_t");
    tc.blame(0, 1);
    tc.blame(0, 2);

    let healer = tc.healer(HealConfig::default());
    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.outcome(), HealOutcome::Healed);

    assert_eq!(
        tc.xattrs(1).get("security.selinux").map(Vec::as_slice),
        Some(&b"system_u:object_r:sink_t"[..])
    );
    assert!(!tc.xattrs(2).contains_key("security.selinux"));
    assert_eq!(tc.xattrs(2).get("user.a").map(Vec::as_slice), Some(&b"1"[..]));
}

#[tokio::test]
async fn test_split_brain_reported_when_not_forced() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 1, 0, 0o644);
    tc.set_attr(1, 2, 0, 0o644);
    tc.set_attr(2, 3, 0, 0o644);
    tc.blame_all(3);

    let healer = tc.healer(HealConfig::default());
    let err = healer.heal(&tc.obj).await.unwrap_err();
    assert!(err.needs_operator());
    assert!(matches!(err, HealError::SplitBrain { object } if object == tc.obj.id));

    assert_eq!(tc.mutations(3), vec![0, 0, 0]);
    assert_eq!(tc.attr(0).uid, 1);
    assert_eq!(tc.attr(1).uid, 2);
    assert_eq!(tc.attr(2).uid, 3);
    assert_eq!(tc.cluster.held_locks(), 0);
    assert_eq!(healer.metrics().snapshot().split_brain, 1);
}

#[tokio::test]
async fn test_split_brain_forced_picks_lowest_index() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 1, 0, 0o644);
    tc.set_attr(1, 2, 0, 0o644);
    tc.set_attr(2, 3, 0, 0o644);
    tc.blame_all(3);

    let healer = tc.forcing_healer();
    let report = healer.heal(&tc.obj).await.unwrap();
    assert!(report.forced);
    assert_eq!(report.source, 0);
    assert_eq!(report.sources, ReplicaMask::from_indices(3, &[0]));
    assert_eq!(report.sinks, ReplicaMask::from_indices(3, &[1, 2]));
    assert_eq!(report.healed_sinks, report.sinks);
    for i in 0..3 {
        assert_eq!(tc.attr(i).uid, 1);
    }

    // Markers are gone, so the next pass finds agreement.
    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.outcome(), HealOutcome::Clean);
    assert!(!report.forced);
    assert_eq!(healer.metrics().snapshot().forced_split_brain, 1);
}

#[tokio::test]
async fn test_split_brain_forced_skips_unlocked_replica() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 1, 0, 0o644);
    tc.set_attr(1, 2, 0, 0o644);
    tc.set_attr(2, 3, 0, 0o644);
    tc.blame_all(3);
    tc.cluster.set_down(0, true);

    let report = tc.forcing_healer().heal(&tc.obj).await.unwrap();
    assert_eq!(report.source, 1);
    assert_eq!(report.healed_sinks, ReplicaMask::from_indices(3, &[2]));
    assert_eq!(tc.attr(2).uid, 2);
    // Replica 0 was unreachable and still disagrees.
    assert_eq!(tc.attr(0).uid, 1);
}

#[tokio::test]
async fn test_partial_failure_is_isolated() {
    let tc = TestCluster::new(4);
    tc.set_attr(0, 7, 3, 0o644);
    for sink in 1..4 {
        tc.set_attr(sink, 9, 9, 0o600);
        tc.blame(0, sink);
    }
    tc.fail_setattr(2, true);

    let healer = tc.healer(HealConfig::default());
    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.sinks, ReplicaMask::from_indices(4, &[1, 2, 3]));
    assert_eq!(report.healed_sinks, ReplicaMask::from_indices(4, &[1, 3]));
    assert_eq!(
        report.outcome(),
        HealOutcome::Partial {
            unhealed: ReplicaMask::from_indices(4, &[2])
        }
    );

    assert!(tc.attr(1).same_metadata(&tc.attr(0)));
    assert!(tc.attr(3).same_metadata(&tc.attr(0)));
    assert_eq!(tc.attr(2).uid, 9);
    assert_eq!(tc.pending(0, 1), 0);
    assert_eq!(tc.pending(0, 2), 1);
    assert_eq!(tc.pending(0, 3), 0);

    // Once the fault clears, a retry finishes the job.
    tc.fail_setattr(2, false);
    let report = healer.heal(&tc.obj).await.unwrap();
    assert_eq!(report.healed_sinks, ReplicaMask::from_indices(4, &[2]));
    assert!(tc.attr(2).same_metadata(&tc.attr(0)));
    assert_eq!(tc.pending(0, 2), 0);

    let metrics = healer.metrics().snapshot();
    assert_eq!(metrics.partial, 1);
    assert_eq!(metrics.sinks_healed, 3);
    assert_eq!(metrics.sinks_failed, 1);
}

#[tokio::test]
async fn test_xattr_write_failure_clears_bit() {
    let tc = TestCluster::new(3);
    tc.set_xattr(0, "user.a", b"1");
    tc.blame(0, 1);
    tc.blame(0, 2);
    tc.cluster.set_faults(
        1,
        ReplicaFaults {
            fail_setxattr: true,
            ..Default::default()
        },
    );

    let report = tc.healer(HealConfig::default()).heal(&tc.obj).await.unwrap();
    assert_eq!(report.healed_sinks, ReplicaMask::from_indices(3, &[2]));
    assert_eq!(tc.pending(0, 1), 1);
}

#[tokio::test]
async fn test_unreachable_sink_keeps_marker() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 7, 3, 0o644);
    tc.blame(0, 1);
    tc.blame(0, 2);
    tc.cluster.set_down(2, true);

    let report = tc.healer(HealConfig::default()).heal(&tc.obj).await.unwrap();
    assert!(!report.locked_on.get(2));
    assert!(!report.healed_sinks.get(2));
    assert_eq!(report.healed_sinks, ReplicaMask::from_indices(3, &[1]));
    assert_eq!(tc.pending(0, 2), 1);
    assert_eq!(tc.mutations(3)[2], 0);
}

#[tokio::test]
async fn test_divergent_sources_demoted() {
    let tc = TestCluster::new(2);
    tc.set_attr(0, 7, 3, 0o644);
    tc.set_attr(1, 7, 3, 0o600);

    let report = tc.healer(HealConfig::default()).heal(&tc.obj).await.unwrap();
    assert_eq!(report.source, 0);
    assert_eq!(report.demoted, ReplicaMask::from_indices(2, &[1]));
    assert_eq!(report.sinks, ReplicaMask::from_indices(2, &[1]));
    assert_eq!(report.outcome(), HealOutcome::Healed);
    assert_eq!(tc.attr(1).mode, 0o644);
}

#[tokio::test]
async fn test_commit_failure_surfaces_after_repair() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 7, 3, 0o644);
    tc.blame(0, 1);
    tc.cluster.set_fail_commit(true);

    let healer = tc.healer(HealConfig::default());
    match healer.heal(&tc.obj).await {
        Err(HealError::Commit { healed_sinks, .. }) => {
            // Replica 2 is an unblamed source that disagrees with 0, so it
            // is demoted and repaired alongside the blamed sink.
            assert_eq!(healed_sinks, ReplicaMask::from_indices(3, &[1, 2]));
        }
        other => panic!("expected Commit error, got {:?}", other),
    }
    assert!(tc.attr(1).same_metadata(&tc.attr(0)));
    assert!(tc.attr(2).same_metadata(&tc.attr(0)));
    assert_eq!(tc.pending(0, 1), 1);
    assert_eq!(tc.cluster.held_locks(), 0);
    assert_eq!(healer.metrics().snapshot().commit_failures, 1);
}

#[tokio::test]
async fn test_independent_objects_heal_concurrently() {
    let tc = TestCluster::new(3);
    let other = ObjectRef::new(mirrorfs_heal::ObjectId::random());
    for i in 0..3 {
        tc.cluster
            .insert(i, ObjectAttr::file(other.id, 5, 5, 0o640), XattrMap::new());
    }
    tc.set_attr(0, 7, 3, 0o644);
    tc.set_attr(2, 7, 3, 0o644);
    tc.blame(0, 1);
    tc.cluster.mark_pending(other.id, 2, 0, 1);

    let healer = tc.healer(HealConfig::default());
    let (a, b) = tokio::join!(healer.heal(&tc.obj), healer.heal(&other));
    assert_eq!(a.unwrap().healed_sinks, ReplicaMask::from_indices(3, &[1]));
    assert_eq!(b.unwrap().healed_sinks, ReplicaMask::from_indices(3, &[0]));
    assert_eq!(tc.cluster.held_locks(), 0);
}

#[tokio::test]
async fn test_dropped_guard_releases_in_background() {
    let tc = TestCluster::new(3);
    let coord = LockCoordinator::new(tc.cluster.clone(), 3, Duration::from_millis(50));
    {
        let guard = coord.try_lock(&tc.obj, "mirrorfs.self-heal").await;
        assert_eq!(guard.count(), 3);
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tc.cluster.held_locks(), 0);
}

/// Serves the first `get_xattrs` per replica, then fails the source's.
struct SourceGoesDark {
    inner: Arc<MemoryCluster>,
    source: usize,
    source_reads: AtomicUsize,
}

#[async_trait]
impl ReplicaAccessor for SourceGoesDark {
    fn replica_count(&self) -> usize {
        self.inner.replica_count()
    }

    async fn get_attributes(&self, replica: usize, obj: &ObjectRef) -> ReplicaResult<ObjectAttr> {
        self.inner.get_attributes(replica, obj).await
    }

    async fn set_attributes(
        &self,
        replica: usize,
        obj: &ObjectRef,
        attr: &ObjectAttr,
        mask: AttrMask,
    ) -> ReplicaResult<()> {
        self.inner.set_attributes(replica, obj, attr, mask).await
    }

    async fn get_xattrs(&self, replica: usize, obj: &ObjectRef) -> ReplicaResult<XattrMap> {
        if replica == self.source && self.source_reads.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(mirrorfs_heal::ReplicaError::TimedOut);
        }
        self.inner.get_xattrs(replica, obj).await
    }

    async fn set_xattrs(
        &self,
        replica: usize,
        obj: &ObjectRef,
        xattrs: &XattrMap,
    ) -> ReplicaResult<()> {
        self.inner.set_xattrs(replica, obj, xattrs).await
    }

    async fn remove_xattrs(
        &self,
        replica: usize,
        obj: &ObjectRef,
        names: &[String],
    ) -> ReplicaResult<()> {
        self.inner.remove_xattrs(replica, obj, names).await
    }
}

#[tokio::test]
async fn test_unreadable_source_aborts_before_commit() {
    let tc = TestCluster::new(3);
    tc.set_attr(0, 7, 3, 0o644);
    tc.blame(0, 1);

    let accessor = Arc::new(SourceGoesDark {
        inner: tc.cluster.clone(),
        source: 0,
        source_reads: AtomicUsize::new(0),
    });
    let healer = MetadataHealer::new(
        HealConfig::default(),
        accessor,
        tc.cluster.clone(),
        tc.cluster.clone(),
        tc.cluster.clone(),
    )
    .unwrap();

    match healer.heal(&tc.obj).await {
        Err(HealError::SourceUnreadable { replica: 0, .. }) => {}
        other => panic!("expected SourceUnreadable, got {:?}", other),
    }
    assert_eq!(tc.mutations(3), vec![0, 0, 0]);
    assert_eq!(tc.pending(0, 1), 1);
    assert_eq!(tc.cluster.held_locks(), 0);
}

#[tokio::test]
async fn test_config_from_json_drives_filter() {
    let tc = TestCluster::new(2);
    tc.set_xattr(0, "user.a", b"1");
    tc.set_xattr(0, "user.internal.x", b"secret");
    tc.blame(0, 1);

    let config = HealConfig::from_json(
        r#"{"reserved_xattr_prefixes": ["trusted.mirrorfs.", "user.internal."]}"#,
    )
    .unwrap();
    tc.healer(config).heal(&tc.obj).await.unwrap();

    assert!(tc.xattrs(1).contains_key("user.a"));
    assert!(!tc.xattrs(1).contains_key("user.internal.x"));
}
