//! In-process replica set.
//!
//! Holds every replica's copy of each object in memory and implements all
//! heal collaborators against it: metadata access, advisory locking,
//! changelog classification and pending-marker commit. Faults can be
//! switched on per replica. It does not persist anything.
//!
//! Pending markers live in each replica's extended attributes under
//! [`PENDING_XATTR_PREFIX`]: key `<prefix><j>` on replica `i` holds a
//! big-endian u64 count of metadata updates replica `j` missed, as seen by `i`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::classify::{Direction, DirectionClassifier, TransactionKind};
use crate::error::{HealError, ReplicaError, ReplicaResult, Result};
use crate::lock::{InodeLocker, LockOwner, LockRange};
use crate::mask::ReplicaMask;
use crate::pending::{PendingCommitter, PendingUpdate};
use crate::replica::ReplicaAccessor;
use crate::types::{AttrMask, MetadataSnapshot, ObjectAttr, ObjectId, ObjectRef, XattrMap};

/// Prefix of the per-replica pending-marker xattrs.
pub const PENDING_XATTR_PREFIX: &str = "trusted.mirrorfs.pending.";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Returns the xattr key under which a witness records blame of `blamed`.
pub fn pending_key(blamed: usize) -> String {
    format!("{}{}", PENDING_XATTR_PREFIX, blamed)
}

/// Fault switches for one replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaFaults {
    /// Every operation fails with `Disconnected`.
    pub down: bool,
    /// Lock requests fail with `Contended`.
    pub fail_lock: bool,
    /// set-attributes fails.
    pub fail_setattr: bool,
    /// get-xattrs fails.
    pub fail_getxattr: bool,
    /// set-xattrs fails.
    pub fail_setxattr: bool,
    /// remove-xattrs fails.
    pub fail_removexattr: bool,
}

#[derive(Default)]
struct MemoryReplica {
    objects: RwLock<HashMap<ObjectId, MetadataSnapshot>>,
    faults: RwLock<ReplicaFaults>,
    mutations: AtomicU64,
}

type LockKey = (usize, ObjectId, String);

/// In-memory replica set implementing every heal collaborator.
pub struct MemoryCluster {
    replicas: Vec<MemoryReplica>,
    locks: DashMap<LockKey, Vec<(LockRange, LockOwner)>>,
    fail_classify: AtomicBool,
    fail_commit: AtomicBool,
}

fn poisoned(op: &'static str, e: impl std::fmt::Display) -> ReplicaError {
    ReplicaError::Failed {
        op,
        reason: e.to_string(),
    }
}

impl MemoryCluster {
    /// Creates an empty replica set of `replicas` replicas.
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: (0..replicas).map(|_| MemoryReplica::default()).collect(),
            locks: DashMap::new(),
            fail_classify: AtomicBool::new(false),
            fail_commit: AtomicBool::new(false),
        }
    }

    fn replica(&self, i: usize, op: &'static str) -> ReplicaResult<&MemoryReplica> {
        let replica = self.replicas.get(i).ok_or_else(|| ReplicaError::Failed {
            op,
            reason: format!("no replica {}", i),
        })?;
        let faults = *replica.faults.read().map_err(|e| poisoned(op, e))?;
        if faults.down {
            return Err(ReplicaError::Disconnected);
        }
        Ok(replica)
    }

    fn faults(&self, i: usize, op: &'static str) -> ReplicaResult<ReplicaFaults> {
        let replica = self.replica(i, op)?;
        let faults = *replica.faults.read().map_err(|e| poisoned(op, e))?;
        Ok(faults)
    }

    /// Stores `attr` and `xattrs` as replica `i`'s copy of the object.
    pub fn insert(&self, i: usize, attr: ObjectAttr, xattrs: XattrMap) {
        if let Some(replica) = self.replicas.get(i) {
            if let Ok(mut objects) = replica.objects.write() {
                objects.insert(attr.id, MetadataSnapshot::new(attr, xattrs));
            }
        }
    }

    /// Replica `i`'s current copy, bypassing faults.
    pub fn snapshot(&self, i: usize, id: ObjectId) -> Option<MetadataSnapshot> {
        let replica = self.replicas.get(i)?;
        let objects = replica.objects.read().ok()?;
        objects.get(&id).cloned()
    }

    /// Records on `witness` that `blamed` missed `count` metadata updates.
    pub fn mark_pending(&self, id: ObjectId, witness: usize, blamed: usize, count: u64) {
        if let Some(replica) = self.replicas.get(witness) {
            if let Ok(mut objects) = replica.objects.write() {
                if let Some(obj) = objects.get_mut(&id) {
                    if count == 0 {
                        obj.xattrs.remove(&pending_key(blamed));
                    } else {
                        obj.xattrs
                            .insert(pending_key(blamed), count.to_be_bytes().to_vec());
                    }
                }
            }
        }
    }

    /// Pending count `witness` holds against `blamed`.
    pub fn pending(&self, id: ObjectId, witness: usize, blamed: usize) -> u64 {
        self.snapshot(witness, id)
            .and_then(|s| s.xattrs.get(&pending_key(blamed)).cloned())
            .and_then(|v| decode_pending(&v))
            .unwrap_or(0)
    }

    /// Replaces replica `i`'s fault switches.
    pub fn set_faults(&self, i: usize, faults: ReplicaFaults) {
        if let Some(replica) = self.replicas.get(i) {
            if let Ok(mut f) = replica.faults.write() {
                *f = faults;
            }
        }
    }

    /// Takes replica `i` offline or brings it back.
    pub fn set_down(&self, i: usize, down: bool) {
        if let Some(replica) = self.replicas.get(i) {
            if let Ok(mut f) = replica.faults.write() {
                f.down = down;
            }
        }
    }

    /// Makes classification fail.
    pub fn set_fail_classify(&self, fail: bool) {
        self.fail_classify.store(fail, Ordering::SeqCst);
    }

    /// Makes pending-marker commit fail.
    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Number of attribute and xattr writes replica `i` has accepted.
    pub fn mutations(&self, i: usize) -> u64 {
        self.replicas
            .get(i)
            .map(|r| r.mutations.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Total lock entries currently held across every replica and domain.
    pub fn held_locks(&self) -> usize {
        self.locks.iter().map(|e| e.value().len()).sum()
    }

    /// Lock entries held on one replica for one object and domain.
    pub fn locks_on(&self, i: usize, id: ObjectId, domain: &str) -> usize {
        self.locks
            .get(&(i, id, domain.to_string()))
            .map(|e| e.value().len())
            .unwrap_or(0)
    }

    fn with_object<T>(
        &self,
        i: usize,
        id: ObjectId,
        op: &'static str,
        f: impl FnOnce(&mut MetadataSnapshot) -> T,
    ) -> ReplicaResult<T> {
        let replica = self.replica(i, op)?;
        let mut objects = replica.objects.write().map_err(|e| poisoned(op, e))?;
        let obj = objects.get_mut(&id).ok_or(ReplicaError::NotFound)?;
        Ok(f(obj))
    }

    fn record_mutation(&self, i: usize) {
        if let Some(replica) = self.replicas.get(i) {
            replica.mutations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn decode_pending(value: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[async_trait]
impl ReplicaAccessor for MemoryCluster {
    fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    async fn get_attributes(&self, replica: usize, obj: &ObjectRef) -> ReplicaResult<ObjectAttr> {
        self.with_object(replica, obj.id, "stat", |o| o.attr.clone())
    }

    async fn set_attributes(
        &self,
        replica: usize,
        obj: &ObjectRef,
        attr: &ObjectAttr,
        mask: AttrMask,
    ) -> ReplicaResult<()> {
        if self.faults(replica, "setattr")?.fail_setattr {
            return Err(ReplicaError::Failed {
                op: "setattr",
                reason: "injected fault".to_string(),
            });
        }
        self.with_object(replica, obj.id, "setattr", |o| o.attr.apply(attr, mask))?;
        self.record_mutation(replica);
        Ok(())
    }

    async fn get_xattrs(&self, replica: usize, obj: &ObjectRef) -> ReplicaResult<XattrMap> {
        if self.faults(replica, "getxattr")?.fail_getxattr {
            return Err(ReplicaError::Failed {
                op: "getxattr",
                reason: "injected fault".to_string(),
            });
        }
        self.with_object(replica, obj.id, "getxattr", |o| o.xattrs.clone())
    }

    async fn set_xattrs(
        &self,
        replica: usize,
        obj: &ObjectRef,
        xattrs: &XattrMap,
    ) -> ReplicaResult<()> {
        if self.faults(replica, "setxattr")?.fail_setxattr {
            return Err(ReplicaError::Failed {
                op: "setxattr",
                reason: "injected fault".to_string(),
            });
        }
        self.with_object(replica, obj.id, "setxattr", |o| {
            for (k, v) in xattrs {
                o.xattrs.insert(k.clone(), v.clone());
            }
        })?;
        self.record_mutation(replica);
        Ok(())
    }

    async fn remove_xattrs(
        &self,
        replica: usize,
        obj: &ObjectRef,
        names: &[String],
    ) -> ReplicaResult<()> {
        if self.faults(replica, "removexattr")?.fail_removexattr {
            return Err(ReplicaError::Failed {
                op: "removexattr",
                reason: "injected fault".to_string(),
            });
        }
        self.with_object(replica, obj.id, "removexattr", |o| {
            for name in names {
                o.xattrs.remove(name);
            }
        })?;
        self.record_mutation(replica);
        Ok(())
    }
}

#[async_trait]
impl InodeLocker for MemoryCluster {
    async fn try_lock(
        &self,
        replica: usize,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        owner: LockOwner,
    ) -> ReplicaResult<()> {
        if self.faults(replica, "inodelk")?.fail_lock {
            return Err(ReplicaError::Contended);
        }
        let mut held = self
            .locks
            .entry((replica, obj.id, domain.to_string()))
            .or_default();
        if held
            .iter()
            .any(|(r, o)| *o != owner && r.overlaps(&range))
        {
            return Err(ReplicaError::Contended);
        }
        if !held.iter().any(|(r, o)| *o == owner && *r == range) {
            held.push((range, owner));
        }
        Ok(())
    }

    async fn lock(
        &self,
        replica: usize,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        owner: LockOwner,
    ) -> ReplicaResult<()> {
        loop {
            match self.try_lock(replica, obj, domain, range, owner).await {
                Err(ReplicaError::Contended) => tokio::time::sleep(LOCK_RETRY_INTERVAL).await,
                other => return other,
            }
        }
    }

    async fn unlock(
        &self,
        replica: usize,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        owner: LockOwner,
    ) -> ReplicaResult<()> {
        self.replica(replica, "uninodelk")?;
        let key = (replica, obj.id, domain.to_string());
        if let Some(mut held) = self.locks.get_mut(&key) {
            if let Some(pos) = held.iter().position(|(r, o)| *o == owner && *r == range) {
                held.remove(pos);
            }
        }
        self.locks.remove_if(&key, |_, held| held.is_empty());
        Ok(())
    }
}

#[async_trait]
impl DirectionClassifier for MemoryCluster {
    async fn classify(
        &self,
        obj: &ObjectRef,
        snapshots: &[Option<MetadataSnapshot>],
        locked_on: &ReplicaMask,
        kind: TransactionKind,
    ) -> Result<Direction> {
        if self.fail_classify.load(Ordering::SeqCst) {
            return Err(HealError::Classification {
                reason: "injected fault".to_string(),
            });
        }
        if kind != TransactionKind::Metadata {
            return Err(HealError::Classification {
                reason: format!("{:?} changelog not tracked", kind),
            });
        }

        let n = locked_on.len();
        let witnesses: Vec<usize> = locked_on
            .iter_set()
            .filter(|&i| snapshots.get(i).map_or(false, Option::is_some))
            .collect();

        let mut blamed = ReplicaMask::new(n);
        for &w in &witnesses {
            let snap = match snapshots.get(w).and_then(Option::as_ref) {
                Some(s) => s,
                None => continue,
            };
            for (key, value) in &snap.xattrs {
                let Some(target) = key.strip_prefix(PENDING_XATTR_PREFIX) else {
                    continue;
                };
                let target: usize = target.parse().map_err(|_| HealError::Classification {
                    reason: format!("malformed pending key {} on replica {}", key, w),
                })?;
                let count = decode_pending(value).ok_or_else(|| HealError::Classification {
                    reason: format!("malformed pending value for {} on replica {}", key, w),
                })?;
                if count > 0 && target != w {
                    blamed.set(target);
                }
            }
        }

        let mut sources = ReplicaMask::new(n);
        let mut sinks = ReplicaMask::new(n);
        for &i in &witnesses {
            if blamed.get(i) {
                sinks.set(i);
            } else {
                sources.set(i);
            }
        }

        tracing::debug!(object = %obj.id, sources = %sources, sinks = %sinks, "classified");
        Ok(Direction::new(sources, sinks))
    }
}

#[async_trait]
impl PendingCommitter for MemoryCluster {
    async fn commit_pending(&self, obj: &ObjectRef, update: PendingUpdate<'_>) -> Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(HealError::Commit {
                reason: "injected fault".to_string(),
                healed_sinks: update.healed_sinks.clone(),
            });
        }

        // Sources and healed sinks now agree; clear blame among them.
        let converged: Vec<usize> = (0..update.sources.len())
            .filter(|&i| update.sources.get(i) || update.healed_sinks.get(i))
            .collect();

        for &witness in &converged {
            if !update.locked_on.get(witness) {
                continue;
            }
            let cleared = self
                .with_object(witness, obj.id, "xattrop", |o| {
                    let before = o.xattrs.len();
                    for &j in &converged {
                        o.xattrs.remove(&pending_key(j));
                    }
                    before != o.xattrs.len()
                })
                .map_err(|e| HealError::Commit {
                    reason: format!("replica {}: {}", witness, e),
                    healed_sinks: update.healed_sinks.clone(),
                })?;
            if cleared {
                self.record_mutation(witness);
            }
        }
        Ok(())
    }
}
