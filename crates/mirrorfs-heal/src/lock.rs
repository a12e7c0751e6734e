//! Advisory inode locking across a replica set.
//!
//! The coordinator fans a lock request out to every replica, records which
//! ones granted it, and hands back a [`LockGuard`] that releases exactly the
//! granted replicas. Locks are cooperative: they only exclude healers that
//! use the same domain names.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReplicaError, ReplicaResult};
use crate::mask::ReplicaMask;
use crate::types::ObjectRef;

/// Byte range of an inode lock. `len == 0` extends to infinity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRange {
    /// First byte covered.
    pub start: u64,
    /// Number of bytes covered, 0 for unbounded.
    pub len: u64,
}

impl LockRange {
    /// Whole object.
    pub const WHOLE: LockRange = LockRange { start: 0, len: 0 };

    /// Sentinel range taken by metadata transactions. Sits past any real
    /// file offset so it only conflicts with other metadata transactions.
    pub const METADATA: LockRange = LockRange {
        start: i64::MAX as u64 - 1,
        len: 0,
    };

    /// Creates a bounded range.
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Exclusive end offset, `None` when unbounded.
    pub fn end(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.start.saturating_add(self.len))
        }
    }

    /// True when the two ranges share at least one byte.
    pub fn overlaps(&self, other: &LockRange) -> bool {
        let starts_before_other_ends = other.end().map_or(true, |end| self.start < end);
        let other_starts_before_self_ends = self.end().map_or(true, |end| other.start < end);
        starts_before_other_ends && other_starts_before_self_ends
    }
}

impl fmt::Display for LockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, inf)", self.start),
        }
    }
}

/// Identity of a lock holder. Locks held by the same owner never conflict.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner(Uuid);

impl LockOwner {
    /// Generates a fresh owner identity.
    pub fn random() -> Self {
        LockOwner(Uuid::new_v4())
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exclusive inode lock primitive on a single replica.
#[async_trait]
pub trait InodeLocker: Send + Sync {
    /// Takes the lock or fails immediately with [`ReplicaError::Contended`].
    async fn try_lock(
        &self,
        replica: usize,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        owner: LockOwner,
    ) -> ReplicaResult<()>;

    /// Takes the lock, waiting out contention. The coordinator bounds the wait.
    async fn lock(
        &self,
        replica: usize,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        owner: LockOwner,
    ) -> ReplicaResult<()>;

    /// Drops a lock taken by `owner`. Unlocking a lock that is not held succeeds.
    async fn unlock(
        &self,
        replica: usize,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        owner: LockOwner,
    ) -> ReplicaResult<()>;
}

/// Fans lock operations out across every replica of a set.
pub struct LockCoordinator {
    locker: Arc<dyn InodeLocker>,
    replicas: usize,
    owner: LockOwner,
    lock_wait: Duration,
}

impl LockCoordinator {
    /// Creates a coordinator with a fresh owner identity.
    pub fn new(locker: Arc<dyn InodeLocker>, replicas: usize, lock_wait: Duration) -> Self {
        Self::with_owner(locker, replicas, lock_wait, LockOwner::random())
    }

    /// Creates a coordinator acting as `owner`.
    pub fn with_owner(
        locker: Arc<dyn InodeLocker>,
        replicas: usize,
        lock_wait: Duration,
        owner: LockOwner,
    ) -> Self {
        Self {
            locker,
            replicas,
            owner,
            lock_wait,
        }
    }

    /// Number of replicas the coordinator addresses.
    pub fn replica_count(&self) -> usize {
        self.replicas
    }

    /// Non-blocking whole-object lock on every replica.
    pub async fn try_lock(&self, obj: &ObjectRef, domain: &str) -> LockGuard {
        self.acquire(obj, domain, LockRange::WHOLE, false).await
    }

    /// Lock on every replica, waiting up to the configured bound per replica.
    pub async fn lock(&self, obj: &ObjectRef, domain: &str, range: LockRange) -> LockGuard {
        self.acquire(obj, domain, range, true).await
    }

    /// Best-effort release of `locked_on`. Never fails; per-replica errors
    /// are logged.
    pub async fn unlock(
        &self,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        locked_on: &ReplicaMask,
    ) {
        unlock_replicas(self.locker.as_ref(), obj, domain, range, self.owner, locked_on).await;
    }

    async fn acquire(
        &self,
        obj: &ObjectRef,
        domain: &str,
        range: LockRange,
        blocking: bool,
    ) -> LockGuard {
        let locker = self.locker.as_ref();
        let owner = self.owner;
        let wait = self.lock_wait;

        // Every replica is attempted before anything is counted.
        let results = join_all((0..self.replicas).map(|i| async move {
            let res = if blocking {
                match tokio::time::timeout(wait, locker.lock(i, obj, domain, range, owner)).await {
                    Ok(res) => res,
                    Err(_) => Err(ReplicaError::TimedOut),
                }
            } else {
                locker.try_lock(i, obj, domain, range, owner).await
            };
            (i, res)
        }))
        .await;

        let mut locked = ReplicaMask::new(self.replicas);
        for (i, res) in results {
            match res {
                Ok(()) => locked.set(i),
                Err(e) => {
                    tracing::debug!(replica = i, domain, error = %e, "lock not granted");
                }
            }
        }

        tracing::debug!(
            object = %obj.id,
            domain,
            range = %range,
            locked_on = %locked,
            "lock fan-out complete"
        );

        LockGuard {
            locker: Arc::clone(&self.locker),
            obj: obj.clone(),
            domain: domain.to_string(),
            range,
            owner,
            locked,
            released: false,
        }
    }
}

async fn unlock_replicas(
    locker: &dyn InodeLocker,
    obj: &ObjectRef,
    domain: &str,
    range: LockRange,
    owner: LockOwner,
    locked_on: &ReplicaMask,
) {
    let results = join_all(locked_on.iter_set().map(|i| async move {
        (i, locker.unlock(i, obj, domain, range, owner).await)
    }))
    .await;

    for (i, res) in results {
        if let Err(e) = res {
            tracing::warn!(replica = i, object = %obj.id, domain, error = %e, "unlock failed");
        }
    }
}

/// Locks held on a subset of replicas.
///
/// Call [`LockGuard::release`] on every path. A guard dropped without
/// release (early return, panic) schedules the unlock on the current tokio
/// runtime instead.
pub struct LockGuard {
    locker: Arc<dyn InodeLocker>,
    obj: ObjectRef,
    domain: String,
    range: LockRange,
    owner: LockOwner,
    locked: ReplicaMask,
    released: bool,
}

impl LockGuard {
    /// Replicas that granted the lock.
    pub fn locked_on(&self) -> &ReplicaMask {
        &self.locked
    }

    /// Number of replicas that granted the lock.
    pub fn count(&self) -> usize {
        self.locked.count()
    }

    /// Releases every granted lock.
    pub async fn release(mut self) {
        self.released = true;
        unlock_replicas(
            self.locker.as_ref(),
            &self.obj,
            &self.domain,
            self.range,
            self.owner,
            &self.locked,
        )
        .await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released || !self.locked.any() {
            return;
        }
        self.released = true;

        let locker = Arc::clone(&self.locker);
        let obj = self.obj.clone();
        let domain = std::mem::take(&mut self.domain);
        let range = self.range;
        let owner = self.owner;
        let locked = self.locked.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(object = %obj.id, domain = %domain, "lock guard dropped unreleased");
                handle.spawn(async move {
                    unlock_replicas(locker.as_ref(), &obj, &domain, range, owner, &locked).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    object = %obj.id,
                    domain = %domain,
                    locked_on = %locked,
                    "lock guard dropped outside a runtime, locks leaked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_range_is_unbounded() {
        assert_eq!(LockRange::WHOLE.end(), None);
        assert_eq!(LockRange::new(10, 5).end(), Some(15));
    }

    #[test]
    fn test_overlaps() {
        let a = LockRange::new(0, 10);
        let b = LockRange::new(5, 10);
        let c = LockRange::new(10, 10);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(LockRange::WHOLE.overlaps(&c));
        assert!(LockRange::WHOLE.overlaps(&LockRange::METADATA));
    }

    #[test]
    fn test_metadata_sentinel_clears_data_ranges() {
        let data = LockRange::new(0, 1 << 40);
        assert!(!LockRange::METADATA.overlaps(&data));
        assert!(LockRange::METADATA.overlaps(&LockRange::METADATA));
    }

    #[test]
    fn test_range_display() {
        assert_eq!(LockRange::new(1, 2).to_string(), "[1, 3)");
        assert_eq!(LockRange::WHOLE.to_string(), "[0, inf)");
    }

    #[test]
    fn test_owners_are_distinct() {
        assert_ne!(LockOwner::random(), LockOwner::random());
    }
}
