//! Per-replica metadata primitives.
//!
//! Each call targets exactly one replica and fails independently of the
//! others. Transport and timeouts belong to the implementation; a timed-out
//! call is reported as an ordinary [`ReplicaError`].

use async_trait::async_trait;
use futures::future::join_all;

use crate::error::{HealError, ReplicaResult, Result};
use crate::types::{AttrMask, MetadataSnapshot, ObjectAttr, ObjectRef, XattrMap};

/// Metadata operations against the replicas of one replica set.
#[async_trait]
pub trait ReplicaAccessor: Send + Sync {
    /// Number of replicas in the set. Fixed for the accessor's lifetime.
    fn replica_count(&self) -> usize;

    /// Reads stat-level attributes from one replica.
    async fn get_attributes(&self, replica: usize, obj: &ObjectRef) -> ReplicaResult<ObjectAttr>;

    /// Writes the fields of `attr` selected by `mask` on one replica.
    async fn set_attributes(
        &self,
        replica: usize,
        obj: &ObjectRef,
        attr: &ObjectAttr,
        mask: AttrMask,
    ) -> ReplicaResult<()>;

    /// Reads every extended attribute from one replica.
    async fn get_xattrs(&self, replica: usize, obj: &ObjectRef) -> ReplicaResult<XattrMap>;

    /// Sets (creates or overwrites) the given extended attributes on one replica.
    async fn set_xattrs(&self, replica: usize, obj: &ObjectRef, xattrs: &XattrMap)
        -> ReplicaResult<()>;

    /// Removes the named extended attributes from one replica.
    async fn remove_xattrs(&self, replica: usize, obj: &ObjectRef, names: &[String])
        -> ReplicaResult<()>;

    /// Fetches a fresh snapshot from every replica.
    ///
    /// Slot `i` is `None` when replica `i` did not answer or reported a
    /// different identity. Fails only if no replica answered at all.
    async fn discover(&self, obj: &ObjectRef) -> Result<Vec<Option<MetadataSnapshot>>> {
        let replies = join_all((0..self.replica_count()).map(|i| async move {
            let attr = self.get_attributes(i, obj).await;
            let xattrs = match &attr {
                Ok(_) => self.get_xattrs(i, obj).await,
                Err(e) => Err(e.clone()),
            };
            (i, attr, xattrs)
        }))
        .await;

        let mut snapshots = vec![None; self.replica_count()];
        for (i, attr, xattrs) in replies {
            match (attr, xattrs) {
                (Ok(attr), Ok(xattrs)) if attr.id == obj.id => {
                    snapshots[i] = Some(MetadataSnapshot::new(attr, xattrs));
                }
                (Ok(attr), Ok(_)) => {
                    tracing::warn!(
                        replica = i,
                        expected = %obj.id,
                        found = %attr.id,
                        "identity mismatch during discovery"
                    );
                }
                (Err(e), _) | (_, Err(e)) => {
                    tracing::debug!(replica = i, error = %e, "discovery lookup failed");
                }
            }
        }

        if snapshots.iter().all(Option::is_none) {
            return Err(HealError::Discovery {
                reason: format!("no replica answered lookup of {}", obj),
            });
        }
        Ok(snapshots)
    }
}
