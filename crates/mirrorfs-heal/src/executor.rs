//! Heal executor: copies the source's metadata onto each sink.

use std::sync::Arc;

use futures::future::join_all;

use crate::config::XattrFilter;
use crate::error::{HealError, Result};
use crate::mask::ReplicaMask;
use crate::replica::ReplicaAccessor;
use crate::types::{AttrMask, ObjectAttr, ObjectRef, XattrMap};

/// Applies a source's attributes and extended-attribute set to sinks.
pub struct HealExecutor {
    replicas: Arc<dyn ReplicaAccessor>,
    filter: XattrFilter,
}

impl HealExecutor {
    /// Creates an executor over `replicas` using `filter` to decide which
    /// extended attributes travel.
    pub fn new(replicas: Arc<dyn ReplicaAccessor>, filter: XattrFilter) -> Self {
        Self { replicas, filter }
    }

    /// Heals every sink set in `healed_sinks` from `source`.
    ///
    /// `source_attr` is the source's attribute snapshot taken under the
    /// transaction lock. Extended attributes are re-read from the source.
    /// A sink that fails any step has its bit cleared; the others carry on.
    /// Only an unreadable source aborts the call.
    pub async fn heal(
        &self,
        obj: &ObjectRef,
        source: usize,
        source_attr: &ObjectAttr,
        healed_sinks: &mut ReplicaMask,
    ) -> Result<()> {
        tracing::info!(object = %obj.id, source, sinks = %healed_sinks, "performing metadata selfheal");

        let source_xattrs = self
            .replicas
            .get_xattrs(source, obj)
            .await
            .map_err(|e| HealError::SourceUnreadable {
                replica: source,
                source: e,
            })?;
        let propagated = self.filter.propagated(&source_xattrs);

        // The source is never a heal target.
        healed_sinks.clear(source);

        let targets: Vec<usize> = healed_sinks.iter_set().collect();
        let results = join_all(
            targets
                .iter()
                .map(|&i| self.heal_sink(obj, i, source_attr, &propagated)),
        )
        .await;

        for (i, converged) in results {
            if !converged {
                healed_sinks.clear(i);
            }
        }

        Ok(())
    }

    async fn heal_sink(
        &self,
        obj: &ObjectRef,
        sink: usize,
        source_attr: &ObjectAttr,
        propagated: &XattrMap,
    ) -> (usize, bool) {
        let mut converged = true;

        if let Err(e) = self
            .replicas
            .set_attributes(sink, obj, source_attr, AttrMask::HEAL)
            .await
        {
            tracing::warn!(object = %obj.id, replica = sink, error = %e, "setattr on sink failed");
            converged = false;
        }

        match self.replicas.get_xattrs(sink, obj).await {
            Ok(current) => {
                let stale: Vec<String> = current
                    .keys()
                    .filter(|k| !self.filter.is_excluded(k) && !propagated.contains_key(*k))
                    .cloned()
                    .collect();
                if !stale.is_empty() {
                    tracing::debug!(replica = sink, keys = ?stale, "removing stale xattrs");
                    if let Err(e) = self.replicas.remove_xattrs(sink, obj, &stale).await {
                        tracing::warn!(
                            object = %obj.id,
                            replica = sink,
                            error = %e,
                            "removexattr on sink failed"
                        );
                        converged = false;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(object = %obj.id, replica = sink, error = %e, "getxattr on sink failed");
                converged = false;
            }
        }

        if !propagated.is_empty() {
            if let Err(e) = self.replicas.set_xattrs(sink, obj, propagated).await {
                tracing::warn!(object = %obj.id, replica = sink, error = %e, "setxattr on sink failed");
                converged = false;
            }
        }

        (sink, converged)
    }
}
