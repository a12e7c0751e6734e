//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use mirrorfs_heal::memory::{MemoryCluster, ReplicaFaults};
use mirrorfs_heal::types::XattrMap;
use mirrorfs_heal::{HealConfig, MetadataHealer, ObjectAttr, ObjectId, ObjectRef};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary. Honors RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A replica set holding one object, with helpers to shape each replica.
pub struct TestCluster {
    pub cluster: Arc<MemoryCluster>,
    pub obj: ObjectRef,
}

impl TestCluster {
    /// Creates `n` replicas of a regular file owned by 0:0, mode 0644.
    pub fn new(n: usize) -> Self {
        init_tracing();
        let cluster = Arc::new(MemoryCluster::new(n));
        let id = ObjectId::random();
        for i in 0..n {
            cluster.insert(i, ObjectAttr::file(id, 0, 0, 0o644), XattrMap::new());
        }
        Self {
            cluster,
            obj: ObjectRef::with_path(id, "/vol/data/file"),
        }
    }

    /// Builds a healer over this cluster.
    pub fn healer(&self, config: HealConfig) -> MetadataHealer {
        MetadataHealer::new(
            config,
            self.cluster.clone(),
            self.cluster.clone(),
            self.cluster.clone(),
            self.cluster.clone(),
        )
        .expect("valid config")
    }

    /// Healer with split-brain forcing switched on.
    pub fn forcing_healer(&self) -> MetadataHealer {
        self.healer(HealConfig {
            force_metadata_split_brain: true,
            ..HealConfig::default()
        })
    }

    /// Overwrites replica `i`'s owner, group and mode.
    pub fn set_attr(&self, i: usize, uid: u32, gid: u32, mode: u32) {
        let snap = self.cluster.snapshot(i, self.obj.id).expect("object exists");
        self.cluster
            .insert(i, ObjectAttr::file(self.obj.id, uid, gid, mode), snap.xattrs);
    }

    /// Sets one extended attribute directly on replica `i`.
    pub fn set_xattr(&self, i: usize, key: &str, value: &[u8]) {
        let mut snap = self.cluster.snapshot(i, self.obj.id).expect("object exists");
        snap.xattrs.insert(key.to_string(), value.to_vec());
        self.cluster.insert(i, snap.attr, snap.xattrs);
    }

    /// Records that `witness` saw `blamed` miss an update.
    pub fn blame(&self, witness: usize, blamed: usize) {
        self.cluster.mark_pending(self.obj.id, witness, blamed, 1);
    }

    /// Every replica blames every other replica.
    pub fn blame_all(&self, n: usize) {
        for w in 0..n {
            for b in 0..n {
                if w != b {
                    self.blame(w, b);
                }
            }
        }
    }

    /// Replica `i`'s attributes.
    pub fn attr(&self, i: usize) -> ObjectAttr {
        self.cluster.snapshot(i, self.obj.id).expect("object exists").attr
    }

    /// Replica `i`'s full xattr set.
    pub fn xattrs(&self, i: usize) -> XattrMap {
        self.cluster.snapshot(i, self.obj.id).expect("object exists").xattrs
    }

    /// Replica `i`'s xattrs as heal would propagate them.
    pub fn user_xattrs(&self, i: usize) -> XattrMap {
        HealConfig::default().xattr_filter().propagated(&self.xattrs(i))
    }

    /// Pending count `witness` holds against `blamed`.
    pub fn pending(&self, witness: usize, blamed: usize) -> u64 {
        self.cluster.pending(self.obj.id, witness, blamed)
    }

    /// Write counts of every replica.
    pub fn mutations(&self, n: usize) -> Vec<u64> {
        (0..n).map(|i| self.cluster.mutations(i)).collect()
    }

    /// Injects a set-attributes failure on replica `i`.
    pub fn fail_setattr(&self, i: usize, fail: bool) {
        self.cluster.set_faults(
            i,
            ReplicaFaults {
                fail_setattr: fail,
                ..Default::default()
            },
        );
    }
}
