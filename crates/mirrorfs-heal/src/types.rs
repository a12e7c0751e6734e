//! Core identity and metadata types shared by every heal component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

/// Cluster-wide, immutable 128-bit identity of a filesystem object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Creates an ObjectId from an existing UUID.
    pub fn new(id: Uuid) -> Self {
        ObjectId(id)
    }

    /// Generates a fresh random identity.
    pub fn random() -> Self {
        ObjectId(Uuid::new_v4())
    }

    /// Returns the raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl From<u128> for ObjectId {
    fn from(v: u128) -> Self {
        ObjectId(Uuid::from_u128(v))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle used to address one object on every replica: its identity plus an
/// optional path hint for replicas that resolve by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Stable identity of the object.
    pub id: ObjectId,
    /// Path hint, if the caller has one.
    pub path: Option<String>,
}

impl ObjectRef {
    /// Creates a handle that resolves by identity only.
    pub fn new(id: ObjectId) -> Self {
        Self { id, path: None }
    }

    /// Creates a handle carrying a path hint.
    pub fn with_path(id: ObjectId, path: impl Into<String>) -> Self {
        Self {
            id,
            path: Some(path.into()),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} ({})", path, self.id),
            None => write!(f, "<gfid:{}>", self.id),
        }
    }
}

/// File type enumeration matching POSIX file types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

/// Attributes of one replica's copy of an object that metadata heal cares about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttr {
    /// Object identity as reported by the replica.
    pub id: ObjectId,
    /// File type
    pub file_type: FileType,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// Permission bits (lower 12 bits)
    pub mode: u32,
}

impl ObjectAttr {
    /// Creates a regular-file attribute set.
    pub fn file(id: ObjectId, uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            id,
            file_type: FileType::RegularFile,
            uid,
            gid,
            mode: mode & 0o7777,
        }
    }

    /// Creates a directory attribute set.
    pub fn directory(id: ObjectId, uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            id,
            file_type: FileType::Directory,
            uid,
            gid,
            mode: mode & 0o7777,
        }
    }

    /// True when type, owner, group and permission bits all agree.
    pub fn same_metadata(&self, other: &ObjectAttr) -> bool {
        self.file_type == other.file_type
            && self.uid == other.uid
            && self.gid == other.gid
            && self.mode == other.mode
    }

    /// Copies the fields selected by `mask` from `source` into `self`.
    pub fn apply(&mut self, source: &ObjectAttr, mask: AttrMask) {
        if mask.contains(AttrMask::UID) {
            self.uid = source.uid;
        }
        if mask.contains(AttrMask::GID) {
            self.gid = source.gid;
        }
        if mask.contains(AttrMask::MODE) {
            self.mode = source.mode & 0o7777;
        }
    }
}

/// Extended attributes keyed by name, ordered for stable iteration.
pub type XattrMap = BTreeMap<String, Vec<u8>>;

/// Metadata captured from one replica under the transaction lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    /// Stat-level attributes.
    pub attr: ObjectAttr,
    /// Full extended attribute set, unfiltered.
    pub xattrs: XattrMap,
}

impl MetadataSnapshot {
    /// Creates a snapshot from attributes and extended attributes.
    pub fn new(attr: ObjectAttr, xattrs: XattrMap) -> Self {
        Self { attr, xattrs }
    }
}

/// Selects which attribute fields a set-attributes call writes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrMask(u32);

impl AttrMask {
    /// Owner user ID.
    pub const UID: AttrMask = AttrMask(0x1);
    /// Owner group ID.
    pub const GID: AttrMask = AttrMask(0x2);
    /// Permission bits.
    pub const MODE: AttrMask = AttrMask(0x4);
    /// Fields propagated by metadata heal.
    pub const HEAL: AttrMask = AttrMask(0x1 | 0x2 | 0x4);

    /// Returns true if every bit of `other` is set in `self`.
    pub fn contains(&self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for AttrMask {
    type Output = AttrMask;

    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}
