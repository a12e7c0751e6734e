#![warn(missing_docs)]

//! MirrorFS self-heal subsystem: replica metadata repair, source arbitration, split-brain handling

pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod finalize;
pub mod heal;
pub mod lock;
pub mod mask;
pub mod memory;
pub mod metrics;
pub mod pending;
pub mod replica;
pub mod types;

pub use config::{HealConfig, SplitBrainPolicy, XattrFilter};
pub use error::{HealError, ReplicaError, Result};
pub use heal::{HealOutcome, HealPhase, HealReport, MetadataHealer};
pub use mask::ReplicaMask;
pub use types::{MetadataSnapshot, ObjectAttr, ObjectId, ObjectRef};
