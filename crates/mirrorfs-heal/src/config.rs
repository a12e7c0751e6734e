//! Heal configuration

use serde::{Deserialize, Serialize};

use crate::error::{HealError, Result};
use crate::types::XattrMap;

/// What the finalizer does when no source can be derived.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitBrainPolicy {
    /// Report split brain and leave every replica untouched.
    Report,
    /// Promote the lowest-indexed locked sink that has a snapshot to source.
    ForceLowestIndex,
}

impl From<bool> for SplitBrainPolicy {
    fn from(force: bool) -> Self {
        if force {
            SplitBrainPolicy::ForceLowestIndex
        } else {
            SplitBrainPolicy::Report
        }
    }
}

/// Decides which extended attributes travel from source to sinks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XattrFilter {
    reserved_prefixes: Vec<String>,
    security_keys: Vec<String>,
}

impl XattrFilter {
    /// Creates a filter from reserved prefixes and security-label keys.
    pub fn new(reserved_prefixes: Vec<String>, security_keys: Vec<String>) -> Self {
        Self {
            reserved_prefixes,
            security_keys,
        }
    }

    /// Implementation-reserved key (changelog markers and similar).
    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Security label key.
    pub fn is_security_label(&self, key: &str) -> bool {
        self.security_keys.iter().any(|k| k == key)
    }

    /// True when heal neither propagates nor removes this key.
    pub fn is_excluded(&self, key: &str) -> bool {
        self.is_reserved(key) || self.is_security_label(key)
    }

    /// The subset of `xattrs` that heal propagates.
    pub fn propagated(&self, xattrs: &XattrMap) -> XattrMap {
        xattrs
            .iter()
            .filter(|(k, _)| !self.is_excluded(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Configuration for metadata self-heal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Pick a source arbitrarily on metadata split brain instead of failing.
    pub force_metadata_split_brain: bool,
    /// Lock domain shared by every healer, used for the outer probe lock.
    pub probe_domain: String,
    /// Lock domain serializing metadata transactions.
    pub metadata_domain: String,
    /// Minimum replicas that must be locked to proceed.
    pub quorum: usize,
    /// Upper bound on waiting for the transaction lock, in milliseconds.
    pub lock_wait_ms: u64,
    /// Extended-attribute prefixes that are internal to the replication layer.
    pub reserved_xattr_prefixes: Vec<String>,
    /// Security-label keys that are never propagated or removed.
    pub security_xattr_keys: Vec<String>,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            force_metadata_split_brain: false,
            probe_domain: "mirrorfs.self-heal".to_string(),
            metadata_domain: "mirrorfs.metadata".to_string(),
            quorum: 2,
            lock_wait_ms: 1000,
            reserved_xattr_prefixes: vec!["trusted.mirrorfs.".to_string()],
            security_xattr_keys: vec!["security.selinux".to_string()],
        }
    }
}

impl HealConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: HealConfig = serde_json::from_str(json).map_err(|e| HealError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.quorum < 2 {
            return Err(HealError::Config {
                reason: format!("quorum must be at least 2, got {}", self.quorum),
            });
        }
        if self.probe_domain.is_empty() || self.metadata_domain.is_empty() {
            return Err(HealError::Config {
                reason: "lock domains must not be empty".to_string(),
            });
        }
        if self.probe_domain == self.metadata_domain {
            return Err(HealError::Config {
                reason: "probe and metadata lock domains must differ".to_string(),
            });
        }
        if self.reserved_xattr_prefixes.iter().any(|p| p.is_empty()) {
            return Err(HealError::Config {
                reason: "empty reserved xattr prefix would exclude every key".to_string(),
            });
        }
        Ok(())
    }

    /// Split-brain policy handed to the source finalizer.
    pub fn split_brain_policy(&self) -> SplitBrainPolicy {
        SplitBrainPolicy::from(self.force_metadata_split_brain)
    }

    /// Extended-attribute filter handed to the heal executor.
    pub fn xattr_filter(&self) -> XattrFilter {
        XattrFilter::new(
            self.reserved_xattr_prefixes.clone(),
            self.security_xattr_keys.clone(),
        )
    }
}
