//! Fixed-length per-replica boolean vectors.
//!
//! One slot per replica, sized when a heal starts and never grown. Used for
//! the lock bitmap, the classifier's sources/sinks and the healed-sinks set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Boolean vector indexed by replica position.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaMask {
    bits: Vec<bool>,
}

impl ReplicaMask {
    /// Creates an all-false mask for `replicas` replicas.
    pub fn new(replicas: usize) -> Self {
        Self {
            bits: vec![false; replicas],
        }
    }

    /// Creates an all-true mask.
    pub fn full(replicas: usize) -> Self {
        Self {
            bits: vec![true; replicas],
        }
    }

    /// Creates a mask of length `replicas` with the given indices set.
    /// Indices outside the mask are ignored.
    pub fn from_indices(replicas: usize, indices: &[usize]) -> Self {
        let mut mask = Self::new(replicas);
        for &i in indices {
            if i < replicas {
                mask.bits[i] = true;
            }
        }
        mask
    }

    /// Number of replica slots.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when the mask has no slots.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns slot `i`, false when out of range.
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i).copied().unwrap_or(false)
    }

    /// Sets slot `i`. Out-of-range indices are ignored.
    pub fn set(&mut self, i: usize) {
        if let Some(bit) = self.bits.get_mut(i) {
            *bit = true;
        }
    }

    /// Clears slot `i`. Out-of-range indices are ignored.
    pub fn clear(&mut self, i: usize) {
        if let Some(bit) = self.bits.get_mut(i) {
            *bit = false;
        }
    }

    /// Clears every slot.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = false);
    }

    /// Number of set slots.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// True when at least one slot is set.
    pub fn any(&self) -> bool {
        self.bits.iter().any(|b| *b)
    }

    /// Lowest set index.
    pub fn first(&self) -> Option<usize> {
        self.bits.iter().position(|b| *b)
    }

    /// Iterates over the set indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, b)| if *b { Some(i) } else { None })
    }

    /// Slot-wise AND.
    pub fn and(&self, other: &ReplicaMask) -> ReplicaMask {
        ReplicaMask {
            bits: self
                .bits
                .iter()
                .enumerate()
                .map(|(i, b)| *b && other.get(i))
                .collect(),
        }
    }

    /// Slots set in `self` but not in `other`.
    pub fn difference(&self, other: &ReplicaMask) -> ReplicaMask {
        ReplicaMask {
            bits: self
                .bits
                .iter()
                .enumerate()
                .map(|(i, b)| *b && !other.get(i))
                .collect(),
        }
    }

    /// True when every set slot of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &ReplicaMask) -> bool {
        self.iter_set().all(|i| other.get(i))
    }

    /// True when no slot is set in both masks.
    pub fn is_disjoint(&self, other: &ReplicaMask) -> bool {
        self.iter_set().all(|i| !other.get(i))
    }
}

impl From<Vec<bool>> for ReplicaMask {
    fn from(bits: Vec<bool>) -> Self {
        Self { bits }
    }
}

impl fmt::Display for ReplicaMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.bits {
            f.write_str(if *b { "1" } else { "0" })?;
        }
        Ok(())
    }
}
