//! Vector clocks for causal ordering of strokes.
//!
//! Each author owns one counter. An author bumps its own counter by exactly
//! one per stroke, and a stroke carries a copy of the clock as it was when
//! the stroke was emitted. Comparing two stroke clocks tells whether one
//! stroke happened before the other or whether they are concurrent.
//!
//! Counters are kept in a `BTreeMap` so that the encoded form of a clock is
//! canonical: two replicas holding the same knowledge encode it to the same
//! bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Same counters for every author.
    Equal,
    /// Every counter of `self` is <= the other's, at least one strictly.
    Before,
    /// Every counter of `self` is >= the other's, at least one strictly.
    After,
    /// Neither dominates.
    Concurrent,
}

/// Mapping from author id to a monotonically increasing counter.
///
/// Missing authors count as zero. Zero entries are never stored, including
/// ones arriving on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, u64>", into = "BTreeMap<String, u64>")]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl From<BTreeMap<String, u64>> for VectorClock {
    fn from(counters: BTreeMap<String, u64>) -> Self {
        Self::from_pairs(counters)
    }
}

impl From<VectorClock> for BTreeMap<String, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.counters
    }
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(author, counter)` pairs. Zero counters are dropped.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let counters = pairs
            .into_iter()
            .filter(|(_, c)| *c > 0)
            .map(|(a, c)| (a.into(), c))
            .collect();
        Self { counters }
    }

    /// Counter for `author` (0 if never seen).
    pub fn get(&self, author: &str) -> u64 {
        self.counters.get(author).copied().unwrap_or(0)
    }

    /// Set the counter for `author`. Setting zero removes the entry.
    pub fn set(&mut self, author: impl Into<String>, counter: u64) {
        let author = author.into();
        if counter == 0 {
            self.counters.remove(&author);
        } else {
            self.counters.insert(author, counter);
        }
    }

    /// Bump `author`'s counter by one and return the new value.
    pub fn increment(&mut self, author: &str) -> u64 {
        let next = self.get(author) + 1;
        self.counters.insert(author.to_string(), next);
        next
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (author, &count) in &other.counters {
            if count == 0 {
                continue;
            }
            let current = self.counters.entry(author.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    /// Compare two clocks causally.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for (author, &mine) in &self.counters {
            let theirs = other.get(author);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
        }
        for (author, &theirs) in &other.counters {
            if !self.counters.contains_key(author) && theirs > 0 {
                less = true;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// `true` if every counter in `self` is <= the matching counter in `other`.
    pub fn is_dominated_by(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::Before | ClockOrdering::Equal
        )
    }

    /// Sum of all counters.
    ///
    /// Strictly increases along causality: if `a` happened before `b` then
    /// `a.depth() < b.depth()`.
    pub fn depth(&self) -> u64 {
        self.counters.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Iterate `(author, counter)` in author order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(a, c)| (a.as_str(), *c))
    }

    /// Authors whose counter in `self` exceeds the one in `known`.
    pub fn ahead_of<'a>(&'a self, known: &'a VectorClock) -> impl Iterator<Item = (&'a str, u64)> {
        self.iter().filter(move |(a, c)| *c > known.get(a))
    }
}
