//! Normalized rule sets.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::rule::RuleRecord;
use crate::RuleKind;

/// A record in a normalized rule set together with the sources that
/// contributed it (indices into [`RuleSet::sources`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub record: RuleRecord,
    pub sources: Vec<usize>,
}

/// Counters collected while normalizing one rule set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    /// Records handed to the normalizer
    pub input: usize,
    /// Exact duplicates merged away
    pub duplicates_removed: usize,
    /// CIDR blocks dropped because a broader block was present
    pub subsumed_removed: usize,
    /// Records dropped by keyword exclusion
    pub excluded: usize,
    /// Records in the finalized set
    pub output: usize,
}

/// A named, finalized collection of rule records.
///
/// Entries are unique and kept in [`RuleRecord`] order, so two rule sets
/// built from the same records are identical regardless of source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    name: String,
    sources: Vec<String>,
    entries: Vec<RuleEntry>,
    stats: NormalizeStats,
}

impl RuleSet {
    /// Create a rule set from already-finalized entries.
    pub(crate) fn from_parts(
        name: impl Into<String>,
        sources: Vec<String>,
        entries: Vec<RuleEntry>,
        stats: NormalizeStats,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
            entries,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// URLs of the sources, in declaration order.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn entries(&self) -> &[RuleEntry] {
        &self.entries
    }

    /// Iterate over the records in canonical order.
    pub fn records(&self) -> impl Iterator<Item = &RuleRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> NormalizeStats {
        self.stats
    }

    /// Source URLs that contributed `record`.
    pub fn contributors(&self, record: &RuleRecord) -> Vec<&str> {
        self.entries
            .binary_search_by(|e| e.record.cmp(record))
            .ok()
            .map(|idx| {
                self.entries[idx]
                    .sources
                    .iter()
                    .filter_map(|&i| self.sources.get(i).map(String::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record counts per rule kind.
    pub fn count_by_kind(&self) -> BTreeMap<RuleKind, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records() {
            *counts.entry(record.kind()).or_insert(0) += 1;
        }
        counts
    }
}
