use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DivergenceVerdict, ExecutionResult, ExecutionStatus};

/// Failure bucket recorded for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Taxonomy {
    Timeout,
    ParseError,
    /// Includes platform crashes.
    RuntimeError,
    EquivalenceMismatch,
    Inconclusive,
    OracleFlake,
    MinimizerAborted,
}

impl Taxonomy {
    pub const ALL: [Self; 7] = [
        Self::Timeout,
        Self::ParseError,
        Self::RuntimeError,
        Self::EquivalenceMismatch,
        Self::Inconclusive,
        Self::OracleFlake,
        Self::MinimizerAborted,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ParseError => "parse_error",
            Self::RuntimeError => "runtime_error",
            Self::EquivalenceMismatch => "equivalence_mismatch",
            Self::Inconclusive => "inconclusive",
            Self::OracleFlake => "oracle_flake",
            Self::MinimizerAborted => "minimizer_aborted",
        }
    }

    /// Bucket of a failing execution status; `None` for success.
    pub const fn of_status(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Success => None,
            ExecutionStatus::ParseError => Some(Self::ParseError),
            ExecutionStatus::RuntimeError | ExecutionStatus::Crash => Some(Self::RuntimeError),
            ExecutionStatus::Timeout => Some(Self::Timeout),
        }
    }

    /// Buckets touched by one non-clean batch: one for the verdict itself,
    /// plus one per failing result status. Duplicates are collapsed.
    pub fn for_batch(verdict: &DivergenceVerdict, results: &[ExecutionResult]) -> Vec<Self> {
        let mut buckets = Vec::new();
        match verdict {
            DivergenceVerdict::AllEquivalent | DivergenceVerdict::CrashOnly { .. } => {}
            DivergenceVerdict::Divergent(_) => buckets.push(Self::EquivalenceMismatch),
            DivergenceVerdict::Inconclusive { .. } => buckets.push(Self::Inconclusive),
        }
        for result in results {
            if let Some(bucket) = Self::of_status(result.status()) {
                buckets.push(bucket);
            }
        }
        buckets.sort();
        buckets.dedup();
        buckets
    }
}

impl fmt::Display for Taxonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-bucket tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyCounts {
    pub timeout: usize,
    pub parse_error: usize,
    pub runtime_error: usize,
    pub equivalence_mismatch: usize,
    pub inconclusive: usize,
    pub oracle_flake: usize,
    pub minimizer_aborted: usize,
}

impl TaxonomyCounts {
    pub fn record(&mut self, bucket: Taxonomy) {
        self.add(bucket, 1);
    }

    pub fn add(&mut self, bucket: Taxonomy, n: usize) {
        *self.slot_mut(bucket) += n;
    }

    pub fn get(&self, bucket: Taxonomy) -> usize {
        match bucket {
            Taxonomy::Timeout => self.timeout,
            Taxonomy::ParseError => self.parse_error,
            Taxonomy::RuntimeError => self.runtime_error,
            Taxonomy::EquivalenceMismatch => self.equivalence_mismatch,
            Taxonomy::Inconclusive => self.inconclusive,
            Taxonomy::OracleFlake => self.oracle_flake,
            Taxonomy::MinimizerAborted => self.minimizer_aborted,
        }
    }

    pub fn total(&self) -> usize {
        Taxonomy::ALL.iter().map(|bucket| self.get(*bucket)).sum()
    }

    fn slot_mut(&mut self, bucket: Taxonomy) -> &mut usize {
        match bucket {
            Taxonomy::Timeout => &mut self.timeout,
            Taxonomy::ParseError => &mut self.parse_error,
            Taxonomy::RuntimeError => &mut self.runtime_error,
            Taxonomy::EquivalenceMismatch => &mut self.equivalence_mismatch,
            Taxonomy::Inconclusive => &mut self.inconclusive,
            Taxonomy::OracleFlake => &mut self.oracle_flake,
            Taxonomy::MinimizerAborted => &mut self.minimizer_aborted,
        }
    }
}
