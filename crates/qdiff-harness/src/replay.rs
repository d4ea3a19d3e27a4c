//! Reproduction oracle that replays the mutation pipeline on a candidate.

use std::time::{Duration, Instant};

use qdiff_types::{DivergenceVerdict, ErrorRecord, ExecutionResult, Program, VerdictKind};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::minimizer::ReproductionOracle;
use crate::pipeline::Pipeline;

/// What makes two failures "the same" for minimization purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignature {
    pub kind: VerdictKind,
    /// Substring searched for in the verdict description and in every
    /// failing result's message. Empty matches anything.
    pub clue: String,
}

impl FailureSignature {
    pub fn new(kind: VerdictKind, clue: impl Into<String>) -> Self {
        Self {
            kind,
            clue: clue.into(),
        }
    }

    pub fn from_record(record: &ErrorRecord) -> Self {
        Self::new(record.verdict.verdict.kind(), record.clue_message.clone())
    }

    pub fn matches(&self, verdict: &DivergenceVerdict, results: &[ExecutionResult]) -> bool {
        if verdict.kind() != self.kind {
            return false;
        }
        if self.clue.is_empty() || verdict.describe().contains(&self.clue) {
            return true;
        }
        results
            .iter()
            .filter(|result| !result.is_success())
            .filter_map(ExecutionResult::message)
            .any(|message| message.contains(&self.clue))
    }
}

/// Replays conversion and rounds `1..=round` on each candidate.
///
/// A candidate reproduces when some round's verdict matches the signature.
/// A differing failure in an earlier round, or a clean run through `round`,
/// does not reproduce.
///
/// With a round budget, every replayed round runs under the same wall-clock
/// deadline as the live loop, so budget failures replay as budget failures.
pub struct ReplayOracle<'a> {
    pipeline: &'a Pipeline,
    round: u32,
    signature: FailureSignature,
    round_budget: Option<Duration>,
}

impl<'a> ReplayOracle<'a> {
    pub fn new(pipeline: &'a Pipeline, round: u32, signature: FailureSignature) -> Self {
        Self {
            pipeline,
            round: round.max(1),
            signature,
            round_budget: None,
        }
    }

    #[must_use]
    pub fn with_round_budget(mut self, budget: Duration) -> Self {
        self.round_budget = Some(budget);
        self
    }

    pub fn for_record(pipeline: &'a Pipeline, record: &ErrorRecord) -> Self {
        Self::new(pipeline, record.round, FailureSignature::from_record(record))
    }

    pub fn signature(&self) -> &FailureSignature {
        &self.signature
    }
}

impl ReproductionOracle for ReplayOracle<'_> {
    fn reproduces(&mut self, candidate: &Program) -> bool {
        let mut variants = self.pipeline.convert(candidate);
        for round in 1..=self.round {
            let deadline = self.round_budget.map(|budget| Instant::now() + budget);
            let outcome = self.pipeline.run_round(candidate, round, &variants, deadline);
            if !outcome.verdict.is_all_equivalent() {
                let matched = self.signature.matches(&outcome.verdict, &outcome.results);
                trace!(round, verdict = %outcome.verdict.kind(), matched, "replay diverged");
                return matched;
            }
            variants = outcome.variants;
        }
        false
    }

    fn clue(&self) -> &str {
        &self.signature.clue
    }
}
