//! Durable records written by the mutation loop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    DivergenceVerdict, ExecutionResult, PlatformId, Program, ProgramId, Taxonomy,
    TimestampedVerdict,
};

/// Longest clue extracted from a failure message.
const MAX_CLUE_CHARS: usize = 160;

/// Everything needed to reproduce and triage one failing round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub program_id: ProgramId,
    pub round: u32,
    /// Content hash of the program as read from the corpus.
    pub source_hash: String,
    pub verdict: TimestampedVerdict,
    /// Short substring that identifies this failure when it is replayed.
    pub clue_message: String,
    pub taxonomy: Vec<Taxonomy>,
    pub raw_results: Vec<ExecutionResult>,
    /// Per-platform variants fed to the adapters in the failing round.
    pub failing_variants: BTreeMap<PlatformId, Program>,
}

impl ErrorRecord {
    pub fn new(
        program_id: ProgramId,
        round: u32,
        source_hash: String,
        verdict: TimestampedVerdict,
        raw_results: Vec<ExecutionResult>,
        failing_variants: BTreeMap<PlatformId, Program>,
    ) -> Self {
        let clue_message = derive_clue(&verdict.verdict);
        let taxonomy = Taxonomy::for_batch(&verdict.verdict, &raw_results);
        Self {
            program_id,
            round,
            source_hash,
            verdict,
            clue_message,
            taxonomy,
            raw_results,
            failing_variants,
        }
    }

    /// Record key, also the file stem: `<program_id>_r<round>_error`.
    pub fn key(&self) -> String {
        format!("{}_r{}_error", self.program_id, self.round)
    }
}

/// Clean-round checkpoint; the last one is where a resumed run restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub program_id: ProgramId,
    pub round: u32,
    pub source_hash: String,
    pub verdict: TimestampedVerdict,
    pub variants: BTreeMap<PlatformId, Program>,
    pub raw_results: Vec<ExecutionResult>,
}

impl RoundRecord {
    pub fn key(&self) -> String {
        format!("{}_r{}", self.program_id, self.round)
    }
}

/// Pick the clue used to recognize a failure on replay.
///
/// Crash messages contribute their last non-blank line, which is where
/// interpreters put the exception text.
pub fn derive_clue(verdict: &DivergenceVerdict) -> String {
    let clue = match verdict {
        DivergenceVerdict::AllEquivalent => String::new(),
        DivergenceVerdict::Divergent(_) => "not equivalent".to_owned(),
        DivergenceVerdict::Inconclusive { reason } => reason.clone(),
        DivergenceVerdict::CrashOnly { message, .. } => message
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_owned(),
    };
    clue.chars().take(MAX_CLUE_CHARS).collect()
}
