//! Delta-debugging minimizer over removable statements.
//!
//! Given a failing program and an oracle that answers "does this candidate
//! still reproduce the failure?", [`minimize`] returns a 1-minimal failing
//! subset: removing any single remaining removable statement makes the
//! failure disappear.
//!
//! # Algorithm
//!
//! Classic ddmin over the *removable* positions of the current candidate.
//! Non-removable statements ride along untouched and keep their relative
//! order. Granularity starts at 2; each round first tries removing every
//! chunk, then (above granularity 2) keeping only every chunk. The first
//! reproducing candidate is adopted and granularity drops by one (floor 2).
//! Without progress granularity doubles, up to one statement per chunk.
//!
//! # Flaky oracles
//!
//! A positive observation is accepted immediately. A negative one is
//! re-observed until `confirmations` observations agree; a positive among
//! them is an oracle flake and the trial counts as reproduced. The converged
//! candidate must then reproduce on a strict majority of `verification_runs`
//! observations. If it does not, the minimizer walks back through the
//! candidates it adopted (newest first), restarts from the first one that
//! verifies, and gives up after `max_restarts` restarts.

use std::collections::BTreeSet;
use std::fmt;

use qdiff_types::Program;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Answers whether a candidate program still exhibits the failure.
pub trait ReproductionOracle {
    fn reproduces(&mut self, candidate: &Program) -> bool;

    /// Clue text identifying the failure, recorded in the session.
    fn clue(&self) -> &str {
        ""
    }
}

impl<F> ReproductionOracle for F
where
    F: FnMut(&Program) -> bool,
{
    fn reproduces(&mut self, candidate: &Program) -> bool {
        self(candidate)
    }
}

/// Minimizer knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerConfig {
    /// Total observations a "no longer reproduces" answer needs.
    pub confirmations: u32,
    /// Observations of the converged candidate; a strict majority must
    /// reproduce.
    pub verification_runs: u32,
    /// Restarts from an earlier checkpoint after failed verification.
    pub max_restarts: u32,
    /// Hard cap on oracle calls for one session.
    pub max_oracle_calls: usize,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            confirmations: 3,
            verification_runs: 3,
            max_restarts: 3,
            max_oracle_calls: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    Original,
    RemoveChunk,
    KeepChunk,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Reproduced,
    NotReproduced,
    /// Observations disagreed; resolved as reproduced.
    Flaky,
    /// The oracle budget ran out mid-trial.
    Unfinished,
}

/// One tried candidate and every oracle observation made for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// ddmin pass (1-based); restarts open a new pass.
    pub pass: u32,
    pub phase: TrialPhase,
    pub granularity: usize,
    pub chunk: Option<usize>,
    pub candidate_statements: usize,
    pub candidate_removable: usize,
    /// Session-wide index of the first oracle call made for this trial.
    pub first_call: usize,
    pub observations: Vec<bool>,
    pub outcome: TrialOutcome,
    /// The candidate became the new current program.
    pub adopted: bool,
}

/// Mutable state of one minimization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimizationSession {
    pub original: Program,
    pub clue_message: String,
    pub oracle_calls: usize,
    /// Best candidate so far.
    pub current: Program,
    pub history: Vec<TrialRecord>,
    pub flakes: usize,
    pub restarts: u32,
    pass: u32,
}

impl MinimizationSession {
    pub fn new(original: Program, clue_message: impl Into<String>) -> Self {
        Self {
            current: original.clone(),
            original,
            clue_message: clue_message.into(),
            oracle_calls: 0,
            history: Vec::new(),
            flakes: 0,
            restarts: 0,
            pass: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    OracleBudgetExhausted,
    UnstableReproduction,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OracleBudgetExhausted => f.write_str("oracle_budget_exhausted"),
            Self::UnstableReproduction => f.write_str("unstable_reproduction"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MinimizationOutcome {
    Minimized { program: Program },
    NotReproducible,
    Aborted { reason: AbortReason, best: Program },
}

impl MinimizationOutcome {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Minimized { .. } => "minimized",
            Self::NotReproducible => "not_reproducible",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// Smallest program known to reproduce, if any.
    pub fn best_program(&self) -> Option<&Program> {
        match self {
            Self::Minimized { program } => Some(program),
            Self::Aborted { best, .. } => Some(best),
            Self::NotReproducible => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimizationReport {
    pub outcome: MinimizationOutcome,
    pub oracle_calls: usize,
    pub session: MinimizationSession,
}

impl MinimizationReport {
    pub fn original_statements(&self) -> usize {
        self.session.original.len()
    }

    pub fn final_statements(&self) -> usize {
        self.outcome
            .best_program()
            .map_or(self.session.original.len(), Program::len)
    }
}

/// Reduce `program` to a 1-minimal subset that still satisfies `oracle`.
///
/// Always returns; oracle budget exhaustion and unstable reproduction are
/// reported as [`MinimizationOutcome::Aborted`].
pub fn minimize<O>(program: &Program, oracle: &mut O, config: &MinimizerConfig) -> MinimizationReport
where
    O: ReproductionOracle + ?Sized,
{
    let session = MinimizationSession::new(program.clone(), oracle.clue());
    info!(
        program_id = %program.id,
        statements = program.len(),
        removable = program.removable_count(),
        clue = %session.clue_message,
        "minimization started"
    );
    let mut driver = Driver {
        oracle,
        config,
        session,
    };
    let outcome = match driver.run() {
        Ok(outcome) => outcome,
        Err(Exhausted) => {
            warn!(
                program_id = %program.id,
                oracle_calls = driver.session.oracle_calls,
                "oracle budget exhausted"
            );
            MinimizationOutcome::Aborted {
                reason: AbortReason::OracleBudgetExhausted,
                best: driver.session.current.clone(),
            }
        }
    };
    let session = driver.session;
    info!(
        program_id = %program.id,
        outcome = outcome.label(),
        oracle_calls = session.oracle_calls,
        flakes = session.flakes,
        restarts = session.restarts,
        final_statements = outcome.best_program().map_or(0, Program::len),
        "minimization finished"
    );
    MinimizationReport {
        outcome,
        oracle_calls: session.oracle_calls,
        session,
    }
}

/// Split removable positions into `n` contiguous chunks whose sizes differ by
/// at most one.
fn partition(positions: &[usize], n: usize) -> Vec<BTreeSet<usize>> {
    let n = n.clamp(1, positions.len().max(1));
    let base = positions.len() / n;
    let extra = positions.len() % n;
    let mut chunks = Vec::with_capacity(n);
    let mut offset = 0;
    for idx in 0..n {
        let size = base + usize::from(idx < extra);
        chunks.push(positions[offset..offset + size].iter().copied().collect());
        offset += size;
    }
    chunks
}

struct Exhausted;

struct Driver<'a, O: ReproductionOracle + ?Sized> {
    oracle: &'a mut O,
    config: &'a MinimizerConfig,
    session: MinimizationSession,
}

impl<O: ReproductionOracle + ?Sized> Driver<'_, O> {
    fn run(&mut self) -> Result<MinimizationOutcome, Exhausted> {
        let original = self.session.original.clone();
        if !self.trial(&original, TrialPhase::Original, 0, None)? {
            return Ok(MinimizationOutcome::NotReproducible);
        }

        let mut start = original;
        loop {
            let (result, checkpoints) = self.ddmin(start)?;
            if self.verify(&result)? {
                return Ok(MinimizationOutcome::Minimized { program: result });
            }
            warn!(
                program_id = %result.id,
                statements = result.len(),
                "converged candidate failed verification; backtracking"
            );

            let mut fallback = None;
            for checkpoint in checkpoints.iter().rev() {
                if self.verify(checkpoint)? {
                    fallback = Some(checkpoint.clone());
                    break;
                }
            }
            match fallback {
                None => {
                    return Ok(MinimizationOutcome::Aborted {
                        reason: AbortReason::UnstableReproduction,
                        best: self.session.original.clone(),
                    });
                }
                Some(checkpoint) if self.session.restarts >= self.config.max_restarts => {
                    return Ok(MinimizationOutcome::Aborted {
                        reason: AbortReason::UnstableReproduction,
                        best: checkpoint,
                    });
                }
                Some(checkpoint) => {
                    self.session.restarts += 1;
                    info!(
                        restart = self.session.restarts,
                        statements = checkpoint.len(),
                        "restarting ddmin from verified checkpoint"
                    );
                    self.session.current = checkpoint.clone();
                    start = checkpoint;
                }
            }
        }
    }

    /// One ddmin pass. Returns the converged candidate and the candidates it
    /// replaced, oldest first.
    fn ddmin(&mut self, start: Program) -> Result<(Program, Vec<Program>), Exhausted> {
        self.session.pass += 1;
        let mut checkpoints = Vec::new();
        let mut current = start;
        self.session.current = current.clone();
        let mut n = 2usize;

        loop {
            let positions = current.removable_positions();
            let r = positions.len();
            if r == 0 {
                break;
            }
            n = n.clamp(1, r);
            let chunks = partition(&positions, n);

            let mut adopted = None;
            for (idx, chunk) in chunks.iter().enumerate() {
                let candidate = current.without_positions(chunk);
                if self.trial(&candidate, TrialPhase::RemoveChunk, n, Some(idx))? {
                    adopted = Some(candidate);
                    break;
                }
            }
            if adopted.is_none() && n > 2 {
                for (idx, chunk) in chunks.iter().enumerate() {
                    let candidate = current.retaining_removable(chunk);
                    if self.trial(&candidate, TrialPhase::KeepChunk, n, Some(idx))? {
                        adopted = Some(candidate);
                        break;
                    }
                }
            }

            match adopted {
                Some(candidate) => {
                    if let Some(last) = self.session.history.last_mut() {
                        last.adopted = true;
                    }
                    debug!(
                        granularity = n,
                        from = current.len(),
                        to = candidate.len(),
                        "candidate adopted"
                    );
                    checkpoints.push(std::mem::replace(&mut current, candidate));
                    self.session.current = current.clone();
                    n = n.saturating_sub(1).max(2);
                }
                None => {
                    if n >= r {
                        break;
                    }
                    n = (n * 2).min(r);
                }
            }
        }
        Ok((current, checkpoints))
    }

    fn observe(&mut self, candidate: &Program) -> Result<bool, Exhausted> {
        if self.session.oracle_calls >= self.config.max_oracle_calls {
            return Err(Exhausted);
        }
        self.session.oracle_calls += 1;
        Ok(self.oracle.reproduces(candidate))
    }

    fn new_record(
        &self,
        candidate: &Program,
        phase: TrialPhase,
        granularity: usize,
        chunk: Option<usize>,
    ) -> TrialRecord {
        TrialRecord {
            pass: self.session.pass,
            phase,
            granularity,
            chunk,
            candidate_statements: candidate.len(),
            candidate_removable: candidate.removable_count(),
            first_call: self.session.oracle_calls,
            observations: Vec::new(),
            outcome: TrialOutcome::Unfinished,
            adopted: false,
        }
    }

    fn trial(
        &mut self,
        candidate: &Program,
        phase: TrialPhase,
        granularity: usize,
        chunk: Option<usize>,
    ) -> Result<bool, Exhausted> {
        let mut record = self.new_record(candidate, phase, granularity, chunk);
        let settled = self.settle(candidate, &mut record);
        let reproduced = matches!(
            record.outcome,
            TrialOutcome::Reproduced | TrialOutcome::Flaky
        );
        debug!(
            phase = ?record.phase,
            granularity,
            chunk = ?record.chunk,
            statements = record.candidate_statements,
            observations = record.observations.len(),
            outcome = ?record.outcome,
            oracle_calls = self.session.oracle_calls,
            "trial"
        );
        self.session.history.push(record);
        settled.map(|()| reproduced)
    }

    fn settle(&mut self, candidate: &Program, record: &mut TrialRecord) -> Result<(), Exhausted> {
        let needed = usize::try_from(self.config.confirmations.max(1)).unwrap_or(usize::MAX);
        let first = self.observe(candidate)?;
        record.observations.push(first);
        if first {
            record.outcome = TrialOutcome::Reproduced;
            return Ok(());
        }
        while record.observations.len() < needed {
            let again = self.observe(candidate)?;
            record.observations.push(again);
            if again {
                self.session.flakes += 1;
                warn!(
                    statements = candidate.len(),
                    observations = ?record.observations,
                    "oracle flake during confirmation"
                );
                record.outcome = TrialOutcome::Flaky;
                return Ok(());
            }
        }
        record.outcome = TrialOutcome::NotReproduced;
        Ok(())
    }

    fn verify(&mut self, candidate: &Program) -> Result<bool, Exhausted> {
        let runs = usize::try_from(self.config.verification_runs).unwrap_or(usize::MAX);
        if runs == 0 {
            return Ok(true);
        }
        let mut record = self.new_record(candidate, TrialPhase::Verification, 0, None);
        let settled = self.majority(candidate, runs, &mut record);
        let verified = record.outcome == TrialOutcome::Reproduced;
        debug!(
            statements = record.candidate_statements,
            observations = ?record.observations,
            verified,
            "verification"
        );
        self.session.history.push(record);
        settled.map(|()| verified)
    }

    fn majority(
        &mut self,
        candidate: &Program,
        runs: usize,
        record: &mut TrialRecord,
    ) -> Result<(), Exhausted> {
        let mut positives = 0usize;
        for done in 1..=runs {
            if self.observe(candidate)? {
                positives += 1;
                record.observations.push(true);
            } else {
                record.observations.push(false);
            }
            let remaining = runs - done;
            if positives * 2 > runs || (positives + remaining) * 2 <= runs {
                break;
            }
        }
        record.outcome = if positives * 2 > runs {
            TrialOutcome::Reproduced
        } else {
            TrialOutcome::NotReproduced
        };
        Ok(())
    }
}
