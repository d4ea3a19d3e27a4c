//! Iterative mutation loop over a corpus batch.
//!
//! Each program walks its own state machine:
//!
//! ```text
//! Generated -> Converted -> {Transforming -> Checked} x rounds -> Terminal
//! ```
//!
//! A clean round appends a [`RoundRecord`] and continues from the
//! transformed variants. Any other verdict appends an [`ErrorRecord`] and
//! ends the program, optionally followed by minimization. Programs are
//! independent; only store failures stop the run.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use qdiff_error::{QdiffError, Result};
use qdiff_types::{
    DivergenceVerdict, ErrorRecord, Program, ProgramId, RoundRecord, Taxonomy, TaxonomyCounts,
    TimestampedVerdict, VerdictKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::corpus::ProgramRange;
use crate::minimizer::{MinimizationOutcome, MinimizerConfig, minimize};
use crate::pipeline::{Pipeline, Variants, panic_message};
use crate::replay::ReplayOracle;
use crate::signature::MinimizedRecord;
use crate::store::{ProgramProgress, ResultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QiteConfig {
    pub rounds: u32,
    pub workers: usize,
    pub round_budget: Duration,
    pub minimize_failures: bool,
    pub minimizer: MinimizerConfig,
    /// Wall-clock time after which no new program is dispatched. Programs
    /// already running finish and are recorded.
    pub run_deadline: Option<SystemTime>,
    /// Only programs whose id number falls in this range are run.
    pub program_range: Option<ProgramRange>,
}

impl Default for QiteConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            workers: 4,
            round_budget: Duration::from_secs(300),
            minimize_failures: false,
            minimizer: MinimizerConfig::default(),
            run_deadline: None,
            program_range: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Clean,
    Errored,
    Diverged,
}

impl TerminalState {
    fn of_verdict(verdict: &DivergenceVerdict) -> Self {
        match verdict {
            DivergenceVerdict::AllEquivalent => Self::Clean,
            DivergenceVerdict::Divergent(_) => Self::Diverged,
            DivergenceVerdict::Inconclusive { .. } | DivergenceVerdict::CrashOnly { .. } => {
                Self::Errored
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramState {
    Generated,
    Converted,
    Transforming { round: u32 },
    Checked { round: u32 },
    Terminal(TerminalState),
}

/// What happened to one program in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramReport {
    pub program_id: ProgramId,
    pub terminal: TerminalState,
    /// Highest round that completed clean.
    pub rounds_completed: u32,
    /// Round the run resumed after, when earlier records existed.
    pub resumed_after: Option<u32>,
    /// Already terminal before this run; nothing was executed.
    pub skipped: bool,
    pub verdict: Option<VerdictKind>,
    pub taxonomy: Vec<Taxonomy>,
    pub minimization: Option<String>,
    pub oracle_flakes: usize,
    pub minimizer_aborted: bool,
}

impl ProgramReport {
    fn new(program_id: ProgramId, resumed_after: Option<u32>) -> Self {
        Self {
            program_id,
            terminal: TerminalState::Clean,
            rounds_completed: resumed_after.unwrap_or(0),
            resumed_after,
            skipped: false,
            verdict: None,
            taxonomy: Vec::new(),
            minimization: None,
            oracle_flakes: 0,
            minimizer_aborted: false,
        }
    }

    fn skipped(program_id: ProgramId, terminal: TerminalState, round: u32) -> Self {
        Self {
            terminal,
            skipped: true,
            ..Self::new(program_id, Some(round))
        }
    }
}

/// Per-round tally of one run, appended to the store's stats log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStats {
    pub round: u32,
    /// Programs that completed this round clean during the run.
    pub advanced: usize,
    /// Programs whose failure was recorded in this round.
    pub failed: usize,
    pub recorded_at_unix_ms: u64,
}

impl RoundStats {
    fn from_reports(reports: &[ProgramReport], rounds: u32) -> Vec<Self> {
        let recorded_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let ran: Vec<&ProgramReport> = reports.iter().filter(|r| !r.skipped).collect();
        (1..=rounds)
            .map(|round| Self {
                round,
                advanced: ran
                    .iter()
                    .filter(|r| r.rounds_completed >= round)
                    .filter(|r| r.resumed_after.is_none_or(|after| after < round))
                    .count(),
                failed: ran
                    .iter()
                    .filter(|r| r.terminal != TerminalState::Clean)
                    .filter(|r| r.rounds_completed + 1 == round)
                    .count(),
                recorded_at_unix_ms,
            })
            .collect()
    }
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub programs: usize,
    pub clean: usize,
    pub errored: usize,
    pub diverged: usize,
    pub already_terminal: usize,
    pub minimized: usize,
    /// Batch programs outside the configured id range.
    pub excluded: usize,
    /// Selected programs never dispatched because the run deadline passed.
    pub not_started: usize,
    pub deadline_reached: bool,
    pub taxonomy: TaxonomyCounts,
    pub elapsed_ms: u64,
    pub round_stats: Vec<RoundStats>,
    pub reports: Vec<ProgramReport>,
}

impl RunSummary {
    fn from_reports(mut reports: Vec<ProgramReport>, elapsed: Duration) -> Self {
        reports.sort_by(|a, b| a.program_id.cmp(&b.program_id));
        let mut summary = Self {
            programs: reports.len(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        };
        for report in &reports {
            if report.skipped {
                summary.already_terminal += 1;
                continue;
            }
            match report.terminal {
                TerminalState::Clean => summary.clean += 1,
                TerminalState::Errored => summary.errored += 1,
                TerminalState::Diverged => summary.diverged += 1,
            }
            for bucket in &report.taxonomy {
                summary.taxonomy.record(*bucket);
            }
            summary.taxonomy.add(Taxonomy::OracleFlake, report.oracle_flakes);
            if report.minimizer_aborted {
                summary.taxonomy.record(Taxonomy::MinimizerAborted);
            }
            if report.minimization.is_some() {
                summary.minimized += 1;
            }
        }
        summary.reports = reports;
        summary
    }

    /// Pretty JSON report.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub struct QiteLoop<'a> {
    pipeline: &'a Pipeline,
    store: &'a dyn ResultStore,
    config: QiteConfig,
}

impl<'a> QiteLoop<'a> {
    pub fn new(pipeline: &'a Pipeline, store: &'a dyn ResultStore, config: QiteConfig) -> Self {
        Self {
            pipeline,
            store,
            config,
        }
    }

    /// Drive every program of `batch` to a terminal state on a bounded
    /// worker pool.
    ///
    /// # Errors
    ///
    /// The first store error stops dispatch of further programs and is
    /// returned once in-flight programs finish.
    pub fn run(&self, batch: &[Program]) -> Result<RunSummary> {
        let started_at = Instant::now();
        let selected: Vec<&Program> = batch
            .iter()
            .filter(|p| self.config.program_range.is_none_or(|range| range.contains(&p.id)))
            .collect();
        let workers = self.config.workers.clamp(1, selected.len().max(1));
        info!(
            programs = selected.len(),
            excluded = batch.len() - selected.len(),
            workers,
            rounds = self.config.rounds,
            platforms = self.pipeline.platforms().len(),
            "qite run started"
        );

        let cursor = AtomicUsize::new(0);
        let deadline_reached = AtomicBool::new(false);
        let fatal: Mutex<Option<QdiffError>> = Mutex::new(None);
        let reports: Mutex<Vec<ProgramReport>> = Mutex::new(Vec::with_capacity(selected.len()));

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (cursor, deadline_reached, fatal, reports, selected) =
                    (&cursor, &deadline_reached, &fatal, &reports, &selected);
                let handle = scope.spawn(move || {
                    loop {
                        if fatal.lock().is_some() || deadline_reached.load(Ordering::SeqCst) {
                            break;
                        }
                        if self.run_deadline_passed() {
                            if !deadline_reached.swap(true, Ordering::SeqCst) {
                                warn!(worker, "run deadline reached; dispatching no further programs");
                            }
                            break;
                        }
                        let idx = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(program) = selected.get(idx).copied() else {
                            break;
                        };
                        debug!(worker, program_id = %program.id, "program dispatched");
                        match self.run_program(program) {
                            Ok(report) => reports.lock().push(report),
                            Err(err) => {
                                error!(worker, program_id = %program.id, error = %err, "fatal harness error; stopping dispatch");
                                let mut latch = fatal.lock();
                                if latch.is_none() {
                                    *latch = Some(err);
                                }
                                break;
                            }
                        }
                    }
                });
                handles.push((worker, handle));
            }
            for (worker, handle) in handles {
                if let Err(payload) = handle.join() {
                    let err = QdiffError::internal(format!(
                        "qite worker {worker} panicked: {}",
                        panic_message(payload.as_ref())
                    ));
                    error!(worker, error = %err, "worker lost; stopping dispatch");
                    fatal.lock().get_or_insert(err);
                }
            }
        });

        if let Some(err) = fatal.into_inner() {
            return Err(err);
        }
        let reports = reports.into_inner();
        let round_stats = RoundStats::from_reports(&reports, self.config.rounds);
        for stats in &round_stats {
            self.store.append_round_stats(stats)?;
        }
        let mut summary = RunSummary::from_reports(reports, started_at.elapsed());
        summary.excluded = batch.len() - selected.len();
        summary.not_started = selected.len() - summary.programs;
        summary.deadline_reached = deadline_reached.into_inner();
        summary.round_stats = round_stats;
        info!(
            programs = summary.programs,
            clean = summary.clean,
            errored = summary.errored,
            diverged = summary.diverged,
            already_terminal = summary.already_terminal,
            bucketed = summary.taxonomy.total(),
            not_started = summary.not_started,
            deadline_reached = summary.deadline_reached,
            elapsed_ms = summary.elapsed_ms,
            "qite run finished"
        );
        Ok(summary)
    }

    fn run_deadline_passed(&self) -> bool {
        self.config
            .run_deadline
            .is_some_and(|deadline| SystemTime::now() >= deadline)
    }

    /// Drive one program to a terminal state, resuming from its records.
    ///
    /// # Errors
    ///
    /// Only store errors; every per-program failure is recorded as data.
    pub fn run_program(&self, program: &Program) -> Result<ProgramReport> {
        let id = &program.id;
        enter(id, ProgramState::Generated);

        let (mut variants, first_round, resumed_after): (Variants, u32, Option<u32>) =
            match self.store.load_progress(id)? {
                ProgramProgress::Terminal(record) => {
                    info!(program_id = %id, round = record.round, "already terminal; skipping");
                    let terminal = TerminalState::of_verdict(&record.verdict.verdict);
                    return Ok(ProgramReport::skipped(id.clone(), terminal, record.round));
                }
                ProgramProgress::Resumable(record) if record.round >= self.config.rounds => {
                    info!(program_id = %id, round = record.round, "all rounds already clean; skipping");
                    return Ok(ProgramReport::skipped(
                        id.clone(),
                        TerminalState::Clean,
                        record.round,
                    ));
                }
                ProgramProgress::Resumable(record) => {
                    info!(program_id = %id, round = record.round, "resuming after recorded round");
                    let round = record.round;
                    let variants = record
                        .variants
                        .into_iter()
                        .map(|(platform, program)| (platform, Ok(program)))
                        .collect();
                    (variants, round + 1, Some(round))
                }
                ProgramProgress::Fresh => (self.pipeline.convert(program), 1, None),
            };

        let source_hash = program.content_hash();
        debug!(program_id = %id, source_hash = %source_hash, "converted");
        enter(id, ProgramState::Converted);
        let mut report = ProgramReport::new(id.clone(), resumed_after);

        for round in first_round..=self.config.rounds {
            enter(id, ProgramState::Transforming { round });
            let deadline = Instant::now() + self.config.round_budget;
            let outcome = self
                .pipeline
                .run_round(program, round, &variants, Some(deadline));
            enter(id, ProgramState::Checked { round });
            report.verdict = Some(outcome.verdict.kind());

            if outcome.verdict.is_all_equivalent() {
                let record = RoundRecord {
                    program_id: id.clone(),
                    round,
                    source_hash: source_hash.clone(),
                    verdict: TimestampedVerdict::now(outcome.verdict.clone()),
                    variants: outcome.programs(),
                    raw_results: outcome.results.clone(),
                };
                self.store.append_round(&record)?;
                report.rounds_completed = round;
                variants = outcome.variants;
                continue;
            }

            let terminal = TerminalState::of_verdict(&outcome.verdict);
            let mut record = ErrorRecord::new(
                id.clone(),
                round,
                source_hash,
                TimestampedVerdict::now(outcome.verdict.clone()),
                outcome.results.clone(),
                outcome.programs(),
            );
            if outcome.budget_exceeded && !record.taxonomy.contains(&Taxonomy::Timeout) {
                record.taxonomy.push(Taxonomy::Timeout);
                record.taxonomy.sort();
            }
            self.store.append_error(&record)?;
            warn!(
                program_id = %id,
                round,
                verdict = %outcome.verdict.kind(),
                clue = %record.clue_message,
                "failure recorded"
            );
            report.terminal = terminal;
            report.taxonomy.clone_from(&record.taxonomy);

            if self.config.minimize_failures {
                self.minimize_failure(program, &record, &mut report)?;
            }
            enter(id, ProgramState::Terminal(terminal));
            return Ok(report);
        }

        enter(id, ProgramState::Terminal(TerminalState::Clean));
        Ok(report)
    }

    fn minimize_failure(
        &self,
        program: &Program,
        record: &ErrorRecord,
        report: &mut ProgramReport,
    ) -> Result<()> {
        let mut oracle = ReplayOracle::for_record(self.pipeline, record)
            .with_round_budget(self.config.round_budget);
        let result = minimize(program, &mut oracle, &self.config.minimizer);
        let minimized = MinimizedRecord::from_report(record.round, &record.verdict.verdict, &result);
        self.store.append_minimized(&minimized)?;

        report.minimization = Some(result.outcome.label().to_owned());
        report.oracle_flakes = result.session.flakes;
        report.minimizer_aborted = matches!(result.outcome, MinimizationOutcome::Aborted { .. });
        info!(
            program_id = %program.id,
            round = record.round,
            outcome = result.outcome.label(),
            oracle_calls = result.oracle_calls,
            original_statements = result.original_statements(),
            final_statements = result.final_statements(),
            "failure minimized"
        );
        Ok(())
    }
}

fn enter(program_id: &ProgramId, state: ProgramState) {
    match state {
        ProgramState::Terminal(terminal) => {
            info!(program_id = %program_id, state = ?terminal, "program terminal");
        }
        _ => debug!(program_id = %program_id, state = ?state, "state transition"),
    }
}
