//! `qdiff-minimize`: shrink the program behind one error record.
//!
//! Writes `<record stem>_min.<ext>` and `<record stem>_min.session.jsonl`
//! next to the record, appends the minimized record to the store, and
//! regroups every minimized record into `<corpus>/unique_failures.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use qdiff_error::{QdiffError, Result};
use qdiff_harness::corpus::load_program;
use qdiff_harness::session::write_session_log;
use qdiff_harness::store::read_record;
use qdiff_harness::{
    FsResultStore, HarnessConfig, MinimizationOutcome, MinimizedRecord, ReplayOracle,
    ResultStore, exit_with, init_tracing, minimize,
};
use qdiff_types::ErrorRecord;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "qdiff-minimize", version)]
#[command(about = "Minimize the program of one error record", long_about = None)]
struct Cli {
    /// Error record JSON (`<program_id>_r<round>_error.json`).
    #[arg(long)]
    record: PathBuf,

    /// Corpus folder holding the original program.
    #[arg(long)]
    corpus: PathBuf,

    /// Harness configuration file (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Override the oracle-call cap.
    #[arg(long)]
    max_oracle_calls: Option<usize>,

    /// Override the confirmation count for negative observations.
    #[arg(long)]
    confirmations: Option<u32>,
}

fn main() -> ExitCode {
    init_tracing("info");
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => exit_with("qdiff-minimize", &err),
    }
}

fn sibling(record: &Path, suffix: &str) -> Result<PathBuf> {
    let stem = record
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| QdiffError::config(format!("bad record path '{}'", record.display())))?;
    let dir = record.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(format!("{stem}{suffix}")))
}

/// `Ok(true)` when the failure was minimized to a verified reproducer.
fn run(cli: &Cli) -> Result<bool> {
    let mut config = HarnessConfig::load(&cli.config)?;
    if let Some(cap) = cli.max_oracle_calls {
        config.minimizer.max_oracle_calls = cap;
    }
    if let Some(confirmations) = cli.confirmations {
        config.minimizer.confirmations = confirmations;
    }
    config.validate()?;

    let record: ErrorRecord = read_record(&cli.record)?;
    let program = load_program(&cli.corpus, &record.program_id, &config.format)?;
    if program.content_hash() != record.source_hash {
        warn!(
            program_id = %record.program_id,
            "program source changed since the record was written"
        );
    }
    info!(
        program_id = %record.program_id,
        round = record.round,
        verdict = %record.verdict.verdict.kind(),
        clue = %record.clue_message,
        "minimizing recorded failure"
    );

    let pipeline = config.build_pipeline();
    let mut oracle = ReplayOracle::for_record(&pipeline, &record)
        .with_round_budget(Duration::from_millis(config.round_budget_ms));
    let report = minimize(&program, &mut oracle, &config.minimizer);

    if let Some(best) = report.outcome.best_program() {
        let path = sibling(&cli.record, &format!("_min.{}", config.format.extension()))?;
        fs::write(&path, best.render())?;
        info!(path = %path.display(), statements = best.len(), "minimized program written");
    }
    write_session_log(
        &sibling(&cli.record, "_min.session.jsonl")?,
        record.round,
        &config.minimizer,
        &report,
    )?;

    let minimized = MinimizedRecord::from_report(record.round, &record.verdict.verdict, &report);
    let store = FsResultStore::open(&cli.corpus)?;
    match store.append_minimized(&minimized) {
        Ok(()) => {}
        Err(QdiffError::DuplicateRecord { key }) => {
            warn!(key = %key, "minimized record already stored; keeping the earlier one");
        }
        Err(err) => return Err(err),
    }
    store.write_unique_failures()?;
    println!("{}", serde_json::to_string_pretty(&minimized)?);

    Ok(matches!(report.outcome, MinimizationOutcome::Minimized { .. }))
}
