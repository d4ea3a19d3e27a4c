//! `qdiff-qite`: run transform-and-check rounds over a contiguous batch of a
//! corpus, resuming from records already on disk.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use qdiff_error::Result;
use qdiff_harness::{
    Corpus, FsResultStore, HarnessConfig, ProgramRange, QiteLoop, exit_with, init_tracing,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "qdiff-qite", version)]
#[command(about = "Differentially test a corpus batch across platforms", long_about = None)]
struct Cli {
    /// Corpus folder holding `<program_id>.<ext>` files; records are written
    /// under its `metadata/` and `error/` subfolders.
    #[arg(long)]
    corpus: PathBuf,

    /// Harness configuration file (JSON).
    #[arg(long)]
    config: PathBuf,

    /// First position (inclusive) in the sorted corpus.
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Last position (exclusive); defaults to the end of the corpus.
    #[arg(long)]
    end: Option<usize>,

    /// Override the configured number of rounds.
    #[arg(long)]
    rounds: Option<u32>,

    /// Override the configured worker count.
    #[arg(long)]
    workers: Option<usize>,

    /// Only run programs whose numeric id prefix is at least this.
    #[arg(long, requires = "last_id")]
    first_id: Option<u64>,

    /// Only run programs whose numeric id prefix is at most this.
    #[arg(long, requires = "first_id")]
    last_id: Option<u64>,

    /// Unix time in seconds after which no new program is started.
    #[arg(long)]
    end_timestamp: Option<u64>,

    /// Minimize every recorded failure and regroup the minimized records
    /// into `<corpus>/unique_failures.json`.
    #[arg(long)]
    minimize: bool,

    /// Write the JSON run summary to this file instead of stdout.
    #[arg(long)]
    summary: Option<PathBuf>,
}

fn main() -> ExitCode {
    init_tracing("info");
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => exit_with("qdiff-qite", &err),
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = HarnessConfig::load(&cli.config)?;
    if let Some(rounds) = cli.rounds {
        config.rounds = rounds;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let (Some(first), Some(last)) = (cli.first_id, cli.last_id) {
        config.program_range = Some(ProgramRange { first, last });
    }
    if cli.end_timestamp.is_some() {
        config.run_deadline_unix_s = cli.end_timestamp;
    }
    config.minimize_failures |= cli.minimize;
    config.validate()?;

    let corpus = Corpus::load(&cli.corpus, &config.format)?;
    for (id, reason) in &corpus.skipped {
        warn!(program_id = %id, reason = %reason, "program not part of this run");
    }
    let store = FsResultStore::open(&cli.corpus)?;
    let pipeline = config.build_pipeline();
    let batch = corpus.batch(cli.start, cli.end);
    info!(
        start = cli.start,
        end = ?cli.end,
        batch = batch.len(),
        corpus = corpus.programs.len(),
        "batch selected"
    );

    let summary = QiteLoop::new(&pipeline, &store, config.qite_config()).run(batch)?;
    if config.minimize_failures {
        store.write_unique_failures()?;
    }
    match &cli.summary {
        Some(path) => summary.write_json(path)?,
        None => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}
