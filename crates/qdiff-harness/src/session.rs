//! JSONL log of one minimization session: a `meta` line, one `trial` line per
//! tried candidate, and a closing `summary` line.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use qdiff_error::Result;
use qdiff_types::ProgramId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::minimizer::{
    AbortReason, MinimizationOutcome, MinimizationReport, MinimizerConfig, TrialRecord,
};

/// Version of the session log schema.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionLine {
    Meta {
        schema_version: u32,
        program_id: ProgramId,
        round: u32,
        clue: String,
        original_statements: usize,
        original_removable: usize,
        config: MinimizerConfig,
    },
    Trial(TrialRecord),
    Summary {
        outcome: String,
        abort_reason: Option<AbortReason>,
        oracle_calls: usize,
        final_statements: usize,
        flakes: usize,
        restarts: u32,
    },
}

pub fn session_lines(
    round: u32,
    config: &MinimizerConfig,
    report: &MinimizationReport,
) -> Vec<SessionLine> {
    let session = &report.session;
    let mut lines = Vec::with_capacity(session.history.len() + 2);
    lines.push(SessionLine::Meta {
        schema_version: SESSION_SCHEMA_VERSION,
        program_id: session.original.id.clone(),
        round,
        clue: session.clue_message.clone(),
        original_statements: session.original.len(),
        original_removable: session.original.removable_count(),
        config: *config,
    });
    lines.extend(session.history.iter().cloned().map(SessionLine::Trial));
    lines.push(SessionLine::Summary {
        outcome: report.outcome.label().to_owned(),
        abort_reason: match &report.outcome {
            MinimizationOutcome::Aborted { reason, .. } => Some(*reason),
            _ => None,
        },
        oracle_calls: report.oracle_calls,
        final_statements: report.final_statements(),
        flakes: session.flakes,
        restarts: session.restarts,
    });
    lines
}

pub fn write_session_log(
    path: &Path,
    round: u32,
    config: &MinimizerConfig,
    report: &MinimizationReport,
) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let lines = session_lines(round, config, report);
    for line in &lines {
        serde_json::to_writer(&mut out, line)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    info!(path = %path.display(), lines = lines.len(), "session log written");
    Ok(())
}

pub fn read_session_log(path: &Path) -> Result<Vec<SessionLine>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines.push(serde_json::from_str(&line)?);
    }
    Ok(lines)
}
