//! Scripted platforms shared by the integration tests.
//!
//! Programs are opaque line lists; behavior is driven by marker statements:
//!
//! - `crash_on_b`: platform `b` fails with a runtime error.
//! - `late_crash`: like `crash_on_b`, but only once the round-2 tag exists.
//! - `diverge_on_c`: platform `c` returns a different artifact.
//! - `slow`: every platform sleeps 50 ms before answering.

#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use qdiff_harness::{
    DetectorConfig, DivergenceDetector, ExecutionAdapter, Identity, NormalizedTextMatch, Pipeline,
    PlatformConverter, ProgramTransform,
};
use qdiff_types::{
    ExecutionResult, ExecutionStatus, PlatformId, Program, ProgramFormat, ProgramId, Statement,
    StatementKind,
};

pub const PLATFORMS: [&str; 3] = ["a", "b", "c"];

pub struct ScriptedAdapter;

impl ExecutionAdapter for ScriptedAdapter {
    fn execute(
        &self,
        program: &Program,
        platform: &PlatformId,
        _timeout: Duration,
    ) -> ExecutionResult {
        if program.contains_payload("slow") {
            thread::sleep(Duration::from_millis(50));
        }
        let crashes = program.contains_payload("crash_on_b")
            || (program.contains_payload("late_crash") && program.contains_payload("tag r2"));
        if crashes && platform.as_str() == "b" {
            return ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::RuntimeError,
                "Traceback (most recent call last):\nRuntimeError: gate not supported by backend",
                Duration::from_millis(1),
            );
        }
        if program.contains_payload("diverge_on_c") && platform.as_str() == "c" {
            return ExecutionResult::success(platform.clone(), "DIFFERENT", Duration::from_millis(1));
        }
        ExecutionResult::success(platform.clone(), program.render(), Duration::from_millis(1))
    }
}

/// Appends `tag r<round>` to every variant.
pub struct RoundTagger;

impl ProgramTransform for RoundTagger {
    fn transform(
        &self,
        program: &Program,
        _platform: &PlatformId,
        round: u32,
        _timeout: Duration,
    ) -> Result<Program, String> {
        let mut next = program.clone();
        next.statements.push(Statement::fixed(
            StatementKind::Opaque,
            format!("tag r{round}"),
        ));
        Ok(next)
    }
}

pub fn pipeline() -> Pipeline {
    pipeline_with_converter(Box::new(Identity))
}

pub fn pipeline_with_converter(converter: Box<dyn PlatformConverter>) -> Pipeline {
    Pipeline::new(
        PLATFORMS.iter().map(|p| PlatformId::new(*p)).collect(),
        Box::new(ScriptedAdapter),
        converter,
        Box::new(RoundTagger),
        DivergenceDetector::new(Box::new(NormalizedTextMatch), DetectorConfig::default()),
        Duration::from_secs(5),
    )
}

/// Program `id` with one opaque removable statement per line of `body`.
pub fn program(id: &str, body: &[&str]) -> Program {
    ProgramFormat::Lines
        .parse(ProgramId::new(id), &body.join("\n"))
        .expect("non-empty program")
}

/// `filler` gates plus `marker` at position `marker_at`.
pub fn program_with_marker(id: &str, filler: usize, marker: &str, marker_at: usize) -> Program {
    let mut lines: Vec<String> = (0..filler).map(|i| format!("g{i}")).collect();
    lines.insert(marker_at.min(lines.len()), marker.to_owned());
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    program(id, &refs)
}
