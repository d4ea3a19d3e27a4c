use std::time::Duration;

use qdiff_harness::{
    DetectorConfig, DivergenceDetector, ExecutionAdapter, FailureSignature, Identity,
    MinimizationOutcome, MinimizerConfig, NormalizedTextMatch, Pipeline, TrialOutcome,
    ReplayOracle, ReproductionOracle, minimize,
};
use qdiff_types::{
    ExecutionResult, ExecutionStatus, PlatformId, Program, ProgramFormat, ProgramId, VerdictKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CAUSE: &str = "s7";

/// Ten removable statements `s0..s9`.
fn ten_statements() -> Program {
    let source: Vec<String> = (0..10).map(|i| format!("s{i}")).collect();
    ProgramFormat::Lines
        .parse(ProgramId::new("scenario_d"), &source.join("\n"))
        .expect("parse")
}

/// Platform `b` fails whenever the cause statement is present.
struct FailsOnCause;

impl ExecutionAdapter for FailsOnCause {
    fn execute(&self, program: &Program, platform: &PlatformId, _: Duration) -> ExecutionResult {
        if platform.as_str() == "b" && program.contains_payload(CAUSE) {
            return ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::RuntimeError,
                "transpile failed\nRuntimeError: circuits are not equivalent",
                Duration::from_millis(1),
            );
        }
        ExecutionResult::success(platform.clone(), "ok", Duration::from_millis(1))
    }
}

fn replay_pipeline() -> Pipeline {
    Pipeline::new(
        vec![PlatformId::new("a"), PlatformId::new("b"), PlatformId::new("c")],
        Box::new(FailsOnCause),
        Box::new(Identity),
        Box::new(Identity),
        DivergenceDetector::new(Box::new(NormalizedTextMatch), DetectorConfig::default()),
        Duration::from_secs(5),
    )
}

/// Truth is "contains the cause"; each answer flips with probability 1/20.
struct FlakyOracle {
    rng: StdRng,
}

impl ReproductionOracle for FlakyOracle {
    fn reproduces(&mut self, candidate: &Program) -> bool {
        let truth = candidate.contains_payload(CAUSE);
        if self.rng.gen_bool(1.0 / 20.0) { !truth } else { truth }
    }
}

#[test]
fn test_replay_isolates_the_single_cause() {
    let pipeline = replay_pipeline();
    let program = ten_statements();
    let mut oracle = ReplayOracle::new(
        &pipeline,
        1,
        FailureSignature::new(VerdictKind::CrashOnly, "not equivalent"),
    );
    assert_eq!(oracle.clue(), "not equivalent");

    let report = minimize(&program, &mut oracle, &MinimizerConfig::default());
    let MinimizationOutcome::Minimized { program: minimal } = &report.outcome else {
        panic!("expected minimized, got {:?}", report.outcome);
    };
    assert_eq!(minimal.len(), 1);
    assert!(minimal.contains_payload(CAUSE));
    assert_eq!(report.session.clue_message, "not equivalent");
    assert_eq!(report.session.flakes, 0);

    // n log n scaled by the confirmation count.
    let n = program.removable_count();
    let bound = 3 * n * (usize::BITS - n.leading_zeros()) as usize;
    assert!(
        report.oracle_calls <= bound,
        "{} oracle calls exceeds {bound}",
        report.oracle_calls
    );
}

#[test]
fn test_replay_rejects_a_different_failure() {
    let pipeline = replay_pipeline();
    let program = ten_statements();
    let mut oracle = ReplayOracle::new(
        &pipeline,
        1,
        FailureSignature::new(VerdictKind::CrashOnly, "segmentation fault"),
    );
    let report = minimize(&program, &mut oracle, &MinimizerConfig::default());
    assert_eq!(report.outcome, MinimizationOutcome::NotReproducible);
    assert_eq!(report.oracle_calls, 3);
}

#[test]
fn test_flaky_oracle_rarely_discards_the_cause() {
    const TRIALS: u64 = 200;
    let program = ten_statements();
    let config = MinimizerConfig::default();

    let mut discards = 0u64;
    let mut flaky_sessions = 0u64;
    for seed in 0..TRIALS {
        let mut oracle = FlakyOracle {
            rng: StdRng::seed_from_u64(seed),
        };
        let report = minimize(&program, &mut oracle, &config);
        if report.session.flakes > 0 {
            flaky_sessions += 1;
        }
        if let Some(best) = report.outcome.best_program() {
            if !best.contains_payload(CAUSE) {
                discards += 1;
            }
        }
    }
    assert!(
        discards * 10 <= TRIALS,
        "cause discarded in {discards} of {TRIALS} trials"
    );
    assert!(flaky_sessions > 0, "flip rate never produced a flake");
}

#[test]
fn test_flakes_are_logged_as_trial_outcomes() {
    let program = ten_statements();
    // Deterministic: the first negative trial of a cause-holding candidate
    // is followed by a positive re-observation.
    let mut answers = 0usize;
    let mut oracle = |candidate: &Program| {
        answers += 1;
        candidate.contains_payload(CAUSE) && answers != 2
    };
    let report = minimize(&program, &mut oracle, &MinimizerConfig::default());
    assert!(
        report
            .session
            .history
            .iter()
            .any(|trial| trial.outcome == TrialOutcome::Flaky)
    );
    assert_eq!(report.session.flakes, 1);
    let best = report.outcome.best_program().expect("best program");
    assert!(best.contains_payload(CAUSE));
}
