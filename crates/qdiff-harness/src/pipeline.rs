//! One program round: per-platform transform and execution fanned out on
//! scoped threads, joined, then classified.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use qdiff_types::{
    DivergenceVerdict, ExecutionResult, ExecutionStatus, PlatformId, Program,
};
use tracing::{debug, warn};

use crate::adapter::{ExecutionAdapter, PlatformConverter, ProgramTransform};
use crate::detector::DivergenceDetector;

/// Per-platform program variant. `Err` carries the reason the platform
/// could not get a variant; such a platform reports `Crash` every round.
pub type Variants = BTreeMap<PlatformId, Result<Program, String>>;

/// Outcome of one transform-execute-classify round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub variants: Variants,
    /// One result per platform, in platform order.
    pub results: Vec<ExecutionResult>,
    pub verdict: DivergenceVerdict,
    /// The round wall-clock budget ran out before classification.
    pub budget_exceeded: bool,
}

impl RoundOutcome {
    /// Variants that exist, dropping platforms that failed to get one.
    pub fn programs(&self) -> BTreeMap<PlatformId, Program> {
        self.variants
            .iter()
            .filter_map(|(platform, variant)| {
                variant
                    .as_ref()
                    .ok()
                    .map(|program| (platform.clone(), program.clone()))
            })
            .collect()
    }
}

/// The collaborators a round needs.
pub struct Pipeline {
    platforms: Vec<PlatformId>,
    adapter: Box<dyn ExecutionAdapter>,
    converter: Box<dyn PlatformConverter>,
    transform: Box<dyn ProgramTransform>,
    detector: DivergenceDetector,
    execution_timeout: Duration,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("platforms", &self.platforms)
            .field("detector", &self.detector)
            .field("execution_timeout", &self.execution_timeout)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// `platforms` is sorted and deduplicated.
    pub fn new(
        mut platforms: Vec<PlatformId>,
        adapter: Box<dyn ExecutionAdapter>,
        converter: Box<dyn PlatformConverter>,
        transform: Box<dyn ProgramTransform>,
        detector: DivergenceDetector,
        execution_timeout: Duration,
    ) -> Self {
        platforms.sort();
        platforms.dedup();
        Self {
            platforms,
            adapter,
            converter,
            transform,
            detector,
            execution_timeout,
        }
    }

    pub fn platforms(&self) -> &[PlatformId] {
        &self.platforms
    }

    pub fn detector(&self) -> &DivergenceDetector {
        &self.detector
    }

    /// Materialize `program` for every platform. A panicking converter only
    /// costs that platform its variant.
    pub fn convert(&self, program: &Program) -> Variants {
        self.platforms
            .iter()
            .map(|platform| {
                let attempt =
                    panic::catch_unwind(AssertUnwindSafe(|| self.converter.convert(program, platform)));
                let variant = attempt.unwrap_or_else(|payload| {
                    Err(format!("converter panicked: {}", panic_message(payload.as_ref())))
                });
                if let Err(message) = &variant {
                    warn!(program_id = %program.id, platform = %platform, error = %message, "conversion failed");
                }
                (platform.clone(), variant)
            })
            .collect()
    }

    /// Transform every platform's variant, execute it, and classify the
    /// batch.
    ///
    /// `deadline` bounds the whole round: transforms, executions, and
    /// equivalence checks each get at most the time left. A round that
    /// reaches the deadline is `Inconclusive` with `budget_exceeded` set.
    pub fn run_round(
        &self,
        program: &Program,
        round: u32,
        variants: &Variants,
        deadline: Option<Instant>,
    ) -> RoundOutcome {
        let per_platform: Vec<(PlatformId, Result<Program, String>, ExecutionResult)> =
            thread::scope(|scope| {
                let handles: Vec<_> = self
                    .platforms
                    .iter()
                    .map(|platform| {
                        let input = variants.get(platform);
                        let handle = scope.spawn(move || {
                            self.transform_and_execute(program, platform, round, input, deadline)
                        });
                        (platform, handle)
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|(platform, handle)| {
                        handle.join().unwrap_or_else(|payload| {
                            let message =
                                format!("platform worker panicked: {}", panic_message(payload.as_ref()));
                            warn!(program_id = %program.id, platform = %platform, round, error = %message, "platform worker panicked");
                            (
                                platform.clone(),
                                Err(message.clone()),
                                ExecutionResult::failure(
                                    platform.clone(),
                                    ExecutionStatus::Crash,
                                    message,
                                    Duration::ZERO,
                                ),
                            )
                        })
                    })
                    .collect()
            });

        let mut next = Variants::new();
        let mut results = Vec::with_capacity(per_platform.len());
        for (platform, variant, result) in per_platform {
            next.insert(platform, variant);
            results.push(result);
        }

        let classified = if expired(deadline) {
            None
        } else {
            Some(self.detector.classify_within(&results, deadline))
        };
        let budget_exceeded = expired(deadline);
        let verdict = match classified {
            Some(verdict) if !budget_exceeded => verdict,
            _ => DivergenceVerdict::Inconclusive {
                reason: format!("round {round} exceeded its wall-clock budget"),
            },
        };
        debug!(program_id = %program.id, round, verdict = %verdict.kind(), "round classified");

        RoundOutcome {
            variants: next,
            results,
            verdict,
            budget_exceeded,
        }
    }

    fn transform_and_execute(
        &self,
        program: &Program,
        platform: &PlatformId,
        round: u32,
        input: Option<&Result<Program, String>>,
        deadline: Option<Instant>,
    ) -> (PlatformId, Result<Program, String>, ExecutionResult) {
        let started_at = Instant::now();
        let crash = |message: String| {
            ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::Crash,
                message,
                started_at.elapsed(),
            )
        };

        let variant = match input {
            Some(Ok(variant)) => variant,
            Some(Err(message)) => {
                let result = crash(format!("no variant: {message}"));
                return (platform.clone(), Err(message.clone()), result);
            }
            None => {
                let message = format!("no variant for platform '{platform}'");
                let result = crash(message.clone());
                return (platform.clone(), Err(message), result);
            }
        };

        let budget = remaining(deadline);
        let transformed = match self.transform.transform(variant, platform, round, budget) {
            Ok(transformed) => transformed,
            Err(message) => {
                warn!(program_id = %program.id, platform = %platform, round, error = %message, "transform failed");
                let result = crash(format!("transform failed: {message}"));
                return (platform.clone(), Err(message), result);
            }
        };

        let timeout = self.execution_timeout.min(remaining(deadline));
        let result = if timeout.is_zero() {
            ExecutionResult::timeout(platform.clone(), started_at.elapsed())
        } else {
            self.adapter.execute(&transformed, platform, timeout)
        };
        debug!(
            program_id = %program.id,
            platform = %platform,
            round,
            status = %result.status(),
            duration_ms = u64::try_from(result.duration().as_millis()).unwrap_or(u64::MAX),
            "platform executed"
        );
        (platform.clone(), Ok(transformed), result)
    }
}

/// Time left before `deadline`; unbounded without one.
fn remaining(deadline: Option<Instant>) -> Duration {
    deadline.map_or(Duration::MAX, |deadline| {
        deadline.saturating_duration_since(Instant::now())
    })
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

#[cfg(test)]
mod tests {
    use qdiff_types::{Equivalence, ProgramId, Statement, VerdictKind};

    use super::*;
    use crate::adapter::Identity;
    use crate::detector::DetectorConfig;
    use crate::equivalence::{EquivalencePredicate, ExactMatch};

    struct Render;

    impl ExecutionAdapter for Render {
        fn execute(&self, program: &Program, platform: &PlatformId, _: Duration) -> ExecutionResult {
            ExecutionResult::success(platform.clone(), program.render(), Duration::ZERO)
        }
    }

    struct AppendOnB;

    impl ProgramTransform for AppendOnB {
        fn transform(
            &self,
            program: &Program,
            platform: &PlatformId,
            round: u32,
            _: Duration,
        ) -> Result<Program, String> {
            if platform.as_str() == "b" && round == 2 {
                return Err("rewriter crashed".to_owned());
            }
            Ok(program.clone())
        }
    }

    struct PanicsOnB;

    impl PlatformConverter for PanicsOnB {
        fn convert(&self, program: &Program, platform: &PlatformId) -> Result<Program, String> {
            if platform.as_str() == "b" {
                panic!("converter bug");
            }
            Ok(program.clone())
        }
    }

    struct SlowEquivalence;

    impl EquivalencePredicate for SlowEquivalence {
        fn are_equivalent(&self, _: &str, _: &str) -> Equivalence {
            std::thread::sleep(Duration::from_millis(100));
            Equivalence::Equivalent
        }
    }

    fn pipeline(transform: Box<dyn ProgramTransform>) -> Pipeline {
        Pipeline::new(
            vec![PlatformId::new("c"), PlatformId::new("a"), PlatformId::new("b")],
            Box::new(Render),
            Box::new(Identity),
            transform,
            DivergenceDetector::new(Box::new(ExactMatch), DetectorConfig::default()),
            Duration::from_secs(5),
        )
    }

    fn program() -> Program {
        Program::new(ProgramId::new("p"), vec![Statement::gate("h q[0];")])
    }

    #[test]
    fn platforms_are_sorted() {
        let pipeline = pipeline(Box::new(Identity));
        let names: Vec<&str> = pipeline
            .platforms()
            .iter()
            .map(PlatformId::as_str)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn clean_round_is_all_equivalent() {
        let pipeline = pipeline(Box::new(Identity));
        let variants = pipeline.convert(&program());
        let outcome = pipeline.run_round(&program(), 1, &variants, None);
        assert!(outcome.verdict.is_all_equivalent());
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.programs().len(), 3);
        assert!(!outcome.budget_exceeded);
    }

    #[test]
    fn failing_transform_becomes_crash() {
        let pipeline = pipeline(Box::new(AppendOnB));
        let variants = pipeline.convert(&program());
        let outcome = pipeline.run_round(&program(), 2, &variants, None);
        assert_eq!(outcome.verdict.kind(), VerdictKind::CrashOnly);
        assert!(outcome.variants[&PlatformId::new("b")].is_err());
        assert_eq!(outcome.programs().len(), 2);
    }

    #[test]
    fn expired_deadline_is_inconclusive() {
        let pipeline = pipeline(Box::new(Identity));
        let variants = pipeline.convert(&program());
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        let outcome = pipeline.run_round(&program(), 1, &variants, Some(deadline));
        assert!(outcome.budget_exceeded);
        assert_eq!(outcome.verdict.kind(), VerdictKind::Inconclusive);
    }

    #[test]
    fn slow_classification_counts_against_the_budget() {
        let pipeline = Pipeline::new(
            vec![PlatformId::new("a"), PlatformId::new("b"), PlatformId::new("c")],
            Box::new(Render),
            Box::new(Identity),
            Box::new(Identity),
            DivergenceDetector::new(Box::new(SlowEquivalence), DetectorConfig::default()),
            Duration::from_secs(5),
        );
        let variants = pipeline.convert(&program());
        let started = Instant::now();
        let outcome = pipeline.run_round(
            &program(),
            1,
            &variants,
            Some(started + Duration::from_millis(50)),
        );
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(outcome.budget_exceeded);
        assert_eq!(
            outcome.verdict,
            DivergenceVerdict::Inconclusive {
                reason: "round 1 exceeded its wall-clock budget".to_owned()
            }
        );

        let unbounded = pipeline.run_round(&program(), 1, &variants, None);
        assert!(unbounded.verdict.is_all_equivalent());
    }

    #[test]
    fn panicking_converter_costs_only_its_platform() {
        let pipeline = Pipeline::new(
            vec![PlatformId::new("a"), PlatformId::new("b"), PlatformId::new("c")],
            Box::new(Render),
            Box::new(PanicsOnB),
            Box::new(Identity),
            DivergenceDetector::new(Box::new(ExactMatch), DetectorConfig::default()),
            Duration::from_secs(5),
        );
        let variants = pipeline.convert(&program());
        let b = variants[&PlatformId::new("b")].as_ref().expect_err("no variant for b");
        assert_eq!(b, "converter panicked: converter bug");
        assert!(variants[&PlatformId::new("a")].is_ok());

        let outcome = pipeline.run_round(&program(), 1, &variants, None);
        assert_eq!(outcome.verdict.kind(), VerdictKind::CrashOnly);
    }
}
