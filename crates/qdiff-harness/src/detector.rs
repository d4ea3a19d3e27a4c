//! Divergence oracle: classifies the results of one program across all
//! platforms of a batch.
//!
//! # Decision table
//!
//! Evaluated in order, over results sorted by platform id:
//!
//! 1. No results at all: `Inconclusive`.
//! 2. Some pair of successful platforms is `NotEquivalent`: `Divergent`, with
//!    every disagreeing pair, every undecided pair, and every failed platform.
//! 3. Some pair is undecided (`NoInformation`, or the predicate panicked):
//!    `Inconclusive`.
//! 4. Some platform timed out: `Inconclusive`.
//! 5. Two or more platforms failed: `Inconclusive`.
//! 6. Exactly one platform failed: `CrashOnly`.
//! 7. Otherwise: `AllEquivalent`.
//!
//! The predicate is always called with the lexicographically smaller
//! platform's artifact first, so input order never changes the verdict.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use qdiff_types::{
    DivergenceDetail, DivergenceVerdict, Equivalence, ExecutionResult, ExecutionStatus,
    PlatformId, PlatformPair,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::equivalence::EquivalencePredicate;

/// Longest excerpt of a differing line kept in a divergence summary.
const SUMMARY_EXCERPT_CHARS: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Case-insensitive substrings that mark a single-platform failure as
    /// an unsupported feature rather than a bug.
    pub unsupported_feature_markers: Vec<String>,
}

impl DetectorConfig {
    fn is_unsupported_feature(&self, message: &str) -> bool {
        let message = message.to_ascii_lowercase();
        self.unsupported_feature_markers
            .iter()
            .any(|marker| !marker.is_empty() && message.contains(&marker.to_ascii_lowercase()))
    }
}

pub struct DivergenceDetector {
    predicate: Box<dyn EquivalencePredicate>,
    config: DetectorConfig,
}

impl std::fmt::Debug for DivergenceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DivergenceDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DivergenceDetector {
    pub fn new(predicate: Box<dyn EquivalencePredicate>, config: DetectorConfig) -> Self {
        Self { predicate, config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Classify one batch. Pure apart from predicate calls; never panics.
    #[must_use]
    pub fn classify(&self, results: &[ExecutionResult]) -> DivergenceVerdict {
        self.classify_within(results, None)
    }

    /// [`classify`](Self::classify) bounded by `deadline`.
    ///
    /// Each predicate call gets the remaining time as its budget. Once the
    /// deadline has passed no further pairs are compared and the batch is
    /// `Inconclusive`.
    #[must_use]
    pub fn classify_within(
        &self,
        results: &[ExecutionResult],
        deadline: Option<Instant>,
    ) -> DivergenceVerdict {
        if results.is_empty() {
            return DivergenceVerdict::Inconclusive {
                reason: "no execution results".to_owned(),
            };
        }

        let mut ordered: Vec<&ExecutionResult> = results.iter().collect();
        ordered.sort_by(|a, b| {
            a.platform()
                .cmp(b.platform())
                .then_with(|| a.status().cmp(&b.status()))
                .then_with(|| a.artifact().cmp(&b.artifact()))
                .then_with(|| a.message().cmp(&b.message()))
        });

        let successes: Vec<(&PlatformId, &str)> = ordered
            .iter()
            .filter_map(|r| r.artifact().filter(|_| r.is_success()).map(|a| (r.platform(), a)))
            .collect();
        let failures: Vec<&ExecutionResult> =
            ordered.iter().copied().filter(|r| !r.is_success()).collect();

        let mut disagreeing = Vec::new();
        let mut undecided = Vec::new();
        let mut summary = String::new();
        let mut predicate_panicked = false;

        let total_pairs = successes.len() * successes.len().saturating_sub(1) / 2;
        let mut compared = 0usize;
        for (i, (left_id, left)) in successes.iter().enumerate() {
            for (right_id, right) in &successes[i + 1..] {
                let pair = PlatformPair::new((*left_id).clone(), (*right_id).clone());
                let budget = match deadline {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                    None => Duration::MAX,
                };
                if budget.is_zero() {
                    warn!(compared, total_pairs, "classification ran out of budget");
                    return DivergenceVerdict::Inconclusive {
                        reason: format!(
                            "classification exceeded its budget after {compared} of {total_pairs} comparisons"
                        ),
                    };
                }
                compared += 1;
                let answer = self.compare(left, right, budget).unwrap_or_else(|| {
                    predicate_panicked = true;
                    Equivalence::NoInformation
                });
                debug!(pair = %pair, ?answer, "pairwise comparison");
                match answer {
                    Equivalence::Equivalent => {}
                    Equivalence::NotEquivalent => {
                        if summary.is_empty() {
                            summary = first_difference(left, right);
                        }
                        disagreeing.push(pair);
                    }
                    Equivalence::NoInformation => undecided.push(pair),
                }
            }
        }

        let failed_platforms: Vec<PlatformId> =
            failures.iter().map(|r| r.platform().clone()).collect();

        if !disagreeing.is_empty() {
            disagreeing.sort();
            undecided.sort();
            return DivergenceVerdict::Divergent(DivergenceDetail {
                disagreeing_pairs: disagreeing,
                undecided_pairs: undecided,
                failed_platforms,
                summary,
            });
        }

        if !undecided.is_empty() {
            undecided.sort();
            let pairs: Vec<String> = undecided.iter().map(ToString::to_string).collect();
            let cause = if predicate_panicked {
                "equivalence predicate panicked"
            } else {
                "equivalence undecided"
            };
            return DivergenceVerdict::Inconclusive {
                reason: format!("{cause} for {}", pairs.join(", ")),
            };
        }

        let timed_out: Vec<String> = failures
            .iter()
            .filter(|r| r.status() == ExecutionStatus::Timeout)
            .map(|r| r.platform().to_string())
            .collect();
        if !timed_out.is_empty() {
            return DivergenceVerdict::Inconclusive {
                reason: format!("timeout on {}", timed_out.join(", ")),
            };
        }

        match failures.as_slice() {
            [] => DivergenceVerdict::AllEquivalent,
            [only] => {
                let message = only.message().unwrap_or_default().to_owned();
                DivergenceVerdict::CrashOnly {
                    platform: only.platform().clone(),
                    status: only.status(),
                    unsupported_feature: self.config.is_unsupported_feature(&message),
                    message,
                }
            }
            many => {
                let names: Vec<String> = many
                    .iter()
                    .map(|r| format!("{} ({})", r.platform(), r.status()))
                    .collect();
                DivergenceVerdict::Inconclusive {
                    reason: format!("multiple platforms failed: {}", names.join(", ")),
                }
            }
        }
    }

    /// `None` when the predicate panicked.
    fn compare(&self, a: &str, b: &str, budget: Duration) -> Option<Equivalence> {
        let call = AssertUnwindSafe(|| {
            if budget == Duration::MAX {
                self.predicate.are_equivalent(a, b)
            } else {
                self.predicate.are_equivalent_within(a, b, budget)
            }
        });
        match panic::catch_unwind(call) {
            Ok(answer) => Some(answer),
            Err(_) => {
                warn!("equivalence predicate panicked; treating pair as undecided");
                None
            }
        }
    }
}

/// `line N: '<a>' vs '<b>'` for the first line where the artifacts differ.
fn first_difference(a: &str, b: &str) -> String {
    let mut left = a.lines();
    let mut right = b.lines();
    let mut line_no = 1usize;
    loop {
        match (left.next(), right.next()) {
            (None, None) => return "artifacts differ only in line endings".to_owned(),
            (l, r) if l != r => {
                return format!(
                    "line {line_no}: '{}' vs '{}'",
                    excerpt(l.unwrap_or("<eof>")),
                    excerpt(r.unwrap_or("<eof>"))
                );
            }
            _ => line_no += 1,
        }
    }
}

fn excerpt(line: &str) -> String {
    line.chars().take(SUMMARY_EXCERPT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use qdiff_types::VerdictKind;

    use super::*;
    use crate::equivalence::{ExactMatch, NormalizedTextMatch};

    fn ok(platform: &str, artifact: &str) -> ExecutionResult {
        ExecutionResult::success(PlatformId::new(platform), artifact, Duration::ZERO)
    }

    fn fail(platform: &str, status: ExecutionStatus, message: &str) -> ExecutionResult {
        ExecutionResult::failure(PlatformId::new(platform), status, message, Duration::ZERO)
    }

    fn exact() -> DivergenceDetector {
        DivergenceDetector::new(Box::new(ExactMatch), DetectorConfig::default())
    }

    struct Undecided;

    impl EquivalencePredicate for Undecided {
        fn are_equivalent(&self, _: &str, _: &str) -> Equivalence {
            Equivalence::NoInformation
        }
    }

    struct Panicking;

    impl EquivalencePredicate for Panicking {
        fn are_equivalent(&self, _: &str, _: &str) -> Equivalence {
            panic!("predicate bug")
        }
    }

    #[test]
    fn empty_input_is_inconclusive() {
        assert_eq!(exact().classify(&[]).kind(), VerdictKind::Inconclusive);
    }

    #[test]
    fn three_identical_artifacts_are_equivalent() {
        let verdict = exact().classify(&[ok("p1", "X"), ok("p2", "X"), ok("p3", "X")]);
        assert_eq!(verdict, DivergenceVerdict::AllEquivalent);
    }

    #[test]
    fn divergence_reports_every_pair() {
        let verdict = exact().classify(&[ok("p3", "X"), ok("p1", "X"), ok("p2", "Y")]);
        let DivergenceVerdict::Divergent(detail) = verdict else {
            panic!("expected divergent, got {verdict:?}");
        };
        let pairs: Vec<String> = detail.disagreeing_pairs.iter().map(ToString::to_string).collect();
        assert_eq!(pairs, ["p1 vs p2", "p2 vs p3"]);
        assert_eq!(detail.summary, "line 1: 'X' vs 'Y'");
        assert!(detail.failed_platforms.is_empty());
    }

    #[test]
    fn divergence_wins_over_failures() {
        let verdict = exact().classify(&[
            ok("a", "X"),
            ok("b", "Y"),
            fail("c", ExecutionStatus::Timeout, "slow"),
        ]);
        let DivergenceVerdict::Divergent(detail) = verdict else {
            panic!("expected divergent");
        };
        assert_eq!(detail.failed_platforms, vec![PlatformId::new("c")]);
    }

    #[test]
    fn single_parse_error_is_crash_only() {
        let verdict = exact().classify(&[
            fail("p1", ExecutionStatus::ParseError, "unexpected token"),
            ok("p2", "X"),
            ok("p3", "X"),
        ]);
        assert_eq!(
            verdict,
            DivergenceVerdict::CrashOnly {
                platform: PlatformId::new("p1"),
                status: ExecutionStatus::ParseError,
                message: "unexpected token".to_owned(),
                unsupported_feature: false,
            }
        );
    }

    #[test]
    fn unsupported_feature_marker_tags_crash() {
        let detector = DivergenceDetector::new(
            Box::new(ExactMatch),
            DetectorConfig {
                unsupported_feature_markers: vec!["Not Supported".to_owned()],
            },
        );
        let verdict = detector.classify(&[
            fail("pytket", ExecutionStatus::RuntimeError, "gate rccx is not supported"),
            ok("qiskit", "X"),
        ]);
        assert!(matches!(
            verdict,
            DivergenceVerdict::CrashOnly {
                unsupported_feature: true,
                ..
            }
        ));
    }

    #[test]
    fn timeouts_and_multiple_failures_are_inconclusive() {
        let verdict = exact().classify(&[
            ok("a", "X"),
            ok("b", "X"),
            fail("c", ExecutionStatus::Timeout, "slow"),
        ]);
        assert_eq!(
            verdict,
            DivergenceVerdict::Inconclusive {
                reason: "timeout on c".to_owned()
            }
        );

        let verdict = exact().classify(&[
            ok("a", "X"),
            fail("b", ExecutionStatus::Crash, "segv"),
            fail("c", ExecutionStatus::ParseError, "bad"),
        ]);
        assert_eq!(
            verdict,
            DivergenceVerdict::Inconclusive {
                reason: "multiple platforms failed: b (crash), c (parse_error)".to_owned()
            }
        );
    }

    #[test]
    fn undecided_predicate_is_inconclusive() {
        let detector = DivergenceDetector::new(Box::new(Undecided), DetectorConfig::default());
        let verdict = detector.classify(&[ok("a", "X"), ok("b", "X")]);
        assert_eq!(verdict.kind(), VerdictKind::Inconclusive);
    }

    #[test]
    fn panicking_predicate_is_contained() {
        let detector = DivergenceDetector::new(Box::new(Panicking), DetectorConfig::default());
        let verdict = detector.classify(&[ok("a", "X"), ok("b", "Y")]);
        let DivergenceVerdict::Inconclusive { reason } = verdict else {
            panic!("expected inconclusive");
        };
        assert!(reason.contains("panicked"));
    }

    struct Slow(Duration);

    impl EquivalencePredicate for Slow {
        fn are_equivalent(&self, _: &str, _: &str) -> Equivalence {
            std::thread::sleep(self.0);
            Equivalence::Equivalent
        }
    }

    #[test]
    fn classification_stops_at_the_deadline() {
        let detector = DivergenceDetector::new(
            Box::new(Slow(Duration::from_millis(100))),
            DetectorConfig::default(),
        );
        let results = [ok("a", "X"), ok("b", "X"), ok("c", "X")];
        let started = Instant::now();
        let verdict =
            detector.classify_within(&results, Some(started + Duration::from_millis(30)));
        assert!(started.elapsed() < Duration::from_millis(250));
        let DivergenceVerdict::Inconclusive { reason } = verdict else {
            panic!("expected inconclusive, got {verdict:?}");
        };
        assert_eq!(reason, "classification exceeded its budget after 1 of 3 comparisons");

        let unbounded = detector.classify_within(&results, None);
        assert!(unbounded.is_all_equivalent());
    }

    #[test]
    fn normalized_predicate_plugs_in() {
        let detector =
            DivergenceDetector::new(Box::new(NormalizedTextMatch), DetectorConfig::default());
        let verdict = detector.classify(&[ok("a", "X\n\n"), ok("b", "X // same")]);
        assert!(verdict.is_all_equivalent());
    }

    #[test]
    fn first_difference_handles_length_mismatch() {
        assert_eq!(first_difference("a\nb", "a"), "line 2: 'b' vs '<eof>'");
    }
}
