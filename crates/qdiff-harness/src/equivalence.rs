//! Pluggable artifact equivalence predicates.

use std::io::Write as _;
use std::time::Duration;

use qdiff_types::Equivalence;
use tracing::{debug, warn};

use crate::process;

/// Decides whether two platform artifacts are equivalent.
///
/// Implementations may answer [`Equivalence::NoInformation`] whenever they
/// cannot decide; the detector turns that into an inconclusive verdict.
pub trait EquivalencePredicate: Send + Sync {
    fn are_equivalent(&self, a: &str, b: &str) -> Equivalence;

    /// Answer within `budget`. Predicates backed by an interruptible
    /// resource override this; in-process ones ignore the budget and the
    /// detector checks its deadline between calls.
    fn are_equivalent_within(&self, a: &str, b: &str, budget: Duration) -> Equivalence {
        let _ = budget;
        self.are_equivalent(a, b)
    }
}

/// Byte-for-byte comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl EquivalencePredicate for ExactMatch {
    fn are_equivalent(&self, a: &str, b: &str) -> Equivalence {
        if a == b {
            Equivalence::Equivalent
        } else {
            Equivalence::NotEquivalent
        }
    }
}

/// Comparison that ignores blank lines, `//` comments, and trailing
/// whitespace.
///
/// A `//` opens a comment only at the start of a line or after whitespace
/// or `;`, so URLs and paths in artifacts are compared verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedTextMatch;

impl NormalizedTextMatch {
    pub fn normalize(text: &str) -> Vec<&str> {
        text.lines()
            .map(|line| strip_comment(line).trim_end())
            .filter(|line| !line.trim().is_empty())
            .collect()
    }
}

fn strip_comment(line: &str) -> &str {
    let mut from = 0;
    while let Some(found) = line[from..].find("//") {
        let idx = from + found;
        let head = &line[..idx];
        if head.trim().is_empty() || head.ends_with(|c: char| c.is_whitespace() || c == ';') {
            return head;
        }
        from = idx + 2;
    }
    line
}

impl EquivalencePredicate for NormalizedTextMatch {
    fn are_equivalent(&self, a: &str, b: &str) -> Equivalence {
        if Self::normalize(a) == Self::normalize(b) {
            Equivalence::Equivalent
        } else {
            Equivalence::NotEquivalent
        }
    }
}

/// Delegates to an external verification tool.
///
/// `{a}` and `{b}` in argv are replaced by temp files holding the two
/// artifacts. The last non-blank stdout line is the answer token.
#[derive(Debug, Clone)]
pub struct CommandEquivalence {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandEquivalence {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }

    /// Map the tool's answer token to an [`Equivalence`].
    pub fn parse_token(token: &str) -> Equivalence {
        match token.trim().to_ascii_lowercase().as_str() {
            "equivalent" | "equivalent_up_to_global_phase" | "equivalent_up_to_phase" => {
                Equivalence::Equivalent
            }
            "not_equivalent" => Equivalence::NotEquivalent,
            _ => Equivalence::NoInformation,
        }
    }

    fn write_artifact(text: &str) -> Option<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("qdiff-artifact-")
            .tempfile()
            .ok()?;
        file.write_all(text.as_bytes()).ok()?;
        file.flush().ok()?;
        Some(file)
    }
}

impl EquivalencePredicate for CommandEquivalence {
    fn are_equivalent(&self, a: &str, b: &str) -> Equivalence {
        self.are_equivalent_within(a, b, self.timeout)
    }

    /// The command runs under the smaller of its own timeout and `budget`.
    fn are_equivalent_within(&self, a: &str, b: &str, budget: Duration) -> Equivalence {
        let timeout = self.timeout.min(budget);
        let (Some(file_a), Some(file_b)) = (Self::write_artifact(a), Self::write_artifact(b)) else {
            warn!("could not stage artifacts for equivalence command");
            return Equivalence::NoInformation;
        };
        let path_a = file_a.path().display().to_string();
        let path_b = file_b.path().display().to_string();
        let argv = process::substitute(&self.argv, &[("a", &path_a), ("b", &path_b)]);

        match process::run_with_timeout(&argv, timeout) {
            Ok(output) if output.timed_out => {
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "equivalence command timed out"
                );
                Equivalence::NoInformation
            }
            Ok(output) => {
                let token = output
                    .stdout
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or_default();
                let answer = Self::parse_token(token);
                debug!(token = %token.trim(), ?answer, "equivalence command answered");
                answer
            }
            Err(message) => {
                warn!(error = %message, "equivalence command failed to run");
                Equivalence::NoInformation
            }
        }
    }
}
