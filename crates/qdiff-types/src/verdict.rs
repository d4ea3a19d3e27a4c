//! Verdicts produced by classifying one multi-platform execution batch.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{ExecutionStatus, PlatformId};

/// Answer of an equivalence predicate for one pair of artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Equivalence {
    Equivalent,
    NotEquivalent,
    NoInformation,
}

/// Unordered platform pair, stored with the lexicographically smaller id first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlatformPair {
    pub first: PlatformId,
    pub second: PlatformId,
}

impl PlatformPair {
    pub fn new(a: PlatformId, b: PlatformId) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }

    pub fn contains(&self, platform: &PlatformId) -> bool {
        &self.first == platform || &self.second == platform
    }
}

impl fmt::Display for PlatformPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vs {}", self.first, self.second)
    }
}

/// Pairwise disagreement graph of a divergent batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceDetail {
    /// Every pair of successful platforms judged not equivalent, sorted.
    pub disagreeing_pairs: Vec<PlatformPair>,
    /// Pairs the predicate could not decide, sorted.
    pub undecided_pairs: Vec<PlatformPair>,
    /// Platforms that did not succeed, sorted.
    pub failed_platforms: Vec<PlatformId>,
    /// First differing line of the first disagreeing pair.
    pub summary: String,
}

impl DivergenceDetail {
    /// Every platform appearing in a disagreeing pair.
    pub fn divergent_platforms(&self) -> BTreeSet<PlatformId> {
        self.disagreeing_pairs
            .iter()
            .flat_map(|pair| [pair.first.clone(), pair.second.clone()])
            .collect()
    }
}

/// Classification of one batch of execution results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergenceVerdict {
    AllEquivalent,
    Divergent(DivergenceDetail),
    Inconclusive {
        reason: String,
    },
    CrashOnly {
        platform: PlatformId,
        status: ExecutionStatus,
        message: String,
        /// The failure message matched a configured unsupported-feature marker.
        #[serde(default)]
        unsupported_feature: bool,
    },
}

impl DivergenceVerdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Self::AllEquivalent => VerdictKind::AllEquivalent,
            Self::Divergent(_) => VerdictKind::Divergent,
            Self::Inconclusive { .. } => VerdictKind::Inconclusive,
            Self::CrashOnly { .. } => VerdictKind::CrashOnly,
        }
    }

    #[inline]
    pub fn is_all_equivalent(&self) -> bool {
        matches!(self, Self::AllEquivalent)
    }

    /// One-line human readable description, also the text clue matching
    /// searches in.
    pub fn describe(&self) -> String {
        match self {
            Self::AllEquivalent => "all platforms equivalent".to_owned(),
            Self::Divergent(detail) => {
                let pairs: Vec<String> = detail
                    .disagreeing_pairs
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                format!("not equivalent: {} ({})", pairs.join(", "), detail.summary)
            }
            Self::Inconclusive { reason } => format!("inconclusive: {reason}"),
            Self::CrashOnly {
                platform,
                status,
                message,
                unsupported_feature,
            } => {
                let tag = if *unsupported_feature {
                    " [unsupported feature]"
                } else {
                    ""
                };
                format!("{platform} {status}{tag}: {message}")
            }
        }
    }
}

/// Discriminant of a verdict, used in signatures and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    AllEquivalent,
    Divergent,
    Inconclusive,
    CrashOnly,
}

impl VerdictKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllEquivalent => "all_equivalent",
            Self::Divergent => "divergent",
            Self::Inconclusive => "inconclusive",
            Self::CrashOnly => "crash_only",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict paired with the wall-clock time it was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedVerdict {
    pub verdict: DivergenceVerdict,
    pub classified_at_unix_ms: u64,
}

impl TimestampedVerdict {
    pub fn now(verdict: DivergenceVerdict) -> Self {
        let classified_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            verdict,
            classified_at_unix_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_canonical() {
        let ab = PlatformPair::new(PlatformId::new("b"), PlatformId::new("a"));
        assert_eq!(ab.first.as_str(), "a");
        assert_eq!(ab, PlatformPair::new(PlatformId::new("a"), PlatformId::new("b")));
        assert!(ab.contains(&PlatformId::new("b")));
        assert_eq!(ab.to_string(), "a vs b");
    }

    #[test]
    fn divergent_description_contains_clue_text() {
        let verdict = DivergenceVerdict::Divergent(DivergenceDetail {
            disagreeing_pairs: vec![PlatformPair::new("p1".into(), "p2".into())],
            undecided_pairs: Vec::new(),
            failed_platforms: Vec::new(),
            summary: "line 1: 'X' vs 'Y'".to_owned(),
        });
        assert_eq!(verdict.kind(), VerdictKind::Divergent);
        assert!(verdict.describe().contains("not equivalent"));
        assert!(verdict.describe().contains("p1 vs p2"));
    }

    #[test]
    fn crash_only_description_tags_unsupported_feature() {
        let verdict = DivergenceVerdict::CrashOnly {
            platform: "pytket".into(),
            status: ExecutionStatus::ParseError,
            message: "gate 'rccx' is not supported".to_owned(),
            unsupported_feature: true,
        };
        let text = verdict.describe();
        assert!(text.starts_with("pytket parse_error [unsupported feature]"));
    }

    #[test]
    fn verdict_serde_is_tagged() {
        let verdict = DivergenceVerdict::Inconclusive {
            reason: "timeout on qiskit".to_owned(),
        };
        let json = serde_json::to_string(&verdict).expect("serialize");
        assert!(json.contains("\"kind\":\"inconclusive\""));
        let back: DivergenceVerdict = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, verdict);
    }

    #[test]
    fn detail_lists_divergent_platforms() {
        let detail = DivergenceDetail {
            disagreeing_pairs: vec![
                PlatformPair::new("a".into(), "c".into()),
                PlatformPair::new("b".into(), "c".into()),
            ],
            undecided_pairs: Vec::new(),
            failed_platforms: Vec::new(),
            summary: String::new(),
        };
        let names: Vec<String> = detail
            .divergent_platforms()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn timestamp_is_populated() {
        let stamped = TimestampedVerdict::now(DivergenceVerdict::AllEquivalent);
        assert!(stamped.classified_at_unix_ms > 0);
    }
}
