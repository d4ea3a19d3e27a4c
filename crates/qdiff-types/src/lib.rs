pub mod execution;
pub mod program;
pub mod record;
pub mod taxonomy;
pub mod verdict;

pub use execution::{ExecutionResult, ExecutionStatus};
pub use program::{Program, ProgramFormat, ProgramId, ProgramParseError, Statement, StatementKind};
pub use record::{ErrorRecord, RoundRecord, derive_clue};
pub use taxonomy::{Taxonomy, TaxonomyCounts};
pub use verdict::{
    DivergenceDetail, DivergenceVerdict, Equivalence, PlatformPair, TimestampedVerdict,
    VerdictKind,
};

use std::fmt;

/// Identifier of one independent implementation under differential test.
///
/// Opaque to the core. Ordering is lexicographic and is what makes pairwise
/// disagreement reports canonical regardless of execution order.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct PlatformId(String);

impl PlatformId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlatformId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
