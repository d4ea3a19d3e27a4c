use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PlatformId;

/// Outcome class of one program execution on one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    ParseError,
    RuntimeError,
    Timeout,
    Crash,
}

impl ExecutionStatus {
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ParseError => "parse_error",
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable output of running one program on one platform.
///
/// Created once by an adapter and never mutated afterwards; fields are only
/// reachable through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    platform: PlatformId,
    status: ExecutionStatus,
    artifact: Option<String>,
    message: Option<String>,
    duration: Duration,
}

impl ExecutionResult {
    /// Successful execution producing `artifact`.
    pub fn success(platform: PlatformId, artifact: impl Into<String>, duration: Duration) -> Self {
        Self {
            platform,
            status: ExecutionStatus::Success,
            artifact: Some(artifact.into()),
            message: None,
            duration,
        }
    }

    /// Failed execution. A `Success` status is coerced to `RuntimeError`
    /// because a success without an artifact carries nothing to compare.
    pub fn failure(
        platform: PlatformId,
        status: ExecutionStatus,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let status = if status.is_success() {
            ExecutionStatus::RuntimeError
        } else {
            status
        };
        Self {
            platform,
            status,
            artifact: None,
            message: Some(message.into()),
            duration,
        }
    }

    pub fn timeout(platform: PlatformId, elapsed: Duration) -> Self {
        let message = format!("execution exceeded {} ms", elapsed.as_millis());
        Self::failure(platform, ExecutionStatus::Timeout, message, elapsed)
    }

    #[inline]
    pub fn platform(&self) -> &PlatformId {
        &self.platform
    }

    #[inline]
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    #[inline]
    pub fn artifact(&self) -> Option<&str> {
        self.artifact.as_deref()
    }

    #[inline]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_carries_artifact() {
        let result =
            ExecutionResult::success(PlatformId::new("qiskit"), "X", Duration::from_millis(4));
        assert!(result.is_success());
        assert_eq!(result.artifact(), Some("X"));
        assert_eq!(result.message(), None);
    }

    #[test]
    fn failure_never_reports_success() {
        let result = ExecutionResult::failure(
            PlatformId::new("pytket"),
            ExecutionStatus::Success,
            "no output",
            Duration::ZERO,
        );
        assert_eq!(result.status(), ExecutionStatus::RuntimeError);
        assert_eq!(result.artifact(), None);
    }

    #[test]
    fn timeout_message_names_budget() {
        let result = ExecutionResult::timeout(PlatformId::new("bqskit"), Duration::from_secs(2));
        assert_eq!(result.status(), ExecutionStatus::Timeout);
        assert_eq!(result.message(), Some("execution exceeded 2000 ms"));
    }

    #[test]
    fn serde_uses_snake_case_status() {
        let result = ExecutionResult::failure(
            PlatformId::new("qiskit"),
            ExecutionStatus::ParseError,
            "unexpected token",
            Duration::from_millis(1),
        );
        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"parse_error\""));
        let back: ExecutionResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, result);
    }
}
