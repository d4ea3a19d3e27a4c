//! Harness configuration loaded from JSON. Every field has a default.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use qdiff_error::{QdiffError, Result};
use qdiff_types::{PlatformId, ProgramFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapter::{CommandAdapter, CommandRewriter, Identity, PlatformConverter, ProgramTransform};
use crate::corpus::ProgramRange;
use crate::detector::{DetectorConfig, DivergenceDetector};
use crate::equivalence::{CommandEquivalence, EquivalencePredicate, ExactMatch, NormalizedTextMatch};
use crate::minimizer::MinimizerConfig;
use crate::pipeline::Pipeline;
use crate::qite::QiteConfig;

/// One platform under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub id: PlatformId,
    /// Command running a program; `{program}` and `{platform}` are replaced.
    pub execute: Vec<String>,
    /// Optional per-round rewrite command; stdout is the new program.
    #[serde(default)]
    pub transform: Option<Vec<String>>,
    /// Optional one-time conversion command applied before round 1.
    #[serde(default)]
    pub convert: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EquivalenceSpec {
    Exact,
    #[default]
    Normalized,
    Command {
        argv: Vec<String>,
        #[serde(default = "default_command_timeout_ms")]
        timeout_ms: u64,
    },
}

const fn default_command_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub platforms: Vec<PlatformSpec>,
    pub equivalence: EquivalenceSpec,
    pub execution_timeout_ms: u64,
    pub transform_timeout_ms: u64,
    pub round_budget_ms: u64,
    pub rounds: u32,
    pub workers: usize,
    pub minimize_failures: bool,
    pub minimizer: MinimizerConfig,
    pub detector: DetectorConfig,
    pub format: ProgramFormat,
    /// Only programs whose numeric id prefix falls in this range run.
    pub program_range: Option<ProgramRange>,
    /// Unix time in seconds after which no new program is started.
    pub run_deadline_unix_s: Option<u64>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            platforms: Vec::new(),
            equivalence: EquivalenceSpec::default(),
            execution_timeout_ms: 30_000,
            transform_timeout_ms: 30_000,
            round_budget_ms: 300_000,
            rounds: 3,
            workers: 4,
            minimize_failures: false,
            minimizer: MinimizerConfig::default(),
            detector: DetectorConfig::default(),
            format: ProgramFormat::default(),
            program_range: None,
            run_deadline_unix_s: None,
        }
    }
}

impl HarnessConfig {
    /// Read and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// `Io`/`Json` when the file cannot be read or parsed, `InvalidConfig`
    /// when validation fails.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|error| {
            QdiffError::config(format!("cannot read '{}': {error}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!(
            path = %path.display(),
            platforms = config.platforms.len(),
            rounds = config.rounds,
            workers = config.workers,
            "configuration loaded"
        );
        Ok(config)
    }

    /// # Errors
    ///
    /// `InvalidConfig` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.platforms.is_empty() {
            return Err(QdiffError::config("at least one platform is required"));
        }
        let mut seen = BTreeSet::new();
        for platform in &self.platforms {
            if !seen.insert(&platform.id) {
                return Err(QdiffError::config(format!(
                    "duplicate platform id '{}'",
                    platform.id
                )));
            }
            if platform.execute.is_empty() {
                return Err(QdiffError::config(format!(
                    "platform '{}' has an empty execute command",
                    platform.id
                )));
            }
            for (what, argv) in [("transform", &platform.transform), ("convert", &platform.convert)] {
                if argv.as_ref().is_some_and(Vec::is_empty) {
                    return Err(QdiffError::config(format!(
                        "platform '{}' has an empty {what} command",
                        platform.id
                    )));
                }
            }
        }
        if let EquivalenceSpec::Command { argv, .. } = &self.equivalence {
            if argv.is_empty() {
                return Err(QdiffError::config("equivalence command is empty"));
            }
        }
        if self.workers == 0 {
            return Err(QdiffError::config("workers must be at least 1"));
        }
        if self.rounds == 0 {
            return Err(QdiffError::config("rounds must be at least 1"));
        }
        if self.execution_timeout_ms == 0 || self.round_budget_ms == 0 {
            return Err(QdiffError::config("timeouts must be positive"));
        }
        if let Some(range) = self.program_range {
            if range.first > range.last {
                return Err(QdiffError::config(format!(
                    "program_range {}..{} is empty",
                    range.first, range.last
                )));
            }
        }
        if self.minimizer.max_oracle_calls == 0 {
            return Err(QdiffError::config("minimizer.max_oracle_calls must be positive"));
        }
        Ok(())
    }

    pub fn platform_ids(&self) -> Vec<PlatformId> {
        self.platforms.iter().map(|p| p.id.clone()).collect()
    }

    pub fn qite_config(&self) -> QiteConfig {
        QiteConfig {
            rounds: self.rounds,
            workers: self.workers,
            round_budget: Duration::from_millis(self.round_budget_ms),
            minimize_failures: self.minimize_failures,
            minimizer: self.minimizer,
            run_deadline: self
                .run_deadline_unix_s
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
            program_range: self.program_range,
        }
    }

    pub fn equivalence_predicate(&self) -> Box<dyn EquivalencePredicate> {
        match &self.equivalence {
            EquivalenceSpec::Exact => Box::new(ExactMatch),
            EquivalenceSpec::Normalized => Box::new(NormalizedTextMatch),
            EquivalenceSpec::Command { argv, timeout_ms } => Box::new(CommandEquivalence::new(
                argv.clone(),
                Duration::from_millis(*timeout_ms),
            )),
        }
    }

    /// Subprocess-backed pipeline for the configured platforms.
    pub fn build_pipeline(&self) -> Pipeline {
        let execute: BTreeMap<PlatformId, Vec<String>> = self
            .platforms
            .iter()
            .map(|p| (p.id.clone(), p.execute.clone()))
            .collect();
        let rewrite_timeout = Duration::from_millis(self.transform_timeout_ms);
        let transforms = command_map(&self.platforms, |p| p.transform.as_ref());
        let transform: Box<dyn ProgramTransform> = if transforms.is_empty() {
            Box::new(Identity)
        } else {
            Box::new(CommandRewriter::new(
                transforms,
                self.format.clone(),
                rewrite_timeout,
            ))
        };
        let conversions = command_map(&self.platforms, |p| p.convert.as_ref());
        let converter: Box<dyn PlatformConverter> = if conversions.is_empty() {
            Box::new(Identity)
        } else {
            Box::new(CommandRewriter::new(
                conversions,
                self.format.clone(),
                rewrite_timeout,
            ))
        };

        Pipeline::new(
            self.platform_ids(),
            Box::new(CommandAdapter::new(execute, self.format.clone())),
            converter,
            transform,
            DivergenceDetector::new(self.equivalence_predicate(), self.detector.clone()),
            Duration::from_millis(self.execution_timeout_ms),
        )
    }
}

fn command_map(
    platforms: &[PlatformSpec],
    select: fn(&PlatformSpec) -> Option<&Vec<String>>,
) -> BTreeMap<PlatformId, Vec<String>> {
    platforms
        .iter()
        .filter_map(|p| select(p).map(|argv| (p.id.clone(), argv.clone())))
        .collect()
}
