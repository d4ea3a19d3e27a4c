//! Seams to the outside world: executing a program on a platform, and
//! rewriting a program for a platform.
//!
//! The harness never executes program semantics itself. Everything it knows
//! about a platform comes back through an [`ExecutionResult`].

use std::collections::BTreeMap;
use std::io::Write as _;
use std::time::{Duration, Instant};

use qdiff_types::{ExecutionResult, ExecutionStatus, PlatformId, Program, ProgramFormat};
use tracing::debug;

use crate::process::{self, CommandOutput};

/// Exit status a command uses to report that it rejected the program text.
pub const PARSE_ERROR_EXIT_CODE: i32 = 2;

/// Runs one program on one platform.
///
/// Implementations must convert every low-level fault (spawn failure, crash,
/// hang) into an [`ExecutionStatus`] and must honor `timeout`.
pub trait ExecutionAdapter: Send + Sync {
    fn execute(&self, program: &Program, platform: &PlatformId, timeout: Duration)
    -> ExecutionResult;
}

/// Semantics-preserving mutation applied once per round to each platform's
/// current variant.
pub trait ProgramTransform: Send + Sync {
    /// Must give up once `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns a message when the platform's rewriting tool fails; the loop
    /// records it as a `Crash` result for that platform.
    fn transform(
        &self,
        program: &Program,
        platform: &PlatformId,
        round: u32,
        timeout: Duration,
    ) -> Result<Program, String>;
}

/// Materializes a program into a platform-specific variant before round 1.
pub trait PlatformConverter: Send + Sync {
    /// # Errors
    ///
    /// Returns a message when the program cannot be expressed for `platform`.
    fn convert(&self, program: &Program, platform: &PlatformId) -> Result<Program, String>;
}

/// Transform and converter that return the program unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ProgramTransform for Identity {
    fn transform(
        &self,
        program: &Program,
        _: &PlatformId,
        _: u32,
        _: Duration,
    ) -> Result<Program, String> {
        Ok(program.clone())
    }
}

impl PlatformConverter for Identity {
    fn convert(&self, program: &Program, _: &PlatformId) -> Result<Program, String> {
        Ok(program.clone())
    }
}

// ---------------------------------------------------------------------------
// Subprocess-backed implementations
// ---------------------------------------------------------------------------

/// Write the rendered program to a named temp file with the format's
/// extension, so tools that sniff extensions accept it.
fn materialize(program: &Program, format: &ProgramFormat) -> Result<tempfile::NamedTempFile, String> {
    let mut file = tempfile::Builder::new()
        .prefix("qdiff-")
        .suffix(&format!(".{}", format.extension()))
        .tempfile()
        .map_err(|error| format!("temp program file: {error}"))?;
    file.write_all(program.render().as_bytes())
        .and_then(|()| file.flush())
        .map_err(|error| format!("temp program file: {error}"))?;
    Ok(file)
}

fn failure_message(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.stdout.trim().to_owned()
    } else {
        stderr.to_owned()
    }
}

/// Runs each platform as an external command.
///
/// In every argv, `{program}` is replaced by the path of a temp file holding
/// the rendered program and `{platform}` by the platform id. Exit status 0
/// is success with stdout as the artifact; [`PARSE_ERROR_EXIT_CODE`] is a
/// parse error; death by signal is a crash; any other status is a runtime
/// error.
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    commands: BTreeMap<PlatformId, Vec<String>>,
    format: ProgramFormat,
}

impl CommandAdapter {
    pub fn new(commands: BTreeMap<PlatformId, Vec<String>>, format: ProgramFormat) -> Self {
        Self { commands, format }
    }
}

impl ExecutionAdapter for CommandAdapter {
    fn execute(
        &self,
        program: &Program,
        platform: &PlatformId,
        timeout: Duration,
    ) -> ExecutionResult {
        let started_at = Instant::now();
        let Some(argv) = self.commands.get(platform) else {
            return ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::Crash,
                format!("no execute command configured for platform '{platform}'"),
                started_at.elapsed(),
            );
        };
        let file = match materialize(program, &self.format) {
            Ok(file) => file,
            Err(message) => {
                return ExecutionResult::failure(
                    platform.clone(),
                    ExecutionStatus::Crash,
                    message,
                    started_at.elapsed(),
                );
            }
        };
        let path = file.path().display().to_string();
        let argv = process::substitute(argv, &[("program", &path), ("platform", platform.as_str())]);

        let output = match process::run_with_timeout(&argv, timeout) {
            Ok(output) => output,
            Err(message) => {
                return ExecutionResult::failure(
                    platform.clone(),
                    ExecutionStatus::Crash,
                    message,
                    started_at.elapsed(),
                );
            }
        };
        debug!(
            program_id = %program.id,
            platform = %platform,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            elapsed_ms = u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
            "platform command finished"
        );

        if output.timed_out {
            return ExecutionResult::timeout(platform.clone(), output.elapsed);
        }
        match output.exit_code {
            Some(0) => ExecutionResult::success(platform.clone(), output.stdout, output.elapsed),
            Some(PARSE_ERROR_EXIT_CODE) => ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::ParseError,
                failure_message(&output),
                output.elapsed,
            ),
            Some(_) => ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::RuntimeError,
                failure_message(&output),
                output.elapsed,
            ),
            None => ExecutionResult::failure(
                platform.clone(),
                ExecutionStatus::Crash,
                format!("terminated by signal: {}", failure_message(&output)),
                output.elapsed,
            ),
        }
    }
}

/// Rewrites programs through an external command whose stdout is the new
/// program text. Platforms without a command pass through unchanged.
///
/// Serves both as the per-round [`ProgramTransform`] (with `{round}`
/// available in argv) and as the [`PlatformConverter`].
#[derive(Debug, Clone)]
pub struct CommandRewriter {
    commands: BTreeMap<PlatformId, Vec<String>>,
    format: ProgramFormat,
    timeout: Duration,
}

impl CommandRewriter {
    pub fn new(
        commands: BTreeMap<PlatformId, Vec<String>>,
        format: ProgramFormat,
        timeout: Duration,
    ) -> Self {
        Self {
            commands,
            format,
            timeout,
        }
    }

    fn rewrite(
        &self,
        program: &Program,
        platform: &PlatformId,
        round: Option<u32>,
        timeout: Duration,
    ) -> Result<Program, String> {
        let Some(argv) = self.commands.get(platform) else {
            return Ok(program.clone());
        };
        let file = materialize(program, &self.format)?;
        let path = file.path().display().to_string();
        let round = round.map_or_else(|| "0".to_owned(), |r| r.to_string());
        let argv = process::substitute(
            argv,
            &[
                ("program", &path),
                ("platform", platform.as_str()),
                ("round", &round),
            ],
        );
        let output = process::run_with_timeout(&argv, timeout)?;
        if output.timed_out {
            return Err(format!(
                "rewrite for '{platform}' exceeded {} ms",
                timeout.as_millis()
            ));
        }
        if !output.succeeded() {
            return Err(format!(
                "rewrite for '{platform}' exited with {:?}: {}",
                output.exit_code,
                failure_message(&output)
            ));
        }
        self.format
            .parse(program.id.clone(), &output.stdout)
            .map_err(|error| format!("rewrite for '{platform}' produced invalid program: {error}"))
    }
}

impl ProgramTransform for CommandRewriter {
    fn transform(
        &self,
        program: &Program,
        platform: &PlatformId,
        round: u32,
        timeout: Duration,
    ) -> Result<Program, String> {
        self.rewrite(program, platform, Some(round), self.timeout.min(timeout))
    }
}

impl PlatformConverter for CommandRewriter {
    fn convert(&self, program: &Program, platform: &PlatformId) -> Result<Program, String> {
        self.rewrite(program, platform, None, self.timeout)
    }
}
