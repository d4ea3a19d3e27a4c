//! Subprocess execution with a hard wall-clock limit.
//!
//! Output streams go to anonymous temp files instead of pipes so a chatty
//! child can never block on a full pipe while we poll it. On unix the child
//! leads its own process group and a timeout kills the whole group, so
//! commands run through `sh -c` do not leave grandchildren behind.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const POLL_INTERVAL_MILLIS: u64 = 10;

/// Captured outcome of one finished (or killed) child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Replace `{key}` placeholders in every argument.
pub fn substitute(argv: &[String], replacements: &[(&str, &str)]) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            replacements
                .iter()
                .fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
        })
        .collect()
}

/// Spawn `argv` and wait at most `timeout` for it.
///
/// # Errors
///
/// Returns `Err` with a short description when the command is empty or the
/// child cannot be spawned or waited on. A timeout is not an error.
pub fn run_with_timeout(argv: &[String], timeout: Duration) -> Result<CommandOutput, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command line".to_owned())?;

    let mut stdout_file =
        tempfile::tempfile().map_err(|error| format!("stdout capture failed: {error}"))?;
    let mut stderr_file =
        tempfile::tempfile().map_err(|error| format!("stderr capture failed: {error}"))?;

    let stdout_handle = stdout_file
        .try_clone()
        .map_err(|error| format!("stdout capture failed: {error}"))?;
    let stderr_handle = stderr_file
        .try_clone()
        .map_err(|error| format!("stderr capture failed: {error}"))?;

    debug!(command = %program, args = args.len(), timeout_ms = millis(timeout), "spawning");
    let started_at = Instant::now();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_handle))
        .stderr(Stdio::from(stderr_handle));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .map_err(|error| format!("spawn of '{program}' failed: {error}"))?;

    let (exit_code, timed_out) = wait_for_child(&mut child, timeout, started_at, program)?;
    let elapsed = started_at.elapsed();

    let stdout =
        read_back(&mut stdout_file).map_err(|error| format!("stdout read-back failed: {error}"))?;
    let stderr =
        read_back(&mut stderr_file).map_err(|error| format!("stderr read-back failed: {error}"))?;
    Ok(CommandOutput {
        exit_code,
        timed_out,
        stdout,
        stderr,
        elapsed,
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn wait_for_child(
    child: &mut Child,
    timeout: Duration,
    started_at: Instant,
    program: &str,
) -> Result<(Option<i32>, bool), String> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MILLIS);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status.code(), false)),
            Ok(None) => {
                if started_at.elapsed() >= timeout {
                    kill_tree(child);
                    let status = child
                        .wait()
                        .map_err(|error| format!("wait after kill of '{program}' failed: {error}"))?;
                    warn!(command = %program, timeout_ms = millis(timeout), "child killed after timeout");
                    return Ok((status.code(), true));
                }
                thread::sleep(poll_interval);
            }
            Err(error) => return Err(format!("try_wait on '{program}' failed: {error}")),
        }
    }
}

/// Kill the child's process group, falling back to the child alone.
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let group = format!("-{}", child.id());
    let signalled = Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success());
    if !signalled {
        debug!(pid = child.id(), "group kill failed; killing the child only");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn read_back(file: &mut File) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn substitute_replaces_every_placeholder() {
        let out = substitute(
            &argv(&["run", "--platform={platform}", "{program}", "{program}.log"]),
            &[("program", "/tmp/p.qasm"), ("platform", "qiskit")],
        );
        assert_eq!(
            out,
            argv(&["run", "--platform=qiskit", "/tmp/p.qasm", "/tmp/p.qasm.log"])
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = run_with_timeout(&[], Duration::from_secs(1)).expect_err("empty argv");
        assert!(err.contains("empty"));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_with_timeout(
            &argv(&["sh", "-c", "echo hello; echo oops >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.succeeded());
    }

    #[cfg(unix)]
    #[test]
    fn kills_child_on_timeout() {
        let out = run_with_timeout(&argv(&["sleep", "5"]), Duration::from_millis(100))
            .expect("run");
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("late");
        let script = format!("(sleep 1; echo late > '{}') & sleep 5", marker.display());
        let out = run_with_timeout(&argv(&["sh", "-c", &script]), Duration::from_millis(100))
            .expect("run");
        assert!(out.timed_out);

        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background job outlived the timeout");
    }

    #[test]
    fn read_back_rewinds_the_capture() {
        let mut file = tempfile::tempfile().expect("tempfile");
        std::io::Write::write_all(&mut file, b"captured").expect("write");
        assert_eq!(read_back(&mut file).expect("read"), "captured");
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let err = run_with_timeout(
            &argv(&["qdiff-definitely-not-a-binary"]),
            Duration::from_secs(1),
        )
        .expect_err("spawn should fail");
        assert!(err.contains("spawn"));
    }
}
