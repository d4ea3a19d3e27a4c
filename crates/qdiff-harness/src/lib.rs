//! Differential-testing harness for circuit-compiler toolchains.
//!
//! Runs each program of a corpus on several independent platforms, classifies
//! disagreements ([`detector`]), drives programs through repeated
//! transform-and-check rounds ([`qite`]), and shrinks failing programs to
//! 1-minimal reproducers ([`minimizer`]).

pub mod adapter;
pub mod config;
pub mod corpus;
pub mod detector;
pub mod equivalence;
pub mod minimizer;
pub mod pipeline;
pub mod process;
pub mod qite;
pub mod replay;
pub mod session;
pub mod signature;
pub mod store;

pub use adapter::{
    CommandAdapter, CommandRewriter, ExecutionAdapter, Identity, PlatformConverter,
    ProgramTransform,
};
pub use config::{EquivalenceSpec, HarnessConfig, PlatformSpec};
pub use corpus::{Corpus, ProgramRange};
pub use detector::{DetectorConfig, DivergenceDetector};
pub use equivalence::{CommandEquivalence, EquivalencePredicate, ExactMatch, NormalizedTextMatch};
pub use minimizer::{
    AbortReason, MinimizationOutcome, MinimizationReport, MinimizationSession, MinimizerConfig,
    ReproductionOracle, TrialOutcome, TrialPhase, TrialRecord, minimize,
};
pub use pipeline::{Pipeline, RoundOutcome, Variants};
pub use qite::{
    ProgramReport, ProgramState, QiteConfig, QiteLoop, RoundStats, RunSummary, TerminalState,
};
pub use replay::{FailureSignature, ReplayOracle};
pub use signature::{CanonicalSignature, DeduplicatedFailures, MinimizedRecord, deduplicate};
pub use store::{FsResultStore, InMemoryResultStore, ProgramProgress, ResultStore};

/// Install the stderr `tracing` subscriber used by the binaries.
///
/// `RUST_LOG` overrides `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Log `err`, print an operator hint, and map it to the process exit code.
pub fn exit_with(binary: &str, err: &qdiff_error::QdiffError) -> std::process::ExitCode {
    tracing::error!(error = %err, "{binary} failed");
    match err.suggestion() {
        Some(hint) => eprintln!("hint: {hint}"),
        None if !err.is_user_recoverable() => {
            eprintln!("hint: rerun with RUST_LOG=debug and keep the log for a bug report");
        }
        None => {}
    }
    std::process::ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}
