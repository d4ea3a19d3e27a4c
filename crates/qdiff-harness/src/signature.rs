//! Canonical failure signatures and deduplication of minimized failures.
//!
//! A [`CanonicalSignature`] is a content-addressed fingerprint of a minimized
//! failure: verdict kind, the platforms involved, and the minimized program.
//! Two minimized failures with the same signature are the same bug. Hashes
//! are SHA-256 truncated to 16 hex characters.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use qdiff_types::{DivergenceVerdict, Program, ProgramId, VerdictKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::minimizer::{MinimizationOutcome, MinimizationReport};

const SIGNATURE_HEX_CHARS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalSignature {
    pub hash: String,
    pub kind: VerdictKind,
    /// Sorted disagreeing pairs, or the crashing platform and its status.
    pub parties: Vec<String>,
    pub statement_count: usize,
    /// First removable statement left, for human readability.
    pub first_statement: String,
}

impl CanonicalSignature {
    #[must_use]
    pub fn compute(verdict: &DivergenceVerdict, program: &Program) -> Self {
        let parties = parties_of(verdict);
        let mut hasher = Sha256::new();
        hasher.update(b"qdiff-signature-v1\n");
        hasher.update(verdict.kind().as_str().as_bytes());
        hasher.update(b"\n");
        for party in &parties {
            hasher.update(party.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"--\n");
        for stmt in &program.statements {
            hasher.update(stmt.kind.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(stmt.payload.trim().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();

        Self {
            hash: hex_encode_truncated(&digest, SIGNATURE_HEX_CHARS),
            kind: verdict.kind(),
            parties,
            statement_count: program.len(),
            first_statement: program
                .statements
                .iter()
                .find(|stmt| stmt.removable)
                .map(|stmt| stmt.payload.trim().to_owned())
                .unwrap_or_default(),
        }
    }
}

fn parties_of(verdict: &DivergenceVerdict) -> Vec<String> {
    let mut parties = match verdict {
        DivergenceVerdict::AllEquivalent | DivergenceVerdict::Inconclusive { .. } => Vec::new(),
        DivergenceVerdict::Divergent(detail) => detail
            .disagreeing_pairs
            .iter()
            .map(ToString::to_string)
            .collect(),
        DivergenceVerdict::CrashOnly {
            platform, status, ..
        } => vec![format!("{platform}:{status}")],
    };
    parties.sort();
    parties
}

/// Durable result of minimizing one error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimizedRecord {
    pub program_id: ProgramId,
    pub round: u32,
    pub clue_message: String,
    pub outcome: MinimizationOutcome,
    pub oracle_calls: usize,
    pub original_statements: usize,
    pub flakes: usize,
    pub restarts: u32,
    /// Absent when the failure did not reproduce.
    pub signature: Option<CanonicalSignature>,
}

impl MinimizedRecord {
    pub fn from_report(round: u32, verdict: &DivergenceVerdict, report: &MinimizationReport) -> Self {
        Self {
            program_id: report.session.original.id.clone(),
            round,
            clue_message: report.session.clue_message.clone(),
            signature: report
                .outcome
                .best_program()
                .map(|program| CanonicalSignature::compute(verdict, program)),
            outcome: report.outcome.clone(),
            oracle_calls: report.oracle_calls,
            original_statements: report.original_statements(),
            flakes: report.session.flakes,
            restarts: report.session.restarts,
        }
    }

    /// Record key, also the file stem: `<program_id>_r<round>_min`.
    pub fn key(&self) -> String {
        format!("{}_r{}_min", self.program_id, self.round)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicatedFailures {
    /// One record per signature, ordered by verdict kind then hash.
    pub unique_failures: Vec<MinimizedRecord>,
    pub total_before_dedup: usize,
    /// `(hash, count)` for signatures seen more than once.
    pub duplicate_counts: Vec<(String, usize)>,
}

/// Group minimized records by signature. Records without a signature are
/// counted but never reported as unique failures.
pub fn deduplicate(records: &[MinimizedRecord]) -> DeduplicatedFailures {
    let mut first_seen: BTreeMap<String, &MinimizedRecord> = BTreeMap::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        let Some(signature) = &record.signature else {
            continue;
        };
        *counts.entry(signature.hash.clone()).or_insert(0) += 1;
        first_seen.entry(signature.hash.clone()).or_insert(record);
    }

    let mut unique: Vec<MinimizedRecord> = first_seen.into_values().cloned().collect();
    unique.sort_by(|a, b| {
        let key = |r: &MinimizedRecord| r.signature.as_ref().map(|s| (s.kind, s.hash.clone()));
        key(a).cmp(&key(b))
    });

    DeduplicatedFailures {
        unique_failures: unique,
        total_before_dedup: records.len(),
        duplicate_counts: counts.into_iter().filter(|(_, count)| *count > 1).collect(),
    }
}

fn hex_encode_truncated(bytes: &[u8], max_chars: usize) -> String {
    let mut s = String::with_capacity(max_chars);
    for byte in bytes {
        if s.len() >= max_chars {
            break;
        }
        let _ = write!(s, "{byte:02x}");
    }
    s.truncate(max_chars);
    s
}

#[cfg(test)]
mod tests {
    use qdiff_types::{DivergenceDetail, ExecutionStatus, PlatformPair, Statement};

    use super::*;

    fn program(id: &str, gates: &[&str]) -> Program {
        let mut statements = vec![Statement::declaration("qreg q[2];")];
        statements.extend(gates.iter().map(|g| Statement::gate(*g)));
        Program::new(ProgramId::new(id), statements)
    }

    fn crash(platform: &str) -> DivergenceVerdict {
        DivergenceVerdict::CrashOnly {
            platform: platform.into(),
            status: ExecutionStatus::RuntimeError,
            message: "boom".to_owned(),
            unsupported_feature: false,
        }
    }

    fn record(id: &str, verdict: &DivergenceVerdict, gates: &[&str]) -> MinimizedRecord {
        let minimized = program(id, gates);
        MinimizedRecord {
            program_id: ProgramId::new(id),
            round: 1,
            clue_message: "boom".to_owned(),
            signature: Some(CanonicalSignature::compute(verdict, &minimized)),
            outcome: MinimizationOutcome::Minimized { program: minimized },
            oracle_calls: 10,
            original_statements: 20,
            flakes: 0,
            restarts: 0,
        }
    }

    #[test]
    fn signature_ignores_program_id_and_message() {
        let a = CanonicalSignature::compute(&crash("qiskit"), &program("p1", &["ccx q[0],q[1];"]));
        let b = CanonicalSignature::compute(&crash("qiskit"), &program("p9", &["ccx q[0],q[1];"]));
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), SIGNATURE_HEX_CHARS);
        assert_eq!(a.parties, ["qiskit:runtime_error"]);
        assert_eq!(a.first_statement, "ccx q[0],q[1];");
    }

    #[test]
    fn signature_depends_on_platforms_and_program() {
        let base = CanonicalSignature::compute(&crash("qiskit"), &program("p", &["x q[0];"]));
        let other_platform =
            CanonicalSignature::compute(&crash("pytket"), &program("p", &["x q[0];"]));
        let other_program = CanonicalSignature::compute(&crash("qiskit"), &program("p", &["y q[0];"]));
        assert_ne!(base.hash, other_platform.hash);
        assert_ne!(base.hash, other_program.hash);
    }

    #[test]
    fn divergent_parties_are_sorted_pairs() {
        let verdict = DivergenceVerdict::Divergent(DivergenceDetail {
            disagreeing_pairs: vec![
                PlatformPair::new("b".into(), "c".into()),
                PlatformPair::new("a".into(), "b".into()),
            ],
            undecided_pairs: Vec::new(),
            failed_platforms: Vec::new(),
            summary: String::new(),
        });
        let signature = CanonicalSignature::compute(&verdict, &program("p", &["h q[0];"]));
        assert_eq!(signature.parties, ["a vs b", "b vs c"]);
        assert_eq!(signature.kind, VerdictKind::Divergent);
    }

    #[test]
    fn deduplicate_groups_by_hash() {
        let records = vec![
            record("p1", &crash("qiskit"), &["ccx q[0],q[1];"]),
            record("p2", &crash("qiskit"), &["ccx q[0],q[1];"]),
            record("p3", &crash("pytket"), &["rzz(0.1) q[0],q[1];"]),
            MinimizedRecord {
                signature: None,
                outcome: MinimizationOutcome::NotReproducible,
                ..record("p4", &crash("qiskit"), &[])
            },
        ];
        let dedup = deduplicate(&records);
        assert_eq!(dedup.total_before_dedup, 4);
        assert_eq!(dedup.unique_failures.len(), 2);
        assert_eq!(dedup.duplicate_counts.len(), 1);
        assert_eq!(dedup.duplicate_counts[0].1, 2);
        let ids: Vec<&str> = dedup
            .unique_failures
            .iter()
            .map(|r| r.program_id.as_str())
            .collect();
        assert!(ids.contains(&"p1"));
        assert!(!ids.contains(&"p2"));
    }

    #[test]
    fn record_key() {
        let r = record("prog_12", &crash("qiskit"), &["x q[0];"]);
        assert_eq!(r.key(), "prog_12_r1_min");
    }
}
