//! Programs as ordered sequences of atomic statements.
//!
//! A statement is the unit of minimization. The core never looks inside a
//! statement's payload; it only needs the `removable` hint and the kind tag.
//! Validity of a program is decided by the platforms, never here.

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of a program inside a corpus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind tag of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// Format header (`OPENQASM 2.0;`, `include "qelib1.inc";`, preamble code).
    Header,
    /// Register or variable declaration required by downstream parsers.
    Declaration,
    /// Custom gate definition.
    GateDefinition,
    /// One gate application.
    Gate,
    /// Measurement into a classical register.
    Measurement,
    /// Barrier, reset, and similar non-unitary directives.
    Directive,
    /// Anything else; payload kept verbatim.
    Opaque,
}

impl StatementKind {
    /// Whether statements of this kind are deletion candidates unless stated
    /// otherwise.
    pub const fn removable_by_default(self) -> bool {
        !matches!(self, Self::Header | Self::Declaration)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Declaration => "declaration",
            Self::GateDefinition => "gate_definition",
            Self::Gate => "gate",
            Self::Measurement => "measurement",
            Self::Directive => "directive",
            Self::Opaque => "opaque",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structurally atomic unit of a program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    /// Hint for the minimizer. Non-removable statements keep their position.
    pub removable: bool,
    /// Opaque source text.
    pub payload: String,
}

impl Statement {
    /// Statement whose removability follows its kind.
    pub fn new(kind: StatementKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            removable: kind.removable_by_default(),
            payload: payload.into(),
        }
    }

    /// Statement that the minimizer must never delete.
    pub fn fixed(kind: StatementKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            removable: false,
            payload: payload.into(),
        }
    }

    pub fn gate(payload: impl Into<String>) -> Self {
        Self::new(StatementKind::Gate, payload)
    }

    pub fn declaration(payload: impl Into<String>) -> Self {
        Self::new(StatementKind::Declaration, payload)
    }
}

/// An ordered sequence of statements with a stable identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn new(id: ProgramId, statements: Vec<Statement>) -> Self {
        Self { id, statements }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Positions (indices into `statements`) of removable statements, in order.
    #[must_use]
    pub fn removable_positions(&self) -> Vec<usize> {
        self.statements
            .iter()
            .enumerate()
            .filter(|(_, stmt)| stmt.removable)
            .map(|(idx, _)| idx)
            .collect()
    }

    #[must_use]
    pub fn removable_count(&self) -> usize {
        self.statements.iter().filter(|stmt| stmt.removable).count()
    }

    /// Copy of the program with the given positions deleted.
    ///
    /// Positions pointing at non-removable statements are ignored.
    #[must_use]
    pub fn without_positions(&self, positions: &BTreeSet<usize>) -> Self {
        let statements = self
            .statements
            .iter()
            .enumerate()
            .filter(|(idx, stmt)| !(stmt.removable && positions.contains(idx)))
            .map(|(_, stmt)| stmt.clone())
            .collect();
        Self::new(self.id.clone(), statements)
    }

    /// Copy of the program keeping every non-removable statement and only the
    /// removable statements at `keep`.
    #[must_use]
    pub fn retaining_removable(&self, keep: &BTreeSet<usize>) -> Self {
        let statements = self
            .statements
            .iter()
            .enumerate()
            .filter(|(idx, stmt)| !stmt.removable || keep.contains(idx))
            .map(|(_, stmt)| stmt.clone())
            .collect();
        Self::new(self.id.clone(), statements)
    }

    /// Whether any statement carries exactly this payload (after trimming).
    pub fn contains_payload(&self, payload: &str) -> bool {
        self.statements
            .iter()
            .any(|stmt| stmt.payload.trim() == payload.trim())
    }

    /// Source text, one statement per line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for stmt in &self.statements {
            out.push_str(&stmt.payload);
            out.push('\n');
        }
        out
    }

    /// SHA-256 over kinds and payloads, hex encoded.
    ///
    /// The id is not part of the hash: two programs with the same content
    /// have the same identity hash.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"program-v1:");
        for stmt in &self.statements {
            hasher.update(stmt.kind.as_str().as_bytes());
            hasher.update(if stmt.removable { b":r:" } else { b":f:" });
            hasher.update(stmt.payload.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

// ---------------------------------------------------------------------------
// Source readers
// ---------------------------------------------------------------------------

/// How program files in a corpus are split into statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramFormat {
    /// OpenQASM-style source, one statement per line.
    #[default]
    Qasm,
    /// Arbitrary source where only the lines strictly between the two marker
    /// lines are removable; everything else is kept verbatim.
    Marked {
        start_marker: String,
        end_marker: String,
    },
    /// Every non-blank line is a removable opaque statement.
    Lines,
}

/// Error returned when a source cannot be split into statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramParseError {
    pub detail: String,
}

impl fmt::Display for ProgramParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for ProgramParseError {}

impl ProgramFormat {
    /// Split `source` into a program.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the source holds no statement at all, or when the
    /// markers of a `Marked` format are missing or out of order.
    pub fn parse(&self, id: ProgramId, source: &str) -> Result<Program, ProgramParseError> {
        let statements = match self {
            Self::Qasm => split_qasm(source),
            Self::Lines => source
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| Statement::new(StatementKind::Opaque, line))
                .collect(),
            Self::Marked {
                start_marker,
                end_marker,
            } => split_marked(source, start_marker, end_marker)?,
        };
        if statements.is_empty() {
            return Err(ProgramParseError {
                detail: "source contains no statements".to_owned(),
            });
        }
        Ok(Program::new(id, statements))
    }

    /// File extension used for program files of this format.
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Qasm => "qasm",
            Self::Marked { .. } => "py",
            Self::Lines => "txt",
        }
    }
}

/// One statement per line, except that a `gate` definition runs until its
/// body's closing brace and becomes a single statement.
fn split_qasm(source: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut definition: Option<GateBody> = None;
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(mut body) = definition.take() {
            if !trimmed.is_empty() && !trimmed.starts_with("//") {
                body.push(trimmed);
            }
            if body.is_closed() {
                statements.push(body.into_statement());
            } else {
                definition = Some(body);
            }
            continue;
        }
        if trimmed.starts_with("gate ") {
            let body = GateBody::open(trimmed);
            if body.is_closed() {
                statements.push(body.into_statement());
            } else {
                definition = Some(body);
            }
            continue;
        }
        statements.extend(classify_qasm_line(line));
    }
    // Unterminated definition: keep what was read.
    statements.extend(definition.map(GateBody::into_statement));
    statements
}

struct GateBody {
    lines: Vec<String>,
    depth: usize,
    opened: bool,
}

impl GateBody {
    fn open(line: &str) -> Self {
        let mut body = Self {
            lines: Vec::new(),
            depth: 0,
            opened: false,
        };
        body.push(line);
        body
    }

    fn push(&mut self, line: &str) {
        for c in line.chars() {
            match c {
                '{' => {
                    self.depth += 1;
                    self.opened = true;
                }
                '}' => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
        }
        self.lines.push(line.to_owned());
    }

    fn is_closed(&self) -> bool {
        self.opened && self.depth == 0
    }

    fn into_statement(self) -> Statement {
        Statement::new(StatementKind::GateDefinition, self.lines.join("\n"))
    }
}

fn classify_qasm_line(line: &str) -> Option<Statement> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("//") {
        return None;
    }
    let kind = if trimmed.starts_with("OPENQASM") || trimmed.starts_with("include ") {
        StatementKind::Header
    } else if ["qreg ", "creg ", "qubit", "bit[", "bit "]
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        StatementKind::Declaration
    } else if trimmed.starts_with("gate ") || trimmed.starts_with("opaque ") {
        StatementKind::GateDefinition
    } else if trimmed.starts_with("measure") || trimmed.contains("= measure") {
        StatementKind::Measurement
    } else if trimmed.starts_with("barrier") || trimmed.starts_with("reset") {
        StatementKind::Directive
    } else {
        StatementKind::Gate
    };
    Some(Statement::new(kind, trimmed))
}

fn split_marked(
    source: &str,
    start_marker: &str,
    end_marker: &str,
) -> Result<Vec<Statement>, ProgramParseError> {
    let lines: Vec<&str> = source.lines().collect();
    let start = lines
        .iter()
        .position(|line| line.trim() == start_marker)
        .ok_or_else(|| ProgramParseError {
            detail: format!("start marker '{start_marker}' not found"),
        })?;
    let end = lines
        .iter()
        .skip(start + 1)
        .position(|line| line.trim() == end_marker)
        .map(|offset| start + 1 + offset)
        .ok_or_else(|| ProgramParseError {
            detail: format!("end marker '{end_marker}' not found after start marker"),
        })?;

    let mut statements = Vec::with_capacity(lines.len());
    for line in &lines[..=start] {
        statements.push(Statement::fixed(StatementKind::Header, *line));
    }
    for line in &lines[start + 1..end] {
        if !line.trim().is_empty() {
            statements.push(Statement::new(StatementKind::Opaque, *line));
        }
    }
    for line in &lines[end..] {
        statements.push(Statement::fixed(StatementKind::Opaque, *line));
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BELL: &str = "OPENQASM 2.0;\ninclude \"qelib1.inc\";\nqreg q[2];\ncreg c[2];\n\
                        h q[0];\ncx q[0],q[1];\nbarrier q;\nmeasure q -> c;\n";

    fn pid() -> ProgramId {
        ProgramId::new("prog_0")
    }

    #[test]
    fn qasm_headers_and_declarations_are_fixed() {
        let program = ProgramFormat::Qasm.parse(pid(), BELL).expect("parse");
        assert_eq!(program.len(), 8);
        let kinds: Vec<StatementKind> = program.statements.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                StatementKind::Header,
                StatementKind::Header,
                StatementKind::Declaration,
                StatementKind::Declaration,
                StatementKind::Gate,
                StatementKind::Gate,
                StatementKind::Directive,
                StatementKind::Measurement,
            ]
        );
        assert_eq!(program.removable_positions(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn qasm_skips_blank_and_comment_lines() {
        let source = "OPENQASM 2.0;\n\n// generated\nqreg q[1];\nx q[0];\n";
        let program = ProgramFormat::Qasm.parse(pid(), source).expect("parse");
        assert_eq!(program.len(), 3);
    }

    #[test]
    fn gate_definitions_are_removable() {
        let source = "OPENQASM 2.0;\ngate mcx a,b { cx a,b; }\nqreg q[2];\nmcx q[0],q[1];\n";
        let program = ProgramFormat::Qasm.parse(pid(), source).expect("parse");
        assert_eq!(program.statements[1].kind, StatementKind::GateDefinition);
        assert!(program.statements[1].removable);
    }

    #[test]
    fn multi_line_gate_definition_is_one_statement() {
        let source = "OPENQASM 2.0;\ngate majority a,b,c\n{\n  cx c,b;\n\n  // carry\n  ccx a,b,c;\n}\nqreg q[3];\nmajority q[0],q[1],q[2];\n";
        let program = ProgramFormat::Qasm.parse(pid(), source).expect("parse");
        let kinds: Vec<StatementKind> = program.statements.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [
                StatementKind::Header,
                StatementKind::GateDefinition,
                StatementKind::Declaration,
                StatementKind::Gate,
            ]
        );
        assert_eq!(
            program.statements[1].payload,
            "gate majority a,b,c\n{\ncx c,b;\nccx a,b,c;\n}"
        );

        // Dropping the definition drops its whole body.
        let without = program.without_positions(&[1].into_iter().collect());
        assert!(!without.render().contains("ccx"));
    }

    #[test]
    fn marked_source_only_exposes_region() {
        let source = "import qiskit\nqc = QuantumCircuit(2)\n# <START_GATES>\nqc.h(0)\n\n\
                      qc.cx(0, 1)\n# <END_GATES>\nrun(qc)\n";
        let format = ProgramFormat::Marked {
            start_marker: "# <START_GATES>".to_owned(),
            end_marker: "# <END_GATES>".to_owned(),
        };
        let program = format.parse(pid(), source).expect("parse");
        assert_eq!(program.removable_count(), 2);
        assert_eq!(program.len(), 7);
        assert_eq!(program.render(), source.replace("qc.h(0)\n\n", "qc.h(0)\n"));
    }

    #[test]
    fn marked_source_requires_both_markers() {
        let format = ProgramFormat::Marked {
            start_marker: "# <START_GATES>".to_owned(),
            end_marker: "# <END_GATES>".to_owned(),
        };
        let err = format
            .parse(pid(), "# <START_GATES>\nqc.h(0)\n")
            .expect_err("missing end marker");
        assert!(err.detail.contains("end marker"));
        let err = format
            .parse(pid(), "# <END_GATES>\n# <START_GATES>\n")
            .expect_err("end before start");
        assert!(err.detail.contains("end marker"));
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(ProgramFormat::Qasm.parse(pid(), "\n// nothing\n").is_err());
        assert!(ProgramFormat::Lines.parse(pid(), "   \n").is_err());
    }

    #[test]
    fn without_positions_never_drops_fixed_statements() {
        let program = ProgramFormat::Qasm.parse(pid(), BELL).expect("parse");
        let all: BTreeSet<usize> = (0..program.len()).collect();
        let reduced = program.without_positions(&all);
        assert_eq!(reduced.len(), 4);
        assert_eq!(reduced.removable_count(), 0);
        assert!(reduced.contains_payload("qreg q[2];"));
    }

    #[test]
    fn retaining_removable_keeps_order() {
        let program = ProgramFormat::Qasm.parse(pid(), BELL).expect("parse");
        let keep: BTreeSet<usize> = [7, 5].into_iter().collect();
        let reduced = program.retaining_removable(&keep);
        let payloads: Vec<&str> = reduced
            .statements
            .iter()
            .map(|s| s.payload.as_str())
            .collect();
        assert_eq!(
            payloads,
            [
                "OPENQASM 2.0;",
                "include \"qelib1.inc\";",
                "qreg q[2];",
                "creg c[2];",
                "cx q[0],q[1];",
                "measure q -> c;",
            ]
        );
    }

    #[test]
    fn content_hash_ignores_id_but_not_content() {
        let a = ProgramFormat::Qasm.parse(pid(), BELL).expect("parse");
        let mut b = a.clone();
        b.id = ProgramId::new("prog_99");
        assert_eq!(a.content_hash(), b.content_hash());
        let c = a.without_positions(&[4].into_iter().collect());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    proptest! {
        #[test]
        fn prop_removal_preserves_relative_order(
            removable in proptest::collection::vec(any::<bool>(), 1..24),
            drop_mask in proptest::collection::vec(any::<bool>(), 24),
        ) {
            let statements: Vec<Statement> = removable
                .iter()
                .enumerate()
                .map(|(idx, &r)| Statement {
                    kind: StatementKind::Opaque,
                    removable: r,
                    payload: format!("s{idx}"),
                })
                .collect();
            let program = Program::new(pid(), statements);
            let drop: BTreeSet<usize> = drop_mask
                .iter()
                .take(program.len())
                .enumerate()
                .filter(|(_, d)| **d)
                .map(|(idx, _)| idx)
                .collect();
            let reduced = program.without_positions(&drop);

            let indices: Vec<usize> = reduced
                .statements
                .iter()
                .map(|s| s.payload[1..].parse::<usize>().expect("index payload"))
                .collect();
            prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
            for (idx, stmt) in program.statements.iter().enumerate() {
                if !stmt.removable {
                    prop_assert!(indices.contains(&idx));
                }
            }
        }
    }
}
