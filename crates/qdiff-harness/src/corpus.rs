//! Reading program files from a corpus folder.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use qdiff_error::{QdiffError, Result};
use qdiff_types::{Program, ProgramFormat, ProgramId};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Inclusive range over the numeric prefix of program ids: `17_qite` has
/// number 17. Ids without a numeric prefix are outside every range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRange {
    pub first: u64,
    pub last: u64,
}

impl ProgramRange {
    pub fn contains(&self, id: &ProgramId) -> bool {
        id_number(id).is_some_and(|n| (self.first..=self.last).contains(&n))
    }
}

/// Leading number of `id`, up to the first `_`.
pub fn id_number(id: &ProgramId) -> Option<u64> {
    id.as_str().split('_').next()?.parse().ok()
}

/// Programs of one corpus folder, sorted by id.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub programs: Vec<Program>,
    /// Files that could not be split into statements, with the reason.
    pub skipped: Vec<(ProgramId, String)>,
}

impl Corpus {
    /// Load every `<id>.<ext>` file directly inside `root`.
    ///
    /// Unparseable files are skipped (and listed); an unreadable folder is
    /// an error.
    pub fn load(root: &Path, format: &ProgramFormat) -> Result<Self> {
        if !root.is_dir() {
            return Err(QdiffError::CorpusNotFound {
                path: root.to_path_buf(),
            });
        }
        let extension = format.extension();
        let mut corpus = Self::default();
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = ProgramId::new(stem);
            let source = fs::read_to_string(&path)?;
            match format.parse(id.clone(), &source) {
                Ok(program) => corpus.programs.push(program),
                Err(error) => {
                    warn!(program_id = %id, error = %error, "skipping unparseable program");
                    corpus.skipped.push((id, error.to_string()));
                }
            }
        }
        corpus.programs.sort_by(|a, b| a.id.cmp(&b.id));
        corpus.skipped.sort();
        info!(
            root = %root.display(),
            programs = corpus.programs.len(),
            skipped = corpus.skipped.len(),
            "corpus loaded"
        );
        Ok(corpus)
    }

    /// Contiguous batch `[start, end)` by position in the sorted corpus.
    /// Out-of-range bounds are clamped.
    pub fn batch(&self, start: usize, end: Option<usize>) -> &[Program] {
        let len = self.programs.len();
        let end = end.unwrap_or(len).min(len);
        let start = start.min(end);
        &self.programs[start..end]
    }
}

pub fn program_path(root: &Path, id: &ProgramId, format: &ProgramFormat) -> PathBuf {
    root.join(format!("{id}.{}", format.extension()))
}

/// Load the single program `<root>/<id>.<ext>`.
pub fn load_program(root: &Path, id: &ProgramId, format: &ProgramFormat) -> Result<Program> {
    let path = program_path(root, id, format);
    let source = fs::read_to_string(&path).map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            QdiffError::RecordNotFound {
                key: path.display().to_string(),
            }
        } else {
            QdiffError::Io(error)
        }
    })?;
    format
        .parse(id.clone(), &source)
        .map_err(|error| QdiffError::invalid_program(id.as_str(), error.to_string()))
}
