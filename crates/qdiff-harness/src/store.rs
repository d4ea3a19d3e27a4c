//! Append-only persistence of round checkpoints, error records, and
//! minimized records, keyed by program identity.
//!
//! Filesystem layout under the corpus folder:
//!
//! ```text
//! <corpus>/<program_id>.<ext>                    program sources
//! <corpus>/metadata/<program_id>_r<round>.json   clean-round checkpoints
//! <corpus>/error/<program_id>_r<round>_error.json
//! <corpus>/error/<program_id>_r<round>_min.json
//! <corpus>/_qite_stats.jsonl                     one line per round per run
//! <corpus>/unique_failures.json                  minimized records, deduplicated
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use qdiff_error::{QdiffError, Result};
use qdiff_types::{ErrorRecord, ProgramId, RoundRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::qite::RoundStats;
use crate::signature::{DeduplicatedFailures, MinimizedRecord, deduplicate};

pub const METADATA_DIR: &str = "metadata";
pub const ERROR_DIR: &str = "error";
pub const STATS_FILE: &str = "_qite_stats.jsonl";
pub const UNIQUE_FAILURES_FILE: &str = "unique_failures.json";

/// Where a program stands according to its persisted records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramProgress {
    /// Nothing recorded yet.
    Fresh,
    /// Last clean round; the run continues after it.
    Resumable(Box<RoundRecord>),
    /// A failure was recorded; the program is done.
    Terminal(Box<ErrorRecord>),
}

/// Durable, append-only record sink shared by all workers.
///
/// Every record has a unique key; appending a key twice fails with
/// [`QdiffError::DuplicateRecord`].
pub trait ResultStore: Send + Sync {
    fn append_round(&self, record: &RoundRecord) -> Result<()>;
    fn append_error(&self, record: &ErrorRecord) -> Result<()>;
    fn append_minimized(&self, record: &MinimizedRecord) -> Result<()>;
    /// Append one line to the run statistics log. Unlike records, stats
    /// lines have no key and may repeat across runs.
    fn append_round_stats(&self, stats: &RoundStats) -> Result<()>;
    fn load_progress(&self, program_id: &ProgramId) -> Result<ProgramProgress>;
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    /// Open (creating the record folders if needed) a store rooted at the
    /// corpus folder.
    ///
    /// # Errors
    ///
    /// `CorpusNotFound` when `root` is not a directory, `StoreUnwritable`
    /// when the record folders cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(QdiffError::CorpusNotFound { path: root });
        }
        for dir in [METADATA_DIR, ERROR_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|error| QdiffError::store_unwritable(&path, error.to_string()))?;
        }
        info!(root = %root.display(), "result store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn round_path(&self, record: &RoundRecord) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(format!("{}.json", record.key()))
    }

    pub fn error_path(&self, record: &ErrorRecord) -> PathBuf {
        self.root
            .join(ERROR_DIR)
            .join(format!("{}.json", record.key()))
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    pub fn minimized_path(&self, record: &MinimizedRecord) -> PathBuf {
        self.root
            .join(ERROR_DIR)
            .join(format!("{}.json", record.key()))
    }

    /// Every minimized record under `error/`, ordered by file name.
    ///
    /// # Errors
    ///
    /// `Io` when the folder cannot be listed, `Json` when a record does not
    /// parse.
    pub fn minimized_records(&self) -> Result<Vec<MinimizedRecord>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(self.root.join(ERROR_DIR))? {
            let path = entry?.path();
            let is_minimized = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with("_min.json"));
            if is_minimized {
                paths.push(path);
            }
        }
        paths.sort();
        paths.iter().map(|path| read_record(path)).collect()
    }

    /// Regroup every minimized record by signature and replace
    /// `unique_failures.json` with the result.
    ///
    /// # Errors
    ///
    /// `StoreUnwritable` when the file cannot be replaced, plus the errors
    /// of [`Self::minimized_records`].
    pub fn write_unique_failures(&self) -> Result<DeduplicatedFailures> {
        let failures = deduplicate(&self.minimized_records()?);
        let path = self.root.join(UNIQUE_FAILURES_FILE);
        let unwritable = |error: std::io::Error| QdiffError::store_unwritable(&path, error.to_string());

        let bytes = serde_json::to_vec_pretty(&failures)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.root).map_err(unwritable)?;
        staged.write_all(&bytes).map_err(unwritable)?;
        staged.persist(&path).map_err(|error| unwritable(error.error))?;
        info!(
            path = %path.display(),
            unique = failures.unique_failures.len(),
            total = failures.total_before_dedup,
            "unique failures written"
        );
        Ok(failures)
    }

    /// Atomically create `path` with pretty JSON. Never overwrites.
    fn write_new<T: Serialize>(&self, path: &Path, key: &str, value: &T) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let unwritable = |error: std::io::Error| QdiffError::store_unwritable(dir, error.to_string());

        let bytes = serde_json::to_vec_pretty(value)?;
        let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(unwritable)?;
        staged
            .write_all(&bytes)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(unwritable)?;
        staged.persist_noclobber(path).map_err(|error| {
            if error.error.kind() == ErrorKind::AlreadyExists {
                QdiffError::DuplicateRecord {
                    key: key.to_owned(),
                }
            } else {
                QdiffError::store_unwritable(path, error.error.to_string())
            }
        })?;
        debug!(path = %path.display(), "record written");
        Ok(())
    }

    /// Rounds recorded for `program_id` in `dir`, parsed from file names
    /// `<program_id>_r<round><suffix>`.
    fn rounds_in(&self, dir: &str, program_id: &ProgramId, suffix: &str) -> Result<Vec<u32>> {
        let prefix = format!("{program_id}_r");
        let mut rounds = Vec::new();
        for entry in fs::read_dir(self.root.join(dir))? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let round = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .and_then(|digits| digits.parse::<u32>().ok());
            if let Some(round) = round {
                rounds.push(round);
            }
        }
        rounds.sort_unstable();
        Ok(rounds)
    }
}

/// Read one JSON record from disk.
///
/// # Errors
///
/// `RecordNotFound` when the file does not exist; `Json` when it does not
/// parse.
pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            QdiffError::RecordNotFound {
                key: path.display().to_string(),
            }
        } else {
            QdiffError::Io(error)
        }
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl ResultStore for FsResultStore {
    fn append_round(&self, record: &RoundRecord) -> Result<()> {
        self.write_new(&self.round_path(record), &record.key(), record)
    }

    fn append_error(&self, record: &ErrorRecord) -> Result<()> {
        self.write_new(&self.error_path(record), &record.key(), record)
    }

    fn append_minimized(&self, record: &MinimizedRecord) -> Result<()> {
        self.write_new(&self.minimized_path(record), &record.key(), record)
    }

    fn append_round_stats(&self, stats: &RoundStats) -> Result<()> {
        let path = self.stats_path();
        let unwritable = |error: std::io::Error| QdiffError::store_unwritable(&path, error.to_string());
        let mut line = serde_json::to_vec(stats)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unwritable)?;
        file.write_all(&line).map_err(unwritable)?;
        debug!(path = %path.display(), round = stats.round, "round stats appended");
        Ok(())
    }

    fn load_progress(&self, program_id: &ProgramId) -> Result<ProgramProgress> {
        if let Some(round) = self
            .rounds_in(ERROR_DIR, program_id, "_error.json")?
            .first()
        {
            let path = self
                .root
                .join(ERROR_DIR)
                .join(format!("{program_id}_r{round}_error.json"));
            return Ok(ProgramProgress::Terminal(Box::new(read_record(&path)?)));
        }
        if let Some(round) = self.rounds_in(METADATA_DIR, program_id, ".json")?.last() {
            let path = self
                .root
                .join(METADATA_DIR)
                .join(format!("{program_id}_r{round}.json"));
            return Ok(ProgramProgress::Resumable(Box::new(read_record(&path)?)));
        }
        Ok(ProgramProgress::Fresh)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    rounds: BTreeMap<String, RoundRecord>,
    errors: BTreeMap<String, ErrorRecord>,
    minimized: BTreeMap<String, MinimizedRecord>,
    stats: Vec<RoundStats>,
}

/// Store kept entirely in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    state: Mutex<MemoryState>,
    unwritable: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later append fail with `StoreUnwritable`.
    pub fn set_unwritable(&self, unwritable: bool) {
        self.unwritable.store(unwritable, Ordering::SeqCst);
    }

    pub fn round_records(&self) -> Vec<RoundRecord> {
        self.state.lock().rounds.values().cloned().collect()
    }

    pub fn error_records(&self) -> Vec<ErrorRecord> {
        self.state.lock().errors.values().cloned().collect()
    }

    pub fn minimized_records(&self) -> Vec<MinimizedRecord> {
        self.state.lock().minimized.values().cloned().collect()
    }

    pub fn round_stats(&self) -> Vec<RoundStats> {
        self.state.lock().stats.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.unwritable.load(Ordering::SeqCst) {
            return Err(QdiffError::store_unwritable("<memory>", "store marked unwritable"));
        }
        Ok(())
    }
}

fn insert_new<T: Clone>(map: &mut BTreeMap<String, T>, key: String, record: &T) -> Result<()> {
    if map.contains_key(&key) {
        return Err(QdiffError::DuplicateRecord { key });
    }
    map.insert(key, record.clone());
    Ok(())
}

impl ResultStore for InMemoryResultStore {
    fn append_round(&self, record: &RoundRecord) -> Result<()> {
        self.check_writable()?;
        insert_new(&mut self.state.lock().rounds, record.key(), record)
    }

    fn append_error(&self, record: &ErrorRecord) -> Result<()> {
        self.check_writable()?;
        insert_new(&mut self.state.lock().errors, record.key(), record)
    }

    fn append_minimized(&self, record: &MinimizedRecord) -> Result<()> {
        self.check_writable()?;
        insert_new(&mut self.state.lock().minimized, record.key(), record)
    }

    fn append_round_stats(&self, stats: &RoundStats) -> Result<()> {
        self.check_writable()?;
        self.state.lock().stats.push(stats.clone());
        Ok(())
    }

    fn load_progress(&self, program_id: &ProgramId) -> Result<ProgramProgress> {
        let state = self.state.lock();
        if let Some(error) = state
            .errors
            .values()
            .filter(|r| &r.program_id == program_id)
            .min_by_key(|r| r.round)
        {
            return Ok(ProgramProgress::Terminal(Box::new(error.clone())));
        }
        Ok(state
            .rounds
            .values()
            .filter(|r| &r.program_id == program_id)
            .max_by_key(|r| r.round)
            .map_or(ProgramProgress::Fresh, |r| {
                ProgramProgress::Resumable(Box::new(r.clone()))
            }))
    }
}
