//! Persisted record of what each chain installed.
//!
//! Layout under the state directory:
//!
//! ```text
//! runs/
//!   <chain>.json   { "<kver>": { "stored_at_utc": "...", "artifacts": [...] } }
//!   <chain>.lock   exclusive lock held during read-modify-write
//! ```
//!
//! Every update rewrites the whole per-chain document through a temporary
//! file and a rename, so readers never see a half-written record and other
//! kernel versions of the same chain are carried over unchanged.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::artifact::filesystem::canonical_install_path;
use crate::artifact::{Artifact, ArtifactStore};
use crate::error::{Error, Result};

const RUNS_DIR: &str = "runs";

/// Installed artifacts of one (chain, kver) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRun {
    pub stored_at_utc: String,
    pub artifacts: Vec<Artifact>,
}

/// All stored runs of one chain, keyed by kernel version.
pub type ChainRecord = BTreeMap<String, PersistedRun>;

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

/// Held for the duration of a read-modify-write.
struct RecordLock {
    _file: File,
}

impl RunStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let root = state_dir.join(RUNS_DIR);
        fs::create_dir_all(&root).map_err(|e| storage(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record the installed subset of `store` as the run for `chain`/`kver`,
    /// replacing any previous record for that kver. Paths are stored in
    /// canonical form (see [`canonical_install_path`]).
    pub fn store(&self, chain: &str, kver: &str, store: &ArtifactStore) -> Result<PersistedRun> {
        let run = PersistedRun {
            stored_at_utc: now_utc(),
            artifacts: store
                .installed()
                .map(|artifact| {
                    let mut artifact = artifact.clone();
                    artifact.path = canonical_install_path(&artifact.path);
                    artifact
                })
                .collect(),
        };

        let _lock = self.lock(chain)?;
        let mut record = self.read_record(chain)?;
        record.insert(kver.to_string(), run.clone());
        self.write_record(chain, &record)?;

        tracing::debug!(chain, kver, installed = run.artifacts.len(), "stored run");
        Ok(run)
    }

    pub fn get(&self, chain: &str, kver: &str) -> Result<PersistedRun> {
        self.read_record(chain)?
            .remove(kver)
            .ok_or_else(|| not_found(chain, kver))
    }

    /// Remove exactly the `chain`/`kver` entry.
    pub fn delete(&self, chain: &str, kver: &str) -> Result<()> {
        let _lock = self.lock(chain)?;
        let mut record = self.read_record(chain)?;
        if record.remove(kver).is_none() {
            return Err(not_found(chain, kver));
        }
        if record.is_empty() {
            let path = self.record_path(chain);
            fs::remove_file(&path).map_err(|e| storage(&path, e))?;
        } else {
            self.write_record(chain, &record)?;
        }
        Ok(())
    }

    /// Stored kernel versions of `chain`, sorted ascending. Empty when the
    /// chain has no record.
    pub fn kvers(&self, chain: &str) -> Result<Vec<String>> {
        Ok(self.read_record(chain)?.into_keys().collect())
    }

    /// Chains with a stored record.
    pub fn chains(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| storage(&self.root, e))? {
            let entry = entry.map_err(|e| storage(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn record_path(&self, chain: &str) -> PathBuf {
        self.root.join(format!("{chain}.json"))
    }

    fn read_record(&self, chain: &str) -> Result<ChainRecord> {
        let path = self.record_path(chain);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ChainRecord::new()),
            Err(e) => return Err(storage(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| Error::CorruptRecord { path, source })
    }

    fn write_record(&self, chain: &str, record: &ChainRecord) -> Result<()> {
        let path = self.record_path(chain);
        let tmp = self.root.join(format!(".{chain}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|source| Error::CorruptRecord {
                path: path.clone(),
                source,
            })?;
        fs::write(&tmp, bytes).map_err(|e| storage(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| storage(&path, e))
    }

    fn lock(&self, chain: &str) -> Result<RecordLock> {
        let path = self.root.join(format!("{chain}.lock"));
        // The lock file is never unlinked: removing a held lock would let a
        // second process lock a fresh file at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| storage(&path, e))?;
        file.lock_exclusive().map_err(|e| storage(&path, e))?;
        Ok(RecordLock { _file: file })
    }
}

fn storage(path: &Path, source: std::io::Error) -> Error {
    Error::Storage {
        path: path.to_path_buf(),
        source,
    }
}

fn not_found(chain: &str, kver: &str) -> Error {
    Error::NotFound {
        chain: chain.to_string(),
        kver: Some(kver.to_string()),
    }
}

fn now_utc() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("unknown"))
}
