//! Persistent dependency store, one JSON file per workspace
//!
//! Every mutation rewrites the whole file through write-fsync-rename, so an
//! abrupt termination leaves either the previous or the new file on disk and
//! never a half-written record.

use crate::error::{MemoError, MemoResult};
use crate::fingerprint::{now_ns, FileFingerprint};
use crate::identity::CommandIdentity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current schema version. Bump when the file format changes.
const STORE_VERSION: u32 = 2;

/// Directory created inside the workspace when no state directory is configured
pub const DEFAULT_STATE_DIR: &str = ".memo";

/// Store file name inside [`DEFAULT_STATE_DIR`]
const STORE_FILE: &str = "deps.json";

/// The durable scope of one dependency store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    id: String,
    store_path: PathBuf,
}

impl Workspace {
    /// Workspace rooted at `root`, store kept in `<root>/.memo/deps.json`
    pub fn new(root: impl AsRef<Path>) -> MemoResult<Self> {
        let root = absolute_root(root.as_ref())?;
        let store_path = root.join(DEFAULT_STATE_DIR).join(STORE_FILE);
        Ok(Self {
            id: workspace_id(&root),
            root,
            store_path,
        })
    }

    /// Workspace rooted at `root`, store kept in `<state_dir>/<workspace-id>.json`
    pub fn with_state_dir(root: impl AsRef<Path>, state_dir: impl AsRef<Path>) -> MemoResult<Self> {
        let root = absolute_root(root.as_ref())?;
        let id = workspace_id(&root);
        let store_path = state_dir.as_ref().join(format!("{id}.json"));
        Ok(Self {
            root,
            id,
            store_path,
        })
    }

    /// Absolute root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable identifier derived from the root path
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Location of the store file
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Directory holding the store file
    pub fn state_dir(&self) -> &Path {
        self.store_path.parent().unwrap_or(&self.root)
    }
}

fn absolute_root(root: &Path) -> MemoResult<PathBuf> {
    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()?.join(root)
    };
    // Canonical when possible so `./build` and `/abs/build` share a store.
    Ok(fs::canonicalize(&root).unwrap_or(root))
}

/// `<dir-name>-<16 hex chars of sha256(root)>`
fn workspace_id(root: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    format!("{name}-{}", &digest[..16])
}

/// Fingerprints captured by the most recent successful run of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// The command this record belongs to
    pub command: CommandIdentity,
    /// Files the command read
    pub inputs: Vec<FileFingerprint>,
    /// Files the command wrote
    pub outputs: Vec<FileFingerprint>,
    /// When the record was committed, nanoseconds since the Unix epoch
    pub committed_at_ns: u64,
}

/// On-disk layout
#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    workspace: String,
    records: BTreeMap<String, DependencyRecord>,
}

/// Mapping from command identity to [`DependencyRecord`]
#[derive(Debug)]
pub struct DependencyStore {
    path: PathBuf,
    workspace_id: String,
    records: BTreeMap<String, DependencyRecord>,
    recovered: Option<MemoError>,
}

impl DependencyStore {
    /// Load the store for `workspace`, or start empty.
    ///
    /// A malformed or foreign file is not an error: it is logged and replaced
    /// by an empty store on the next commit, since the worst consequence is an
    /// unnecessary re-run.
    pub fn open(workspace: &Workspace) -> MemoResult<Self> {
        let path = workspace.store_path().to_path_buf();
        let mut store = Self {
            path,
            workspace_id: workspace.id().to_string(),
            records: BTreeMap::new(),
            recovered: None,
        };

        let tmp = store.tmp_path();
        if tmp.exists() {
            debug!("Removing interrupted commit {}", tmp.display());
            let _ = fs::remove_file(&tmp);
        }

        let data = match fs::read_to_string(&store.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No dependency store at {}, starting empty", store.path.display());
                return Ok(store);
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                store.recover(format!("not UTF-8: {e}"));
                return Ok(store);
            }
            Err(source) => {
                return Err(MemoError::Store {
                    path: store.path,
                    source,
                });
            }
        };

        match serde_json::from_str::<StoreFile>(&data) {
            Ok(file) if file.version != STORE_VERSION => {
                store.recover(format!(
                    "schema version {} (expected {STORE_VERSION})",
                    file.version
                ));
            }
            Ok(file) if file.workspace != store.workspace_id => {
                store.recover(format!("belongs to workspace `{}`", file.workspace));
            }
            Ok(file) => {
                debug!(
                    "Loaded {} records from {}",
                    file.records.len(),
                    store.path.display()
                );
                store.records = file.records;
            }
            Err(e) => store.recover(e.to_string()),
        }

        Ok(store)
    }

    fn recover(&mut self, reason: String) {
        let err = MemoError::StoreCorruption {
            path: self.path.clone(),
            reason,
        };
        warn!("{err}; treating it as empty");
        self.recovered = Some(err);
    }

    /// The corruption that was recovered from while opening, if any
    pub fn recovered_corruption(&self) -> Option<&MemoError> {
        self.recovered.as_ref()
    }

    /// Store file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record for `identity`, if one was committed
    pub fn lookup(&self, identity: &CommandIdentity) -> Option<&DependencyRecord> {
        self.records.get(&identity.key())
    }

    /// All records, in key order
    pub fn records(&self) -> impl Iterator<Item = &DependencyRecord> {
        self.records.values()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` when no record exists
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert or overwrite the record for `identity` and persist it.
    ///
    /// The in-memory map only changes once the file has been replaced.
    pub fn commit(
        &mut self,
        identity: &CommandIdentity,
        inputs: Vec<FileFingerprint>,
        outputs: Vec<FileFingerprint>,
    ) -> MemoResult<()> {
        let record = DependencyRecord {
            command: identity.clone(),
            inputs,
            outputs,
            committed_at_ns: now_ns(),
        };
        let mut records = self.records.clone();
        let _ = records.insert(identity.key(), record);
        self.persist(&records)?;
        self.records = records;
        debug!("Committed record for {identity}");
        Ok(())
    }

    /// Drop the record for `identity`. Returns whether one existed.
    pub fn discard(&mut self, identity: &CommandIdentity) -> MemoResult<bool> {
        let key = identity.key();
        if !self.records.contains_key(&key) {
            return Ok(false);
        }
        let mut records = self.records.clone();
        let _ = records.remove(&key);
        self.persist(&records)?;
        self.records = records;
        debug!("Discarded record for {identity}");
        Ok(true)
    }

    /// Remove every record, returning what was removed
    pub fn clear(&mut self) -> MemoResult<Vec<DependencyRecord>> {
        let empty = BTreeMap::new();
        self.persist(&empty)?;
        let cleared = std::mem::take(&mut self.records);
        info!("Cleared {} records from {}", cleared.len(), self.path.display());
        Ok(cleared.into_values().collect())
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    fn persist(&self, records: &BTreeMap<String, DependencyRecord>) -> MemoResult<()> {
        let file = StoreFile {
            version: STORE_VERSION,
            workspace: self.workspace_id.clone(),
            records: records.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        atomic_write(&self.path, &self.tmp_path(), &json).map_err(|source| MemoError::Store {
            path: self.path.clone(),
            source,
        })
    }
}

/// Write-fsync-rename, then fsync the parent directory
fn atomic_write(path: &Path, tmp: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            // Not supported everywhere.
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
