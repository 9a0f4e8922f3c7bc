//! Invocation recorders: which files did one command read and write?
//!
//! Two backends sit behind the [`Recorder`] trait:
//! - **Traced** ([`strace::StraceRecorder`]): follows the process tree's
//!   file syscalls, each invocation writing to its own trace file
//! - **Snapshot** ([`snapshot::SnapshotRecorder`]): fingerprints candidate
//!   paths and scans directories before and after the run
//!
//! The backend is chosen once, when the driver is built.

pub mod snapshot;
pub mod strace;

use crate::config::{MemoConfig, RecorderChoice};
use crate::error::{MemoError, MemoResult};
use crate::identity::CommandIdentity;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

pub use snapshot::SnapshotRecorder;
pub use strace::StraceRecorder;

/// Recorder backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderKind {
    /// Syscall tracing
    Traced,
    /// Before/after snapshots
    Snapshot,
}

impl fmt::Display for RecorderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Traced => write!(f, "traced"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Paths read and written by one invocation.
///
/// The two sets are disjoint: a path that was written is an output even if
/// it was read first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    inputs: BTreeSet<PathBuf>,
    outputs: BTreeSet<PathBuf>,
}

impl AccessSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a read. Ignored if the path was already written.
    pub fn read(&mut self, path: PathBuf) {
        if !self.outputs.contains(&path) {
            let _ = self.inputs.insert(path);
        }
    }

    /// Note a write
    pub fn write(&mut self, path: PathBuf) {
        let _ = self.inputs.remove(&path);
        let _ = self.outputs.insert(path);
    }

    /// Note a deletion or rename-away; the path is no longer part of the result
    pub fn remove(&mut self, path: &Path) {
        let _ = self.inputs.remove(path);
        let _ = self.outputs.remove(path);
    }

    /// Paths only read
    pub fn inputs(&self) -> &BTreeSet<PathBuf> {
        &self.inputs
    }

    /// Paths written
    pub fn outputs(&self) -> &BTreeSet<PathBuf> {
        &self.outputs
    }

    /// Keep only paths for which `keep` holds
    pub fn retain(&mut self, mut keep: impl FnMut(&Path) -> bool) {
        self.inputs.retain(|p| keep(p));
        self.outputs.retain(|p| keep(p));
    }
}

/// A request after tool substitution, path resolution, and executable lookup
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    /// Memoization key
    pub identity: CommandIdentity,
    /// Located executable
    pub executable: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Absolute working directory
    pub cwd: PathBuf,
    /// Absolute snapshot candidates
    pub candidates: Vec<PathBuf>,
    /// Outputs recorded by the previous successful run, if any
    pub previous_outputs: Vec<PathBuf>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
}

impl ResolvedCommand {
    /// A plain [`Command`] for this invocation, without any recording wrapper
    pub fn plain_command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        let _ = command
            .args(&self.args)
            .current_dir(&self.cwd)
            .envs(&self.env);
        command
    }
}

/// Strategy for attributing file accesses to one invocation
pub trait Recorder: Send + Sync + fmt::Debug {
    /// Backend type
    fn kind(&self) -> RecorderKind;

    /// Whether sessions running at the same time are attributed independently.
    /// Batches degrade to one process at a time when this is `false`.
    fn isolates_concurrent(&self) -> bool;

    /// Prepare recording for `command`. Snapshot recorders take their
    /// "before" picture here.
    fn begin(&self, command: &ResolvedCommand) -> MemoResult<Box<dyn Session>>;
}

/// Recording state for one invocation
pub trait Session: Send {
    /// The process to spawn, wrapped as the recorder needs
    fn command(&self) -> Command;

    /// Classify accesses once the process has exited successfully
    fn finish(self: Box<Self>) -> MemoResult<AccessSet>;
}

/// Whether `path` falls under one of `prefixes`
pub fn is_ignored(prefixes: &[PathBuf], path: &Path) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix))
}

/// Lexical normalization: drop `.` and fold `..`
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Pick the recorder requested by `config`.
///
/// Like sandbox backend detection, `auto` checks the host once and falls back
/// to snapshots when tracing is unavailable.
pub fn select(config: &MemoConfig, workspace_state_dir: &Path) -> MemoResult<Box<dyn Recorder>> {
    let mut ignore = config.ignore_prefixes.clone();
    ignore.push(workspace_state_dir.to_path_buf());

    match config.recorder {
        RecorderChoice::Traced => {
            if !strace::is_usable(&config.strace) {
                return Err(MemoError::Config(format!(
                    "traced recording requested but `{}` is not usable on this host",
                    config.strace.display()
                )));
            }
            info!("Using traced recorder ({})", config.strace.display());
            Ok(Box::new(StraceRecorder::new(config.strace.clone(), ignore)))
        }
        RecorderChoice::Snapshot => {
            info!("Using snapshot recorder");
            Ok(Box::new(SnapshotRecorder::new(ignore)))
        }
        RecorderChoice::Auto => {
            if strace::is_usable(&config.strace) {
                info!("Detected `{}`, using traced recorder", config.strace.display());
                Ok(Box::new(StraceRecorder::new(config.strace.clone(), ignore)))
            } else {
                warn!(
                    "`{}` not usable, falling back to snapshot recorder (declare candidates)",
                    config.strace.display()
                );
                Ok(Box::new(SnapshotRecorder::new(ignore)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_write_is_output_only() {
        let mut set = AccessSet::new();
        set.read(PathBuf::from("/w/lib.a"));
        set.write(PathBuf::from("/w/lib.a"));
        set.read(PathBuf::from("/w/lib.a"));
        assert!(set.inputs().is_empty());
        assert!(set.outputs().contains(Path::new("/w/lib.a")));
    }

    #[test]
    fn test_remove_forgets_path() {
        let mut set = AccessSet::new();
        set.write(PathBuf::from("/tmp/cc1.s"));
        set.read(PathBuf::from("/w/a.c"));
        set.remove(Path::new("/tmp/cc1.s"));
        assert!(set.outputs().is_empty());
        assert_eq!(set.inputs().len(), 1);
    }

    #[test]
    fn test_retain_filters_both_sets() {
        let mut set = AccessSet::new();
        set.read(PathBuf::from("/proc/self/maps"));
        set.read(PathBuf::from("/w/a.c"));
        set.write(PathBuf::from("/dev/null"));
        set.write(PathBuf::from("/w/a.o"));
        set.retain(|p| !p.starts_with("/proc") && !p.starts_with("/dev"));
        assert_eq!(set.inputs().iter().collect::<Vec<_>>(), vec![Path::new("/w/a.c")]);
        assert_eq!(set.outputs().iter().collect::<Vec<_>>(), vec![Path::new("/w/a.o")]);
    }

    #[test]
    fn test_ignored_prefixes_match_whole_components() {
        let prefixes = vec![PathBuf::from("/proc"), PathBuf::from("/w/.memo")];
        assert!(is_ignored(&prefixes, Path::new("/proc/self/maps")));
        assert!(is_ignored(&prefixes, Path::new("/w/.memo/deps.json")));
        assert!(!is_ignored(&prefixes, Path::new("/processor.c")));
        assert!(!is_ignored(&prefixes, Path::new("/w/a.o")));
    }

    #[test]
    fn test_normalize_folds_dots() {
        assert_eq!(normalize(Path::new("/w/./a/../b.c")), PathBuf::from("/w/b.c"));
        assert_eq!(normalize(Path::new("./runtime/")), PathBuf::from("runtime"));
        assert_eq!(normalize(Path::new(".")), PathBuf::new());
    }

    #[test]
    fn test_snapshot_choice_never_runs_tracer() {
        let config = MemoConfig::new(".")
            .with_recorder(RecorderChoice::Snapshot);
        let recorder = select(&config, Path::new("/w/.memo")).unwrap();
        assert_eq!(recorder.kind(), RecorderKind::Snapshot);
        assert!(!recorder.isolates_concurrent());
    }

    #[test]
    fn test_traced_choice_with_missing_tracer_fails() {
        let mut config = MemoConfig::new(".").with_recorder(RecorderChoice::Traced);
        config.strace = PathBuf::from("/nonexistent/strace");
        assert!(matches!(
            select(&config, Path::new("/w/.memo")),
            Err(MemoError::Config(_))
        ));
    }
}
