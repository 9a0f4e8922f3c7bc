//! Snapshot recorder: fingerprint before, fingerprint and scan after
//!
//! Candidates (declared paths plus the previous run's outputs) are hashed
//! before the process starts. The working directory and every candidate
//! directory are listed by size and mtime. After the process exits:
//! - a candidate with the same hash is an input (an output if the previous
//!   run produced it)
//! - a candidate with a different hash is an output
//! - a listed file that is new or whose size/mtime moved is an output
//!
//! Directory scans cannot tell two concurrent processes apart, so this
//! recorder reports [`Recorder::isolates_concurrent`] as `false`.

use super::{is_ignored, AccessSet, Recorder, RecorderKind, ResolvedCommand, Session};
use crate::error::MemoResult;
use crate::fingerprint::{FileFingerprint, FileStat, Fingerprinter};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Pre/post snapshot backend
#[derive(Debug, Clone)]
pub struct SnapshotRecorder {
    exclude: Vec<PathBuf>,
    fingerprinter: Fingerprinter,
}

impl SnapshotRecorder {
    /// Recorder that never scans below the `exclude` prefixes
    pub fn new(exclude: Vec<PathBuf>) -> Self {
        Self {
            exclude,
            fingerprinter: Fingerprinter::new(),
        }
    }
}

impl Recorder for SnapshotRecorder {
    fn kind(&self) -> RecorderKind {
        RecorderKind::Snapshot
    }

    fn isolates_concurrent(&self) -> bool {
        false
    }

    fn begin(&self, command: &ResolvedCommand) -> MemoResult<Box<dyn Session>> {
        let mut roots = vec![command.cwd.clone()];
        let mut candidates = BTreeSet::new();
        for path in command.candidates.iter().chain(&command.previous_outputs) {
            if path.is_dir() {
                roots.push(path.clone());
                candidates.extend(list_files(path, &self.exclude).into_keys());
            } else {
                let _ = candidates.insert(path.clone());
            }
        }

        let mut before = BTreeMap::new();
        for path in &candidates {
            // Candidates that do not exist yet are simply not fingerprinted.
            if let Ok(fp) = self.fingerprinter.fingerprint(path) {
                let _ = before.insert(path.clone(), fp);
            }
        }

        let mut listing = BTreeMap::new();
        for root in &roots {
            listing.extend(list_files(root, &self.exclude));
        }

        debug!(
            "Snapshot of `{}`: {} candidates, {} listed files",
            command.identity,
            before.len(),
            listing.len()
        );

        Ok(Box::new(SnapshotSession {
            command: command.plain_command(),
            fingerprinter: self.fingerprinter.clone(),
            exclude: self.exclude.clone(),
            roots,
            candidates,
            before,
            listing,
            previous_outputs: command.previous_outputs.iter().cloned().collect(),
        }))
    }
}

struct SnapshotSession {
    command: Command,
    fingerprinter: Fingerprinter,
    exclude: Vec<PathBuf>,
    roots: Vec<PathBuf>,
    candidates: BTreeSet<PathBuf>,
    before: BTreeMap<PathBuf, FileFingerprint>,
    listing: BTreeMap<PathBuf, FileStat>,
    previous_outputs: BTreeSet<PathBuf>,
}

impl Session for SnapshotSession {
    fn command(&self) -> Command {
        let mut command = Command::new(self.command.get_program());
        let _ = command.args(self.command.get_args());
        if let Some(cwd) = self.command.get_current_dir() {
            let _ = command.current_dir(cwd);
        }
        for (key, value) in self.command.get_envs() {
            match value {
                Some(value) => {
                    let _ = command.env(key, value);
                }
                None => {
                    let _ = command.env_remove(key);
                }
            }
        }
        command
    }

    fn finish(self: Box<Self>) -> MemoResult<AccessSet> {
        let mut accesses = AccessSet::new();

        for path in &self.candidates {
            let Ok(after) = self.fingerprinter.fingerprint(path) else {
                // Deleted by the command, or never created.
                continue;
            };
            match self.before.get(path) {
                Some(before) if before.matches(&after) => {
                    if self.previous_outputs.contains(path) {
                        accesses.write(path.clone());
                    } else {
                        accesses.read(path.clone());
                    }
                }
                _ => accesses.write(path.clone()),
            }
        }

        let mut after = BTreeMap::new();
        for root in &self.roots {
            after.extend(list_files(root, &self.exclude));
        }
        for (path, stat) in after {
            if self.candidates.contains(&path) {
                continue;
            }
            match self.listing.get(&path) {
                Some(old) if *old == stat => {}
                _ => accesses.write(path),
            }
        }

        Ok(accesses)
    }
}

/// Regular files below `root`, with their stat, skipping excluded prefixes
fn list_files(root: &Path, exclude: &[PathBuf]) -> BTreeMap<PathBuf, FileStat> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored(exclude, entry.path()))
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let path = entry.into_path();
            FileStat::of(&path).ok().map(|stat| (path, stat))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CommandIdentity;
    use std::fs;
    use tempfile::TempDir;

    fn resolved(cwd: &Path, candidates: Vec<PathBuf>, previous: Vec<PathBuf>) -> ResolvedCommand {
        ResolvedCommand {
            identity: CommandIdentity::new("sh", ["-c", "true"]),
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "true".into()],
            cwd: cwd.to_path_buf(),
            candidates,
            previous_outputs: previous,
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_classifies_unchanged_changed_and_new() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.o");
        let b = tmp.path().join("b.o");
        let unrelated = tmp.path().join("README");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();
        fs::write(&unrelated, b"docs").unwrap();

        let recorder = SnapshotRecorder::new(vec![]);
        let session = recorder
            .begin(&resolved(tmp.path(), vec![a.clone(), b.clone()], vec![]))
            .unwrap();

        // What the command would have done:
        fs::write(&b, b"b, rewritten in place").unwrap();
        fs::write(tmp.path().join("lib.a"), b"archive").unwrap();

        let accesses = session.finish().unwrap();
        assert!(accesses.inputs().contains(&a));
        assert!(accesses.outputs().contains(&b));
        assert!(accesses.outputs().contains(&tmp.path().join("lib.a")));
        assert!(!accesses.inputs().contains(&unrelated));
        assert!(!accesses.outputs().contains(&unrelated));
    }

    #[test]
    fn test_rewritten_existing_file_is_output() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("lib.a");
        fs::write(&lib, b"old archive").unwrap();
        filetime::set_file_mtime(&lib, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();

        let recorder = SnapshotRecorder::new(vec![]);
        let session = recorder.begin(&resolved(tmp.path(), vec![], vec![])).unwrap();
        fs::write(&lib, b"new archive!").unwrap();

        let accesses = session.finish().unwrap();
        assert!(accesses.outputs().contains(&lib));
    }

    #[test]
    fn test_identical_rewrite_of_previous_output_stays_output() {
        let tmp = TempDir::new().unwrap();
        let lib = tmp.path().join("lib.a");
        fs::write(&lib, b"archive").unwrap();

        let recorder = SnapshotRecorder::new(vec![]);
        let session = recorder
            .begin(&resolved(tmp.path(), vec![], vec![lib.clone()]))
            .unwrap();
        let accesses = session.finish().unwrap();
        assert!(accesses.outputs().contains(&lib));
        assert!(accesses.inputs().is_empty());
    }

    #[test]
    fn test_excluded_state_dir_is_not_scanned() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join(".memo");
        fs::create_dir_all(&state).unwrap();

        let recorder = SnapshotRecorder::new(vec![state.clone()]);
        let session = recorder.begin(&resolved(tmp.path(), vec![], vec![])).unwrap();
        fs::write(state.join("deps.json"), b"{}").unwrap();

        let accesses = session.finish().unwrap();
        assert!(accesses.outputs().is_empty());
    }

    #[test]
    fn test_candidate_directory_is_expanded() {
        let tmp = TempDir::new().unwrap();
        let include = tmp.path().join("include");
        fs::create_dir_all(&include).unwrap();
        fs::write(include.join("maxhash.h"), b"#pragma once").unwrap();

        let work = tmp.path().join("build");
        fs::create_dir_all(&work).unwrap();

        let recorder = SnapshotRecorder::new(vec![]);
        let session = recorder
            .begin(&resolved(&work, vec![include.clone()], vec![]))
            .unwrap();
        let accesses = session.finish().unwrap();
        assert!(accesses.inputs().contains(&include.join("maxhash.h")));
    }
}
