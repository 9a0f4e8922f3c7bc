//! Request, outcome, and lifecycle types

use crate::decision::StaleReason;
use crate::error::MemoError;
use crate::identity::CommandIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A command the caller wants run (or skipped, if nothing changed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Executable: a path, a name looked up on `PATH`, or a configured tool name
    pub program: String,

    /// Ordered arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the workspace root (default: the root)
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Paths fingerprinted before and after the run in snapshot mode.
    /// Directories are expanded recursively.
    #[serde(default)]
    pub candidates: Vec<PathBuf>,
}

impl CommandRequest {
    /// Request for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            candidates: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Declare a snapshot candidate
    pub fn candidate(mut self, path: impl Into<PathBuf>) -> Self {
        self.candidates.push(path.into());
        self
    }

    /// Declare several snapshot candidates
    pub fn candidates<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.candidates.extend(paths.into_iter().map(Into::into));
        self
    }
}

/// Result of [`crate::Driver::run`]
#[derive(Debug)]
pub enum Outcome {
    /// Prior outputs are still valid; nothing was executed
    Skipped,
    /// The command ran and its dependencies were committed
    Succeeded(RunReport),
    /// The command could not be launched, failed, or could not be committed
    Failed(MemoError),
}

impl Outcome {
    /// `true` for [`Outcome::Skipped`]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// `true` for [`Outcome::Succeeded`]
    pub fn ran(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// `true` for [`Outcome::Failed`]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The failure, if any
    pub fn error(&self) -> Option<&MemoError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Succeeded(report) => write!(f, "ran ({})", report.reason),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// What happened during a run that succeeded
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Command that ran
    pub identity: CommandIdentity,
    /// Why it had to run
    pub reason: StaleReason,
    /// Recorded inputs
    pub inputs: Vec<PathBuf>,
    /// Recorded outputs
    pub outputs: Vec<PathBuf>,
    /// Wall-clock duration of the process
    pub duration_ms: u64,
}

/// Lifecycle of one invocation.
///
/// `Pending -> Deciding -> {Skipped | Running -> {Succeeded -> Committing -> Done | Failed}}`;
/// `Committing -> Failed` when an output cannot be fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    /// Not yet looked at
    Pending,
    /// Consulting the decision engine
    Deciding,
    /// Prior outputs reused
    Skipped,
    /// Process launched
    Running,
    /// Process exited successfully
    Succeeded,
    /// Fingerprinting accesses and writing the store
    Committing,
    /// Record committed
    Done,
    /// Launch failure, non-zero exit, or failed commit
    Failed,
}

impl InvocationState {
    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Pending, Deciding)
                | (Deciding, Skipped)
                | (Deciding, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Committing)
                | (Committing, Done)
                | (Committing, Failed)
        )
    }

    /// No further transitions possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Done | Self::Failed)
    }

    /// Move to `next`, logging the edge
    pub(crate) fn advance(&mut self, next: InvocationState) {
        debug_assert!(
            self.can_transition_to(next),
            "invalid invocation transition {self} -> {next}"
        );
        tracing::trace!("{} -> {}", self, next);
        *self = next;
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Deciding => "deciding",
            Self::Skipped => "skipped",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Counters kept by a [`crate::Driver`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStats {
    /// Commands executed and committed
    pub executed: usize,
    /// Commands skipped
    pub skipped: usize,
    /// Commands that failed
    pub failed: usize,
}

impl fmt::Display for DriverStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} executed, {} skipped, {} failed",
            self.executed, self.skipped, self.failed
        )
    }
}

/// Result of [`crate::Driver::clean`]
#[derive(Debug, Default)]
pub struct CleanReport {
    /// Records dropped from the store
    pub records_cleared: usize,
    /// Output files deleted
    pub removed: Vec<PathBuf>,
    /// Recorded outputs that were already gone
    pub missing: Vec<PathBuf>,
    /// Outputs that could not be deleted, with the OS error
    pub failures: Vec<(PathBuf, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvocationState::*;

    #[test]
    fn test_lifecycle_edges() {
        assert!(Pending.can_transition_to(Deciding));
        assert!(Deciding.can_transition_to(Skipped));
        assert!(Deciding.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Committing.can_transition_to(Done));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Done));
        assert!(!Failed.can_transition_to(Committing));
    }

    #[test]
    fn test_terminal_states() {
        for state in [Skipped, Done, Failed] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
        for state in [Pending, Deciding, Running, Succeeded, Committing] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
    }

    #[test]
    fn test_advance_walks_happy_path() {
        let mut state = Pending;
        for next in [Deciding, Running, Succeeded, Committing, Done] {
            state.advance(next);
        }
        assert_eq!(state, Done);
    }

    #[test]
    fn test_request_builder() {
        let req = CommandRequest::new("gcc")
            .args(["-c", "a.c"])
            .arg("-o")
            .arg("a.o")
            .cwd("runtime")
            .candidate("a.c");
        assert_eq!(req.args, vec!["-c", "a.c", "-o", "a.o"]);
        assert_eq!(req.cwd, Some(PathBuf::from("runtime")));
        assert_eq!(req.candidates, vec![PathBuf::from("a.c")]);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: CommandRequest = serde_json::from_str(r#"{"program": "ar"}"#).unwrap();
        assert_eq!(req, CommandRequest::new("ar"));
    }
}
