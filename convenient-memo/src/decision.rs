//! Rebuild decision: may a command's prior outputs be reused?

use crate::fingerprint::{FileFingerprint, Fingerprinter};
use crate::store::DependencyRecord;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Why a command must run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    /// Never ran successfully in this workspace (or the store was cleaned)
    NoRecord,
    /// A recorded output no longer exists
    OutputMissing(PathBuf),
    /// A recorded output was modified out-of-band
    OutputChanged(PathBuf),
    /// A recorded output exists but cannot be read
    OutputUnreadable(PathBuf),
    /// A recorded input's content changed
    InputChanged(PathBuf),
    /// A recorded input no longer exists
    InputMissing(PathBuf),
    /// A recorded input cannot be read, so validity cannot be proven
    InputUnreadable(PathBuf),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecord => write!(f, "no previous run"),
            Self::OutputMissing(p) => write!(f, "output missing: {}", p.display()),
            Self::OutputChanged(p) => write!(f, "output modified: {}", p.display()),
            Self::OutputUnreadable(p) => write!(f, "output unreadable: {}", p.display()),
            Self::InputChanged(p) => write!(f, "input changed: {}", p.display()),
            Self::InputMissing(p) => write!(f, "input missing: {}", p.display()),
            Self::InputUnreadable(p) => write!(f, "input unreadable: {}", p.display()),
        }
    }
}

/// Outcome of the decision procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Prior outputs remain valid
    MaySkip,
    /// The command has to be executed
    MustRun(StaleReason),
}

impl Decision {
    /// `true` for [`Decision::MaySkip`]
    pub fn may_skip(&self) -> bool {
        matches!(self, Self::MaySkip)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaySkip => write!(f, "up to date"),
            Self::MustRun(reason) => write!(f, "out of date ({reason})"),
        }
    }
}

/// Decide whether the command owning `record` must run.
///
/// Outputs are checked before inputs; any fingerprint that cannot be
/// recomputed counts as stale.
pub fn decide(record: Option<&DependencyRecord>, fingerprinter: &Fingerprinter) -> Decision {
    let Some(record) = record else {
        return Decision::MustRun(StaleReason::NoRecord);
    };

    for output in &record.outputs {
        if let Some(reason) = check(output, record.committed_at_ns, fingerprinter, Role::Output) {
            return Decision::MustRun(reason);
        }
    }

    for input in &record.inputs {
        if let Some(reason) = check(input, record.committed_at_ns, fingerprinter, Role::Input) {
            return Decision::MustRun(reason);
        }
    }

    Decision::MaySkip
}

#[derive(Clone, Copy)]
enum Role {
    Input,
    Output,
}

fn check(
    recorded: &FileFingerprint,
    committed_at_ns: u64,
    fingerprinter: &Fingerprinter,
    role: Role,
) -> Option<StaleReason> {
    let path = recorded.path.clone();
    match fingerprinter.refresh(recorded, committed_at_ns) {
        Ok(current) if current.matches(recorded) => None,
        Ok(_) => Some(match role {
            Role::Input => StaleReason::InputChanged(path),
            Role::Output => StaleReason::OutputChanged(path),
        }),
        Err(e) => {
            debug!("{e}");
            let missing = e.is_not_found();
            Some(match (role, missing) {
                (Role::Input, true) => StaleReason::InputMissing(path),
                (Role::Input, false) => StaleReason::InputUnreadable(path),
                (Role::Output, true) => StaleReason::OutputMissing(path),
                (Role::Output, false) => StaleReason::OutputUnreadable(path),
            })
        }
    }
}
