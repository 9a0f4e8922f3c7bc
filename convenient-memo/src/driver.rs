//! Execution driver: decide, launch, record, commit
//!
//! A [`Driver`] owns the dependency store of one workspace and the recorder
//! chosen at startup. Every request walks the [`InvocationState`] lifecycle:
//! a command whose record still holds is skipped; anything else is launched
//! in its own process group, recorded, and committed only if it exits
//! successfully and all of its accesses can be fingerprinted.
//!
//! Every live process group is registered with [`crate::cancel`], so a
//! binary that installed the cancellation handlers takes its commands down
//! when it is interrupted.

use crate::cancel;
use crate::config::MemoConfig;
use crate::decision::{decide, Decision, StaleReason};
use crate::error::{MemoError, MemoResult};
use crate::fingerprint::{FileFingerprint, Fingerprinter};
use crate::identity::CommandIdentity;
use crate::recorder::{self, Recorder, RecorderKind, ResolvedCommand, Session};
use crate::store::{DependencyStore, Workspace};
use crate::types::{CleanReport, CommandRequest, DriverStats, InvocationState, Outcome, RunReport};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a batch polls its running processes
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Memoizing command runner for one workspace
#[derive(Debug)]
pub struct Driver {
    config: MemoConfig,
    workspace: Workspace,
    store: DependencyStore,
    fingerprinter: Fingerprinter,
    recorder: Box<dyn Recorder>,
    stats: DriverStats,
}

/// Result of the first half of an invocation
enum Started {
    Skipped,
    Running(RunningInvocation),
    Failed(MemoError),
}

/// A launched process and its recording session.
///
/// Dropping it before the process has been reaped kills the whole process
/// group, so nothing outlives an abandoned run and nothing gets committed.
/// The group id equals the child's pid.
struct RunningInvocation {
    identity: CommandIdentity,
    reason: StaleReason,
    state: InvocationState,
    session: Option<Box<dyn Session>>,
    child: Child,
    started: Instant,
    reaped: bool,
}

impl RunningInvocation {
    fn pgid(&self) -> i32 {
        self.child.id() as i32
    }

    fn reap(&mut self) {
        self.reaped = true;
        cancel::untrack(self.pgid());
    }
}

impl Drop for RunningInvocation {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!("Terminating unfinished `{}`", self.identity);
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(self.child.id() as i32), Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        cancel::untrack(self.pgid());
    }
}

impl Driver {
    /// Open the workspace named by `config` and select a recorder for this host
    pub fn new(config: MemoConfig) -> MemoResult<Self> {
        config.validate()?;
        let workspace = config.workspace()?;
        let recorder = recorder::select(&config, workspace.state_dir())?;
        Self::assemble(config, workspace, recorder)
    }

    /// Like [`Driver::new`], with an explicitly chosen recorder
    pub fn with_recorder(config: MemoConfig, recorder: Box<dyn Recorder>) -> MemoResult<Self> {
        config.validate()?;
        let workspace = config.workspace()?;
        Self::assemble(config, workspace, recorder)
    }

    fn assemble(
        config: MemoConfig,
        workspace: Workspace,
        recorder: Box<dyn Recorder>,
    ) -> MemoResult<Self> {
        if !workspace.root().is_dir() {
            return Err(MemoError::Config(format!(
                "workspace {} is not a directory",
                workspace.root().display()
            )));
        }
        info!(
            "Initializing driver for workspace {} ({})",
            workspace.root().display(),
            workspace.id()
        );
        debug!("Dependency store: {}", workspace.store_path().display());

        let store = DependencyStore::open(&workspace)?;
        Ok(Self {
            config,
            workspace,
            store,
            fingerprinter: Fingerprinter::new(),
            recorder,
            stats: DriverStats::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &MemoConfig {
        &self.config
    }

    /// Workspace this driver memoizes for
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The dependency store
    pub fn store(&self) -> &DependencyStore {
        &self.store
    }

    /// Backend used to record accesses
    pub fn recorder_kind(&self) -> RecorderKind {
        self.recorder.kind()
    }

    /// Counters since construction
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Memoization key for `request`, after tool substitution.
    ///
    /// The working directory is normalized and taken relative to the
    /// workspace root, so `runtime`, `./runtime/` and `<root>/runtime` agree.
    pub fn identity(&self, request: &CommandRequest) -> CommandIdentity {
        let identity = CommandIdentity::new(
            self.config.resolve_tool(&request.program),
            request.args.iter().cloned(),
        );
        match &request.cwd {
            Some(cwd) => identity.in_dir(self.relative_cwd(cwd)),
            None => identity,
        }
    }

    /// `cwd` relative to the workspace root, or absolute when outside it
    fn relative_cwd(&self, cwd: &Path) -> PathBuf {
        let root = self.workspace.root();
        let absolute = recorder::normalize(&root.join(cwd));
        match absolute.strip_prefix(root) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => absolute,
        }
    }

    /// Whether `request` would run, and why, without running it
    pub fn status(&self, request: &CommandRequest) -> Decision {
        let identity = self.identity(request);
        decide(self.store.lookup(&identity), &self.fingerprinter)
    }

    /// Run `request` unless its recorded dependencies are unchanged
    pub fn run(&mut self, request: &CommandRequest) -> Outcome {
        match self.start(request) {
            Started::Skipped => Outcome::Skipped,
            Started::Failed(e) => Outcome::Failed(e),
            Started::Running(mut invocation) => {
                let status = invocation.child.wait();
                self.finish(invocation, status)
            }
        }
    }

    /// Run independent requests, at most `jobs` processes at a time.
    ///
    /// Outcomes are returned in request order. Ordering between dependent
    /// commands is the caller's job: submit them in separate batches.
    pub fn run_batch(&mut self, requests: &[CommandRequest]) -> Vec<Outcome> {
        let limit = if self.recorder.isolates_concurrent() {
            self.config.jobs
        } else {
            if requests.len() > 1 {
                debug!(
                    "{} recorder cannot separate concurrent runs; batch runs sequentially",
                    self.recorder.kind()
                );
            }
            1
        };

        let mut outcomes: Vec<Option<Outcome>> = requests.iter().map(|_| None).collect();
        let mut running: Vec<(usize, RunningInvocation)> = Vec::new();
        let mut next = 0;

        while next < requests.len() || !running.is_empty() {
            while running.len() < limit && next < requests.len() {
                match self.start(&requests[next]) {
                    Started::Skipped => outcomes[next] = Some(Outcome::Skipped),
                    Started::Failed(e) => outcomes[next] = Some(Outcome::Failed(e)),
                    Started::Running(invocation) => running.push((next, invocation)),
                }
                next += 1;
            }

            let mut progressed = false;
            let mut i = 0;
            while i < running.len() {
                let status = match running[i].1.child.try_wait() {
                    Ok(None) => {
                        i += 1;
                        continue;
                    }
                    Ok(Some(status)) => Ok(status),
                    Err(e) => Err(e),
                };
                let (index, invocation) = running.swap_remove(i);
                outcomes[index] = Some(self.finish(invocation, status));
                progressed = true;
            }

            if !progressed && !running.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        outcomes.into_iter().flatten().collect()
    }

    /// Delete every recorded output and empty the store.
    ///
    /// Deletion is best-effort: per-file failures end up in the report and
    /// never stop the rest.
    pub fn clean(&mut self) -> MemoResult<CleanReport> {
        let outputs: BTreeSet<PathBuf> = self
            .store
            .records()
            .flat_map(|record| record.outputs.iter().map(|fp| fp.path.clone()))
            .collect();

        let mut report = CleanReport::default();
        for path in outputs {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed {}", path.display());
                    report.removed.push(path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => report.missing.push(path),
                Err(e) => {
                    warn!("Failed to remove {}: {}", path.display(), e);
                    report.failures.push((path, e.to_string()));
                }
            }
        }

        report.records_cleared = self.store.clear()?.len();
        info!(
            "Clean: {} outputs removed, {} already missing, {} failures, {} records cleared",
            report.removed.len(),
            report.missing.len(),
            report.failures.len(),
            report.records_cleared
        );
        Ok(report)
    }

    /// Pending -> Deciding -> {Skipped | Running | Failed}
    fn start(&mut self, request: &CommandRequest) -> Started {
        let identity = self.identity(request);
        let mut state = InvocationState::Pending;

        state.advance(InvocationState::Deciding);
        let record = self.store.lookup(&identity);
        let reason = match decide(record, &self.fingerprinter) {
            Decision::MaySkip => {
                state.advance(InvocationState::Skipped);
                debug!("`{identity}` is up to date");
                self.stats.skipped += 1;
                return Started::Skipped;
            }
            Decision::MustRun(reason) => reason,
        };
        let previous_outputs: Vec<PathBuf> = record
            .map(|r| r.outputs.iter().map(|fp| fp.path.clone()).collect())
            .unwrap_or_default();

        debug!("`{identity}` must run: {reason}");
        if self.config.echo {
            info!("{identity}");
        }

        state.advance(InvocationState::Running);
        match self.launch(request, &identity, previous_outputs) {
            Ok((session, child)) => {
                let invocation = RunningInvocation {
                    identity,
                    reason,
                    state,
                    session: Some(session),
                    child,
                    started: Instant::now(),
                    reaped: false,
                };
                let _ = cancel::track(invocation.pgid());
                Started::Running(invocation)
            }
            Err(e) => {
                state.advance(InvocationState::Failed);
                Started::Failed(self.fail(&identity, e))
            }
        }
    }

    fn launch(
        &self,
        request: &CommandRequest,
        identity: &CommandIdentity,
        previous_outputs: Vec<PathBuf>,
    ) -> MemoResult<(Box<dyn Session>, Child)> {
        let cwd = self.workspace.root().join(identity.cwd());
        let executable = self
            .locate(identity.program(), &cwd)
            .map_err(|source| MemoError::Launch {
                command: identity.to_string(),
                source,
            })?;

        let resolved = ResolvedCommand {
            identity: identity.clone(),
            executable,
            args: identity.args().to_vec(),
            candidates: request.candidates.iter().map(|c| cwd.join(c)).collect(),
            previous_outputs,
            env: self.config.env.clone(),
            cwd,
        };

        let session = self.recorder.begin(&resolved)?;
        let mut command = session.command();
        let _ = command.stdin(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let _ = command.process_group(0);
            die_with_parent(&mut command);
        }

        debug!("Spawning {:?}", command);
        let child = command.spawn().map_err(|source| MemoError::Launch {
            command: identity.to_string(),
            source,
        })?;
        Ok((session, child))
    }

    /// Running -> {Failed | Succeeded -> Committing -> {Done | Failed}}
    fn finish(
        &mut self,
        mut invocation: RunningInvocation,
        status: io::Result<ExitStatus>,
    ) -> Outcome {
        invocation.reap();
        let duration_ms = invocation.started.elapsed().as_millis() as u64;
        let identity = invocation.identity.clone();

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                invocation.state.advance(InvocationState::Failed);
                let error = MemoError::Wait {
                    command: identity.to_string(),
                    source: e,
                };
                return Outcome::Failed(self.fail(&identity, error));
            }
        };
        if !status.success() {
            invocation.state.advance(InvocationState::Failed);
            return Outcome::Failed(self.fail(
                &identity,
                MemoError::Execution {
                    command: identity.to_string(),
                    status,
                },
            ));
        }
        invocation.state.advance(InvocationState::Succeeded);

        invocation.state.advance(InvocationState::Committing);
        let Some(session) = invocation.session.take() else {
            invocation.state.advance(InvocationState::Failed);
            return Outcome::Failed(self.fail(
                &identity,
                MemoError::Trace("recording session already consumed".into()),
            ));
        };
        match self.commit(&identity, session) {
            Ok((inputs, outputs)) => {
                invocation.state.advance(InvocationState::Done);
                self.stats.executed += 1;
                info!(
                    "`{}` done in {}ms ({} inputs, {} outputs)",
                    identity,
                    duration_ms,
                    inputs.len(),
                    outputs.len()
                );
                Outcome::Succeeded(RunReport {
                    identity,
                    reason: invocation.reason.clone(),
                    inputs,
                    outputs,
                    duration_ms,
                })
            }
            Err(e) => {
                invocation.state.advance(InvocationState::Failed);
                Outcome::Failed(self.fail(&identity, e))
            }
        }
    }

    /// Fingerprint every recorded access and write the record
    fn commit(
        &mut self,
        identity: &CommandIdentity,
        session: Box<dyn Session>,
    ) -> MemoResult<(Vec<PathBuf>, Vec<PathBuf>)> {
        let accesses = session.finish()?;
        let outputs = self.fingerprint_all(accesses.outputs())?;
        let inputs = self.fingerprint_all(accesses.inputs())?;
        self.store.commit(identity, inputs.clone(), outputs.clone())?;
        Ok((paths(&inputs), paths(&outputs)))
    }

    fn fingerprint_all(&self, paths: &BTreeSet<PathBuf>) -> MemoResult<Vec<FileFingerprint>> {
        paths
            .iter()
            .map(|path| self.fingerprinter.fingerprint(path))
            .collect()
    }

    /// Count a failure and drop the stale record so the next run retries
    fn fail(&mut self, identity: &CommandIdentity, error: MemoError) -> MemoError {
        warn!("{error}");
        self.stats.failed += 1;
        match self.store.discard(identity) {
            Ok(true) => debug!("Discarded previous record of `{identity}`"),
            Ok(false) => {}
            Err(e) => warn!("Could not discard record of `{identity}`: {e}"),
        }
        error
    }

    /// Find the executable for `program`: paths containing a slash are taken
    /// relative to `cwd`, bare names are searched on `PATH`
    fn locate(&self, program: &str, cwd: &Path) -> io::Result<PathBuf> {
        if program.contains('/') {
            let path = cwd.join(program);
            return if is_executable(&path) {
                Ok(path)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} is not an executable file", path.display()),
                ))
            };
        }

        if let Some(search_path) = self.config.search_path() {
            for dir in std::env::split_paths(&search_path) {
                let candidate = cwd.join(dir).join(program);
                if is_executable(&candidate) {
                    return Ok(candidate);
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("`{program}` not found on PATH"),
        ))
    }
}

/// Have the kernel kill the child if this process dies first. Only the
/// direct child is covered; its descendants rely on [`cancel`] and, for
/// traced runs, on strace's `--kill-on-exit`.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn die_with_parent(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: prctl is async-signal-safe and touches no parent state.
    unsafe {
        let _ = command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL)
                .map_err(io::Error::from)
        });
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn die_with_parent(_command: &mut std::process::Command) {}

fn paths(fingerprints: &[FileFingerprint]) -> Vec<PathBuf> {
    fingerprints.iter().map(|fp| fp.path.clone()).collect()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
