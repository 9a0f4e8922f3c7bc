//! Driver configuration
//!
//! Everything the engine needs to know about the host - where tools live,
//! what environment they get, how accesses are recorded - is carried by
//! [`MemoConfig`] and handed to [`crate::Driver::new`]. Nothing is read from
//! ambient process state except `PATH` when neither the tool table nor
//! [`MemoConfig::env`] names the executable.

use crate::error::{MemoError, MemoResult};
use crate::store::Workspace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which invocation recorder to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderChoice {
    /// Traced when the tracer works on this host, snapshot otherwise
    #[default]
    Auto,
    /// Syscall tracing; fails at startup if unavailable
    Traced,
    /// Pre/post fingerprint snapshots
    Snapshot,
}

/// Configuration passed to [`crate::Driver::new`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoConfig {
    /// Root of the build workspace
    pub workspace: PathBuf,

    /// Shared directory for stores of many workspaces; `None` keeps the
    /// store inside the workspace
    pub state_dir: Option<PathBuf>,

    /// Recording strategy
    pub recorder: RecorderChoice,

    /// Tracer executable used in traced mode
    pub strace: PathBuf,

    /// Tool name -> executable path (e.g. `cc`, `ar`, `sliccompile`)
    pub tools: BTreeMap<String, PathBuf>,

    /// Environment variables set on every launched command
    pub env: BTreeMap<String, String>,

    /// Paths under these prefixes are never recorded
    pub ignore_prefixes: Vec<PathBuf>,

    /// Maximum number of processes in flight during a batch
    pub jobs: usize,

    /// Log every launched command line at info level
    pub echo: bool,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            state_dir: None,
            recorder: RecorderChoice::Auto,
            strace: PathBuf::from("strace"),
            tools: BTreeMap::new(),
            env: BTreeMap::new(),
            ignore_prefixes: ["/proc", "/dev", "/sys", "/run"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            jobs: num_cpus::get(),
            echo: true,
        }
    }
}

impl MemoConfig {
    /// Defaults for a workspace rooted at `workspace`
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file. Relative `workspace` and `state_dir`
    /// entries are resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> MemoResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| MemoError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&data)
            .map_err(|e| MemoError::Config(format!("{}: {e}", path.display())))?;

        let base = path.parent().unwrap_or(Path::new("."));
        if config.workspace.is_relative() {
            config.workspace = base.join(&config.workspace);
        }
        if let Some(state_dir) = config.state_dir.as_mut() {
            if state_dir.is_relative() {
                *state_dir = base.join(&*state_dir);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Select the recorder
    pub fn with_recorder(mut self, recorder: RecorderChoice) -> Self {
        self.recorder = recorder;
        self
    }

    /// Register a tool location
    pub fn with_tool(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let _ = self.tools.insert(name.into(), path.into());
        self
    }

    /// Set an environment variable for launched commands
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Keep stores under `state_dir`
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(state_dir.into());
        self
    }

    /// Reject settings the driver cannot work with
    pub fn validate(&self) -> MemoResult<()> {
        if self.jobs == 0 {
            return Err(MemoError::Config("jobs must be at least 1".into()));
        }
        if self.strace.as_os_str().is_empty() {
            return Err(MemoError::Config("strace path is empty".into()));
        }
        Ok(())
    }

    /// The workspace this configuration addresses
    pub fn workspace(&self) -> MemoResult<Workspace> {
        match &self.state_dir {
            Some(state_dir) => Workspace::with_state_dir(&self.workspace, state_dir),
            None => Workspace::new(&self.workspace),
        }
    }

    /// Program after tool-table substitution
    pub fn resolve_tool(&self, program: &str) -> String {
        match self.tools.get(program) {
            Some(path) => path.to_string_lossy().into_owned(),
            None => program.to_string(),
        }
    }

    /// `PATH` used to locate bare program names
    pub fn search_path(&self) -> Option<std::ffi::OsString> {
        match self.env.get("PATH") {
            Some(path) => Some(path.into()),
            None => std::env::var_os("PATH"),
        }
    }
}
