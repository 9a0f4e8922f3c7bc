//! Memozel command-line interface
//!
//! - `run`: run one command unless it is up to date
//! - `batch`: run a JSON list of independent commands in parallel
//! - `status`: report whether a command would run, without running it
//! - `list`: show the dependency records of the workspace
//! - `clean`: delete recorded outputs and forget all records

use clap::{Parser, Subcommand, ValueEnum};
use convenient_memo::{CommandRequest, MemoConfig, MemoResult, RecorderChoice};
use std::path::PathBuf;

pub mod clean;
pub mod inspect;
pub mod run;

/// Memozel - memoizing command runner for heterogeneous toolchains
#[derive(Parser, Debug)]
#[command(name = "memozel")]
#[command(about = "Run build commands only when their inputs or outputs changed")]
#[command(version)]
pub struct Cli {
    /// Workspace root (default: current directory)
    #[arg(short, long, global = true)]
    pub workspace: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// How file accesses are recorded
    #[arg(long, value_enum, global = true)]
    pub mode: Option<Mode>,

    /// Directory holding the stores of many workspaces
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Maximum number of commands running at once
    #[arg(short, long, global = true)]
    pub jobs: Option<usize>,

    /// Do not echo command lines
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Recorder selection on the command line
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Traced if strace works, snapshot otherwise
    Auto,
    /// Trace file accesses with strace
    Traced,
    /// Compare declared candidates before and after
    Snapshot,
}

impl From<Mode> for RecorderChoice {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => RecorderChoice::Auto,
            Mode::Traced => RecorderChoice::Traced,
            Mode::Snapshot => RecorderChoice::Snapshot,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command unless its recorded dependencies are unchanged
    Run {
        #[command(flatten)]
        target: Target,
    },

    /// Run independent commands from a JSON file (array of requests)
    Batch {
        /// File holding `[{"program": ..., "args": [...], "cwd": ..., "candidates": [...]}, ...]`
        file: PathBuf,
    },

    /// Report whether a command is up to date; exits 1 when it would run
    Status {
        #[command(flatten)]
        target: Target,
    },

    /// List dependency records
    List {
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete recorded outputs and clear the dependency store
    Clean,
}

/// One command on the command line
#[derive(clap::Args, Debug)]
pub struct Target {
    /// Working directory, relative to the workspace
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Path fingerprinted before and after the run (snapshot mode)
    #[arg(short = 'c', long = "candidate")]
    pub candidates: Vec<PathBuf>,

    /// Program and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl Target {
    /// The request this target describes
    pub fn request(&self) -> CommandRequest {
        let (program, args) = match self.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let mut request = CommandRequest::new(program)
            .args(args)
            .candidates(self.candidates.iter().cloned());
        request.cwd = self.cwd.clone();
        request
    }
}

impl Cli {
    /// Configuration file (if any) with command-line flags layered on top
    pub fn memo_config(&self) -> MemoResult<MemoConfig> {
        let mut config = match &self.config {
            Some(path) => MemoConfig::load(path)?,
            None => MemoConfig::new("."),
        };
        if let Some(workspace) = &self.workspace {
            config.workspace = workspace.clone();
        }
        if let Some(mode) = self.mode {
            config.recorder = mode.into();
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = Some(state_dir.clone());
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if self.quiet {
            config.echo = false;
        }
        config.validate()?;
        Ok(config)
    }
}
