//! Command memoization engine for heterogeneous toolchains.
//!
//! Runs external tool invocations (compilers, archivers, linkers, hardware
//! design compilers, simulator control) and skips those whose recorded inputs
//! and outputs are unchanged since their last successful run.
//!
//! # Features
//!
//! - SHA-256 file fingerprints with an mtime + size shortcut
//! - Access recording through `strace`, or pre/post snapshots where tracing
//!   is unavailable
//! - A per-workspace JSON dependency store replaced atomically on every commit
//! - Batches of independent commands with a bounded number of processes
//! - Process-group cleanup of in-flight commands when the caller is
//!   interrupted ([`cancel::install`])
//!
//! # Example
//!
//! ```no_run
//! use convenient_memo::{CommandRequest, Driver, MemoConfig};
//!
//! let mut driver = Driver::new(MemoConfig::new("build"))?;
//! let archive = CommandRequest::new("ar")
//!     .args(["-cq", "lib.a", "a.o", "b.o"])
//!     .candidates(["a.o", "b.o", "lib.a"]);
//!
//! let outcome = driver.run(&archive);
//! println!("{outcome}");
//! # Ok::<(), convenient_memo::MemoError>(())
//! ```

#![warn(missing_docs)]
#![warn(unused_results)]

pub mod cancel;
pub mod config;
pub mod decision;
pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod recorder;
pub mod store;
pub mod types;

pub use config::{MemoConfig, RecorderChoice};
pub use decision::{decide, Decision, StaleReason};
pub use driver::Driver;
pub use error::{MemoError, MemoResult};
pub use fingerprint::{FileFingerprint, Fingerprinter};
pub use identity::CommandIdentity;
pub use recorder::{AccessSet, Recorder, RecorderKind, ResolvedCommand, Session};
pub use store::{DependencyRecord, DependencyStore, Workspace};
pub use types::{CleanReport, CommandRequest, DriverStats, InvocationState, Outcome, RunReport};
