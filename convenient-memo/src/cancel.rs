//! Cancellation: take in-flight process groups down with this process
//!
//! Launched commands run in their own process group, so a terminal `^C`
//! never reaches them directly. The driver registers every group it starts
//! in a fixed table of atomics; [`install`] hooks `SIGINT`, `SIGTERM` and
//! `SIGHUP` so that the handler can `killpg` each registered group before
//! the signal is re-raised with its default action. Nothing is committed for
//! a killed command, so the next run re-evaluates it from scratch.
//!
//! The table is lock-free because the handler runs in signal context, where
//! only async-signal-safe calls (`killpg`, `sigaction`, `raise`) are allowed.

use crate::error::MemoResult;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

/// Most process groups tracked at once
const SLOTS: usize = 256;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicI32 = AtomicI32::new(0);

static GROUPS: [AtomicI32; SLOTS] = [EMPTY; SLOTS];

/// Remember process group `pgid` until [`untrack`] is called for it.
///
/// Returns `false` when every slot is taken; that group is then only
/// cleaned up by the driver itself.
pub fn track(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    for slot in &GROUPS {
        if slot
            .compare_exchange(0, pgid, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
    warn!("Cancellation table full; process group {pgid} is not tracked");
    false
}

/// Forget process group `pgid`
pub fn untrack(pgid: i32) {
    for slot in &GROUPS {
        if slot
            .compare_exchange(pgid, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

/// Whether `pgid` is currently tracked
pub fn is_tracked(pgid: i32) -> bool {
    pgid > 0 && GROUPS.iter().any(|slot| slot.load(Ordering::SeqCst) == pgid)
}

/// Send `SIGKILL` to every tracked process group. Safe to call from a
/// signal handler.
pub fn kill_tracked() -> usize {
    let mut killed = 0;
    for slot in &GROUPS {
        let pgid = slot.load(Ordering::SeqCst);
        if pgid > 0 && kill_group(pgid) {
            killed += 1;
        }
    }
    killed
}

#[cfg(unix)]
fn kill_group(pgid: i32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    killpg(Pid::from_raw(pgid), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) -> bool {
    false
}

#[cfg(unix)]
extern "C" fn on_terminate(signal: nix::libc::c_int) {
    use nix::sys::signal::{raise, signal as set_handler, SigHandler, Signal};

    let _ = kill_tracked();
    if let Ok(signal) = Signal::try_from(signal) {
        // SAFETY: restoring the default disposition is async-signal-safe.
        let _ = unsafe { set_handler(signal, SigHandler::SigDfl) };
        let _ = raise(signal);
    }
}

/// Kill tracked process groups when this process is asked to terminate.
///
/// Meant for binaries: it replaces the process-wide handlers of `SIGINT`,
/// `SIGTERM` and `SIGHUP`. After cleanup the signal is delivered again with
/// its default action, so the exit status still reports it.
#[cfg(unix)]
pub fn install() -> MemoResult<()> {
    use crate::error::MemoError;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only touches atomics and async-signal-safe calls.
        let _ = unsafe { sigaction(signal, &action) }.map_err(|e| {
            MemoError::Config(format!("cannot install {signal:?} handler: {e}"))
        })?;
    }
    debug!("Cancellation handlers installed");
    Ok(())
}

/// No signals to hook on this platform
#[cfg(not(unix))]
pub fn install() -> MemoResult<()> {
    debug!("Cancellation handlers are not supported on this platform");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_track_and_untrack() {
        let pgid = i32::MAX - 7;
        assert!(!is_tracked(pgid));
        assert!(track(pgid));
        assert!(is_tracked(pgid));
        untrack(pgid);
        assert!(!is_tracked(pgid));
        assert!(!track(0));
    }

    #[test]
    fn test_group_kill_reaches_grandchildren() {
        let tmp = tempfile::TempDir::new().unwrap();
        let late = tmp.path().join("late.txt");
        let script = format!("(sleep 1; echo late > '{}') & wait", late.display());
        let mut child = Command::new("sh")
            .args(["-c", &script])
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id() as i32;
        assert!(track(pgid));

        let begun = Instant::now();
        assert!(kill_group(pgid));
        let status = child.wait().unwrap();
        untrack(pgid);
        assert!(!status.success());
        assert!(begun.elapsed() < Duration::from_secs(1));

        // The backgrounded subshell shared the group and never wrote.
        std::thread::sleep(Duration::from_secs(2));
        assert!(!late.exists());
    }
}
