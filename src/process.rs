//! Liveness checks for producer processes.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

// ============================================================================
// SECTION 13: PRODUCER PROCESS LIVENESS
// ============================================================================

/// Answers "does this process still exist?".
pub trait ProcessProbe: Send + Sync {
    fn exists(&self, pid: i32) -> bool;
}

/// Probe backed by `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn exists(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            // Exists, but owned by someone we may not signal.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
