//! OS process introspection used by the liveness pollers.

use std::fs;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::Result;

/// Looks up client processes by PID.
pub trait ProcessInspector: Send + Sync {
    /// Short command name of `pid`.
    fn process_name(&self, pid: i32) -> Result<String>;

    /// Whether `pid` is still running.
    fn process_exists(&self, pid: i32) -> Result<bool>;
}

/// [`ProcessInspector`] backed by `/proc` and `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInspector;

impl ProcessInspector for SystemInspector {
    fn process_name(&self, pid: i32) -> Result<String> {
        let comm = fs::read_to_string(format!("/proc/{pid}/comm"))?;
        Ok(comm.trim_end().to_string())
    }

    fn process_exists(&self, pid: i32) -> Result<bool> {
        if pid <= 0 {
            return Ok(false);
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(true),
            // Alive but owned by someone else.
            Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
