//! Process-tree tracing engine.
//!
//! Attaches to a command and all of its descendants through the kernel's
//! ptrace facility, interprets a fixed set of syscalls on entry and exit,
//! and reconciles the resulting stream of stops into per-command execution
//! records: which files each program image read, which it wrote, and the
//! command that produced them.
//!
//! The supervisor is single-threaded and must stay on one OS thread for the
//! whole session: the kernel keys the tracer/tracee association on the
//! tracing thread. Spawn the tracee with [`spawn::spawn_traced`] and drive
//! it with [`supervisor::Supervisor::run`] from the same thread.

use nix::errno::Errno;
use thiserror::Error;

pub mod fs;
pub mod kernel;
pub mod proc;
pub mod tracelog;

#[cfg(target_arch = "x86_64")]
pub mod ptrace;
#[cfg(target_arch = "x86_64")]
pub mod seccomp;
#[cfg(target_arch = "x86_64")]
pub mod spawn;
#[cfg(target_arch = "x86_64")]
pub mod supervisor;
#[cfg(target_arch = "x86_64")]
pub mod syscall;

use crate::fs::FsRegistry;
use crate::kernel::SeccompMode;
use crate::proc::ProcRegistry;

/// Session-wide registries shared by the interpreter and the supervisor.
#[derive(Debug, Default)]
pub struct SysState {
    pub fs: FsRegistry,
    pub procs: ProcRegistry,
}

impl SysState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Behavior switches for one tracing session.
#[derive(Debug, Clone)]
pub struct TraceSettings {
    /// Capture environment vectors at exec entry.
    pub record_env: bool,
    /// Rewrite unlink/unlinkat/rmdir into access probes so traced builds
    /// cannot delete files.
    pub undelete: bool,
    pub seccomp: SeccompMode,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            record_env: false,
            undelete: false,
            seccomp: SeccompMode::Off,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ptrace: {0}")]
    Os(#[from] Errno),
    #[error("trace protocol violation: {0}")]
    Protocol(String),
    #[error("failed to launch tracee: {0}")]
    Spawn(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
