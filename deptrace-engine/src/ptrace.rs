//! Platform adapter: wait/demultiplex, register and tracee-memory access,
//! resume policy.
//!
//! Only the x86-64 Linux ABI is supported. The interpreter is written
//! against the [`Tracee`] trait so tests can drive it without a live
//! process; [`LiveTracee`] is the real implementation over ptrace.

use log::debug;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::EngineError;

pub type Regs = libc::user_regs_struct;

/// Why a traced process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Ordinary syscall entry or exit stop.
    Syscall,
    Fork,
    Vfork,
    VforkDone,
    Clone,
    Exec,
    /// Filter-accelerated (seccomp) stop.
    Filter,
}

impl Stop {
    /// Trace-log tag for process-creation stops.
    pub fn tag(&self) -> &'static str {
        match self {
            Stop::Fork => "fork",
            Stop::Vfork => "vfork",
            Stop::VforkDone => "vforke",
            Stop::Clone => "clone",
            Stop::Exec => "_exec",
            Stop::Filter => "_filter",
            Stop::Syscall => "_syscall",
        }
    }
}

/// One demultiplexed wait result.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent {
    Stopped { pid: Pid, stop: Stop },
    /// The process is gone; status is the exit code, negative for death by
    /// signal.
    Exited { pid: Pid, status: i32 },
}

/// Block until any traced process stops or exits. Signal-delivery stops
/// are handled here: the signal is forwarded and the wait continues. The
/// initial `SIGSTOP` of a freshly attached child is swallowed and the
/// child steered to its next syscall boundary.
pub fn wait_for_event(seccomp: bool) -> Result<TraceEvent, EngineError> {
    loop {
        match waitpid(None, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::PtraceSyscall(pid)) => {
                return Ok(TraceEvent::Stopped {
                    pid,
                    stop: Stop::Syscall,
                })
            }
            Ok(WaitStatus::PtraceEvent(pid, _, event)) => {
                let stop = match event {
                    libc::PTRACE_EVENT_FORK => Stop::Fork,
                    libc::PTRACE_EVENT_VFORK => Stop::Vfork,
                    libc::PTRACE_EVENT_VFORK_DONE => Stop::VforkDone,
                    libc::PTRACE_EVENT_CLONE => Stop::Clone,
                    libc::PTRACE_EVENT_EXEC => Stop::Exec,
                    libc::PTRACE_EVENT_SECCOMP => Stop::Filter,
                    other => {
                        return Err(EngineError::Protocol(format!(
                            "unexpected ptrace event {other} on pid {pid}"
                        )))
                    }
                };
                return Ok(TraceEvent::Stopped { pid, stop });
            }
            Ok(WaitStatus::Exited(pid, code)) => {
                return Ok(TraceEvent::Exited { pid, status: code })
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                return Ok(TraceEvent::Exited {
                    pid,
                    status: -(sig as i32),
                })
            }
            Ok(WaitStatus::Stopped(pid, Signal::SIGSTOP)) => {
                // Fresh tracee announcing itself; aim it at the next
                // syscall boundary so its clone-exit stop is observed.
                debug!("swallowing SIGSTOP of {pid}");
                resume_with(pid, None, true, seccomp)?;
            }
            Ok(WaitStatus::Stopped(pid, sig)) => {
                debug!("forwarding {sig} to {pid}");
                resume_with(pid, Some(sig), false, seccomp)?;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Continue a stopped tracee. With filter acceleration the tracee runs
/// free until the next filter stop, unless a syscall exit stop is still
/// owed; without it every syscall boundary stops.
pub fn resume(pid: Pid, expect_syscall_exit: bool, seccomp: bool) -> Result<(), EngineError> {
    resume_with(pid, None, expect_syscall_exit, seccomp)
}

fn resume_with(
    pid: Pid,
    sig: Option<Signal>,
    expect_syscall_exit: bool,
    seccomp: bool,
) -> Result<(), EngineError> {
    let res = if seccomp && !expect_syscall_exit {
        ptrace::cont(pid, sig)
    } else {
        ptrace::syscall(pid, sig)
    };
    match res {
        // The tracee can die between the stop and our resume.
        Err(Errno::ESRCH) => Ok(()),
        other => Ok(other?),
    }
}

/// Register snapshot, or None when the tracee has vanished.
pub fn get_regs(pid: Pid) -> Option<Regs> {
    ptrace::getregs(pid).ok()
}

/// Kernel-provided event data: the new child pid at creation stops, the
/// old pid at exec stops.
pub fn event_msg(pid: Pid) -> Result<u64, EngineError> {
    Ok(ptrace::getevent(pid)? as u64)
}

/// Ptrace option set for every tracee in the session.
pub fn default_options(seccomp: bool) -> ptrace::Options {
    let mut opts = ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEVFORKDONE
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_EXITKILL;
    if seccomp {
        opts |= ptrace::Options::PTRACE_O_TRACESECCOMP;
    }
    opts
}

/// Access to a stopped tracee's registers and memory. `None` from any
/// method means the process vanished mid-inspection; the supervisor then
/// terminates its record.
pub trait Tracee {
    fn pid(&self) -> i32;
    fn regs(&mut self) -> Option<Regs>;
    fn set_regs(&mut self, regs: &Regs) -> Option<()>;
    /// NUL-terminated string at `addr`.
    fn read_string(&mut self, addr: u64) -> Option<String>;
    /// NULL-terminated array of string pointers at `addr`.
    fn read_string_array(&mut self, addr: u64) -> Option<Vec<String>>;
    fn peek(&mut self, addr: u64, len: usize) -> Option<Vec<u8>>;
}

/// The real adapter, bound to one stopped pid.
pub struct LiveTracee(pub Pid);

impl LiveTracee {
    fn read_word(&self, addr: u64) -> Option<libc::c_long> {
        ptrace::read(self.0, addr as usize as ptrace::AddressType).ok()
    }
}

impl Tracee for LiveTracee {
    fn pid(&self) -> i32 {
        self.0.as_raw()
    }

    fn regs(&mut self) -> Option<Regs> {
        get_regs(self.0)
    }

    fn set_regs(&mut self, regs: &Regs) -> Option<()> {
        ptrace::setregs(self.0, *regs).ok()
    }

    fn read_string(&mut self, addr: u64) -> Option<String> {
        let mut bytes = Vec::new();
        let mut offset = 0u64;
        loop {
            let word = self.read_word(addr + offset)?;
            for byte in word.to_ne_bytes() {
                if byte == 0 {
                    return Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                bytes.push(byte);
            }
            offset += std::mem::size_of::<libc::c_long>() as u64;
        }
    }

    fn read_string_array(&mut self, addr: u64) -> Option<Vec<String>> {
        let mut out = Vec::new();
        let mut slot = addr;
        loop {
            let ptr = self.read_word(slot)? as u64;
            if ptr == 0 {
                return Some(out);
            }
            out.push(self.read_string(ptr)?);
            slot += std::mem::size_of::<libc::c_long>() as u64;
        }
    }

    fn peek(&mut self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut offset = 0u64;
        while out.len() < len {
            let word = self.read_word(addr + offset)?;
            out.extend_from_slice(&word.to_ne_bytes());
            offset += std::mem::size_of::<libc::c_long>() as u64;
        }
        out.truncate(len);
        Some(out)
    }
}
