//! Launcher for the initial tracee.
//!
//! The child volunteers for tracing, stops itself so the parent can set
//! ptrace options, then (once resumed) arms the syscall filter and execs
//! the target. Everything the child needs after the fork is prepared
//! before it, so the child does not allocate.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::ptrace::default_options;
use crate::seccomp::FilterProgram;
use crate::syscall::TRACKED_SYSCALLS;
use crate::EngineError;

/// Fork and exec `program` under tracing. Returns the child stopped at its
/// initial SIGSTOP with options applied; the supervisor performs the first
/// resume. Must be called on the thread that will run the supervisor.
pub fn spawn_traced(program: &str, args: &[String], seccomp: bool) -> Result<Pid, EngineError> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(cstring(program)?);
    for arg in args {
        argv.push(cstring(arg)?);
    }
    let filter = seccomp.then(|| FilterProgram::tracing(TRACKED_SYSCALLS));

    match unsafe { fork() }.map_err(|err| EngineError::Spawn(format!("fork: {err}")))? {
        ForkResult::Child => child_main(&argv, filter.as_ref()),
        ForkResult::Parent { child } => {
            match waitpid(child, None) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    return Err(EngineError::Spawn(format!(
                        "tracee exited with status {code} before stopping (is ptrace permitted?)"
                    )))
                }
                Ok(status) => {
                    return Err(EngineError::Spawn(format!(
                        "unexpected tracee state {status:?}"
                    )))
                }
                Err(err) => return Err(EngineError::Spawn(format!("waitpid: {err}"))),
            }
            ptrace::setoptions(child, default_options(seccomp))
                .map_err(|err| EngineError::Spawn(format!("setoptions: {err}")))?;
            Ok(child)
        }
    }
}

fn cstring(s: &str) -> Result<CString, EngineError> {
    CString::new(s).map_err(|_| EngineError::Spawn(format!("argument contains NUL: {s:?}")))
}

fn child_main(argv: &[CString], filter: Option<&FilterProgram>) -> ! {
    if let Err(err) = ptrace::traceme() {
        eprintln!("deptrace: ptrace TRACEME failed: {err}");
        std::process::exit(127);
    }
    let _ = raise(Signal::SIGSTOP);
    if let Some(filter) = filter {
        if let Err(err) = filter.install() {
            eprintln!("deptrace: seccomp filter install failed: {err}");
            std::process::exit(126);
        }
    }
    let err: Errno = execvp(&argv[0], argv).unwrap_err();
    eprintln!("deptrace: exec {:?} failed: {err}", argv[0]);
    std::process::exit(125);
}
