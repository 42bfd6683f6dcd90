//! The event loop: demultiplexes trace stops, maintains the set of live,
//! suspended and terminated pids, replays out-of-order child stops, and
//! emits completed execution records.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use nix::unistd::Pid;

use crate::kernel::SeccompMode;
use crate::proc::{ProcState, SharedCmd};
use crate::ptrace::{self, LiveTracee, Stop, TraceEvent};
use crate::syscall::{sysenter, sysexit};
use crate::tracelog::TraceLog;
use crate::{EngineError, SysState, TraceSettings};

/// Receives lifecycle notifications for traced commands.
pub trait EventSink {
    /// A process successfully replaced its image; `p.cur_cmd` is the new
    /// command and the fd table reflects close-on-exec.
    fn exec(&mut self, p: &ProcState, sys: &SysState);
    /// A command's I/O sets are final; called once per emitted record.
    fn exit(&mut self, p: &ProcState, sys: &SysState);
}

pub struct Supervisor {
    pub sys: SysState,
    settings: TraceSettings,
    log: TraceLog,
}

impl Supervisor {
    pub fn new(settings: TraceSettings, log: TraceLog) -> Supervisor {
        Supervisor {
            sys: SysState::new(),
            settings,
            log,
        }
    }

    /// Drive the trace until every tracked process has terminated. Returns
    /// the main tracee's exit status, negative for death by signal. Must
    /// run on the thread that spawned the tracee.
    pub fn run(&mut self, main: Pid, sink: &mut dyn EventSink) -> Result<i32, EngineError> {
        let seccomp = self.settings.seccomp.enabled();
        let mut pstates: HashMap<i32, ProcState> = HashMap::new();
        let mut suspended: HashMap<i32, Stop> = HashMap::new();
        let mut terminated: HashSet<i32> = HashSet::new();
        let mut running: HashSet<i32> = HashSet::new();
        let mut pidcmds: HashMap<i32, SharedCmd> = HashMap::new();

        let mut state = ProcState::new(std::env::current_dir()?);
        {
            let mut fds = state.fds.borrow_mut();
            fds.set(0, self.sys.fs.inode(Path::new("/dev/stdin")));
            fds.set(1, self.sys.fs.inode(Path::new("/dev/stdout")));
            fds.set(2, self.sys.fs.inode(Path::new("/dev/stderr")));
        }
        let mut main_pid = main.as_raw();
        let mut main_rc = 0;
        pstates.insert(main_pid, state);
        running.insert(main_pid);

        ptrace::resume(main, false, seccomp)?;

        loop {
            let (pid, stop) = match ptrace::wait_for_event(seccomp)? {
                TraceEvent::Exited { pid, status } => {
                    let pid = pid.as_raw();
                    if let Some(cmd) = pidcmds.get(&pid) {
                        cmd.borrow_mut().exit = status;
                    }
                    self.finish(pid, &mut pstates, &mut terminated, &mut running, sink);
                    pidcmds.remove(&pid);
                    if pid == main_pid {
                        // Preserve the main status; the loop continues
                        // until the whole tree drains.
                        main_pid = 0;
                        main_rc = status;
                    }
                    if running.is_empty() {
                        return Ok(main_rc);
                    }
                    continue;
                }
                TraceEvent::Stopped { pid, stop } => (pid.as_raw(), stop),
            };

            if !pstates.contains_key(&pid) {
                // Stop observed before the creation event that announces
                // this pid; hold it until the parent catches up.
                suspended.insert(pid, stop);
                self.log.tag(pid, "_suspend");
                continue;
            }

            let mut pid = pid;
            let mut stop = stop;
            loop {
                match stop {
                    Stop::Fork | Stop::Vfork | Stop::VforkDone | Stop::Clone => {
                        let newpid = ptrace::event_msg(Pid::from_raw(pid))? as i32;
                        let share_fds = stop == Stop::Clone
                            && matches!(
                                ptrace::get_regs(Pid::from_raw(pid)),
                                Some(regs) if regs.rdi as i64 & libc::CLONE_FILES as i64 != 0
                            );
                        let child = pstates[&pid].fork(share_fds);
                        pstates.insert(newpid, child);
                        running.insert(newpid);
                        terminated.remove(&newpid);
                        self.log.line(pid, stop.tag(), format_args!("{newpid}"));
                        if let Some(saved) = suspended.remove(&newpid) {
                            // The child stopped before we learned of it;
                            // resume the parent and replay the child's
                            // saved stop against its fresh state.
                            let enter = pstates[&pid].sys_enter;
                            ptrace::resume(Pid::from_raw(pid), enter, seccomp)?;
                            self.log.tag(newpid, "_resume");
                            pid = newpid;
                            stop = saved;
                            continue;
                        }
                        let enter = pstates[&pid].sys_enter;
                        ptrace::resume(Pid::from_raw(pid), enter, seccomp)?;
                        break;
                    }
                    Stop::Exec => {
                        if let Some(cmd) = pidcmds.get(&pid) {
                            cmd.borrow_mut().exec = self.sys.procs.next_exec_id();
                        }
                        self.finish(pid, &mut pstates, &mut terminated, &mut running, sink);
                        let oldpid = ptrace::event_msg(Pid::from_raw(pid))? as i32;
                        if oldpid != pid && !pstates[&pid].io_exclusive() {
                            return Err(EngineError::Protocol(format!(
                                "state lost across exec: {oldpid} -> {pid}"
                            )));
                        }
                        if oldpid != pid {
                            // A non-leader thread exec'd and adopted the
                            // leader pid; its state migrates over.
                            self.finish(oldpid, &mut pstates, &mut terminated, &mut running, sink);
                        }
                        let mut state = pstates.remove(&oldpid).ok_or_else(|| {
                            EngineError::Protocol(format!("exec event for unknown pid {oldpid}"))
                        })?;
                        terminated.remove(&pid);
                        self.sys.procs.exec(&mut state);
                        let cmd = state.cur_cmd.clone().expect("exec installs a command");
                        pidcmds.insert(pid, cmd);
                        sink.exec(&state, &self.sys);
                        state.sys_enter = true;
                        self.log.line(oldpid, "_exec", format_args!("{pid}"));
                        pstates.insert(pid, state);
                        running.insert(pid);
                        ptrace::resume(Pid::from_raw(pid), true, seccomp)?;
                        break;
                    }
                    Stop::Filter => {
                        if pstates[&pid].sys_enter {
                            return Err(EngineError::Protocol(format!(
                                "filter stop during a syscall on pid {pid}"
                            )));
                        }
                        if self.settings.seccomp == SeccompMode::Precedes {
                            // Old delivery order: the ordinary entry stop
                            // still follows and drives the state machine.
                            ptrace::resume(Pid::from_raw(pid), true, seccomp)?;
                            break;
                        }
                        stop = Stop::Syscall;
                        continue;
                    }
                    Stop::Syscall => {
                        let p = pstates.get_mut(&pid).expect("dispatch requires state");
                        p.sys_enter = !p.sys_enter;
                        let mut tracee = LiveTracee(Pid::from_raw(pid));
                        let ok = if p.sys_enter {
                            sysenter(&mut tracee, p, &mut self.sys, &self.settings, &mut self.log)
                        } else {
                            sysexit(&mut tracee, p, &mut self.sys, &self.settings, &mut self.log)
                        };
                        if !ok {
                            self.finish(pid, &mut pstates, &mut terminated, &mut running, sink);
                            self.log.tag(pid, "_vanish");
                            break;
                        }
                        let enter = pstates[&pid].sys_enter;
                        ptrace::resume(Pid::from_raw(pid), enter, seccomp)?;
                        break;
                    }
                }
            }
        }
    }

    /// Terminate a pid's current image: emit its record when this state is
    /// the exclusive I/O owner, then drop its claim. Idempotent per image;
    /// the exec handler re-arms a pid that lives on under a new image.
    fn finish(
        &mut self,
        pid: i32,
        pstates: &mut HashMap<i32, ProcState>,
        terminated: &mut HashSet<i32>,
        running: &mut HashSet<i32>,
        sink: &mut dyn EventSink,
    ) {
        if !terminated.insert(pid) {
            return;
        }
        running.remove(&pid);
        if let Some(p) = pstates.get(&pid) {
            if p.io_exclusive() {
                if let Some(cmd) = &p.cur_cmd {
                    sink.exit(p, &self.sys);
                    let cmd = cmd.borrow();
                    self.log.line(
                        pid,
                        "record",
                        format_args!("{} {:?}", cmd.id, cmd.path),
                    );
                }
            }
        }
        if let Some(p) = pstates.get_mut(&pid) {
            p.reset_io();
        }
    }
}
