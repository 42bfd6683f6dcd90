//! Syscall interpreter: decodes tracked syscalls at entry and exit stops
//! and folds them into the per-process state and the path registry.
//!
//! Entry work is limited to exec argument capture and the undelete
//! rewrites; everything else happens on successful exit, where the return
//! value is known. A `false` return from either entry point means the
//! tracee vanished mid-inspection and its record should be terminated.

use std::path::{Path, PathBuf};

use deptrace_core::Cmd;
use log::{debug, warn};

use crate::fs::{absolutize, is_pipe_path, FsRegistry};
use crate::proc::ProcState;
use crate::ptrace::Tracee;
use crate::tracelog::TraceLog;
use crate::{SysState, TraceSettings};

/// Syscalls the engine interprets; also the set the seccomp filter traps.
pub const TRACKED_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_execve,
    libc::SYS_execveat,
    libc::SYS_open,
    libc::SYS_openat,
    libc::SYS_close,
    libc::SYS_chdir,
    libc::SYS_fchdir,
    libc::SYS_link,
    libc::SYS_linkat,
    libc::SYS_rename,
    libc::SYS_renameat,
    libc::SYS_renameat2,
    libc::SYS_dup,
    libc::SYS_dup2,
    libc::SYS_dup3,
    libc::SYS_fcntl,
    libc::SYS_read,
    libc::SYS_pread64,
    libc::SYS_readv,
    libc::SYS_preadv,
    libc::SYS_preadv2,
    libc::SYS_write,
    libc::SYS_pwrite64,
    libc::SYS_writev,
    libc::SYS_pwritev,
    libc::SYS_pwritev2,
    libc::SYS_pipe,
    libc::SYS_pipe2,
    libc::SYS_unlink,
    libc::SYS_unlinkat,
    libc::SYS_rmdir,
];

/// Interpret a syscall entry stop.
pub fn sysenter(
    t: &mut impl Tracee,
    p: &mut ProcState,
    sys: &mut SysState,
    cfg: &TraceSettings,
    out: &mut TraceLog,
) -> bool {
    let Some(mut regs) = t.regs() else {
        return false;
    };
    p.syscall = regs.orig_rax as i64;
    match p.syscall {
        libc::SYS_execve => {
            let Some(path) = t.read_string(regs.rdi) else {
                return false;
            };
            let Some(args) = t.read_string_array(regs.rsi) else {
                return false;
            };
            let mut cmd = Cmd::new(p.abs(&path), args, p.cur_dir.clone());
            if cfg.record_env {
                let Some(env) = t.read_string_array(regs.rdx) else {
                    return false;
                };
                cmd.env = Some(env);
            }
            out.line(t.pid(), "execve", format_args!("{:?} {:?}", cmd.path, cmd.args));
            p.next_cmd = Some(cmd);
        }
        libc::SYS_execveat => {
            let Some(path) = t.read_string(regs.rsi) else {
                return false;
            };
            let Some(args) = t.read_string_array(regs.rdx) else {
                return false;
            };
            let abs = abs_at(p, &mut sys.fs, t.pid(), regs.rdi as i32, &path);
            let mut cmd = Cmd::new(abs, args, p.cur_dir.clone());
            if cfg.record_env {
                let Some(env) = t.read_string_array(regs.r10) else {
                    return false;
                };
                cmd.env = Some(env);
            }
            out.line(t.pid(), "execveat", format_args!("{:?} {:?}", cmd.path, cmd.args));
            p.next_cmd = Some(cmd);
        }
        libc::SYS_unlink | libc::SYS_rmdir if cfg.undelete => {
            // Turn the deletion into an existence probe; the kernel never
            // sees the original request.
            regs.orig_rax = libc::SYS_access as u64;
            regs.rsi = libc::F_OK as u64;
            if t.set_regs(&regs).is_none() {
                return false;
            }
        }
        libc::SYS_unlinkat if cfg.undelete => {
            regs.orig_rax = libc::SYS_faccessat as u64;
            regs.r10 = regs.rdx;
            regs.rdx = libc::F_OK as u64;
            if t.set_regs(&regs).is_none() {
                return false;
            }
        }
        _ => {}
    }
    true
}

/// Interpret a syscall exit stop. Failed syscalls record nothing.
pub fn sysexit(
    t: &mut impl Tracee,
    p: &mut ProcState,
    sys: &mut SysState,
    _cfg: &TraceSettings,
    out: &mut TraceLog,
) -> bool {
    let Some(mut regs) = t.regs() else {
        return false;
    };
    let ret = regs.rax as i64;
    if ret < 0 {
        return true;
    }
    let retfd = ret as i32;
    let pid = t.pid();

    // fcntl is a disguise over dup/dup3/cloexec flips; remap and fall
    // through to the plain handlers.
    let mut syscall = p.syscall;
    if syscall == libc::SYS_fcntl {
        match regs.rsi as i32 {
            libc::F_DUPFD => syscall = libc::SYS_dup,
            libc::F_DUPFD_CLOEXEC => {
                syscall = libc::SYS_dup3;
                regs.rdx = libc::O_CLOEXEC as u64;
            }
            libc::F_SETFD => {
                let on = regs.rdx as i64 & libc::FD_CLOEXEC as i64 != 0;
                p.fds.borrow_mut().set_cloexec(regs.rdi as i32, on);
                out.line(pid, "fcntl/setfd", format_args!("{} {}", regs.rdi, on));
            }
            _ => {}
        }
    }

    match syscall {
        libc::SYS_open | libc::SYS_openat => {
            let (tag, at, name, flags) = if syscall == libc::SYS_open {
                ("open", libc::AT_FDCWD, regs.rdi, regs.rsi as i64)
            } else {
                ("openat", regs.rdi as i32, regs.rsi, regs.rdx as i64)
            };
            let path = if flags & libc::O_TMPFILE as i64 == libc::O_TMPFILE as i64 {
                // An unnamable file; the proc entry is its only name.
                PathBuf::from(format!("/proc/{pid}/fd/{retfd}"))
            } else {
                let Some(raw) = t.read_string(name) else {
                    return false;
                };
                abs_at(p, &mut sys.fs, pid, at, &raw)
            };
            let write = flags & (libc::O_WRONLY | libc::O_RDWR) as i64 != 0;
            let ino = sys.fs.inode(&path);
            {
                let mut fds = p.fds.borrow_mut();
                fds.set(retfd, ino);
                if flags & libc::O_CLOEXEC as i64 != 0 {
                    fds.set_cloexec(retfd, true);
                }
            }
            out.line(
                pid,
                tag,
                format_args!("{} {}", if write { "w" } else { "r" }, path.display()),
            );
            let mut io = p.io.borrow_mut();
            if io.write.contains(&ino) {
                // Reads after writes stay writes only.
            } else if probe_dir(&path) {
                // Directories are not I/O.
            } else if write {
                io.add_write(ino);
            } else {
                io.add_read(ino);
            }
        }
        libc::SYS_chdir => {
            let Some(raw) = t.read_string(regs.rdi) else {
                return false;
            };
            p.cur_dir = p.abs(&raw);
            out.line(pid, "chdir", format_args!("{}", p.cur_dir.display()));
        }
        libc::SYS_fchdir => {
            p.cur_dir = fd_path(p, &sys.fs, regs.rdi as i32);
            out.line(pid, "fchdir", format_args!("{}", p.cur_dir.display()));
        }
        libc::SYS_link | libc::SYS_linkat => {
            let (tag, old, new) = if syscall == libc::SYS_link {
                let Some(old) = t.read_string(regs.rdi) else {
                    return false;
                };
                let Some(new) = t.read_string(regs.rsi) else {
                    return false;
                };
                ("link", p.abs(&old), p.abs(&new))
            } else {
                let Some(old) = t.read_string(regs.rsi) else {
                    return false;
                };
                let Some(new) = t.read_string(regs.r10) else {
                    return false;
                };
                (
                    "linkat",
                    abs_at(p, &mut sys.fs, pid, regs.rdi as i32, &old),
                    abs_at(p, &mut sys.fs, pid, regs.rdx as i32, &new),
                )
            };
            let old_ino = sys.fs.inode(&old);
            let new_ino = sys.fs.inode(&new);
            let mut io = p.io.borrow_mut();
            io.add_read(old_ino);
            io.add_write(new_ino);
            out.line(pid, tag, format_args!("{} {}", old.display(), new.display()));
        }
        libc::SYS_rename | libc::SYS_renameat | libc::SYS_renameat2 => {
            let (tag, old, new) = if syscall == libc::SYS_rename {
                let Some(old) = t.read_string(regs.rdi) else {
                    return false;
                };
                let Some(new) = t.read_string(regs.rsi) else {
                    return false;
                };
                ("rename", p.abs(&old), p.abs(&new))
            } else {
                let Some(old) = t.read_string(regs.rsi) else {
                    return false;
                };
                let Some(new) = t.read_string(regs.r10) else {
                    return false;
                };
                (
                    "renameat",
                    abs_at(p, &mut sys.fs, pid, regs.rdi as i32, &old),
                    abs_at(p, &mut sys.fs, pid, regs.rdx as i32, &new),
                )
            };
            sys.fs.rename(&old, &new);
            out.line(pid, tag, format_args!("{} {}", old.display(), new.display()));
        }
        libc::SYS_dup | libc::SYS_dup2 | libc::SYS_dup3 => {
            let src = regs.rdi as i32;
            let mut fds = p.fds.borrow_mut();
            let ino = fds.get(src);
            fds.set(retfd, ino);
            if syscall == libc::SYS_dup3 && regs.rdx as i64 & libc::O_CLOEXEC as i64 != 0 {
                fds.set_cloexec(retfd, true);
            }
            out.line(pid, "dup", format_args!("{src} {retfd} {}", fds.is_cloexec(retfd)));
        }
        libc::SYS_read
        | libc::SYS_pread64
        | libc::SYS_readv
        | libc::SYS_preadv
        | libc::SYS_preadv2 => {
            let ino = p.fds.borrow().get(regs.rdi as i32);
            if ino != 0 {
                p.io.borrow_mut().add_read(ino);
            }
        }
        libc::SYS_write
        | libc::SYS_pwrite64
        | libc::SYS_writev
        | libc::SYS_pwritev
        | libc::SYS_pwritev2 => {
            let ino = p.fds.borrow().get(regs.rdi as i32);
            if ino != 0 {
                p.io.borrow_mut().add_write(ino);
            }
        }
        libc::SYS_close => {
            p.fds.borrow_mut().close(regs.rdi as i32);
            out.line(pid, "close", format_args!("{}", regs.rdi));
        }
        libc::SYS_pipe | libc::SYS_pipe2 => {
            let Some(buf) = t.peek(regs.rdi, 8) else {
                return false;
            };
            let read_fd = i32::from_ne_bytes(buf[0..4].try_into().expect("fd pair"));
            let write_fd = i32::from_ne_bytes(buf[4..8].try_into().expect("fd pair"));
            let ino = sys.fs.pipe();
            let mut fds = p.fds.borrow_mut();
            fds.set(read_fd, ino);
            fds.set(write_fd, ino);
            if syscall == libc::SYS_pipe2 && regs.rsi as i64 & libc::O_CLOEXEC as i64 != 0 {
                fds.set_cloexec(read_fd, true);
                fds.set_cloexec(write_fd, true);
            }
            out.line(
                pid,
                "pipe",
                format_args!("{read_fd} {write_fd} {}", fds.is_cloexec(read_fd)),
            );
        }
        _ => {}
    }
    true
}

/// Resolve a path argument of an `*at` syscall against the tracked
/// descriptor table, with the semantics of the `*at` family, then map
/// process-relative `/dev/fd` and `/proc/self` forms back to real names.
fn abs_at(p: &ProcState, fs: &mut FsRegistry, pid: i32, dirfd: i32, path: &str) -> PathBuf {
    let resolved = if dirfd == libc::AT_FDCWD {
        p.abs(path)
    } else if path.is_empty() {
        // AT_EMPTY_PATH: the descriptor itself names the file.
        fd_path(p, fs, dirfd)
    } else {
        absolutize(&fd_path(p, fs, dirfd), path)
    };
    resolve_proc_self(p, fs, pid, resolved)
}

/// Path of the file a descriptor is bound to, best-effort: an untracked
/// descriptor falls back to the working directory.
fn fd_path(p: &ProcState, fs: &FsRegistry, fd: i32) -> PathBuf {
    match p.fds.borrow().get(fd) {
        0 => {
            debug!("fd {fd} is not tracked; assuming cwd");
            p.cur_dir.clone()
        }
        ino => fs
            .path(ino)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| p.cur_dir.clone()),
    }
}

fn resolve_proc_self(p: &ProcState, fs: &FsRegistry, pid: i32, path: PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    let s = match s.strip_prefix("/dev/fd/") {
        Some(rest) => format!("/proc/self/fd/{rest}"),
        None => s.into_owned(),
    };
    if let Some(rest) = s.strip_prefix("/proc/self/") {
        if let Some(fd) = rest.strip_prefix("fd/").and_then(|n| n.parse::<i32>().ok()) {
            // A self-reference to a descriptor we already track maps to
            // the true inode, not to the proc name.
            let ino = p.fds.borrow().get(fd);
            if ino != 0 {
                if let Some(real) = fs.path(ino) {
                    return real.to_path_buf();
                }
            }
        }
        return PathBuf::from(format!("/proc/{pid}/{rest}"));
    }
    PathBuf::from(s)
}

/// Filesystem probe deciding whether an opened path is a directory. Pipes
/// never are; a failed probe is reported and treated as "not a directory"
/// (a type change between open and probe is accepted).
fn probe_dir(path: &Path) -> bool {
    if is_pipe_path(path) {
        return false;
    }
    match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.is_dir(),
        Err(err) => {
            warn!("cannot stat {}: {err}", path.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptrace::Regs;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeTracee {
        pid: i32,
        regs: Option<Regs>,
        strings: HashMap<u64, String>,
        arrays: HashMap<u64, Vec<String>>,
        data: HashMap<u64, Vec<u8>>,
        written_regs: Option<Regs>,
    }

    impl Tracee for FakeTracee {
        fn pid(&self) -> i32 {
            self.pid
        }

        fn regs(&mut self) -> Option<Regs> {
            self.regs
        }

        fn set_regs(&mut self, regs: &Regs) -> Option<()> {
            self.written_regs = Some(*regs);
            Some(())
        }

        fn read_string(&mut self, addr: u64) -> Option<String> {
            self.strings.get(&addr).cloned()
        }

        fn read_string_array(&mut self, addr: u64) -> Option<Vec<String>> {
            self.arrays.get(&addr).cloned()
        }

        fn peek(&mut self, addr: u64, len: usize) -> Option<Vec<u8>> {
            self.data.get(&addr).filter(|d| d.len() >= len).cloned()
        }
    }

    fn regs_for(syscall: libc::c_long) -> Regs {
        let mut regs: Regs = unsafe { std::mem::zeroed() };
        regs.orig_rax = syscall as u64;
        regs
    }

    fn state() -> ProcState {
        ProcState::new(PathBuf::from("/work"))
    }

    fn settings() -> TraceSettings {
        TraceSettings::default()
    }

    /// Drive one entry/exit pair through the interpreter.
    fn run_exit(
        t: &mut FakeTracee,
        p: &mut ProcState,
        sys: &mut SysState,
        enter_regs: Regs,
        mut exit_regs: Regs,
    ) {
        t.regs = Some(enter_regs);
        assert!(sysenter(t, p, sys, &settings(), &mut TraceLog::disabled()));
        exit_regs.orig_rax = enter_regs.orig_rax;
        t.regs = Some(exit_regs);
        assert!(sysexit(t, p, sys, &settings(), &mut TraceLog::disabled()));
    }

    #[test]
    fn open_for_write_records_an_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.txt");
        std::fs::write(&file, b"x").unwrap();

        let mut t = FakeTracee {
            pid: 100,
            ..Default::default()
        };
        t.strings.insert(0x1000, file.to_str().unwrap().to_string());
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_open);
        enter.rdi = 0x1000;
        enter.rsi = libc::O_WRONLY as u64;
        let mut exit = enter;
        exit.rax = 3;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        let ino = sys.fs.inode(&file);
        assert!(p.io.borrow().write.contains(&ino));
        assert_eq!(p.fds.borrow().get(3), ino);
    }

    #[test]
    fn failed_open_records_nothing() {
        let mut t = FakeTracee::default();
        t.strings.insert(0x1000, "/tmp/nope".to_string());
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_open);
        enter.rdi = 0x1000;
        let mut exit = enter;
        exit.rax = (-libc::ENOENT as i64) as u64;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        assert!(p.io.borrow().read.is_empty());
        assert!(p.io.borrow().write.is_empty());
    }

    #[test]
    fn directories_are_not_recorded_but_their_fd_is_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = FakeTracee::default();
        t.strings
            .insert(0x1000, dir.path().to_str().unwrap().to_string());
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_open);
        enter.rdi = 0x1000;
        let mut exit = enter;
        exit.rax = 5;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        assert!(p.io.borrow().read.is_empty());
        assert_ne!(p.fds.borrow().get(5), 0);
    }

    #[test]
    fn read_after_write_is_not_an_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("b");
        std::fs::write(&file, b"x").unwrap();
        let mut t = FakeTracee::default();
        t.strings.insert(0x1000, file.to_str().unwrap().to_string());
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_open);
        enter.rdi = 0x1000;
        enter.rsi = libc::O_WRONLY as u64;
        let mut exit = enter;
        exit.rax = 3;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        enter.rsi = libc::O_RDONLY as u64;
        exit.rax = 4;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        let ino = sys.fs.inode(&file);
        assert!(p.io.borrow().write.contains(&ino));
        assert!(!p.io.borrow().read.contains(&ino));
    }

    #[test]
    fn tmpfile_open_tracks_the_proc_name() {
        let mut t = FakeTracee {
            pid: 7,
            ..Default::default()
        };
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_open);
        enter.rsi = (libc::O_TMPFILE | libc::O_RDWR) as u64;
        let mut exit = enter;
        exit.rax = 9;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        let ino = sys.fs.inode(Path::new("/proc/7/fd/9"));
        assert!(p.io.borrow().write.contains(&ino));
    }

    #[test]
    fn pipe_endpoints_share_one_inode() {
        let mut t = FakeTracee::default();
        let mut fds = Vec::new();
        fds.extend_from_slice(&3i32.to_ne_bytes());
        fds.extend_from_slice(&4i32.to_ne_bytes());
        t.data.insert(0x2000, fds);
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_pipe2);
        enter.rdi = 0x2000;
        enter.rsi = libc::O_CLOEXEC as u64;
        let mut exit = enter;
        exit.rax = 0;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        let fds = p.fds.borrow();
        assert_ne!(fds.get(3), 0);
        assert_eq!(fds.get(3), fds.get(4));
        assert!(fds.is_cloexec(3) && fds.is_cloexec(4));
        assert!(is_pipe_path(sys.fs.path(fds.get(3)).unwrap()));
    }

    #[test]
    fn reads_and_writes_through_descriptors_accumulate() {
        let mut t = FakeTracee::default();
        let mut p = state();
        let mut sys = SysState::new();
        let ino = sys.fs.inode(Path::new("/tmp/data"));
        p.fds.borrow_mut().set(3, ino);

        let mut enter = regs_for(libc::SYS_read);
        enter.rdi = 3;
        let mut exit = enter;
        exit.rax = 128;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);
        assert!(p.io.borrow().read.contains(&ino));

        let mut enter = regs_for(libc::SYS_write);
        enter.rdi = 3;
        let mut exit = enter;
        exit.rax = 128;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);
        assert!(p.io.borrow().write.contains(&ino));
    }

    #[test]
    fn dup_copies_the_binding_and_close_clears_it() {
        let mut t = FakeTracee::default();
        let mut p = state();
        let mut sys = SysState::new();
        let ino = sys.fs.inode(Path::new("/tmp/dup-me"));
        p.fds.borrow_mut().set(3, ino);

        let mut enter = regs_for(libc::SYS_dup);
        enter.rdi = 3;
        let mut exit = enter;
        exit.rax = 7;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);
        assert_eq!(p.fds.borrow().get(7), ino);

        let mut enter = regs_for(libc::SYS_close);
        enter.rdi = 7;
        let mut exit = enter;
        exit.rax = 0;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);
        assert_eq!(p.fds.borrow().get(7), 0);
    }

    #[test]
    fn fcntl_dupfd_cloexec_behaves_like_dup3() {
        let mut t = FakeTracee::default();
        let mut p = state();
        let mut sys = SysState::new();
        let ino = sys.fs.inode(Path::new("/tmp/f"));
        p.fds.borrow_mut().set(3, ino);

        let mut enter = regs_for(libc::SYS_fcntl);
        enter.rdi = 3;
        enter.rsi = libc::F_DUPFD_CLOEXEC as u64;
        let mut exit = enter;
        exit.rax = 8;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        let fds = p.fds.borrow();
        assert_eq!(fds.get(8), ino);
        assert!(fds.is_cloexec(8));
    }

    #[test]
    fn fcntl_setfd_flips_the_cloexec_bit() {
        let mut t = FakeTracee::default();
        let mut p = state();
        let mut sys = SysState::new();
        p.fds.borrow_mut().set(3, 1);

        let mut enter = regs_for(libc::SYS_fcntl);
        enter.rdi = 3;
        enter.rsi = libc::F_SETFD as u64;
        enter.rdx = libc::FD_CLOEXEC as u64;
        let mut exit = enter;
        exit.rax = 0;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);
        assert!(p.fds.borrow().is_cloexec(3));
    }

    #[test]
    fn rename_moves_the_registry_binding() {
        let mut t = FakeTracee::default();
        t.strings.insert(0x1000, "old".to_string());
        t.strings.insert(0x2000, "new".to_string());
        let mut p = state();
        let mut sys = SysState::new();
        let ino = sys.fs.inode(Path::new("/work/old"));

        let mut enter = regs_for(libc::SYS_rename);
        enter.rdi = 0x1000;
        enter.rsi = 0x2000;
        let mut exit = enter;
        exit.rax = 0;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        assert_eq!(sys.fs.path(ino), Some(Path::new("/work/new")));
    }

    #[test]
    fn link_reads_the_source_and_writes_the_destination() {
        let mut t = FakeTracee::default();
        t.strings.insert(0x1000, "src".to_string());
        t.strings.insert(0x2000, "dst".to_string());
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_link);
        enter.rdi = 0x1000;
        enter.rsi = 0x2000;
        let mut exit = enter;
        exit.rax = 0;
        run_exit(&mut t, &mut p, &mut sys, enter, exit);

        let src = sys.fs.inode(Path::new("/work/src"));
        let dst = sys.fs.inode(Path::new("/work/dst"));
        assert!(p.io.borrow().read.contains(&src));
        assert!(p.io.borrow().write.contains(&dst));
    }

    #[test]
    fn execve_entry_captures_the_next_command() {
        let mut t = FakeTracee::default();
        t.strings.insert(0x1000, "tools/cc".to_string());
        t.arrays
            .insert(0x2000, vec!["cc".to_string(), "-c".to_string()]);
        let mut p = state();
        let mut sys = SysState::new();

        let mut enter = regs_for(libc::SYS_execve);
        enter.rdi = 0x1000;
        enter.rsi = 0x2000;
        t.regs = Some(enter);
        assert!(sysenter(&mut t, &mut p, &mut sys, &settings(), &mut TraceLog::disabled()));

        let cmd = p.next_cmd.as_ref().unwrap();
        assert_eq!(cmd.path, Path::new("/work/tools/cc"));
        assert_eq!(cmd.args, vec!["cc".to_string(), "-c".to_string()]);
        assert_eq!(cmd.dir, Path::new("/work"));
        assert!(cmd.env.is_none());
    }

    #[test]
    fn undelete_rewrites_unlink_to_an_access_probe() {
        let mut t = FakeTracee::default();
        let mut p = state();
        let mut sys = SysState::new();
        let cfg = TraceSettings {
            undelete: true,
            ..TraceSettings::default()
        };

        let mut enter = regs_for(libc::SYS_unlink);
        enter.rdi = 0x1000;
        t.regs = Some(enter);
        assert!(sysenter(&mut t, &mut p, &mut sys, &cfg, &mut TraceLog::disabled()));

        let written = t.written_regs.expect("registers rewritten");
        assert_eq!(written.orig_rax, libc::SYS_access as u64);
        assert_eq!(written.rsi, libc::F_OK as u64);
        // The original syscall is what the exit matcher sees.
        assert_eq!(p.syscall, libc::SYS_unlink);
    }

    #[test]
    fn undelete_rewrites_unlinkat_and_shifts_flags() {
        let mut t = FakeTracee::default();
        let mut p = state();
        let mut sys = SysState::new();
        let cfg = TraceSettings {
            undelete: true,
            ..TraceSettings::default()
        };

        let mut enter = regs_for(libc::SYS_unlinkat);
        enter.rdx = libc::AT_REMOVEDIR as u64;
        t.regs = Some(enter);
        assert!(sysenter(&mut t, &mut p, &mut sys, &cfg, &mut TraceLog::disabled()));

        let written = t.written_regs.expect("registers rewritten");
        assert_eq!(written.orig_rax, libc::SYS_faccessat as u64);
        assert_eq!(written.r10, libc::AT_REMOVEDIR as u64);
        assert_eq!(written.rdx, libc::F_OK as u64);
    }

    #[test]
    fn vanished_tracee_is_reported() {
        let mut t = FakeTracee::default();
        t.regs = None;
        let mut p = state();
        let mut sys = SysState::new();
        assert!(!sysenter(&mut t, &mut p, &mut sys, &settings(), &mut TraceLog::disabled()));
        assert!(!sysexit(&mut t, &mut p, &mut sys, &settings(), &mut TraceLog::disabled()));
    }

    #[test]
    fn abs_at_follows_the_at_family_semantics() {
        let mut p = state();
        let mut fs = FsRegistry::new();
        let dir_ino = fs.inode(Path::new("/data/include"));
        p.fds.borrow_mut().set(5, dir_ino);

        assert_eq!(
            abs_at(&p, &mut fs, 1, libc::AT_FDCWD, "x.h"),
            Path::new("/work/x.h")
        );
        assert_eq!(abs_at(&p, &mut fs, 1, 5, ""), Path::new("/data/include"));
        assert_eq!(
            abs_at(&p, &mut fs, 1, 5, "sys/types.h"),
            Path::new("/data/include/sys/types.h")
        );
    }

    #[test]
    fn dev_fd_references_map_to_tracked_inodes() {
        let mut p = state();
        let mut fs = FsRegistry::new();
        let ino = fs.inode(Path::new("/tmp/real-file"));
        p.fds.borrow_mut().set(6, ino);

        assert_eq!(
            abs_at(&p, &mut fs, 33, libc::AT_FDCWD, "/dev/fd/6"),
            Path::new("/tmp/real-file")
        );
        // Untracked descriptor: rewrite self to the pid.
        assert_eq!(
            abs_at(&p, &mut fs, 33, libc::AT_FDCWD, "/proc/self/fd/11"),
            Path::new("/proc/33/fd/11")
        );
        assert_eq!(
            abs_at(&p, &mut fs, 33, libc::AT_FDCWD, "/proc/self/status"),
            Path::new("/proc/33/status")
        );
    }
}
