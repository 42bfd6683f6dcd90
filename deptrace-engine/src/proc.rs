//! Per-process virtual state and command-identity allocation.
//!
//! Everything here lives on the supervisor thread; shared pieces (fd tables
//! of `CLONE_FILES` siblings, the current command, I/O sets) use
//! `Rc<RefCell<_>>` and the `Rc` strong count doubles as the I/O-set
//! refcount that gates record emission.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use deptrace_core::{Cmd, Inode, TraceRecord};

use crate::fs::{absolutize, FsRegistry};

/// Read/write inode sets accumulated for one command.
#[derive(Debug, Default)]
pub struct IoSet {
    pub read: HashSet<Inode>,
    pub write: HashSet<Inode>,
}

impl IoSet {
    /// Record a read unless the inode was already written; a file the
    /// command produced itself is not one of its inputs.
    pub fn add_read(&mut self, ino: Inode) {
        if !self.write.contains(&ino) {
            self.read.insert(ino);
        }
    }

    /// Record a write. Once written, an inode never moves back to the
    /// read set.
    pub fn add_write(&mut self, ino: Inode) {
        self.write.insert(ino);
    }
}

/// Per-fd inode table with close-on-exec bits. Closed descriptors are kept
/// with inode 0 so a stale number never aliases a new file.
#[derive(Debug, Default, Clone)]
pub struct FdTable {
    fds: HashMap<i32, Inode>,
    cloexec: HashSet<i32>,
}

impl FdTable {
    pub fn get(&self, fd: i32) -> Inode {
        self.fds.get(&fd).copied().unwrap_or(0)
    }

    pub fn set(&mut self, fd: i32, ino: Inode) {
        self.fds.insert(fd, ino);
    }

    pub fn set_cloexec(&mut self, fd: i32, on: bool) {
        if on {
            self.cloexec.insert(fd);
        } else {
            self.cloexec.remove(&fd);
        }
    }

    pub fn is_cloexec(&self, fd: i32) -> bool {
        self.cloexec.contains(&fd)
    }

    pub fn close(&mut self, fd: i32) {
        self.fds.insert(fd, 0);
        self.cloexec.remove(&fd);
    }

    /// Close every descriptor marked close-on-exec; called when the image
    /// is replaced.
    pub fn drop_cloexec(&mut self) {
        for fd in std::mem::take(&mut self.cloexec) {
            self.fds.insert(fd, 0);
        }
    }

    /// Descriptors currently bound to a tracked inode.
    pub fn iter_open(&self) -> impl Iterator<Item = (i32, Inode)> + '_ {
        self.fds
            .iter()
            .filter(|(_, &ino)| ino != 0)
            .map(|(&fd, &ino)| (fd, ino))
    }
}

pub type SharedIo = Rc<RefCell<IoSet>>;
pub type SharedFds = Rc<RefCell<FdTable>>;
pub type SharedCmd = Rc<RefCell<Cmd>>;

/// Virtual state of one traced process.
#[derive(Debug)]
pub struct ProcState {
    pub cur_dir: PathBuf,
    pub fds: SharedFds,
    pub io: SharedIo,
    /// Syscall number remembered at entry for matching on exit.
    pub syscall: i64,
    /// Entry/exit toggle: true immediately before the syscall executes.
    pub sys_enter: bool,
    /// Command captured at exec entry, promoted on exec success.
    pub next_cmd: Option<Cmd>,
    pub cur_cmd: Option<SharedCmd>,
}

impl ProcState {
    pub fn new(cur_dir: PathBuf) -> Self {
        Self {
            cur_dir,
            fds: Rc::new(RefCell::new(FdTable::default())),
            io: Rc::new(RefCell::new(IoSet::default())),
            syscall: 0,
            sys_enter: false,
            next_cmd: None,
            cur_cmd: None,
        }
    }

    /// Normalize a tracee-supplied path against the working directory.
    pub fn abs(&self, path: &str) -> PathBuf {
        absolutize(&self.cur_dir, path)
    }

    /// Child state for a fork or clone. With `share_fds` the descriptor
    /// table and I/O sets stay shared (kernel semantics of `CLONE_FILES`);
    /// otherwise the table is copied and the child starts with empty I/O.
    /// The child reports the parent's command until it execs, and its next
    /// observed stop is its own exit from the clone syscall.
    pub fn fork(&self, share_fds: bool) -> ProcState {
        ProcState {
            cur_dir: self.cur_dir.clone(),
            fds: if share_fds {
                Rc::clone(&self.fds)
            } else {
                Rc::new(RefCell::new(self.fds.borrow().clone()))
            },
            io: if share_fds {
                Rc::clone(&self.io)
            } else {
                Rc::new(RefCell::new(IoSet::default()))
            },
            syscall: self.syscall,
            sys_enter: true,
            next_cmd: None,
            cur_cmd: self.cur_cmd.clone(),
        }
    }

    /// True when this state is the last live owner of its I/O sets. Only
    /// the exclusive owner emits a record on termination.
    pub fn io_exclusive(&self) -> bool {
        Rc::strong_count(&self.io) == 1
    }

    /// Drop this state's claim on the current I/O sets and start fresh
    /// ones. Called after a record is emitted.
    pub fn reset_io(&mut self) {
        self.io = Rc::new(RefCell::new(IoSet::default()));
    }

    /// Produce the record for the current command. Inodes resolve through
    /// the registry now, so renames that happened after the I/O are
    /// reflected. Returns None before the first successful exec.
    pub fn record(&self, fs: &FsRegistry) -> Option<TraceRecord> {
        let cmd = self.cur_cmd.as_ref()?.borrow().clone();
        let io = self.io.borrow();
        let resolve = |inos: &mut dyn Iterator<Item = Inode>| -> Vec<PathBuf> {
            let mut paths: Vec<PathBuf> = inos
                .filter_map(|ino| fs.path(ino).map(Path::to_path_buf))
                .collect();
            paths.sort();
            paths
        };
        let inputs = resolve(&mut io.read.iter().copied().filter(|i| !io.write.contains(i)));
        let outputs = resolve(&mut io.write.iter().copied());
        Some(TraceRecord {
            cmd,
            inputs,
            outputs,
            fds: None,
        })
    }
}

/// Allocates command and exec identifiers for the session.
#[derive(Debug, Default)]
pub struct ProcRegistry {
    next_cmd: u64,
    next_exec: u64,
}

impl ProcRegistry {
    pub fn next_cmd_id(&mut self) -> u64 {
        self.next_cmd += 1;
        self.next_cmd
    }

    /// Distinguishes successive images inside one OS process.
    pub fn next_exec_id(&mut self) -> u64 {
        self.next_exec += 1;
        self.next_exec
    }

    /// Promote the command captured at exec entry to the current command
    /// under a fresh id. Close-on-exec descriptors do not survive the
    /// image replacement.
    pub fn exec(&mut self, p: &mut ProcState) {
        let mut cmd = p.next_cmd.take().unwrap_or_default();
        cmd.id = self.next_cmd_id();
        p.cur_cmd = Some(Rc::new(RefCell::new(cmd)));
        p.fds.borrow_mut().drop_cloexec();
    }
}
