//! Command-line front end: flag parsing, record collection and filtering,
//! JSON output, and exit-status mapping.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use structopt::clap::AppSettings;
use structopt::StructOpt;

use deptrace_core::TraceRecord;
use deptrace_engine::kernel::{self, SeccompMode};
use deptrace_engine::proc::ProcState;
use deptrace_engine::spawn::spawn_traced;
use deptrace_engine::supervisor::{EventSink, Supervisor};
use deptrace_engine::tracelog::TraceLog;
use deptrace_engine::{SysState, TraceSettings};

use crate::scripts;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "deptrace",
    about = "Trace a command tree and record which files every command read and wrote.",
    setting = AppSettings::TrailingVarArg
)]
struct Opt {
    /// Record environment variables in each command.
    #[structopt(short = "e", long = "env")]
    env: bool,

    /// Neutralize unlink/unlinkat/rmdir so the traced build cannot delete
    /// files.
    #[structopt(short = "u", long = "undelete")]
    undelete: bool,

    /// Write the diagnostic trace stream to this file.
    #[structopt(short = "t", long = "trace")]
    trace: Option<PathBuf>,

    /// Write the collected dependency records to this file as JSON.
    #[structopt(short = "d", long = "deps")]
    deps: Option<PathBuf>,

    /// Keep only records whose output set is empty or exactly /dev/tty.
    #[structopt(long = "deps-with-output")]
    deps_with_output: bool,

    /// Keep only records of commands whose path or base name matches NAME.
    /// May be given several times.
    #[structopt(long = "deps-of", number_of_values = 1, value_name = "NAME")]
    deps_of: Vec<String>,

    /// Materialize each traced command as a shell script in this directory.
    #[structopt(short = "s", long = "scripts")]
    scripts: Option<PathBuf>,

    /// Remove the scripts directory before writing.
    #[structopt(long = "rm")]
    rm_scripts: bool,

    /// Disable filter-accelerated stops even when the kernel supports
    /// them.
    #[structopt(long = "no-seccomp")]
    no_seccomp: bool,

    /// Kernel release used for capability gating (defaults to uname -r).
    #[structopt(long = "kernel", value_name = "RELEASE")]
    kernel: Option<String>,

    /// Command to trace.
    #[structopt(required = true, value_name = "CMD")]
    cmd: Vec<String>,
}

pub fn run() -> Result<i32> {
    let opt = Opt::from_args();

    let release = opt.kernel.clone().unwrap_or_else(kernel::release);
    let seccomp = SeccompMode::detect(!opt.no_seccomp, &release);
    debug!("kernel {release:?} -> seccomp mode {seccomp:?}");

    let trace_log = match &opt.trace {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create trace file {}", path.display()))?;
            TraceLog::to_writer(Box::new(file))
        }
        None => TraceLog::disabled(),
    };

    if let Some(dir) = &opt.scripts {
        if opt.rm_scripts {
            match std::fs::remove_dir_all(dir) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                    return Err(err)
                        .with_context(|| format!("cannot clean {}", dir.display()));
                }
                _ => {}
            }
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create scripts directory {}", dir.display()))?;
    }

    let settings = TraceSettings {
        record_env: opt.env,
        undelete: opt.undelete,
        seccomp,
    };
    let pid = spawn_traced(&opt.cmd[0], &opt.cmd[1..], settings.seccomp.enabled())
        .with_context(|| format!("cannot launch {:?}", opt.cmd[0]))?;

    let mut collector = Collector::new(&opt);
    let mut supervisor = Supervisor::new(settings, trace_log);
    let rc = supervisor.run(pid, &mut collector).context("trace failed")?;

    if let Some(path) = &opt.deps {
        let file = File::create(path)
            .with_context(|| format!("cannot create deps file {}", path.display()))?;
        serde_json::to_writer_pretty(file, &collector.records)
            .context("cannot encode dependency records")?;
    }

    // Death by signal becomes the conventional 128+signum.
    Ok(if rc < 0 { 128 - rc } else { rc })
}

struct Collector<'a> {
    opt: &'a Opt,
    records: Vec<TraceRecord>,
    cmd_fds: HashMap<u64, BTreeMap<i32, PathBuf>>,
}

impl<'a> Collector<'a> {
    fn new(opt: &'a Opt) -> Self {
        Self {
            opt,
            records: Vec::new(),
            cmd_fds: HashMap::new(),
        }
    }
}

impl EventSink for Collector<'_> {
    fn exec(&mut self, p: &ProcState, sys: &SysState) {
        let Some(cmd) = &p.cur_cmd else { return };
        let cmd = cmd.borrow();
        let fds: BTreeMap<i32, PathBuf> = p
            .fds
            .borrow()
            .iter_open()
            .filter_map(|(fd, ino)| sys.fs.path(ino).map(|path| (fd, path.to_path_buf())))
            .collect();
        self.cmd_fds.insert(cmd.id, fds);
        if let Some(dir) = &self.opt.scripts {
            if let Err(err) = scripts::write_script(dir, &cmd) {
                warn!("cannot write script for command {}: {err}", cmd.id);
            }
        }
    }

    fn exit(&mut self, p: &ProcState, sys: &SysState) {
        let Some(mut record) = p.record(&sys.fs) else {
            return;
        };
        let fds = self.cmd_fds.remove(&record.cmd.id);
        if !admit(&record, self.opt.deps_with_output, &self.opt.deps_of) {
            return;
        }
        record.fds = fds;
        self.records.push(record);
    }
}

/// Record admission: every enabled filter must accept the record.
fn admit(record: &TraceRecord, with_output: bool, of_commands: &[String]) -> bool {
    if with_output {
        let trivial = record.outputs.is_empty()
            || (record.outputs.len() == 1 && record.outputs[0] == Path::new("/dev/tty"));
        if !trivial {
            return false;
        }
    }
    if !of_commands.is_empty() {
        let base = record.cmd.path.file_name().and_then(|b| b.to_str());
        let hit = of_commands
            .iter()
            .any(|name| Path::new(name) == record.cmd.path || base == Some(name.as_str()));
        if !hit {
            return false;
        }
    }
    true
}
