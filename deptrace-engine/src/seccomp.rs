//! Classic-BPF seccomp filter for filter-accelerated syscall stops.
//!
//! The program traps the tracked syscalls to the tracer
//! (`SECCOMP_RET_TRACE`) and lets everything else run without a stop,
//! which is what makes tracing on 3.5+ kernels cheap: only interesting
//! syscalls pay the two context switches.

use std::mem::offset_of;

use nix::errno::Errno;

// Classic BPF opcode pieces (linux/bpf_common.h).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// A built seccomp program, ready to install on the tracee.
#[derive(Debug, Clone)]
pub struct FilterProgram {
    filters: Vec<libc::sock_filter>,
}

impl FilterProgram {
    /// Trap each of `syscalls` to the tracer; allow everything else.
    /// Foreign-architecture syscalls are allowed untraced rather than
    /// killed, so 32-bit helpers a build may spawn keep working.
    pub fn tracing(syscalls: &[libc::c_long]) -> FilterProgram {
        let mut filters = vec![
            stmt(BPF_LD | BPF_W | BPF_ABS, offset_of!(libc::seccomp_data, arch) as u32),
            jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
            stmt(BPF_LD | BPF_W | BPF_ABS, offset_of!(libc::seccomp_data, nr) as u32),
        ];
        for &nr in syscalls {
            filters.push(jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, 0, 1));
            filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE | SECCOMP_RET_DATA));
        }
        filters.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        FilterProgram { filters }
    }

    /// Install on the calling thread. Requires (and sets) no-new-privs.
    /// Called in the forked tracee after its self-stop; allocation-free.
    pub fn install(&self) -> Result<(), Errno> {
        let prog = libc::sock_fprog {
            len: self.filters.len() as u16,
            filter: self.filters.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: plain prctls on the calling thread; `prog` outlives both
        // calls and the kernel copies the program on install.
        unsafe {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1u64, 0u64, 0u64, 0u64) != 0 {
                return Err(Errno::last());
            }
            if libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER as libc::c_ulong,
                &prog as *const libc::sock_fprog,
            ) != 0
            {
                return Err(Errno::last());
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
