//! Line-oriented diagnostic stream: `<pid> <tag> [args...]`.
//!
//! Consumers may rely on monotonic per-pid ordering only, not on the exact
//! format. Write failures are not surfaced; the stream is diagnostic.

use std::fmt;
use std::io::Write;

pub struct TraceLog {
    out: Option<Box<dyn Write>>,
}

impl TraceLog {
    pub fn disabled() -> TraceLog {
        TraceLog { out: None }
    }

    pub fn to_writer(out: Box<dyn Write>) -> TraceLog {
        TraceLog { out: Some(out) }
    }

    pub fn tag(&mut self, pid: i32, tag: &str) {
        if let Some(out) = &mut self.out {
            let _ = writeln!(out, "{pid} {tag}");
        }
    }

    pub fn line(&mut self, pid: i32, tag: &str, args: fmt::Arguments<'_>) {
        if let Some(out) = &mut self.out {
            let _ = writeln!(out, "{pid} {tag} {args}");
        }
    }
}

impl fmt::Debug for TraceLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLog")
            .field("enabled", &self.out.is_some())
            .finish()
    }
}
