//! Materializes each traced command as a runnable shell script, named by
//! its command id.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use deptrace_core::Cmd;

pub fn write_script(dir: &Path, cmd: &Cmd) -> io::Result<()> {
    let path = dir.join(cmd.id.to_string());
    let mut body = String::from("#!/bin/sh\n");
    body.push_str(&format!("cd {}\n", quote(&cmd.dir.to_string_lossy())));
    if let Some(env) = &cmd.env {
        for pair in env {
            if let Some((key, value)) = pair.split_once('=') {
                body.push_str(&format!("export {key}={}\n", quote(value)));
            }
        }
    }
    body.push_str("exec ");
    body.push_str(&quote(&cmd.path.to_string_lossy()));
    for arg in cmd.args.iter().skip(1) {
        body.push(' ');
        body.push_str(&quote(arg));
    }
    body.push('\n');
    fs::write(&path, body)?;

    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms)
}

/// POSIX single-quote escaping; safe for any byte sequence a path or
/// argument can carry.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_wraps_and_escapes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("a b;c"), "'a b;c'");
    }

    #[test]
    fn script_replays_directory_env_and_argv() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = Cmd::new(
            "/usr/bin/cc",
            vec!["cc".into(), "-c".into(), "main's.c".into()],
            "/work/src",
        );
        cmd.id = 3;
        cmd.env = Some(vec!["LANG=C".into(), "malformed".into()]);
        write_script(dir.path(), &cmd).unwrap();

        let script = dir.path().join("3");
        let body = fs::read_to_string(&script).unwrap();
        assert!(body.starts_with("#!/bin/sh\n"));
        assert!(body.contains("cd '/work/src'\n"));
        assert!(body.contains("export LANG='C'\n"));
        assert!(!body.contains("malformed"));
        assert!(body.ends_with("exec '/usr/bin/cc' '-c' 'main'\\''s.c'\n"));

        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
