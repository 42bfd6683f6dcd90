//! Kernel capability gating.
//!
//! Filter-accelerated syscall stops exist since 3.5; 4.8 changed their
//! delivery so the filter stop replaces the ordinary entry stop instead of
//! preceding it. Release strings compare with numeric runs ordered
//! numerically, so "3.10" sorts after "3.5".

use std::cmp::Ordering;

use nix::sys::utsname::uname;

/// Kernel release of the running host, e.g. `6.1.0-13-amd64`. Empty when
/// uname is unavailable, which disables filter stops.
pub fn release() -> String {
    uname()
        .map(|u| u.release().to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// How the kernel delivers filter-accelerated stops for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompMode {
    /// Every syscall is driven by ordinary entry/exit stops.
    Off,
    /// 3.5 ≤ kernel < 4.8: the filter stop precedes the ordinary entry
    /// stop, which still arrives and drives the state machine.
    Precedes,
    /// Kernel ≥ 4.8: the filter stop replaces the entry stop.
    Replaces,
}

impl SeccompMode {
    pub fn detect(wanted: bool, release: &str) -> SeccompMode {
        if !wanted || compare_release(release, "3.5") == Ordering::Less {
            SeccompMode::Off
        } else if compare_release(release, "4.8") == Ordering::Less {
            SeccompMode::Precedes
        } else {
            SeccompMode::Replaces
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, SeccompMode::Off)
    }
}

/// Compare two release strings, treating maximal digit runs as numbers and
/// everything else lexically.
pub fn compare_release(a: &str, b: &str) -> Ordering {
    let mut xs = chunks(a).into_iter();
    let mut ys = chunks(b).into_iter();
    loop {
        match (xs.next(), ys.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => {}
                other => return other,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk<'a> {
    Num(u64),
    Text(&'a str),
}

fn chunks(s: &str) -> Vec<Chunk<'_>> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let digits = bytes[i].is_ascii_digit();
        while i < bytes.len() && bytes[i].is_ascii_digit() == digits {
            i += 1;
        }
        let run = &s[start..i];
        if digits {
            out.push(run.parse().map(Chunk::Num).unwrap_or(Chunk::Text(run)));
        } else {
            out.push(Chunk::Text(run));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_runs_compare_numerically() {
        assert_eq!(compare_release("3.10", "3.5"), Ordering::Greater);
        assert_eq!(compare_release("3.4.113", "3.5"), Ordering::Less);
        assert_eq!(compare_release("4.8", "4.8"), Ordering::Equal);
        assert_eq!(compare_release("6.1.0-13-amd64", "4.8"), Ordering::Greater);
        assert_eq!(compare_release("4.8.0-rc1", "4.8"), Ordering::Greater);
    }

    #[test]
    fn mode_detection_follows_the_kernel_thresholds() {
        assert_eq!(SeccompMode::detect(true, "3.4"), SeccompMode::Off);
        assert_eq!(SeccompMode::detect(true, "3.5"), SeccompMode::Precedes);
        assert_eq!(SeccompMode::detect(true, "4.7.10"), SeccompMode::Precedes);
        assert_eq!(SeccompMode::detect(true, "4.8"), SeccompMode::Replaces);
        assert_eq!(SeccompMode::detect(true, "6.1.0-13-amd64"), SeccompMode::Replaces);
        assert_eq!(SeccompMode::detect(false, "6.1"), SeccompMode::Off);
        assert_eq!(SeccompMode::detect(true, ""), SeccompMode::Off);
    }

    #[test]
    fn host_release_is_nonempty() {
        assert!(!release().is_empty());
    }
}
