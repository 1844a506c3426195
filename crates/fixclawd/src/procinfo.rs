//! Process liveness and identity helpers.
//!
//! On Linux `/proc/<pid>/stat` gives the process state, its group and its
//! start time (clock ticks since boot). The start time lets us tell a live
//! holder from an unrelated process that reused its pid. Elsewhere we fall
//! back to `kill(pid, 0)` only.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg};
use nix::unistd::Pid;

/// Result of asking the kernel about a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Process exists (possibly owned by another user)
    Alive,
    /// Kernel positively reported no such process
    Gone,
}

/// `kill(pid, 0)`: ESRCH means gone, EPERM means alive but not ours.
/// Any other answer is treated as alive.
pub fn pid_liveness(pid: i32) -> Liveness {
    if pid <= 0 {
        return Liveness::Alive;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Gone,
        Err(_) => Liveness::Alive,
    }
}

/// Fields of `/proc/<pid>/stat` we care about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub pgrp: i32,
    pub start_time: u64,
}

/// Parse a stat line. The command name may contain spaces and parentheses,
/// so fields are counted from the last `)`.
pub fn parse_stat(line: &str) -> Option<ProcStat> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); start time is field 22
    let state = fields.first()?.chars().next()?;
    let pgrp = fields.get(2)?.parse().ok()?;
    let start_time = fields.get(19)?.parse().ok()?;
    Some(ProcStat {
        state,
        pgrp,
        start_time,
    })
}

#[cfg(target_os = "linux")]
pub fn read_stat(pid: i32) -> Option<ProcStat> {
    let line = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&line)
}

#[cfg(not(target_os = "linux"))]
pub fn read_stat(_pid: i32) -> Option<ProcStat> {
    None
}

/// Start time of `pid`, when the platform exposes it
pub fn start_time(pid: i32) -> Option<u64> {
    read_stat(pid).map(|s| s.start_time)
}

/// Whether any non-zombie process is still in group `pgid`
#[cfg(target_os = "linux")]
pub fn group_has_live_members(pgid: i32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return killpg(Pid::from_raw(pgid), None).is_ok();
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .filter_map(read_stat)
        .any(|stat| stat.pgrp == pgid && stat.state != 'Z')
}

#[cfg(not(target_os = "linux"))]
pub fn group_has_live_members(pgid: i32) -> bool {
    killpg(Pid::from_raw(pgid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_odd_comm() {
        let line = "4242 (my (odd) cmd) S 1 4242 4242 0 -1 4194560 100 0 0 0 1 2 0 0 20 0 1 0 987654 1000 10";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.start_time, 987654);
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("12 (sh) S 1").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_own_pid_alive() {
        assert_eq!(pid_liveness(std::process::id() as i32), Liveness::Alive);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_start_time_readable() {
        assert!(start_time(std::process::id() as i32).is_some());
    }
}
