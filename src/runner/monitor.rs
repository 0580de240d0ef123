//! Resident-set sampling for the manager's resource governance.
//!
//! Reads `/proc/<pid>/statm`, so samples are point-in-time and only as
//! fresh as the manager's sampling interval.

use std::fs;

/// Resident set size of an arbitrary process, in bytes. `None` when the
/// process is gone or `/proc` is unreadable.
pub fn rss_bytes(pid: u32) -> Option<u64> {
    let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size())
}

/// Resident set size of the calling process, in bytes.
pub fn self_rss_bytes() -> u64 {
    rss_bytes(std::process::id()).unwrap_or(0)
}

fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}
