//! Reads process state out of /proc into the fixed-size wire records.

use std::fs;
use std::io;

use log::trace;
use vmscope_protocol::{
    ProcessEntry, SectionEntry, PERM_EXEC, PERM_PRIVATE, PERM_READ, PERM_SHARED, PERM_WRITE,
};

/// Numeric directory names under /proc are live PIDs.
pub fn scan_pids() -> Vec<u32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<u32>().ok())
        .collect();
    pids.sort_unstable();
    pids
}

/// Full process record for one PID. Errors mean the process vanished
/// mid-read; callers skip it.
pub fn read_process_entry(pid: u32) -> io::Result<ProcessEntry> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let mut entry = parse_stat(&stat).ok_or(io::ErrorKind::InvalidData)?;
    entry.pid = pid;

    if let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) {
        let (uid, gid) = parse_status_ids(&status);
        entry.uid = uid;
        entry.gid = gid;
    }
    if let Ok(exe) = fs::read_link(format!("/proc/{pid}/exe")) {
        entry.exe_path = exe.to_string_lossy().into_owned();
    }
    Ok(entry)
}

/// Memory sections for one PID, capped at `max`.
pub fn read_sections(pid: u32, max: usize) -> io::Result<Vec<SectionEntry>> {
    let maps = fs::read_to_string(format!("/proc/{pid}/maps"))?;
    Ok(maps
        .lines()
        .take(max)
        .filter_map(|line| parse_maps_line(pid, line))
        .collect())
}

/// Raw maps text for one PID (triggered-mode payload).
pub fn read_maps_text(pid: u32) -> io::Result<String> {
    fs::read_to_string(format!("/proc/{pid}/maps"))
}

/// Parses a stat line. The command name is parenthesized and may itself
/// contain spaces and parentheses, so split on the LAST closing paren.
pub fn parse_stat(line: &str) -> Option<ProcessEntry> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let comm = &line[open + 1..close];
    let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();
    // fields[0] is state; stat field numbering starts at 3 here.
    if fields.len() < 22 {
        return None;
    }

    let mut entry = ProcessEntry {
        comm: comm.chars().take(15).collect(),
        state: fields[0].bytes().next().unwrap_or(b'?'),
        ppid: fields[1].parse().unwrap_or(0),
        utime: fields[11].parse().unwrap_or(0),
        stime: fields[12].parse().unwrap_or(0),
        nice: fields[16].parse().unwrap_or(0),
        num_threads: fields[17].parse().unwrap_or(0),
        start_time: fields[19].parse().unwrap_or(0),
        vsize: fields[20].parse().unwrap_or(0),
        rss: fields[21].parse().unwrap_or(0),
        ..Default::default()
    };
    if entry.comm.is_empty() {
        entry.comm = "?".into();
    }
    trace!("stat: pid comm={} ppid={}", entry.comm, entry.ppid);
    Some(entry)
}

/// Pulls real uid/gid out of a status dump.
pub fn parse_status_ids(status: &str) -> (u32, u32) {
    let mut uid = 0;
    let mut gid = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            uid = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Gid:") {
            gid = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            break;
        }
    }
    (uid, gid)
}

/// One maps line: `start-end perms offset dev:dev inode [pathname]`.
pub fn parse_maps_line(pid: u32, line: &str) -> Option<SectionEntry> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let dev = fields.next()?;
    let inode = fields.next()?;
    let pathname = fields.collect::<Vec<_>>().join(" ");

    let (start, end) = range.split_once('-')?;
    let (major, minor) = dev.split_once(':')?;

    let mut permissions = 0u32;
    let perm_bytes = perms.as_bytes();
    if perm_bytes.first() == Some(&b'r') {
        permissions |= PERM_READ;
    }
    if perm_bytes.get(1) == Some(&b'w') {
        permissions |= PERM_WRITE;
    }
    if perm_bytes.get(2) == Some(&b'x') {
        permissions |= PERM_EXEC;
    }
    match perm_bytes.get(3) {
        Some(&b'p') => permissions |= PERM_PRIVATE,
        Some(&b's') => permissions |= PERM_SHARED,
        _ => {}
    }

    Some(SectionEntry {
        pid,
        start_addr: u64::from_str_radix(start, 16).ok()?,
        end_addr: u64::from_str_radix(end, 16).ok()?,
        permissions,
        offset: u64::from_str_radix(offset, 16).ok()?,
        major: u32::from_str_radix(major, 16).ok()?,
        minor: u32::from_str_radix(minor, 16).ok()?,
        inode: inode.parse().ok()?,
        pathname,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stat_parse_handles_parenthesized_comm() {
        let line = "742 (sshd: /usr (1)) S 1 742 742 0 -1 4194560 2103 0 2 0 5 3 0 0 20 0 1 0 351 17844224 2973 18446744073709551615 1 1 0 0 0 0 0 4096 81925 0 0 0 17 3 0 0 0 0 0 0 0 0 0 0 0 0 0";
        let entry = parse_stat(line).unwrap();
        assert_eq!(entry.comm, "sshd: /usr (1)");
        assert_eq!(entry.state, b'S');
        assert_eq!(entry.ppid, 1);
        assert_eq!(entry.utime, 5);
        assert_eq!(entry.stime, 3);
        assert_eq!(entry.num_threads, 1);
        assert_eq!(entry.start_time, 351);
        assert_eq!(entry.vsize, 17_844_224);
        assert_eq!(entry.rss, 2973);
    }

    #[test]
    fn stat_parse_rejects_truncated_lines() {
        assert!(parse_stat("742 (x) S 1 2").is_none());
        assert!(parse_stat("no parens at all").is_none());
    }

    #[test]
    fn status_ids() {
        let status = "Name:\tsshd\nUid:\t1000\t1000\t1000\t1000\nGid:\t985\t985\t985\t985\n";
        assert_eq!(parse_status_ids(status), (1000, 985));
    }

    #[test]
    fn maps_line_with_pathname() {
        let line = "7f2c4a000000-7f2c4a021000 r-xp 00001000 08:02 131072 /usr/lib/libc.so.6";
        let sec = parse_maps_line(42, line).unwrap();
        assert_eq!(sec.pid, 42);
        assert_eq!(sec.start_addr, 0x7f2c_4a00_0000);
        assert_eq!(sec.end_addr, 0x7f2c_4a02_1000);
        assert_eq!(sec.permissions, PERM_READ | PERM_EXEC | PERM_PRIVATE);
        assert_eq!(sec.offset, 0x1000);
        assert_eq!(sec.major, 8);
        assert_eq!(sec.minor, 2);
        assert_eq!(sec.inode, 131_072);
        assert_eq!(sec.pathname, "/usr/lib/libc.so.6");
    }

    #[test]
    fn maps_line_anonymous_and_shared() {
        let sec = parse_maps_line(1, "5596b000-5596d000 rw-s 00000000 00:00 0").unwrap();
        assert_eq!(sec.permissions, PERM_READ | PERM_WRITE | PERM_SHARED);
        assert_eq!(sec.pathname, "");
        assert!(parse_maps_line(1, "garbage").is_none());
    }

    #[test]
    fn live_proc_scan_sees_ourselves() {
        let pids = scan_pids();
        assert!(pids.contains(&(std::process::id())));
        let me = read_process_entry(std::process::id()).unwrap();
        assert_eq!(me.pid, std::process::id());
        assert!(!me.comm.is_empty());
        let sections = read_sections(std::process::id(), 100).unwrap();
        assert!(!sections.is_empty());
    }
}
