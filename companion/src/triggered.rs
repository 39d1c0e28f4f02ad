//! Triggered (single-shot) mode: gather one snapshot, publish one beacon,
//! print the ready line, exit.

use std::io;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use vmscope_protocol::{TriggeredBeacon, TriggeredEntry, PAGE_SIZE};

use crate::procfs;

/// Builds the snapshot: every PID as a fixed entry, plus the raw maps text
/// of the focus PID when one is given.
pub fn collect_entries(focus_pid: u32) -> Vec<TriggeredEntry> {
    let mut entries = Vec::new();
    for pid in procfs::scan_pids() {
        let Ok(proc_entry) = procfs::read_process_entry(pid) else {
            continue; // raced with exit
        };
        entries.push(TriggeredEntry::Pid {
            pid,
            ppid: proc_entry.ppid,
            uid: proc_entry.uid,
            vsize_kb: (proc_entry.vsize / 1024) as u32,
            rss_kb: (proc_entry.rss * (PAGE_SIZE as u64 / 1024)) as u32,
            name: proc_entry.comm,
        });
    }
    if focus_pid > 0 {
        match procfs::read_maps_text(focus_pid) {
            Ok(text) => entries.push(TriggeredEntry::Maps {
                pid: focus_pid,
                text,
            }),
            Err(e) => warn!("maps for focus pid {focus_pid} unavailable: {e}"),
        }
    }
    entries
}

/// Runs the single-shot protocol. The printed line is the sole
/// inter-process signal:
/// `BEACON_READY:<va>:SIZE:<bytes>:MAGIC:<request_id>:PAGES:<n>`
pub fn run(request_id: u32, focus_pid: u32, keep_alive: bool) -> io::Result<()> {
    let beacon = TriggeredBeacon {
        session_id: std::process::id(),
        request_id,
        focus_pid,
        entries: collect_entries(focus_pid),
    };

    let pages = beacon.page_count();
    // Over-allocate one page so the beacon can start page-aligned; the
    // host scans on page boundaries only.
    let mut buf = vec![0u8; (pages + 1) * PAGE_SIZE];
    let align = (PAGE_SIZE - (buf.as_ptr() as usize % PAGE_SIZE)) % PAGE_SIZE;
    let span = &mut buf[align..align + pages * PAGE_SIZE];
    beacon
        .encode_into(span)
        .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e.to_string()))?;

    // Touch every page so it is resident when the host sweeps.
    for page in 0..pages {
        span[page * PAGE_SIZE] |= 0;
    }

    info!(
        "triggered beacon: {} entries, {pages} pages, request {request_id:#x}",
        beacon.entries.len()
    );
    println!(
        "BEACON_READY:{:p}:SIZE:{}:MAGIC:{:08x}:PAGES:{}",
        span.as_ptr(),
        pages * PAGE_SIZE,
        request_id,
        pages
    );

    if keep_alive {
        eprintln!("beacon written; memory stays mapped. kill {} to release", std::process::id());
        loop {
            thread::sleep(Duration::from_secs(3600));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_this_process() {
        let me = std::process::id();
        let entries = collect_entries(me);
        let mine = entries.iter().find(|e| match e {
            TriggeredEntry::Pid { pid, .. } => *pid == me,
            _ => false,
        });
        assert!(mine.is_some());
        // Focus maps entry rides at the tail.
        assert!(entries.iter().any(|e| matches!(
            e,
            TriggeredEntry::Maps { pid, .. } if *pid == me
        )));
    }

    #[test]
    fn snapshot_encodes_within_its_page_budget() {
        let beacon = TriggeredBeacon {
            session_id: 1,
            request_id: 0xFEED,
            focus_pid: 0,
            entries: collect_entries(0),
        };
        let mut buf = vec![0u8; beacon.page_count() * PAGE_SIZE];
        beacon.encode_into(&mut buf).unwrap();
        assert_eq!(TriggeredBeacon::decode(&buf).unwrap().request_id, 0xFEED);
    }
}
