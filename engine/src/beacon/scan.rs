//! Magic-number sweep of the memory-backend file.
//!
//! Beacons are page-aligned, so the scan strides by page size and looks at
//! the first eight bytes only. Matches are validated before indexing;
//! anything with the magic but an implausible header is classified
//! suspicious and recorded separately.

use chrono::Utc;
use log::{debug, info};
use vmscope_protocol::{has_beacon_magic, BeaconClass, MAX_TOTAL_PAGES, PAGE_SIZE, PROTOCOL_VERSION};

use crate::backend::MemoryBackend;
use crate::beacon::{BeaconIndex, BeaconInfo, SuspiciousBeacon};

pub struct BeaconScanner;

impl BeaconScanner {
    /// Full sweep of the mapped file. Read-only and bounded by file size;
    /// safe to run concurrently with other readers.
    pub fn scan(backend: &MemoryBackend) -> BeaconIndex {
        let mut index = BeaconIndex::new();
        let size = backend.mapped_size();
        let mut pages_scanned = 0u64;

        let mut offset = 0u64;
        while offset + PAGE_SIZE as u64 <= size {
            pages_scanned += 1;
            if pages_scanned % 100_000 == 0 {
                debug!("scanned {pages_scanned} pages, {} beacons", index.total());
            }
            Self::probe(backend, offset, &mut index);
            offset += PAGE_SIZE as u64;
        }

        info!(
            "beacon scan: {pages_scanned} pages, {} valid, {} suspicious",
            index.total(),
            index.suspicious().len()
        );
        index
    }

    /// Seeds an index from discovery-page physical hints, avoiding a full
    /// sweep when the companion told us where its pages are. Hints are
    /// guest-physical; anything the region map cannot place is skipped.
    pub fn scan_hints(backend: &MemoryBackend, hints: &[u64], index: &mut BeaconIndex) -> usize {
        let mut found = 0usize;
        for &gpa in hints {
            let Some(offset) = backend.region_map().gpa_to_file_offset(gpa) else {
                continue;
            };
            if offset % PAGE_SIZE as u64 != 0 {
                continue;
            }
            if index.find_by_offset(offset).is_some() {
                continue;
            }
            if Self::probe(backend, offset, index) {
                found += 1;
            }
        }
        found
    }

    /// Checks one page-aligned offset; indexes it when it validates.
    /// Returns true when a valid beacon was added.
    fn probe(backend: &MemoryBackend, offset: u64, index: &mut BeaconIndex) -> bool {
        let Ok(page) = backend.slice(offset, PAGE_SIZE) else {
            return false;
        };
        if !has_beacon_magic(page) {
            return false;
        }

        let word = |i: usize| {
            u32::from_le_bytes([page[i * 4], page[i * 4 + 1], page[i * 4 + 2], page[i * 4 + 3]])
        };
        let session_id = word(2);
        let raw_class = word(3);
        let page_index = word(4);
        let total_pages = word(5);
        let protocol_version = word(6);

        let issue = if session_id == 0 || session_id == 0xFFFF_FFFF {
            Some("invalid session id")
        } else if protocol_version != PROTOCOL_VERSION {
            Some("unexpected protocol version")
        } else if !(1..=10).contains(&raw_class) {
            Some("invalid beacon class")
        } else if page_index >= total_pages || total_pages > MAX_TOTAL_PAGES {
            Some("invalid page index/total")
        } else {
            None
        };

        if let Some(reason) = issue {
            debug!(
                "suspicious beacon at {offset:#x}: {reason} (session={session_id:#x}, proto={protocol_version})"
            );
            index.add_suspicious(SuspiciousBeacon {
                file_offset: offset,
                session_id,
                protocol_version,
                reason,
            });
            return false;
        }

        // Range-checked above.
        let beacon_class = BeaconClass::from_u32(raw_class).expect("class validated");
        index.add(BeaconInfo {
            file_offset: offset,
            session_id,
            beacon_class,
            page_index,
            total_pages,
            protocol_version,
            discovered_at: Utc::now(),
            active: true,
        });
        true
    }
}
