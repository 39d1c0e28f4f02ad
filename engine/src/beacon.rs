//! Host-side beacon handling: scanning the memory file for companion pages,
//! indexing them, and decoding their payloads.

pub mod read;
pub mod scan;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use vmscope_protocol::{BeaconClass, PAGE_SIZE};

pub use read::BeaconReader;
pub use scan::BeaconScanner;

/// One discovered beacon page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeaconInfo {
    pub file_offset: u64,
    pub session_id: u32,
    #[serde(skip)]
    pub beacon_class: BeaconClass,
    pub page_index: u32,
    pub total_pages: u32,
    pub protocol_version: u32,
    pub discovered_at: DateTime<Utc>,
    pub active: bool,
}

/// A magic match that failed validation. Recorded, never indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousBeacon {
    pub file_offset: u64,
    pub session_id: u32,
    pub protocol_version: u32,
    pub reason: &'static str,
}

/// A run of physically contiguous pages of one class within one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconRegion {
    pub base_offset: u64,
    pub page_count: usize,
    pub session_id: u32,
    pub beacon_class: BeaconClass,
    pub first_page_index: u32,
}

/// Insertion-ordered beacon store with offset and session indexes.
#[derive(Debug, Default)]
pub struct BeaconIndex {
    beacons: Vec<BeaconInfo>,
    by_offset: HashMap<u64, usize>,
    by_session: HashMap<u32, Vec<usize>>,
    suspicious: Vec<SuspiciousBeacon>,
}

impl BeaconIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, info: BeaconInfo) -> usize {
        let index = self.beacons.len();
        self.by_offset.insert(info.file_offset, index);
        self.by_session
            .entry(info.session_id)
            .or_default()
            .push(index);
        self.beacons.push(info);
        index
    }

    pub fn add_suspicious(&mut self, entry: SuspiciousBeacon) {
        self.suspicious.push(entry);
    }

    pub fn get(&self, index: usize) -> Option<&BeaconInfo> {
        self.beacons.get(index)
    }

    pub fn find_by_offset(&self, file_offset: u64) -> Option<&BeaconInfo> {
        self.by_offset
            .get(&file_offset)
            .and_then(|&i| self.beacons.get(i))
    }

    /// Active beacons of a session, in insertion order.
    pub fn find_by_session(&self, session_id: u32) -> Vec<&BeaconInfo> {
        self.by_session
            .get(&session_id)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&i| self.beacons.get(i))
                    .filter(|b| b.active)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct session ids with at least one active beacon.
    pub fn sessions(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self
            .by_session
            .iter()
            .filter(|(_, indices)| {
                indices
                    .iter()
                    .any(|&i| self.beacons.get(i).is_some_and(|b| b.active))
            })
            .map(|(&s, _)| s)
            .collect();
        out.sort_unstable();
        out
    }

    /// Merges a session's active pages into contiguous regions: adjacent
    /// file offsets, same class, page indices increasing by one.
    pub fn find_regions(&self, session_id: u32) -> Vec<BeaconRegion> {
        let mut pages = self.find_by_session(session_id);
        pages.sort_by_key(|b| b.file_offset);

        let mut regions: Vec<BeaconRegion> = Vec::new();
        for page in pages {
            match regions.last_mut() {
                Some(region)
                    if page.file_offset
                        == region.base_offset + (region.page_count as u64) * PAGE_SIZE as u64
                        && page.beacon_class == region.beacon_class
                        && page.page_index
                            == region.first_page_index + region.page_count as u32 =>
                {
                    region.page_count += 1;
                }
                _ => regions.push(BeaconRegion {
                    base_offset: page.file_offset,
                    page_count: 1,
                    session_id,
                    beacon_class: page.beacon_class,
                    first_page_index: page.page_index,
                }),
            }
        }
        regions
    }

    /// Marks a session's beacons inactive. They stay listed until
    /// [`cleanup`](Self::cleanup) drops them from the secondary indexes.
    pub fn mark_stale(&mut self, session_id: u32) {
        if let Some(indices) = self.by_session.get(&session_id) {
            for &i in indices {
                if let Some(b) = self.beacons.get_mut(i) {
                    b.active = false;
                }
            }
        }
    }

    /// Removes inactive entries from the offset and session indexes.
    pub fn cleanup(&mut self) {
        let beacons = &self.beacons;
        self.by_offset
            .retain(|_, &mut i| beacons.get(i).is_some_and(|b| b.active));
        for indices in self.by_session.values_mut() {
            indices.retain(|&i| beacons.get(i).is_some_and(|b| b.active));
        }
        self.by_session.retain(|_, indices| !indices.is_empty());
    }

    pub fn total(&self) -> usize {
        self.beacons.len()
    }

    pub fn active_count(&self) -> usize {
        self.beacons.iter().filter(|b| b.active).count()
    }

    pub fn suspicious(&self) -> &[SuspiciousBeacon] {
        &self.suspicious
    }

    pub fn iter(&self) -> impl Iterator<Item = &BeaconInfo> {
        self.beacons.iter()
    }

    pub fn clear(&mut self) {
        self.beacons.clear();
        self.by_offset.clear();
        self.by_session.clear();
        self.suspicious.clear();
    }
}
