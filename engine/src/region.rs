//! Guest RAM region table and GPA ↔ file-offset translation.
//!
//! The memory-backend file is the ordered concatenation of the guest's RAM
//! regions, so translating a guest-physical address is a region lookup plus
//! an offset into that region's span of the file.

use log::{info, warn};
use serde::Serialize;

/// Default RAM base used for the synthetic fallback region when the monitor
/// gives us nothing (the ARM64 virt machine puts RAM here).
pub const DEFAULT_ARM64_RAM_BASE: u64 = 0x4000_0000;

/// One guest RAM region and where its bytes live in the backing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RamRegion {
    pub gpa_start: u64,
    /// Inclusive.
    pub gpa_end: u64,
    pub file_offset: u64,
    pub size: u64,
    pub name: String,
}

impl RamRegion {
    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.gpa_start && gpa <= self.gpa_end
    }
}

/// Discovery progress for the region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryState {
    Undiscovered,
    Querying,
    Discovered,
}

/// Ordered region table. Regions are non-overlapping in GPA and their file
/// spans tile the backing file contiguously.
#[derive(Debug, Clone, Serialize)]
pub struct RegionMap {
    regions: Vec<RamRegion>,
    state: DiscoveryState,
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionMap {
    pub fn new() -> Self {
        RegionMap {
            regions: Vec::new(),
            state: DiscoveryState::Undiscovered,
        }
    }

    /// Builds the table from a monitor memory-tree dump.
    ///
    /// Primary form is the flat view:
    /// `0000000040000000-00000000bfffffff (prio 0, ram): mem` or
    /// `0000000040000000-00000000bfffffff: mem (prio 0, ram)`.
    /// A simpler `hex-hex : name` form is accepted as fallback for lines
    /// mentioning RAM. If nothing parses, a single synthetic region covering
    /// `file_size` bytes at `fallback_base` is installed.
    pub fn discover_from_tree(&mut self, tree: &str, file_size: u64, fallback_base: u64) {
        self.state = DiscoveryState::Querying;
        self.regions.clear();

        let mut file_offset = 0u64;
        for line in tree.lines() {
            let lower = line.to_ascii_lowercase();
            if !(lower.contains("ram") || lower.contains("mem")) {
                continue;
            }
            let Some((start, end, name)) = parse_region_line(line) else {
                continue;
            };
            if name.contains("rom") || name.contains("io") {
                continue;
            }
            if end < start {
                warn!("region line with inverted range skipped: {line:?}");
                continue;
            }
            let size = end - start + 1;
            info!(
                "RAM region '{}': GPA {:#x}-{:#x} (size {:#x}) -> file offset {:#x}",
                name, start, end, size, file_offset
            );
            self.regions.push(RamRegion {
                gpa_start: start,
                gpa_end: end,
                file_offset,
                size,
                name,
            });
            file_offset += size;
        }

        if self.regions.is_empty() {
            warn!(
                "no RAM regions in monitor output; falling back to {:#x}+{:#x}",
                fallback_base, file_size
            );
            self.install_fallback(file_size, fallback_base);
        } else {
            self.state = DiscoveryState::Discovered;
        }
    }

    /// One synthetic region covering the whole file at an architecture
    /// default base.
    pub fn install_fallback(&mut self, file_size: u64, base: u64) {
        self.regions = vec![RamRegion {
            gpa_start: base,
            gpa_end: base + file_size.saturating_sub(1),
            file_offset: 0,
            size: file_size,
            name: "default-ram".into(),
        }];
        self.state = DiscoveryState::Discovered;
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn regions(&self) -> &[RamRegion] {
        &self.regions
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total bytes covered, which equals the expected backing-file size.
    pub fn total_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// GPA → file offset. `None` when no region contains the address.
    pub fn gpa_to_file_offset(&self, gpa: u64) -> Option<u64> {
        self.regions
            .iter()
            .find(|r| r.contains(gpa))
            .map(|r| r.file_offset + (gpa - r.gpa_start))
    }

    /// File offset → GPA. `None` past the end of the table.
    pub fn file_offset_to_gpa(&self, offset: u64) -> Option<u64> {
        self.regions
            .iter()
            .find(|r| offset >= r.file_offset && offset < r.file_offset + r.size)
            .map(|r| r.gpa_start + (offset - r.file_offset))
    }

    /// Pretty JSON dump of the table for offline inspection.
    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.regions).unwrap_or_else(|_| "[]".into())
    }
}

/// Pulls `(start, end, name)` out of one memory-tree line. Handles both the
/// `start-end (attrs): name` and `start-end: name (attrs)` orderings plus
/// the bare `start-end : name` fallback.
fn parse_region_line(line: &str) -> Option<(u64, u64, String)> {
    let trimmed = line.trim_start();
    let (range, rest) = match trimmed.split_once(':') {
        Some((head, tail)) => {
            // `start-end (attrs): name` puts the attrs before the colon.
            match head.split_once('(') {
                Some((range, _attrs)) => (range.trim(), tail.trim()),
                None => (head.trim(), tail.trim()),
            }
        }
        None => return None,
    };
    let (start_str, end_str) = range.split_once('-')?;
    let start = u64::from_str_radix(start_str.trim(), 16).ok()?;
    let end = u64::from_str_radix(end_str.trim(), 16).ok()?;
    let name = rest.split_whitespace().next()?.to_string();
    if name.is_empty() {
        return None;
    }
    Some((start, end, name))
}
