//! Crunched address space: a gap-free enumeration of one process's mapped
//! virtual regions, indexed linearly for dense visualization.
//!
//! The catalog is built from the section entries a companion publishes (or
//! any other source of a process memory map); a crunched offset walks the
//! cumulative sizes back to a virtual address, and translation to physical
//! goes through the process's page tables from there.

use log::debug;
use vmscope_protocol::SectionEntry;

/// One region's place in the dense enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrunchedRegion {
    pub va_start: u64,
    pub size: u64,
    /// Where this region begins in the crunched space.
    pub crunched_start: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CrunchedCatalog {
    pid: u32,
    regions: Vec<CrunchedRegion>,
    total: u64,
}

impl CrunchedCatalog {
    /// Builds the catalog from a process's section list. Sections are
    /// sorted by start address; empty ones are dropped.
    pub fn from_sections(pid: u32, sections: &[SectionEntry]) -> Self {
        let mut spans: Vec<(u64, u64)> = sections
            .iter()
            .filter(|s| s.end_addr > s.start_addr)
            .map(|s| (s.start_addr, s.end_addr - s.start_addr))
            .collect();
        spans.sort_unstable();
        spans.dedup();

        let mut regions = Vec::with_capacity(spans.len());
        let mut cursor = 0u64;
        for (va_start, size) in spans {
            regions.push(CrunchedRegion {
                va_start,
                size,
                crunched_start: cursor,
            });
            cursor += size;
        }
        debug!(
            "crunched catalog for pid {pid}: {} regions, {cursor:#x} bytes",
            regions.len()
        );
        CrunchedCatalog {
            pid,
            regions,
            total: cursor,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn regions(&self) -> &[CrunchedRegion] {
        &self.regions
    }

    /// Crunched offset → virtual address.
    pub fn to_virtual(&self, crunched: u64) -> Option<u64> {
        if crunched >= self.total {
            return None;
        }
        let idx = self
            .regions
            .partition_point(|r| r.crunched_start <= crunched)
            .checked_sub(1)?;
        let region = &self.regions[idx];
        Some(region.va_start + (crunched - region.crunched_start))
    }

    /// Virtual address → crunched offset, when the address is inside a
    /// cataloged region.
    pub fn from_virtual(&self, va: u64) -> Option<u64> {
        let idx = self.regions.partition_point(|r| r.va_start <= va).checked_sub(1)?;
        let region = &self.regions[idx];
        if va < region.va_start + region.size {
            Some(region.crunched_start + (va - region.va_start))
        } else {
            None
        }
    }

    /// How many contiguous bytes remain in the region containing
    /// `crunched`. Reads must not cross region boundaries blindly: adjacent
    /// crunched offsets can be wildly distant virtual addresses.
    pub fn contiguous_remaining(&self, crunched: u64) -> u64 {
        let Some(idx) = self
            .regions
            .partition_point(|r| r.crunched_start <= crunched)
            .checked_sub(1)
        else {
            return 0;
        };
        let region = &self.regions[idx];
        (region.crunched_start + region.size).saturating_sub(crunched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn section(pid: u32, start: u64, end: u64) -> SectionEntry {
        SectionEntry {
            pid,
            start_addr: start,
            end_addr: end,
            ..Default::default()
        }
    }

    fn catalog() -> CrunchedCatalog {
        CrunchedCatalog::from_sections(
            742,
            &[
                section(742, 0x40_0000, 0x40_2000),      // 2 pages
                section(742, 0x7FFF_0000, 0x7FFF_1000),  // 1 page, far away
                section(742, 0x10_0000, 0x10_1000),      // 1 page, out of order
                section(742, 0x999, 0x999),              // empty, dropped
            ],
        )
    }

    #[test]
    fn regions_pack_densely_in_va_order() {
        let c = catalog();
        assert_eq!(c.total_size(), 0x4000);
        assert_eq!(c.regions().len(), 3);
        assert_eq!(c.regions()[0].va_start, 0x10_0000);
        assert_eq!(c.regions()[0].crunched_start, 0);
        assert_eq!(c.regions()[1].crunched_start, 0x1000);
        assert_eq!(c.regions()[2].crunched_start, 0x3000);
    }

    #[test]
    fn round_trip_between_spaces() {
        let c = catalog();
        for crunched in [0u64, 0xFFF, 0x1000, 0x2FFF, 0x3000, 0x3FFF] {
            let va = c.to_virtual(crunched).unwrap();
            assert_eq!(c.from_virtual(va), Some(crunched));
        }
        assert_eq!(c.to_virtual(0x4000), None);
        assert_eq!(c.from_virtual(0x50_0000), None);
    }

    #[test]
    fn gap_between_regions_is_not_addressable() {
        let c = catalog();
        assert_eq!(c.to_virtual(0x1000), Some(0x40_0000));
        assert_eq!(c.from_virtual(0x10_1000), None); // first byte past region 0
        assert_eq!(c.contiguous_remaining(0x2FFF), 1);
        assert_eq!(c.contiguous_remaining(0x1000), 0x2000);
    }
}
