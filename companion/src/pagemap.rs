//! Virtual-to-physical lookups through the kernel's pagemap file.
//!
//! The companion samples its own beacon pages once at startup so the host
//! can shortcut its scan. The file handle is owned here, not cached in
//! process-wide state.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use vmscope_protocol::PAGE_SIZE;

/// Bits 0..54 of a pagemap entry hold the page frame number.
const PFN_MASK: u64 = (1 << 55) - 1;
/// Bit 63: page present in RAM.
const PAGE_PRESENT: u64 = 1 << 63;
const ENTRY_SIZE: u64 = 8;

/// Physical address for a present entry, `None` for swapped/absent pages.
pub fn decode_entry(entry: u64) -> Option<u64> {
    if entry & PAGE_PRESENT == 0 {
        return None;
    }
    Some((entry & PFN_MASK) * PAGE_SIZE as u64)
}

pub struct PagemapReader {
    file: File,
}

impl PagemapReader {
    /// Opens this process's own pagemap. Needs CAP_SYS_ADMIN on hardened
    /// kernels; callers degrade to hint-less discovery when it fails.
    pub fn open_self() -> io::Result<Self> {
        Ok(PagemapReader {
            file: File::open("/proc/self/pagemap")?,
        })
    }

    /// Physical address backing `va`, if the page is resident.
    pub fn physical_addr(&mut self, va: usize) -> io::Result<Option<u64>> {
        let index = (va / PAGE_SIZE) as u64;
        self.file.seek(SeekFrom::Start(index * ENTRY_SIZE))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        let entry = u64::from_le_bytes(buf);
        Ok(decode_entry(entry).map(|pa| pa + (va % PAGE_SIZE) as u64))
    }

    /// Samples up to `max` evenly spaced pages from a virtual range.
    pub fn sample_range(&mut self, base: usize, pages: usize, max: usize) -> Vec<u64> {
        if pages == 0 || max == 0 {
            return Vec::new();
        }
        let step = (pages / max.min(pages)).max(1);
        let mut hints = Vec::new();
        let mut page = 0usize;
        while page < pages && hints.len() < max {
            if let Ok(Some(pa)) = self.physical_addr(base + page * PAGE_SIZE) {
                hints.push(pa);
            }
            page += step;
        }
        hints
    }
}
