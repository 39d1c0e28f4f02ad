//! Memory backend: the guest's RAM as a flat, randomly readable byte array.
//!
//! The hypervisor exposes guest RAM as an ordinary file (a memory-backend
//! file on tmpfs, typically). We map it read-only and never write through
//! it. Guest-physical reads go through the owned [`RegionMap`]; raw
//! file-offset reads bypass it.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use memmap2::{Advice, Mmap};

use crate::error::{Error, Result};
use crate::region::RegionMap;

/// Files smaller than this cannot be a guest RAM image.
const MIN_BACKEND_SIZE: u64 = 1024 * 1024;

/// Conventional places hypervisors put memory-backend files.
const SEARCH_DIRS: &[&str] = &["/dev/shm", "/tmp", "/var/tmp", "."];

pub struct MemoryBackend {
    map: Option<Mmap>,
    path: Option<PathBuf>,
    size: u64,
    regions: RegionMap,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            map: None,
            path: None,
            size: 0,
            regions: RegionMap::new(),
        }
    }

    /// Probes conventional directories for a plausible memory-backend file,
    /// then falls back to scanning hypervisor command lines for an explicit
    /// `mem-path=` argument. Maps the first usable candidate read-only.
    pub fn auto_detect(&mut self) -> bool {
        for dir in SEARCH_DIRS {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name_matches_memory_pattern(&name) {
                    continue;
                }
                let path = entry.path();
                if self.try_map_path(&path) {
                    info!(
                        "auto-detected memory backend {} ({} MB)",
                        path.display(),
                        self.size / (1024 * 1024)
                    );
                    return true;
                }
            }
        }

        // Hypervisor command lines name the file explicitly:
        // -object memory-backend-file,...,mem-path=/dev/shm/vm-mem,share=on
        if let Some(path) = scan_process_cmdlines_for_mem_path() {
            if self.try_map_path(&path) {
                info!(
                    "found memory backend from hypervisor cmdline: {} ({} MB)",
                    path.display(),
                    self.size / (1024 * 1024)
                );
                return true;
            }
        }

        false
    }

    /// Maps `path` if it looks like a guest RAM image (regular file, ≥1 MiB).
    pub fn try_map_path(&mut self, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        if !meta.is_file() || meta.len() < MIN_BACKEND_SIZE {
            return false;
        }
        self.map_file(path).is_ok()
    }

    /// Unmaps any existing mapping and maps the whole of `path` read-only,
    /// advising the kernel that access will be random.
    pub fn map_file(&mut self, path: &Path) -> Result<()> {
        self.unmap();

        let file = File::open(path)?;
        let meta = file.metadata()?;
        let map = unsafe { Mmap::map(&file) }?;
        let _ = map.advise(Advice::Random);

        debug!("mapped {} ({} bytes)", path.display(), meta.len());
        self.size = meta.len();
        self.map = Some(map);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn unmap(&mut self) {
        self.map = None;
        self.path = None;
        self.size = 0;
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    pub fn mapped_size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_region_map(&mut self, regions: RegionMap) {
        self.regions = regions;
    }

    pub fn region_map(&self) -> &RegionMap {
        &self.regions
    }

    /// Zero-copy view at a file offset. Exact-length; errors rather than
    /// clamping. Valid until unmap.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let map = self
            .map
            .as_ref()
            .ok_or(Error::NotConfigured("memory backend not mapped"))?;
        let end = offset
            .checked_add(len as u64)
            .filter(|&e| e <= self.size)
            .ok_or(Error::OutOfRange {
                offset,
                len,
                size: self.size,
            })?;
        Ok(&map[offset as usize..end as usize])
    }

    /// Copying read at a file offset, clamped to the mapping's end.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Err(Error::OutOfRange {
                offset,
                len,
                size: self.size,
            });
        }
        let avail = (self.size - offset) as usize;
        self.slice(offset, len.min(avail)).map(|s| s.to_vec())
    }

    /// Zero-copy view at a guest-physical address, through the region map.
    pub fn slice_phys(&self, gpa: u64, len: usize) -> Result<&[u8]> {
        let offset = self.regions.gpa_to_file_offset(gpa).ok_or(Error::Unmapped {
            addr: gpa,
            space: "guest-physical",
        })?;
        self.slice(offset, len)
    }

    /// Guest-physical read through the region map.
    pub fn read_phys(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        let offset = self.regions.gpa_to_file_offset(gpa).ok_or(Error::Unmapped {
            addr: gpa,
            space: "guest-physical",
        })?;
        self.read_at(offset, len)
    }

    /// Fallible u64 read for page-table walks. Any failure (uncovered GPA,
    /// offset past the mapping) is `None` so walks degrade to "unmapped".
    pub fn read_phys_u64(&self, gpa: u64) -> Option<u64> {
        let offset = self.regions.gpa_to_file_offset(gpa)?;
        let bytes = self.slice(offset, 8).ok()?;
        let mut b = [0u8; 8];
        b.copy_from_slice(bytes);
        Some(u64::from_le_bytes(b))
    }
}

/// Case-insensitive `(qemu|vm|haywire).*mem.*` over a file name: one of the
/// keywords, with `mem` at or after it.
pub(crate) fn name_matches_memory_pattern(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ["qemu", "vm", "haywire"].iter().any(|kw| {
        lower
            .find(kw)
            .is_some_and(|pos| lower[pos..].contains("mem"))
    })
}

/// Looks through `/proc/<pid>/cmdline` for a `mem-path=` argument.
fn scan_process_cmdlines_for_mem_path() -> Option<PathBuf> {
    let proc = fs::read_dir("/proc").ok()?;
    for entry in proc.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw);
        let Some(pos) = cmdline.find("mem-path=") else {
            continue;
        };
        let rest = &cmdline[pos + "mem-path=".len()..];
        let end = rest
            .find(|c: char| c == ',' || c == '\0' || c.is_whitespace())
            .unwrap_or(rest.len());
        if end > 0 {
            let path = PathBuf::from(&rest[..end]);
            warn!("hypervisor cmdline names mem-path {}", path.display());
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::DEFAULT_ARM64_RAM_BASE;
    use std::io::Write;

    fn backend_with_bytes(bytes: &[u8]) -> (MemoryBackend, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        let mut backend = MemoryBackend::new();
        backend.map_file(file.path()).unwrap();
        (backend, file)
    }

    #[test]
    fn name_pattern() {
        assert!(name_matches_memory_pattern("qemu-ram-mem"));
        assert!(name_matches_memory_pattern("QEMU_MEM0"));
        assert!(name_matches_memory_pattern("haywire-vm-mem"));
        assert!(name_matches_memory_pattern("vm-memory"));
        assert!(!name_matches_memory_pattern("memqemu")); // mem before keyword
        assert!(!name_matches_memory_pattern("qemu-disk"));
        assert!(!name_matches_memory_pattern("random-file"));
    }

    #[test]
    fn read_at_clamps_slice_does_not() {
        let (backend, _file) = backend_with_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(backend.read_at(6, 10).unwrap(), vec![7, 8]);
        assert!(backend.slice(6, 10).is_err());
        assert!(matches!(
            backend.read_at(100, 1),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn phys_reads_go_through_region_map() {
        let (mut backend, _file) = backend_with_bytes(&[0xAA; 4096]);
        let mut regions = RegionMap::new();
        regions.install_fallback(4096, DEFAULT_ARM64_RAM_BASE);
        backend.set_region_map(regions);

        assert_eq!(
            backend.read_phys(DEFAULT_ARM64_RAM_BASE + 16, 2).unwrap(),
            vec![0xAA, 0xAA]
        );
        assert!(matches!(
            backend.read_phys(0x1000, 2),
            Err(Error::Unmapped { .. })
        ));
        assert_eq!(backend.read_phys_u64(DEFAULT_ARM64_RAM_BASE), Some(u64::from_le_bytes([0xAA; 8])));
        assert_eq!(backend.read_phys_u64(0x1000), None);
    }

    #[test]
    fn unmapped_backend_is_not_configured() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.slice(0, 1),
            Err(Error::NotConfigured(_))
        ));
    }

    #[test]
    fn rejects_small_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 128]).unwrap();
        let mut backend = MemoryBackend::new();
        assert!(!backend.try_map_path(file.path()));
    }
}
