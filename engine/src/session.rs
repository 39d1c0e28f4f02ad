//! The analysis session: owner of the backend mapping, the monitor socket,
//! the beacon index, and the per-process translation state, with the
//! unified read that routes a typed address to the cheapest working reader.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::addr::{AddressParser, AddressSpace, TypedAddress};
use crate::backend::MemoryBackend;
use crate::beacon::BeaconReader;
use crate::crunched::CrunchedCatalog;
use crate::error::{Error, Result};
use crate::monitor::MonitorClient;
use crate::process::{create_process_walker, ProcessRecord};
use crate::region::{RegionMap, DEFAULT_ARM64_RAM_BASE};
use crate::walker::{create_page_walker, PageWalker};

pub struct Session {
    backend: Arc<MemoryBackend>,
    monitor: Option<Arc<MonitorClient>>,
    arch: String,
    /// Walker used for context-dependent virtual reads; its root follows
    /// the focused process.
    walker: Box<dyn PageWalker>,
    reader: BeaconReader,
    parser: AddressParser,
    processes: HashMap<u64, ProcessRecord>,
    crunched: HashMap<u32, CrunchedCatalog>,
}

impl Session {
    /// Assembles a session: discovers the RAM layout (through the monitor
    /// when available, synthetic fallback otherwise), freezes the backend
    /// behind an `Arc`, and builds the architecture walker.
    ///
    /// The backend must already be mapped; the mapping stays immutable for
    /// the session's lifetime.
    pub fn create(
        mut backend: MemoryBackend,
        monitor: Option<MonitorClient>,
        arch_hint: Option<&str>,
    ) -> Result<Self> {
        if !backend.is_mapped() {
            return Err(Error::NotConfigured("memory backend not mapped"));
        }
        let monitor = monitor.map(Arc::new);

        let arch = match arch_hint {
            Some(a) => a.to_owned(),
            None => match &monitor {
                Some(m) => m.query_target_arch().unwrap_or_else(|e| {
                    warn!("target query failed ({e}); assuming aarch64");
                    "aarch64".into()
                }),
                None => "aarch64".into(),
            },
        };

        // Architecture-default RAM base for the synthetic fallback region.
        let lower_arch = arch.to_ascii_lowercase();
        let fallback_base = if lower_arch.contains("x86") || lower_arch == "x64" || lower_arch == "amd64" {
            0
        } else {
            DEFAULT_ARM64_RAM_BASE
        };
        let mut regions = RegionMap::new();
        match &monitor {
            Some(m) => match m.query_memory_tree() {
                Ok(tree) => {
                    regions.discover_from_tree(&tree, backend.mapped_size(), fallback_base)
                }
                Err(e) => {
                    warn!("memory tree query failed ({e}); using fallback region");
                    regions.install_fallback(backend.mapped_size(), fallback_base);
                }
            },
            None => regions.install_fallback(backend.mapped_size(), fallback_base),
        }
        let ram_base = regions.regions().first().map(|r| r.gpa_start).unwrap_or(0);
        backend.set_region_map(regions);

        let backend = Arc::new(backend);
        let walker = create_page_walker(&arch, backend.clone())?;
        let reader = BeaconReader::new(backend.clone());
        let mut parser = AddressParser::new();
        parser.set_builtins(ram_base, 0, 0);

        info!("session ready: arch={arch}, {} bytes mapped", backend.mapped_size());
        Ok(Session {
            backend,
            monitor,
            arch,
            walker,
            reader,
            parser,
            processes: HashMap::new(),
            crunched: HashMap::new(),
        })
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn monitor(&self) -> Option<&MonitorClient> {
        self.monitor.as_deref()
    }

    pub fn reader(&self) -> &BeaconReader {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut BeaconReader {
        &mut self.reader
    }

    pub fn parser(&self) -> &AddressParser {
        &self.parser
    }

    pub fn parser_mut(&mut self) -> &mut AddressParser {
        &mut self.parser
    }

    /// Replaces the context walker. Mostly for guests whose translation
    /// the standard walkers cannot express (and for tests).
    pub fn set_page_walker(&mut self, walker: Box<dyn PageWalker>) {
        self.walker = walker;
    }

    /// Parses an address string in the physical context by default.
    pub fn parse_address(&self, input: &str) -> Result<TypedAddress> {
        self.parser.parse(input, AddressSpace::GuestPhysical)
    }

    /// Walks the guest's task list and caches the snapshot for per-process
    /// reads. Best-effort: a truncated walk still replaces the snapshot.
    pub fn refresh_processes(&mut self) -> Result<Vec<ProcessRecord>> {
        let translator = create_page_walker(&self.arch, self.backend.clone())?;
        let mut walker =
            create_process_walker("linux", self.backend.clone(), translator, self.monitor.clone())?;
        walker.initialize()?;
        let records = walker.enumerate_processes()?;
        self.processes = records.iter().map(|r| (r.pid, r.clone())).collect();
        Ok(records)
    }

    pub fn process(&self, pid: u64) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    /// Installs `pid`'s page-table root on the context walker.
    pub fn focus_process(&mut self, pid: u64) -> Result<()> {
        let record = self
            .processes
            .get(&pid)
            .ok_or(Error::NotConfigured("pid not in the current snapshot"))?;
        if record.is_kernel_thread() {
            return Err(Error::Unmapped {
                addr: 0,
                space: "kernel thread has no address space",
            });
        }
        self.walker
            .set_page_table_base(record.page_table_base, record.page_table_base);
        debug!("focused pid {pid}, root {:#x}", record.page_table_base);
        Ok(())
    }

    /// Builds the crunched catalog for `pid` from companion-published
    /// section records.
    pub fn build_crunched(&mut self, session_id: u32, pid: u32) -> Result<()> {
        let details = self.reader.process_details(session_id, None)?;
        let sections: Vec<_> = details
            .into_iter()
            .filter(|(p, _)| p.pid == pid)
            .flat_map(|(_, s)| s)
            .collect();
        if sections.is_empty() {
            return Err(Error::NotConfigured("no published sections for that pid"));
        }
        self.crunched
            .insert(pid, CrunchedCatalog::from_sections(pid, &sections));
        Ok(())
    }

    pub fn crunched_catalog(&self, pid: u32) -> Option<&CrunchedCatalog> {
        self.crunched.get(&pid)
    }

    /// Directly installs a catalog (when sections come from another source).
    pub fn set_crunched_catalog(&mut self, catalog: CrunchedCatalog) {
        self.crunched.insert(catalog.pid(), catalog);
    }

    /// The unified read: route the typed address to the cheapest reader
    /// that admits it.
    ///
    /// 1. `Crunched` and pid-qualified `GuestVirtual` go through the
    ///    per-process catalog/page tables.
    /// 2. `SharedFileOffset` inside the mapping is a direct copy.
    /// 3. Everything else converts to `GuestPhysical` through the region
    ///    map and reads the backend, escalating to the monitor when the
    ///    backend cannot serve it.
    pub fn read_with_fallback(&mut self, addr: &TypedAddress, size: usize) -> Result<Vec<u8>> {
        match addr.space() {
            AddressSpace::None => Err(Error::NotConfigured("address has no space")),

            AddressSpace::Crunched => self.read_crunched(addr.value(), size),

            AddressSpace::GuestVirtual { pid: Some(pid) } => {
                self.focus_process(pid as u64)?;
                self.read_virtual(addr.value(), size)
            }
            AddressSpace::GuestVirtual { pid: None } => self.read_virtual(addr.value(), size),

            AddressSpace::SharedFileOffset => {
                if addr.value() < self.backend.mapped_size() {
                    self.backend.read_at(addr.value(), size)
                } else {
                    Err(Error::OutOfRange {
                        offset: addr.value(),
                        len: size,
                        size: self.backend.mapped_size(),
                    })
                }
            }

            AddressSpace::GuestPhysical => self.read_physical(addr.value(), size),
        }
    }

    fn read_physical(&self, gpa: u64, size: usize) -> Result<Vec<u8>> {
        match self.backend.read_phys(gpa, size) {
            Ok(bytes) => Ok(bytes),
            Err(backend_err) => match &self.monitor {
                Some(monitor) if !monitor.is_failed() => {
                    debug!("backend miss at {gpa:#x}; escalating to monitor");
                    monitor.read_physical(gpa, size)
                }
                _ => Err(backend_err),
            },
        }
    }

    fn read_virtual(&self, gva: u64, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let page = self.walker.page_size();
        let mut va = gva;
        let mut remaining = size;
        while remaining > 0 {
            let mut pa = self.walker.translate(va);
            if pa == 0 {
                if let Some(monitor) = &self.monitor {
                    pa = monitor.translate_gva(0, va, None).unwrap_or(0);
                }
            }
            if pa == 0 {
                return Err(Error::Unmapped {
                    addr: va,
                    space: "guest-virtual",
                });
            }
            let chunk = remaining.min((page - (va & (page - 1))) as usize);
            out.extend_from_slice(&self.read_physical(pa, chunk)?);
            va += chunk as u64;
            remaining -= chunk;
        }
        Ok(out)
    }

    fn read_crunched(&mut self, crunched: u64, size: usize) -> Result<Vec<u8>> {
        // Crunched addresses resolve through the most recently focused
        // catalog; with exactly one catalog installed, that one.
        let catalog = match self.crunched.len() {
            0 => return Err(Error::NotConfigured("no crunched catalog built")),
            1 => self.crunched.values().next().unwrap().clone(),
            _ => {
                return Err(Error::NotConfigured(
                    "multiple crunched catalogs; read via v:PID: instead",
                ))
            }
        };
        self.focus_process(catalog.pid() as u64)?;

        let mut out = Vec::with_capacity(size);
        let mut cursor = crunched;
        let mut remaining = size;
        while remaining > 0 {
            let va = catalog.to_virtual(cursor).ok_or(Error::Unmapped {
                addr: cursor,
                space: "crunched",
            })?;
            let run = catalog.contiguous_remaining(cursor).min(remaining as u64) as usize;
            out.extend_from_slice(&self.read_virtual(va, run)?);
            cursor += run as u64;
            remaining -= run;
        }
        Ok(out)
    }

    /// Serializes the current engine view (regions, processes, beacon
    /// sessions) as pretty JSON for offline inspection.
    pub fn export_snapshot(&self) -> String {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            taken_at: String,
            arch: &'a str,
            mapped_bytes: u64,
            regions: &'a [crate::region::RamRegion],
            processes: Vec<&'a ProcessRecord>,
            beacon_sessions: Vec<u32>,
        }
        let mut processes: Vec<&ProcessRecord> = self.processes.values().collect();
        processes.sort_by_key(|p| p.pid);
        let snapshot = Snapshot {
            taken_at: Utc::now().to_rfc3339(),
            arch: &self.arch,
            mapped_bytes: self.backend.mapped_size(),
            regions: self.backend.region_map().regions(),
            processes,
            beacon_sessions: self.reader.sessions(),
        };
        serde_json::to_string_pretty(&snapshot)
            .unwrap_or_else(|_| json!({"error": "snapshot serialization failed"}).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sparse_backend_full;
    use crate::walker::PAGE_SIZE;
    use pretty_assertions::assert_eq;
    use vmscope_protocol::SectionEntry;

    /// Identity translator so virtual reads hit the fixture directly.
    struct IdentityWalker;

    impl PageWalker for IdentityWalker {
        fn set_page_table_base(&mut self, _primary: u64, _secondary: u64) {}
        fn translate(&self, gva: u64) -> u64 {
            gva
        }
        fn arch_name(&self) -> &'static str {
            "test"
        }
    }

    fn session_over(bytes: &[(u64, &[u8])]) -> (Session, tempfile::NamedTempFile) {
        // Unmapped-backend creation must fail first; then map for real.
        let (backend, file) = {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.as_file().set_len(0x10_0000).unwrap();
            use std::io::{Seek, SeekFrom, Write};
            for (off, data) in bytes {
                file.as_file_mut().seek(SeekFrom::Start(*off)).unwrap();
                file.as_file_mut().write_all(data).unwrap();
            }
            let mut backend = MemoryBackend::new();
            backend.map_file(file.path()).unwrap();
            (backend, file)
        };
        let session = Session::create(backend, None, Some("aarch64")).unwrap();
        (session, file)
    }

    #[test]
    fn create_requires_a_mapping() {
        assert!(matches!(
            Session::create(MemoryBackend::new(), None, Some("aarch64")),
            Err(Error::NotConfigured(_))
        ));
    }

    #[test]
    fn fallback_region_covers_the_file() {
        let (session, _f) = session_over(&[]);
        let map = session.backend().region_map();
        assert_eq!(map.regions().len(), 1);
        assert_eq!(map.regions()[0].gpa_start, DEFAULT_ARM64_RAM_BASE);
        assert_eq!(map.total_size(), 0x10_0000);
    }

    #[test]
    fn shared_and_physical_reads_route_correctly() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let (mut session, _f) = session_over(&[(0x2000, &payload)]);

        let shared = session
            .read_with_fallback(&TypedAddress::shared(0x2000), 4)
            .unwrap();
        assert_eq!(shared, payload);

        let phys = session
            .read_with_fallback(&TypedAddress::physical(DEFAULT_ARM64_RAM_BASE + 0x2000), 4)
            .unwrap();
        assert_eq!(phys, payload);

        // Uncovered physical address, no monitor to escalate to.
        assert!(session
            .read_with_fallback(&TypedAddress::physical(0x1000), 4)
            .is_err());
        // Shared offset past the mapping.
        assert!(session
            .read_with_fallback(&TypedAddress::shared(0x20_0000), 4)
            .is_err());
        // Spaceless addresses are unreadable by construction.
        assert!(session
            .read_with_fallback(&TypedAddress::unspaced(0x2000), 4)
            .is_err());
    }

    #[test]
    fn crunched_reads_stitch_regions_together() {
        // Two distant virtual pages that are adjacent in crunched space.
        let a = [0x11u8; 16];
        let b = [0x22u8; 16];
        let (mut session, _f) = session_over(&[
            (0x3000, &a),
            (0x5000, &b),
        ]);
        session.set_page_walker(Box::new(IdentityWalker));

        // The identity walker maps GVA==GPA, so point the sections at GPAs
        // the fallback region covers.
        let base = DEFAULT_ARM64_RAM_BASE;
        let sections = vec![
            SectionEntry {
                pid: 742,
                start_addr: base + 0x3000,
                end_addr: base + 0x3000 + PAGE_SIZE,
                ..Default::default()
            },
            SectionEntry {
                pid: 742,
                start_addr: base + 0x5000,
                end_addr: base + 0x5000 + PAGE_SIZE,
                ..Default::default()
            },
        ];
        session.set_crunched_catalog(CrunchedCatalog::from_sections(742, &sections));
        // Focus requires a process snapshot; inject one.
        session.processes.insert(
            742,
            ProcessRecord {
                pid: 742,
                page_table_base: 0x4567_8000,
                ..Default::default()
            },
        );

        // A read spanning the end of region 0 and the start of region 1.
        let out = session
            .read_with_fallback(
                &TypedAddress::crunched(PAGE_SIZE - 8),
                16,
            )
            .unwrap();
        assert_eq!(&out[..8], &[0u8; 8]); // tail of page 0x3000 (zeros)
        assert_eq!(&out[8..], &b[..8]); // head of page 0x5000

        // Offsets past the catalog are unmapped.
        assert!(session
            .read_with_fallback(&TypedAddress::crunched(2 * PAGE_SIZE), 1)
            .is_err());
    }

    #[test]
    fn snapshot_export_is_valid_json() {
        let (session, _f) = session_over(&[]);
        let snapshot = session.export_snapshot();
        let parsed: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(parsed["arch"], "aarch64");
        assert_eq!(parsed["mapped_bytes"], 0x10_0000);
    }
}
