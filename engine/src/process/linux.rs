//! Linux task-list walker.
//!
//! The kernel keeps every task on a circular doubly linked list threaded
//! through the task structure. Field offsets move between kernel builds, so
//! a registry of known layouts is validated against the guest and the first
//! self-consistent one wins; the chosen layout lives in this walker, never
//! in shared state.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};
use crate::monitor::MonitorClient;
use crate::process::{ProcessRecord, ProcessWalker, MAX_PROCESSES, TASK_COMM_LEN};
use crate::walker::{PageWalker, PAGE_SIZE};

/// Byte offsets into the task structure and memory descriptor for one
/// kernel build family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOffsets {
    pub label: &'static str,
    pub pid: u64,
    pub comm: u64,
    pub tasks_next: u64,
    pub tasks_prev: u64,
    pub mm: u64,
    pub parent: u64,
    /// Offset of the page-table root inside the memory descriptor.
    pub mm_pgd: u64,
}

/// Layouts observed on common kernel minor versions. Detection accepts the
/// first entry that validates against the candidate root task.
pub const KNOWN_OFFSETS: &[KernelOffsets] = &[
    KernelOffsets {
        label: "linux-5.15-arm64",
        pid: 0x4E8,
        comm: 0x738,
        tasks_next: 0x3A0,
        tasks_prev: 0x3A8,
        mm: 0x520,
        parent: 0x2E8,
        mm_pgd: 0x48,
    },
    KernelOffsets {
        label: "linux-5.15-arm64-alt",
        pid: 0x4E0,
        comm: 0x730,
        tasks_next: 0x398,
        tasks_prev: 0x3A0,
        mm: 0x518,
        parent: 0x2E0,
        mm_pgd: 0x48,
    },
    KernelOffsets {
        label: "linux-5.10-arm64",
        pid: 0x398,
        comm: 0x5C8,
        tasks_next: 0x2E0,
        tasks_prev: 0x2E8,
        mm: 0x3F0,
        parent: 0x250,
        mm_pgd: 0x48,
    },
    KernelOffsets {
        label: "linux-5.4-arm64",
        pid: 0x3A0,
        comm: 0x5D0,
        tasks_next: 0x2E8,
        tasks_prev: 0x2F0,
        mm: 0x3F8,
        parent: 0x258,
        mm_pgd: 0x48,
    },
    KernelOffsets {
        label: "linux-5.x-x86_64",
        pid: 0x398,
        comm: 0x5E0,
        tasks_next: 0x2F0,
        tasks_prev: 0x2F8,
        mm: 0x400,
        parent: 0x260,
        mm_pgd: 0x50,
    },
];

/// Everything below this is not a kernel address on either architecture we
/// decode.
const KERNEL_SPACE_FLOOR: u64 = 0xFFFF_0000_0000_0000;

/// Root-task addresses seen on common ARM64 kernel builds, probed before
/// resorting to a scan.
const COMMON_ROOT_TASK_ADDRS: &[u64] = &[
    0xFFFF_8000_11C1_0000,
    0xFFFF_8000_11A1_0000,
    0xFFFF_8000_1181_0000,
    0xFFFF_0000_11C1_0000,
];

/// Kernel data ranges scanned for the idle task as a last resort.
const SWAPPER_SCAN_RANGES: &[(u64, u64)] = &[
    (0xFFFF_0000_1000_0000, 0xFFFF_0000_1200_0000),
    (0xFFFF_8000_1000_0000, 0xFFFF_8000_1200_0000),
];

/// Sub-page stride when scanning for task structures.
const SCAN_STRIDE: u64 = 0x100;

pub struct LinuxProcessWalker {
    backend: Arc<MemoryBackend>,
    translator: Box<dyn PageWalker>,
    monitor: Option<Arc<MonitorClient>>,
    offsets: KernelOffsets,
    offsets_detected: bool,
    root_task: u64,
    kernel_version: Option<String>,
}

impl LinuxProcessWalker {
    pub fn new(
        backend: Arc<MemoryBackend>,
        translator: Box<dyn PageWalker>,
        monitor: Option<Arc<MonitorClient>>,
    ) -> Self {
        LinuxProcessWalker {
            backend,
            translator,
            monitor,
            offsets: KNOWN_OFFSETS[0],
            offsets_detected: false,
            root_task: 0,
            kernel_version: None,
        }
    }

    /// Installs the kernel translation root on the page walker.
    pub fn set_kernel_root(&mut self, root: u64) {
        self.translator.set_page_table_base(root, root);
    }

    /// Pins a known offset layout, skipping detection.
    pub fn set_offsets(&mut self, offsets: KernelOffsets) {
        self.offsets = offsets;
        self.offsets_detected = true;
    }

    pub fn offsets(&self) -> &KernelOffsets {
        &self.offsets
    }

    /// Pins the root task, for callers that already know it.
    pub fn set_root_task(&mut self, gva: u64) {
        self.root_task = gva;
    }

    pub fn root_task(&self) -> u64 {
        self.root_task
    }

    fn read_virt(&self, gva: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut va = gva;
        let mut remaining = len;
        while remaining > 0 {
            let mut pa = self.translator.translate(va);
            if pa == 0 {
                if let Some(monitor) = &self.monitor {
                    pa = monitor.translate_gva(0, va, None).unwrap_or(0);
                }
            }
            if pa == 0 {
                return None;
            }
            let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
            let chunk = remaining.min(in_page);
            let bytes = self.backend.read_phys(pa, chunk).ok()?;
            if bytes.len() != chunk {
                return None;
            }
            out.extend_from_slice(&bytes);
            va += chunk as u64;
            remaining -= chunk;
        }
        Some(out)
    }

    fn read_u32_virt(&self, gva: u64) -> Option<u32> {
        let b = self.read_virt(gva, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64_virt(&self, gva: u64) -> Option<u64> {
        let b = self.read_virt(gva, 8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&b);
        Some(u64::from_le_bytes(arr))
    }

    fn read_comm(&self, gva: u64) -> Option<String> {
        let bytes = self.read_virt(gva, TASK_COMM_LEN)?;
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_COMM_LEN);
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Whether `addr` decodes as a plausible task structure under `offsets`.
    fn validate_task_with(&self, offsets: &KernelOffsets, addr: u64) -> bool {
        if addr < KERNEL_SPACE_FLOOR {
            return false;
        }
        let Some(pid) = self.read_u32_virt(addr + offsets.pid) else {
            return false;
        };
        if pid > 65_535 {
            return false;
        }
        let Some(comm) = self.read_virt(addr + offsets.comm, TASK_COMM_LEN) else {
            return false;
        };
        let mut printable = 0usize;
        let mut terminated = false;
        for &b in &comm {
            if b == 0 {
                terminated = true;
                break;
            }
            if !(32..127).contains(&b) {
                return false;
            }
            printable += 1;
        }
        terminated && printable > 0
    }

    fn validate_task(&self, addr: u64) -> bool {
        self.validate_task_with(&self.offsets, addr)
    }

    /// Full root validation: the structure itself plus one hop along the
    /// list (the back-adjusted `tasks.next` must also look like a task).
    fn validate_root_with(&self, offsets: &KernelOffsets, addr: u64) -> bool {
        if !self.validate_task_with(offsets, addr) {
            return false;
        }
        let Some(next_ptr) = self.read_u64_virt(addr + offsets.tasks_next) else {
            return false;
        };
        let next_task = next_ptr.wrapping_sub(offsets.tasks_next);
        self.validate_task_with(offsets, next_task)
    }

    /// Looks for a root task that is self-consistent under `offsets`.
    /// Strategy order: monitor "current task", historically common
    /// addresses, idle-task scan.
    fn find_root_with(&mut self, offsets: &KernelOffsets) -> Option<u64> {
        if let Some(monitor) = self.monitor.clone() {
            match monitor.query_kernel_task(0) {
                Ok((task, root)) => {
                    debug!("monitor reports current task {task:#x}, root {root:#x}");
                    self.translator.set_page_table_base(root, root);
                    if self.validate_root_with(offsets, task) {
                        return Some(task);
                    }
                }
                Err(e) => debug!("monitor kernel-task query unavailable: {e}"),
            }
        }

        for &addr in COMMON_ROOT_TASK_ADDRS {
            if self.validate_root_with(offsets, addr) {
                return Some(addr);
            }
        }

        self.scan_for_swapper(offsets)
            .filter(|&addr| self.validate_root_with(offsets, addr))
    }

    /// Scans kernel data for a structure with `pid == 0` and a command name
    /// beginning with `swapper` (the idle task). Reads a two-page window per
    /// step so candidates straddling a page boundary still decode.
    fn scan_for_swapper(&self, offsets: &KernelOffsets) -> Option<u64> {
        let page = PAGE_SIZE as usize;
        let need = (offsets.pid.max(offsets.comm) + TASK_COMM_LEN as u64) as usize;
        for &(start, end) in SWAPPER_SCAN_RANGES {
            let mut va = start;
            while va < end {
                let window = self
                    .read_virt(va, 2 * page)
                    .or_else(|| self.read_virt(va, page));
                if let Some(window) = window {
                    let mut sub = 0usize;
                    while sub < page {
                        if sub + need <= window.len() {
                            let pid_off = sub + offsets.pid as usize;
                            let pid = u32::from_le_bytes([
                                window[pid_off],
                                window[pid_off + 1],
                                window[pid_off + 2],
                                window[pid_off + 3],
                            ]);
                            let comm_off = sub + offsets.comm as usize;
                            if pid == 0 && window[comm_off..].starts_with(b"swapper") {
                                let addr = va + sub as u64;
                                debug!("idle task candidate at {addr:#x}");
                                return Some(addr);
                            }
                        }
                        sub += SCAN_STRIDE as usize;
                    }
                }
                va += PAGE_SIZE;
            }
        }
        None
    }

    /// Runs the registry against candidate roots; stores the first layout
    /// and root that are self-consistent.
    pub fn auto_detect_offsets(&mut self) -> Result<()> {
        for offsets in KNOWN_OFFSETS {
            if let Some(root) = self.find_root_with(offsets) {
                info!(
                    "kernel offsets detected: {} (pid={:#x} comm={:#x}), root task {root:#x}",
                    offsets.label, offsets.pid, offsets.comm
                );
                self.offsets = *offsets;
                self.offsets_detected = true;
                self.root_task = root;
                return Ok(());
            }
        }
        Err(Error::OffsetsUnknown)
    }

    fn read_record(&self, task: u64) -> Option<ProcessRecord> {
        let offsets = &self.offsets;
        let mut record = ProcessRecord {
            task_struct_addr: task,
            pid: self.read_u32_virt(task + offsets.pid)? as u64,
            name: self.read_comm(task + offsets.comm)?,
            ..Default::default()
        };
        record.mm_struct_addr = self.read_u64_virt(task + offsets.mm).unwrap_or(0);
        if record.mm_struct_addr != 0 {
            // The root may fail to dereference; that degrades the record to
            // a kernel-thread shape rather than failing the walk.
            record.page_table_base = self
                .read_u64_virt(record.mm_struct_addr + offsets.mm_pgd)
                .unwrap_or(0);
        }
        if let Some(parent) = self.read_u64_virt(task + offsets.parent) {
            if parent != 0 {
                record.parent_pid = self.read_u32_virt(parent + offsets.pid).unwrap_or(0) as u64;
            }
        }
        Some(record)
    }
}

impl ProcessWalker for LinuxProcessWalker {
    fn initialize(&mut self) -> Result<()> {
        if !self.offsets_detected {
            self.auto_detect_offsets()?;
        }
        if self.root_task == 0 {
            let offsets = self.offsets;
            self.root_task = self
                .find_root_with(&offsets)
                .ok_or(Error::OffsetsUnknown)?;
        }
        info!("root task at {:#x} ({})", self.root_task, self.offsets.label);
        Ok(())
    }

    fn enumerate_processes(&mut self) -> Result<Vec<ProcessRecord>> {
        if self.root_task == 0 {
            return Err(Error::NotConfigured("process walker not initialized"));
        }

        let mut records = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.root_task;

        while records.len() < MAX_PROCESSES {
            if !visited.insert(current) {
                debug!("task list loops back to {current:#x}; stopping");
                break;
            }
            match self.read_record(current) {
                Some(record) => records.push(record),
                None => {
                    warn!("unreadable task at {current:#x}; truncating walk");
                    break;
                }
            }

            let Some(next_ptr) = self.read_u64_virt(current + self.offsets.tasks_next) else {
                break;
            };
            let next = next_ptr.wrapping_sub(self.offsets.tasks_next);
            if next == self.root_task {
                break;
            }
            if !self.validate_task(next) {
                warn!("invalid next task {next:#x}; truncating walk");
                break;
            }
            current = next;
        }

        debug!("enumerated {} processes", records.len());
        Ok(records)
    }

    fn os_name(&self) -> &'static str {
        "Linux"
    }

    fn kernel_version(&self) -> String {
        self.kernel_version
            .clone()
            .unwrap_or_else(|| "Linux (version unknown)".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sparse_backend_full;
    use pretty_assertions::assert_eq;

    /// Maps kernel VAs to GPAs by stripping the upper half; stands in for a
    /// rooted hardware walker.
    struct StripTranslator;

    impl PageWalker for StripTranslator {
        fn set_page_table_base(&mut self, _primary: u64, _secondary: u64) {}
        fn translate(&self, gva: u64) -> u64 {
            if gva < KERNEL_SPACE_FLOOR {
                return 0;
            }
            gva & 0xFFFF_FFFF
        }
        fn arch_name(&self) -> &'static str {
            "test"
        }
    }

    const OFFSETS: KernelOffsets = KNOWN_OFFSETS[2]; // linux-5.10-arm64

    const SWAPPER: u64 = 0xFFFF_8000_11C1_0000;
    const INIT: u64 = 0xFFFF_8000_11C1_4000;
    const SSHD: u64 = 0xFFFF_8000_11C1_8000;
    const INIT_MM: u64 = 0xFFFF_8000_1180_0000;
    const INIT_PGD: u64 = 0x4567_8000;

    /// Where a kernel VA lands in the fixture file under the strip mapping.
    fn pa(va: u64) -> u64 {
        va & 0xFFFF_FFFF
    }

    fn task_words(task: u64, pid: u64, mm: u64, parent: u64, next: u64) -> Vec<(u64, u64)> {
        // Keys are file positions (stripped); pointer VALUES stay full VAs.
        vec![
            (pa(task) + OFFSETS.pid, pid),
            (pa(task) + OFFSETS.mm, mm),
            (pa(task) + OFFSETS.parent, parent),
            (pa(task) + OFFSETS.tasks_next, next + OFFSETS.tasks_next),
            (pa(task) + OFFSETS.tasks_prev, task + OFFSETS.tasks_prev),
        ]
    }

    fn fixture_walker() -> (LinuxProcessWalker, tempfile::NamedTempFile) {
        let mut words = Vec::new();
        words.extend(task_words(SWAPPER, 0, 0, SWAPPER, INIT));
        words.extend(task_words(INIT, 1, INIT_MM, SWAPPER, SSHD));
        words.extend(task_words(SSHD, 742, 0, INIT, SWAPPER));
        words.push((pa(INIT_MM) + OFFSETS.mm_pgd, INIT_PGD));

        let comms: Vec<(u64, &[u8])> = vec![
            (pa(SWAPPER) + OFFSETS.comm, b"swapper/0\0"),
            (pa(INIT) + OFFSETS.comm, b"systemd\0"),
            (pa(SSHD) + OFFSETS.comm, b"sshd\0"),
        ];

        let (backend, file) = sparse_backend_full(0x1200_0000, 0, &words, &comms);
        let walker = LinuxProcessWalker::new(backend, Box::new(StripTranslator), None);
        (walker, file)
    }

    #[test]
    fn auto_detects_offsets_and_root() {
        let (mut walker, _f) = fixture_walker();
        walker.initialize().unwrap();
        assert_eq!(walker.offsets().label, "linux-5.10-arm64");
        assert_eq!(walker.root_task(), SWAPPER);
    }

    #[test]
    fn enumerates_the_task_ring() {
        let (mut walker, _f) = fixture_walker();
        walker.initialize().unwrap();
        let procs = walker.enumerate_processes().unwrap();

        assert_eq!(procs.len(), 3);
        assert_eq!(procs[0].pid, 0);
        assert!(procs[0].name.starts_with("swapper"));
        assert!(procs[0].is_kernel_thread());

        assert_eq!(procs[1].pid, 1);
        assert_eq!(procs[1].name, "systemd");
        assert_eq!(procs[1].page_table_base, INIT_PGD);
        assert_eq!(procs[1].parent_pid, 0);

        assert_eq!(procs[2].pid, 742);
        assert_eq!(procs[2].parent_pid, 1);

        // No duplicate task addresses.
        let mut addrs: Vec<u64> = procs.iter().map(|p| p.task_struct_addr).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), procs.len());
    }

    #[test]
    fn find_helpers_filter_enumeration() {
        let (mut walker, _f) = fixture_walker();
        walker.initialize().unwrap();
        assert_eq!(walker.find_process(742).unwrap().unwrap().name, "sshd");
        assert!(walker.find_process(9999).unwrap().is_none());
        let byname = walker.find_processes_by_name("s").unwrap();
        assert_eq!(byname.len(), 3); // swapper, systemd, sshd
    }

    #[test]
    fn loop_guard_terminates_corrupt_ring() {
        // init's next points back at itself rather than closing the ring.
        let mut words = Vec::new();
        words.extend(task_words(SWAPPER, 0, 0, SWAPPER, INIT));
        words.extend(task_words(INIT, 1, 0, SWAPPER, INIT));
        let comms: Vec<(u64, &[u8])> = vec![
            (pa(SWAPPER) + OFFSETS.comm, b"swapper/0\0"),
            (pa(INIT) + OFFSETS.comm, b"systemd\0"),
        ];
        let (backend, _f) = sparse_backend_full(0x1200_0000, 0, &words, &comms);
        let mut walker = LinuxProcessWalker::new(backend, Box::new(StripTranslator), None);
        walker.set_offsets(OFFSETS);
        walker.set_root_task(SWAPPER);
        walker.initialize().unwrap();

        let procs = walker.enumerate_processes().unwrap();
        assert_eq!(procs.len(), 2);
    }

    #[test]
    fn uninitialized_walker_refuses_to_walk() {
        let (mut walker, _f) = fixture_walker();
        assert!(matches!(
            walker.enumerate_processes(),
            Err(Error::NotConfigured(_))
        ));
    }

    #[test]
    fn detection_fails_cleanly_without_a_guest() {
        let (backend, _f) = sparse_backend_full(0x1200_0000, 0, &[], &[]);
        let mut walker = LinuxProcessWalker::new(backend, Box::new(StripTranslator), None);
        assert!(matches!(walker.initialize(), Err(Error::OffsetsUnknown)));
    }
}
