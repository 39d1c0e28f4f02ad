//! OS abstraction for process enumeration.
//!
//! A process walker consumes the memory backend and a page walker and
//! reconstructs the guest's process list from kernel structures, with no
//! cooperation from the guest.

pub mod linux;
pub mod windows;

use std::sync::Arc;

use serde::Serialize;

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};
use crate::monitor::MonitorClient;
use crate::walker::PageWalker;

pub use linux::{KernelOffsets, LinuxProcessWalker, KNOWN_OFFSETS};
pub use windows::{WindowsKernelOffsets, WindowsProcessWalker};

/// Hard cap on a task-list walk; bounds cost against corrupt lists.
pub const MAX_PROCESSES: usize = 10_000;

/// Kernel command-name field width.
pub const TASK_COMM_LEN: usize = 16;

/// One guest process as reconstructed from kernel memory.
///
/// The two `*_addr` fields past `page_table_base` are opaque OS-specific
/// carriers so a Windows walker can populate the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ProcessRecord {
    pub pid: u64,
    pub parent_pid: u64,
    /// Command name, at most [`TASK_COMM_LEN`] bytes.
    pub name: String,
    /// GVA of the kernel task structure.
    pub task_struct_addr: u64,
    /// GVA of the memory descriptor; 0 for kernel threads.
    pub mm_struct_addr: u64,
    /// Page-table root; 0 marks a kernel thread (no address space).
    pub page_table_base: u64,
    pub thread_count: u64,
    pub virtual_size: u64,
    pub eprocess_addr: u64,
    pub peb_addr: u64,
}

impl ProcessRecord {
    pub fn is_kernel_thread(&self) -> bool {
        self.page_table_base == 0
    }
}

pub trait ProcessWalker {
    /// Locates and validates the kernel's root task.
    fn initialize(&mut self) -> Result<()>;

    /// Walks the task list from the root. Best-effort: a truncated walk
    /// returns the records gathered so far.
    fn enumerate_processes(&mut self) -> Result<Vec<ProcessRecord>>;

    fn find_process(&mut self, pid: u64) -> Result<Option<ProcessRecord>> {
        Ok(self
            .enumerate_processes()?
            .into_iter()
            .find(|p| p.pid == pid))
    }

    fn find_processes_by_name(&mut self, needle: &str) -> Result<Vec<ProcessRecord>> {
        Ok(self
            .enumerate_processes()?
            .into_iter()
            .filter(|p| p.name.contains(needle))
            .collect())
    }

    fn os_name(&self) -> &'static str;

    fn kernel_version(&self) -> String {
        "unknown".into()
    }
}

/// Builds the walker for a guest OS string.
pub fn create_process_walker(
    os: &str,
    backend: Arc<MemoryBackend>,
    translator: Box<dyn PageWalker>,
    monitor: Option<Arc<MonitorClient>>,
) -> Result<Box<dyn ProcessWalker>> {
    match os.to_ascii_lowercase().as_str() {
        "linux" => Ok(Box::new(LinuxProcessWalker::new(backend, translator, monitor))),
        "windows" => Ok(Box::new(WindowsProcessWalker::new(backend, translator))),
        _ => Err(Error::NotConfigured("unsupported guest OS")),
    }
}
