//! Architecture abstraction for page-table walks.
//!
//! A walker is one capability: install root(s), translate. Concrete
//! variants are selected by [`create_page_walker`] keyed on the detected
//! architecture string; nothing else is architecture-specific.

pub mod arm64;
pub mod x86_64;

use std::sync::Arc;

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};

pub use arm64::Arm64PageWalker;
pub use x86_64::X86_64PageWalker;

pub const PAGE_SIZE: u64 = 4096;

pub trait PageWalker: Send {
    /// Installs the page-table root(s), clearing the low bits so they are
    /// page-aligned. `secondary` applies only to dual-root architectures.
    fn set_page_table_base(&mut self, primary: u64, secondary: u64);

    /// GVA → GPA. Returns 0 when any descriptor on the walk has its
    /// valid/present bit clear or the walk leaves physical memory.
    fn translate(&self, gva: u64) -> u64;

    /// Page-aligned bulk translation: one result per page, 0 for unmapped
    /// entries.
    fn translate_range(&self, start_gva: u64, n_pages: usize) -> Vec<u64> {
        let page = self.page_size();
        let base = start_gva & !(page - 1);
        (0..n_pages as u64)
            .map(|i| self.translate(base + i * page))
            .collect()
    }

    fn page_size(&self) -> u64 {
        PAGE_SIZE
    }

    fn arch_name(&self) -> &'static str;
}

/// Builds the walker for a detected architecture string (as reported by the
/// monitor's target query).
pub fn create_page_walker(arch: &str, backend: Arc<MemoryBackend>) -> Result<Box<dyn PageWalker>> {
    match arch.to_ascii_lowercase().as_str() {
        "aarch64" | "arm64" => Ok(Box::new(Arm64PageWalker::new(backend))),
        "x86_64" | "x86-64" | "x64" | "amd64" => Ok(Box::new(X86_64PageWalker::new(backend))),
        _ => Err(Error::NotConfigured("unsupported guest architecture")),
    }
}
