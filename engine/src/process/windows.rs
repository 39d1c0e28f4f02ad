//! Windows process walker.
//!
//! Interface only: the record shape and offsets model are real so the
//! abstraction boundary accommodates a Windows guest, but no offset
//! registry ships yet — initialization reports `OffsetsUnknown` until a
//! layout is pinned by the caller.

use std::sync::Arc;

use crate::backend::MemoryBackend;
use crate::error::{Error, Result};
use crate::process::{ProcessRecord, ProcessWalker};
use crate::walker::PageWalker;

/// Byte offsets into `EPROCESS` for one Windows build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowsKernelOffsets {
    pub unique_process_id: u64,
    pub image_file_name: u64,
    pub active_process_links: u64,
    pub directory_table_base: u64,
    pub peb: u64,
}

pub struct WindowsProcessWalker {
    #[allow(dead_code)]
    backend: Arc<MemoryBackend>,
    #[allow(dead_code)]
    translator: Box<dyn PageWalker>,
    offsets: Option<WindowsKernelOffsets>,
    initialized: bool,
}

impl WindowsProcessWalker {
    pub fn new(backend: Arc<MemoryBackend>, translator: Box<dyn PageWalker>) -> Self {
        WindowsProcessWalker {
            backend,
            translator,
            offsets: None,
            initialized: false,
        }
    }

    pub fn set_offsets(&mut self, offsets: WindowsKernelOffsets) {
        self.offsets = Some(offsets);
    }

    pub fn offsets(&self) -> Option<&WindowsKernelOffsets> {
        self.offsets.as_ref()
    }
}

impl ProcessWalker for WindowsProcessWalker {
    fn initialize(&mut self) -> Result<()> {
        // No offset registry for Windows builds yet; detection has nothing
        // to validate against.
        if self.offsets.is_none() {
            return Err(Error::OffsetsUnknown);
        }
        self.initialized = true;
        Ok(())
    }

    fn enumerate_processes(&mut self) -> Result<Vec<ProcessRecord>> {
        if !self.initialized {
            return Err(Error::NotConfigured("windows walker not initialized"));
        }
        // ActiveProcessLinks traversal lands here once an offset registry
        // exists to validate against.
        Err(Error::OffsetsUnknown)
    }

    fn os_name(&self) -> &'static str {
        "Windows"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sparse_backend;
    use crate::walker::Arm64PageWalker;

    #[test]
    fn refuses_until_offsets_are_pinned() {
        let (backend, _f) = sparse_backend(0x1000, 0, &[]);
        let translator = Box::new(Arm64PageWalker::new(backend.clone()));
        let mut walker = WindowsProcessWalker::new(backend, translator);
        assert!(matches!(walker.initialize(), Err(Error::OffsetsUnknown)));
        assert!(matches!(
            walker.enumerate_processes(),
            Err(Error::NotConfigured(_))
        ));

        walker.set_offsets(WindowsKernelOffsets {
            unique_process_id: 0x440,
            image_file_name: 0x5A8,
            active_process_links: 0x448,
            directory_table_base: 0x28,
            peb: 0x550,
        });
        walker.initialize().unwrap();
        assert_eq!(walker.os_name(), "Windows");
    }
}
