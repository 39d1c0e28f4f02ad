//! x86-64 page-table walker: 4 KiB pages, 48-bit VA over four levels, with
//! an explicit opt-in for 57-bit five-level paging.

use std::sync::Arc;

use log::debug;

use crate::backend::MemoryBackend;
use crate::walker::{PageWalker, PAGE_SIZE};

const PTE_PRESENT: u64 = 1 << 0;
/// Page-size bit: a 1 GiB leaf at the PDPT level, 2 MiB at the PD level.
const PTE_PSE: u64 = 1 << 7;

const PML5_SHIFT: u32 = 48;
const PML4_SHIFT: u32 = 39;
const PDPT_SHIFT: u32 = 30;
const PD_SHIFT: u32 = 21;
const PT_SHIFT: u32 = 12;
const TABLE_MASK: u64 = 0x1FF;

/// Physical-address bits 12..51; higher bits carry attributes (NX at 63).
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const LEAF_1G_ADDR_MASK: u64 = 0x000F_FFFF_C000_0000;
const LEAF_2M_ADDR_MASK: u64 = 0x000F_FFFF_FFE0_0000;

pub struct X86_64PageWalker {
    backend: Arc<MemoryBackend>,
    cr3: u64,
    five_level: bool,
}

impl X86_64PageWalker {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        X86_64PageWalker {
            backend,
            cr3: 0,
            five_level: false,
        }
    }

    /// Enables LA57 five-level walks. There is no reliable way to detect
    /// this from the memory file alone, so it is caller opt-in.
    pub fn set_five_level(&mut self, enabled: bool) {
        self.five_level = enabled;
    }

    pub fn five_level(&self) -> bool {
        self.five_level
    }

    fn entry(&self, table: u64, index: u64) -> Option<u64> {
        self.backend.read_phys_u64(table + index * 8)
    }

    /// The PML4-and-down portion shared by both paging modes.
    fn walk_from_pml4(&self, pml4_base: u64, va: u64) -> u64 {
        let pml4e = match self.entry(pml4_base, (va >> PML4_SHIFT) & TABLE_MASK) {
            Some(e) if e & PTE_PRESENT != 0 => e,
            _ => return 0,
        };

        let pdpte = match self.entry(pml4e & PTE_ADDR_MASK, (va >> PDPT_SHIFT) & TABLE_MASK) {
            Some(e) if e & PTE_PRESENT != 0 => e,
            _ => return 0,
        };
        if pdpte & PTE_PSE != 0 {
            return (pdpte & LEAF_1G_ADDR_MASK) | (va & 0x3FFF_FFFF);
        }

        let pde = match self.entry(pdpte & PTE_ADDR_MASK, (va >> PD_SHIFT) & TABLE_MASK) {
            Some(e) if e & PTE_PRESENT != 0 => e,
            _ => return 0,
        };
        if pde & PTE_PSE != 0 {
            return (pde & LEAF_2M_ADDR_MASK) | (va & 0x1F_FFFF);
        }

        let pte = match self.entry(pde & PTE_ADDR_MASK, (va >> PT_SHIFT) & TABLE_MASK) {
            Some(e) if e & PTE_PRESENT != 0 => e,
            _ => return 0,
        };
        (pte & PTE_ADDR_MASK) | (va & (PAGE_SIZE - 1))
    }
}

impl PageWalker for X86_64PageWalker {
    fn set_page_table_base(&mut self, primary: u64, _secondary: u64) {
        // CR3 carries flags in the low 12 bits.
        self.cr3 = primary & !0xFFFu64;
        debug!("x86-64 walker root: cr3={:#x}", self.cr3);
    }

    fn translate(&self, gva: u64) -> u64 {
        if self.cr3 == 0 {
            return 0;
        }
        if self.five_level {
            let pml5e = match self.entry(self.cr3, (gva >> PML5_SHIFT) & TABLE_MASK) {
                Some(e) if e & PTE_PRESENT != 0 => e,
                _ => return 0,
            };
            self.walk_from_pml4(pml5e & PTE_ADDR_MASK, gva)
        } else {
            self.walk_from_pml4(self.cr3, gva)
        }
    }

    fn arch_name(&self) -> &'static str {
        "x86-64"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sparse_backend;
    use pretty_assertions::assert_eq;

    // Identity region: GPA == file offset.
    fn fixture_4level() -> Vec<(u64, u64)> {
        vec![
            (0x10_0000, 0x10_1003), // PML4[0] -> 0x101000
            (0x10_1000, 0x10_2003), // PDPT[0] -> 0x102000
            (0x10_2000, 0x10_3003), // PD[0]   -> 0x103000
            (0x10_3000, 0x50_0003), // PT[0]   -> page 0x500000
        ]
    }

    #[test]
    fn four_level_walk() {
        let (backend, _f) = sparse_backend(0x100_0000, 0, &fixture_4level());
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x10_0FFF, 0); // low flag bits are cleared
        assert_eq!(walker.translate(0x456), 0x50_0456);
    }

    #[test]
    fn non_present_entry_is_unmapped() {
        let writes = vec![
            (0x10_0000, 0x10_1003),
            (0x10_1000, 0x10_2002), // present bit clear
        ];
        let (backend, _f) = sparse_backend(0x100_0000, 0, &writes);
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x10_0000, 0);
        assert_eq!(walker.translate(0x456), 0);
        assert_eq!(walker.translate(0xFFFF_FFFF_FFFF_F000), 0);
    }

    #[test]
    fn two_mib_leaf_via_pse() {
        let writes = vec![
            (0x10_0000, 0x10_1003),
            (0x10_1000, 0x10_2003),
            (0x10_2008, 0x0060_0083), // PD[1]: present + PSE, 2 MiB at 0x600000
        ];
        let (backend, _f) = sparse_backend(0x100_0000, 0, &writes);
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x10_0000, 0);
        assert_eq!(walker.translate(0x20_0789), 0x60_0789);
    }

    #[test]
    fn one_gib_leaf_via_pse() {
        let writes = vec![
            (0x10_0000, 0x10_1003),
            (0x10_1000, 0x4000_0083), // PDPT[0]: present + PSE, 1 GiB at 0x4000_0000
        ];
        let (backend, _f) = sparse_backend(0x100_0000, 0, &writes);
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x10_0000, 0);
        assert_eq!(walker.translate(0x0FFF_FABC), 0x4FFF_FABC);
    }

    #[test]
    fn five_level_walk_prepends_pml5() {
        let mut writes = fixture_4level();
        // PML5[0] points at what the 4-level fixture uses as its PML4.
        writes.push((0x20_0000, 0x10_0003));
        let (backend, _f) = sparse_backend(0x100_0000, 0, &writes);
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x20_0000, 0);
        walker.set_five_level(true);
        assert_eq!(walker.translate(0x456), 0x50_0456);
        // Without the opt-in the same root is misread as a PML4 and the walk
        // lands somewhere else entirely.
        walker.set_five_level(false);
        assert_ne!(walker.translate(0x456), 0x50_0456);
    }

    #[test]
    fn nx_and_attribute_bits_are_masked() {
        let writes = vec![
            (0x10_0000, 0x10_1003 | (1 << 63)), // NX set on the way down
            (0x10_1000, 0x10_2003),
            (0x10_2000, 0x10_3003),
            (0x10_3000, 0x50_0003 | (1 << 63)),
        ];
        let (backend, _f) = sparse_backend(0x100_0000, 0, &writes);
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x10_0000, 0);
        assert_eq!(walker.translate(0x456), 0x50_0456);
    }

    #[test]
    fn page_alignment_invariant() {
        let (backend, _f) = sparse_backend(0x100_0000, 0, &fixture_4level());
        let mut walker = X86_64PageWalker::new(backend);
        walker.set_page_table_base(0x10_0000, 0);
        let gva = 0xABCu64;
        let pa = walker.translate(gva);
        assert_ne!(pa, 0);
        assert_eq!(walker.translate(gva & !0xFFF) & 0xFFF, 0);
        assert_eq!(pa, walker.translate(gva & !0xFFF) | (gva & 0xFFF));
    }
}
