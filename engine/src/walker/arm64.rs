//! ARM64 page-table walker: 4 KiB granule, 48-bit VA, four levels L0..L3.

use std::sync::Arc;

use log::debug;

use crate::backend::MemoryBackend;
use crate::walker::{PageWalker, PAGE_SIZE};

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 1 << 1;

const L0_SHIFT: u32 = 39;
const L1_SHIFT: u32 = 30;
const L2_SHIFT: u32 = 21;
const L3_SHIFT: u32 = 12;
const TABLE_MASK: u64 = 0x1FF;

const TABLE_ADDR_MASK: u64 = !0xFFFu64;
const LEAF_1G_MASK: u64 = 0x3FFF_FFFF;
const LEAF_2M_MASK: u64 = 0x1F_FFFF;

pub struct Arm64PageWalker {
    backend: Arc<MemoryBackend>,
    ttbr0: u64,
    ttbr1: u64,
}

impl Arm64PageWalker {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Arm64PageWalker {
            backend,
            ttbr0: 0,
            ttbr1: 0,
        }
    }

    fn walk(&self, va: u64, ttbr: u64) -> u64 {
        if ttbr == 0 {
            return 0;
        }

        // L0, bits 47:39
        let l0_index = (va >> L0_SHIFT) & TABLE_MASK;
        let Some(l0) = self.backend.read_phys_u64(ttbr + l0_index * 8) else {
            return 0;
        };
        if l0 & DESC_VALID == 0 {
            return 0;
        }

        // L1, bits 38:30
        let table = l0 & TABLE_ADDR_MASK;
        let l1_index = (va >> L1_SHIFT) & TABLE_MASK;
        let Some(l1) = self.backend.read_phys_u64(table + l1_index * 8) else {
            return 0;
        };
        if l1 & DESC_VALID == 0 {
            return 0;
        }
        if l1 & DESC_TABLE == 0 {
            // 1 GiB block: bits 29:0 from the VA
            return (l1 & !LEAF_1G_MASK & !DESC_VALID) | (va & LEAF_1G_MASK);
        }

        // L2, bits 29:21
        let table = l1 & TABLE_ADDR_MASK;
        let l2_index = (va >> L2_SHIFT) & TABLE_MASK;
        let Some(l2) = self.backend.read_phys_u64(table + l2_index * 8) else {
            return 0;
        };
        if l2 & DESC_VALID == 0 {
            return 0;
        }
        if l2 & DESC_TABLE == 0 {
            // 2 MiB block: bits 20:0 from the VA
            return (l2 & !LEAF_2M_MASK & !DESC_VALID) | (va & LEAF_2M_MASK);
        }

        // L3, bits 20:12 — any valid descriptor here is a 4 KiB page.
        let table = l2 & TABLE_ADDR_MASK;
        let l3_index = (va >> L3_SHIFT) & TABLE_MASK;
        let Some(l3) = self.backend.read_phys_u64(table + l3_index * 8) else {
            return 0;
        };
        if l3 & DESC_VALID == 0 {
            return 0;
        }
        (l3 & TABLE_ADDR_MASK) | (va & (PAGE_SIZE - 1))
    }
}

impl PageWalker for Arm64PageWalker {
    fn set_page_table_base(&mut self, primary: u64, secondary: u64) {
        self.ttbr0 = primary & TABLE_ADDR_MASK;
        self.ttbr1 = secondary & TABLE_ADDR_MASK;
        debug!("arm64 walker roots: ttbr0={:#x} ttbr1={:#x}", self.ttbr0, self.ttbr1);
    }

    fn translate(&self, gva: u64) -> u64 {
        // Root split on VA[47]. Hardware consults the translation control
        // register; for the 48-bit configurations we walk, bit 47 picks the
        // same half.
        let ttbr = if gva & (1 << 47) != 0 {
            self.ttbr1
        } else {
            self.ttbr0
        };
        self.walk(gva, ttbr)
    }

    fn arch_name(&self) -> &'static str {
        "arm64"
    }
}
