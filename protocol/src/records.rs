//! Fixed-size process and memory-section records.
//!
//! These ride in `MemoryMap`-class pages as a tagged stream. Their on-wire
//! sizes are part of the contract.

use crate::{
    get_fixed_str, get_u16, get_u32, get_u64, put_fixed_str, put_u16, put_u32, put_u64, WireError,
};

/// On-wire size of [`ProcessEntry`].
pub const PROCESS_ENTRY_SIZE: usize = 336;
/// On-wire size of [`SectionEntry`].
pub const SECTION_ENTRY_SIZE: usize = 304;

pub const RECORD_TAG_PROCESS: u16 = 1;
pub const RECORD_TAG_SECTION: u16 = 2;

/// Section permission bits (rwxp from the guest's maps view).
pub const PERM_READ: u32 = 0x4;
pub const PERM_WRITE: u32 = 0x2;
pub const PERM_EXEC: u32 = 0x1;
pub const PERM_PRIVATE: u32 = 0x8;
pub const PERM_SHARED: u32 = 0x10;

/// One process as the companion sees it from inside the guest.
///
/// Layout: pid/ppid/uid/gid (16), comm\[16\] (32), state/nice/threads (36),
/// vsize/rss/start_time/utime/stime (76), num_sections (80), exe_path\[256\]
/// (336).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub state: u8,
    pub nice: i8,
    pub num_threads: u16,
    pub vsize: u64,
    pub rss: u64,
    pub start_time: u64,
    pub utime: u64,
    pub stime: u64,
    pub num_sections: u32,
    pub exe_path: String,
}

impl ProcessEntry {
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= PROCESS_ENTRY_SIZE);
        put_u32(buf, 0, self.pid);
        put_u32(buf, 4, self.ppid);
        put_u32(buf, 8, self.uid);
        put_u32(buf, 12, self.gid);
        put_fixed_str(buf, 16, 16, &self.comm);
        buf[32] = self.state;
        buf[33] = self.nice as u8;
        put_u16(buf, 34, self.num_threads);
        put_u64(buf, 36, self.vsize);
        put_u64(buf, 44, self.rss);
        put_u64(buf, 52, self.start_time);
        put_u64(buf, 60, self.utime);
        put_u64(buf, 68, self.stime);
        put_u32(buf, 76, self.num_sections);
        put_fixed_str(buf, 80, 256, &self.exe_path);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < PROCESS_ENTRY_SIZE {
            return Err(WireError::Truncated {
                need: PROCESS_ENTRY_SIZE,
                got: buf.len(),
            });
        }
        Ok(ProcessEntry {
            pid: get_u32(buf, 0),
            ppid: get_u32(buf, 4),
            uid: get_u32(buf, 8),
            gid: get_u32(buf, 12),
            comm: get_fixed_str(buf, 16, 16),
            state: buf[32],
            nice: buf[33] as i8,
            num_threads: get_u16(buf, 34),
            vsize: get_u64(buf, 36),
            rss: get_u64(buf, 44),
            start_time: get_u64(buf, 52),
            utime: get_u64(buf, 60),
            stime: get_u64(buf, 68),
            num_sections: get_u32(buf, 76),
            exe_path: get_fixed_str(buf, 80, 256),
        })
    }
}

/// One mapped memory region of a guest process.
///
/// Layout: pid (4), start/end (20), permissions (24), offset (32),
/// major/minor (40), inode (48), pathname\[256\] (304).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SectionEntry {
    pub pid: u32,
    pub start_addr: u64,
    pub end_addr: u64,
    pub permissions: u32,
    pub offset: u64,
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub pathname: String,
}

impl SectionEntry {
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SECTION_ENTRY_SIZE);
        put_u32(buf, 0, self.pid);
        put_u64(buf, 4, self.start_addr);
        put_u64(buf, 12, self.end_addr);
        put_u32(buf, 20, self.permissions);
        put_u64(buf, 24, self.offset);
        put_u32(buf, 32, self.major);
        put_u32(buf, 36, self.minor);
        put_u64(buf, 40, self.inode);
        put_fixed_str(buf, 48, 256, &self.pathname);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SECTION_ENTRY_SIZE {
            return Err(WireError::Truncated {
                need: SECTION_ENTRY_SIZE,
                got: buf.len(),
            });
        }
        Ok(SectionEntry {
            pid: get_u32(buf, 0),
            start_addr: get_u64(buf, 4),
            end_addr: get_u64(buf, 12),
            permissions: get_u32(buf, 20),
            offset: get_u64(buf, 24),
            major: get_u32(buf, 32),
            minor: get_u32(buf, 36),
            inode: get_u64(buf, 40),
            pathname: get_fixed_str(buf, 48, 256),
        })
    }

    pub fn len_bytes(&self) -> u64 {
        self.end_addr.saturating_sub(self.start_addr)
    }
}

/// A record pulled out of a `MemoryMap` page stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapRecord {
    Process(ProcessEntry),
    Section(SectionEntry),
}
