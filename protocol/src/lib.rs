//! Beacon wire format.
//!
//! A beacon is a 4096-byte, page-aligned record the guest companion writes
//! into its own memory so the host can find it by scanning the hypervisor's
//! memory-backend file on page boundaries. Every page starts with a 64-byte
//! header carrying a magic pair; the payload layout is selected by the
//! header's class field.
//!
//! All multi-byte fields are little-endian and packed. The byte positions in
//! this crate are the contract between host and guest and must not move
//! without a protocol-version bump — which is why encoding is explicit
//! field-by-field rather than derived.

mod header;
mod pages;
mod records;
mod slots;
mod triggered;

pub use header::BeaconHeader;
pub use pages::{
    decode_page, encode_log_lines, encode_request_ring, encode_response_ring, BulkPayload,
    CategoryDir, DecodedPage, DecodedPayload, DirtyBitmapPage, DiscoveryPage, PidListPage,
    RecordStream, StatisticsPage, TearFrame, BULK_CAPACITY, RECORD_STREAM_CAPACITY,
};
pub use records::{
    MapRecord, ProcessEntry, SectionEntry, PERM_EXEC, PERM_PRIVATE, PERM_READ, PERM_SHARED,
    PERM_WRITE, PROCESS_ENTRY_SIZE, RECORD_TAG_PROCESS, RECORD_TAG_SECTION, SECTION_ENTRY_SIZE,
};
pub use slots::{RequestArgs, RequestSlot, RequestType, ResponseSlot, ResponseStatus};
pub use triggered::{
    TriggeredBeacon, TriggeredEntry, TriggeredHeader, ENTRY_TYPE_MAPS, ENTRY_TYPE_PID,
    TRIGGERED_MAPS_HEADER_SIZE, TRIGGERED_PID_ENTRY_SIZE,
};

use thiserror::Error;

/// Beacon page size. Scanning strides by this; nothing smaller is addressed.
pub const PAGE_SIZE: usize = 4096;

/// First magic word of every beacon page.
pub const BEACON_MAGIC1: u32 = 0x3142_FACE;
/// Second magic word of every beacon page.
pub const BEACON_MAGIC2: u32 = 0xCAFE_BABE;

/// Secondary magic on the discovery page: the bytes `H a y D` in file order.
pub const DISCOVERY_MAGIC: u32 = u32::from_le_bytes(*b"HayD");

/// Current wire layout version. Bump when any byte position changes.
pub const PROTOCOL_VERSION: u32 = 4;

/// Size of the fixed header at the start of every page.
pub const HEADER_LEN: usize = 64;

/// Byte offset of the tear-detection footer (`version_bottom`).
pub const FOOTER_OFFSET: usize = PAGE_SIZE - 4;

/// Upper bound on `total_pages`; anything larger is a suspicious match.
pub const MAX_TOTAL_PAGES: u32 = 10_000;

/// Header flag: payload carries `version_top`/`version_bottom` markers.
pub const FLAG_TEAR_VERSIONED: u32 = 1 << 0;
/// Header flag: single-shot triggered beacon (header + data tail, no footer).
pub const FLAG_TRIGGERED: u32 = 1 << 1;

/// Physical-address hints published per category on the discovery page.
pub const MAX_HINTS_PER_CATEGORY: usize = 100;

/// PIDs per PID-list page (fills the tear-versioned payload).
pub const MAX_PIDS_PER_PAGE: usize = 999;

/// Fixed request/response slots per ring page.
pub const SLOTS_PER_RING_PAGE: usize = 15;
/// On-wire size of one request or response slot.
pub const SLOT_SIZE: usize = 256;

/// What kind of page this is. Stored in the header; selects the payload
/// schema. The numeric values are wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BeaconClass {
    /// Discovery/index pages: category directory and physical hints.
    Index = 1,
    /// Request circular-buffer slot pages.
    RequestRing = 2,
    /// Response circular-buffer slot pages.
    ResponseRing = 3,
    /// Raw request message pages.
    RequestData = 4,
    /// Raw response message pages.
    ResponseData = 5,
    /// Large transfers; carries PID-list generations when the category says so.
    BulkData = 6,
    /// Dirty page tracking bitmap.
    DirtyBitmap = 7,
    /// Performance counters and heartbeat.
    Statistics = 8,
    /// Diagnostic log lines.
    LogBuffer = 9,
    /// Process + memory-section record streams.
    MemoryMap = 10,
}

impl BeaconClass {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Index,
            2 => Self::RequestRing,
            3 => Self::ResponseRing,
            4 => Self::RequestData,
            5 => Self::ResponseData,
            6 => Self::BulkData,
            7 => Self::DirtyBitmap,
            8 => Self::Statistics,
            9 => Self::LogBuffer,
            10 => Self::MemoryMap,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::RequestRing => "request-ring",
            Self::ResponseRing => "response-ring",
            Self::RequestData => "request-data",
            Self::ResponseData => "response-data",
            Self::BulkData => "bulk-data",
            Self::DirtyBitmap => "dirty-bitmap",
            Self::Statistics => "statistics",
            Self::LogBuffer => "log-buffer",
            Self::MemoryMap => "memory-map",
        }
    }
}

/// Companion-side ring taxonomy. Every tear-versioned payload records which
/// category ring it belongs to, independent of the page's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Category {
    /// Discovery page, heartbeat, log pages.
    Master = 0,
    /// PID snapshot generations.
    PidList = 1,
    /// Per-process detail, a few PIDs per cycle.
    RoundRobin = 2,
    /// Deep detail for one focus PID.
    Camera = 3,
}

pub const NUM_CATEGORIES: usize = 4;

impl Category {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Master,
            1 => Self::PidList,
            2 => Self::RoundRobin,
            3 => Self::Camera,
            _ => return None,
        })
    }

    pub fn all() -> [Category; NUM_CATEGORIES] {
        [Self::Master, Self::PidList, Self::RoundRobin, Self::Camera]
    }
}

/// Wire-level decode failures. Total over arbitrary input: a malformed page
/// produces one of these, never a panic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("bad beacon magic")]
    BadMagic,
    #[error("unknown beacon class {0}")]
    UnknownClass(u32),
    #[error("unknown category {0}")]
    UnknownCategory(u32),
    #[error("torn page: version_top={top} version_bottom={bottom}")]
    TornPage { top: u32, bottom: u32 },
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Copies a string into a fixed NUL-padded field, truncating if needed.
pub(crate) fn put_fixed_str(buf: &mut [u8], off: usize, len: usize, s: &str) {
    let field = &mut buf[off..off + len];
    field.fill(0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Reads a NUL-terminated string out of a fixed field, lossily.
pub(crate) fn get_fixed_str(buf: &[u8], off: usize, len: usize) -> String {
    let field = &buf[off..off + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Quick magic-pair probe over the first 8 bytes of a candidate page.
pub fn has_beacon_magic(page: &[u8]) -> bool {
    page.len() >= 8 && get_u32(page, 0) == BEACON_MAGIC1 && get_u32(page, 4) == BEACON_MAGIC2
}

/// Reads the tear markers of a page. Meaningful only when the header carries
/// `FLAG_TEAR_VERSIONED`.
pub fn version_markers(page: &[u8]) -> (u32, u32) {
    (get_u32(page, HEADER_LEN), get_u32(page, FOOTER_OFFSET))
}

/// Writes the footer marker. The caller is responsible for ordering (the
/// writer fences between payload and footer).
pub fn write_version_bottom(page: &mut [u8], version: u32) {
    put_u32(page, FOOTER_OFFSET, version);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_values_are_wire_contract() {
        assert_eq!(BeaconClass::Index as u32, 1);
        assert_eq!(BeaconClass::MemoryMap as u32, 10);
        for v in 1..=10 {
            assert_eq!(BeaconClass::from_u32(v).map(|c| c as u32), Some(v));
        }
        assert_eq!(BeaconClass::from_u32(0), None);
        assert_eq!(BeaconClass::from_u32(11), None);
    }

    #[test]
    fn discovery_magic_spells_hayd() {
        assert_eq!(DISCOVERY_MAGIC.to_le_bytes(), *b"HayD");
    }

    #[test]
    fn magic_probe() {
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(!has_beacon_magic(&page));
        put_u32(&mut page, 0, BEACON_MAGIC1);
        put_u32(&mut page, 4, BEACON_MAGIC2);
        assert!(has_beacon_magic(&page));
        assert!(!has_beacon_magic(&page[..4]));
    }

    #[test]
    fn fixed_str_roundtrip_and_truncation() {
        let mut buf = vec![0xAAu8; 32];
        put_fixed_str(&mut buf, 0, 16, "swapper/0");
        assert_eq!(get_fixed_str(&buf, 0, 16), "swapper/0");
        put_fixed_str(&mut buf, 0, 4, "abcdefgh");
        assert_eq!(get_fixed_str(&buf, 0, 4), "abcd");
    }
}
