//! Payload layouts, one per beacon class, plus the dispatching decoder.
//!
//! Tear-versioned pages share a 16-byte frame right after the header:
//!
//! ```text
//! 64  version_top  u32   generation * 10_000 + sub_page
//! 68  category     u32   companion ring this page belongs to
//! 72  generation   u32
//! 76  sequence     u32
//! 80  class-specific payload
//! ...
//! 4092 version_bottom u32
//! ```
//!
//! The encoders deliberately do NOT write `version_bottom`: the writer must
//! fence between payload and footer, so the footer store is a separate call
//! ([`crate::write_version_bottom`]).

use crate::records::{
    MapRecord, ProcessEntry, SectionEntry, PROCESS_ENTRY_SIZE, RECORD_TAG_PROCESS,
    RECORD_TAG_SECTION, SECTION_ENTRY_SIZE,
};
use crate::slots::{RequestSlot, ResponseSlot};
use crate::{
    get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, BeaconClass, BeaconHeader, Category,
    WireError, DISCOVERY_MAGIC, FLAG_TEAR_VERSIONED, FLAG_TRIGGERED, FOOTER_OFFSET,
    MAX_HINTS_PER_CATEGORY, MAX_PIDS_PER_PAGE, NUM_CATEGORIES, PAGE_SIZE, SLOTS_PER_RING_PAGE,
    SLOT_SIZE,
};

const FRAME_OFFSET: usize = 64;
const PAYLOAD_OFFSET: usize = 80;

/// Bytes available to a raw bulk payload.
pub const BULK_CAPACITY: usize = FOOTER_OFFSET - PAYLOAD_OFFSET - 4;
/// Bytes available to a record stream.
pub const RECORD_STREAM_CAPACITY: usize = FOOTER_OFFSET - 96;

/// The tear-detection frame shared by in-place-rewritten pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TearFrame {
    pub version: u32,
    pub category: Category,
    pub generation: u32,
    pub sequence: u32,
}

impl TearFrame {
    /// The version scheme the writer uses: unique per (generation, sub-page).
    pub fn version_for(generation: u32, sub_page: u32) -> u32 {
        generation.wrapping_mul(10_000).wrapping_add(sub_page)
    }

    pub fn encode_into(&self, page: &mut [u8]) {
        put_u32(page, FRAME_OFFSET, self.version);
        put_u32(page, FRAME_OFFSET + 4, self.category as u32);
        put_u32(page, FRAME_OFFSET + 8, self.generation);
        put_u32(page, FRAME_OFFSET + 12, self.sequence);
    }

    pub fn decode(page: &[u8]) -> Result<Self, WireError> {
        let raw_cat = get_u32(page, FRAME_OFFSET + 4);
        let category = Category::from_u32(raw_cat).ok_or(WireError::UnknownCategory(raw_cat))?;
        Ok(TearFrame {
            version: get_u32(page, FRAME_OFFSET),
            category,
            generation: get_u32(page, FRAME_OFFSET + 8),
            sequence: get_u32(page, FRAME_OFFSET + 12),
        })
    }
}

/// One category's row in the discovery directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryDir {
    /// Byte offset of the category's first page, relative to the discovery page.
    pub base_offset: u32,
    pub page_count: u32,
    pub write_index: u32,
    pub sequence: u32,
}

/// The first page of the Master category: directory plus physical hints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryPage {
    /// PID of the companion process that owns the session.
    pub session_pid: u32,
    pub directory: [CategoryDir; NUM_CATEGORIES],
    /// Sampled guest-physical page addresses, per category. At most
    /// [`MAX_HINTS_PER_CATEGORY`] each.
    pub hints: [Vec<u64>; NUM_CATEGORIES],
}

const DIR_OFFSET: usize = 96;
const HINTS_OFFSET: usize = 160;
const HINT_BLOCK: usize = 8 + MAX_HINTS_PER_CATEGORY * 8;

impl DiscoveryPage {
    pub fn encode_into(&self, page: &mut [u8], header: &BeaconHeader, frame: &TearFrame) {
        header.encode_into(page);
        frame.encode_into(page);
        put_u32(page, PAYLOAD_OFFSET, DISCOVERY_MAGIC);
        put_u32(page, PAYLOAD_OFFSET + 4, self.session_pid);
        put_u32(page, PAYLOAD_OFFSET + 8, NUM_CATEGORIES as u32);
        put_u32(page, PAYLOAD_OFFSET + 12, 0);
        for (i, dir) in self.directory.iter().enumerate() {
            let off = DIR_OFFSET + i * 16;
            put_u32(page, off, dir.base_offset);
            put_u32(page, off + 4, dir.page_count);
            put_u32(page, off + 8, dir.write_index);
            put_u32(page, off + 12, dir.sequence);
        }
        for (i, hints) in self.hints.iter().enumerate() {
            let off = HINTS_OFFSET + i * HINT_BLOCK;
            let count = hints.len().min(MAX_HINTS_PER_CATEGORY);
            put_u32(page, off, count as u32);
            put_u32(page, off + 4, 0);
            for (j, pa) in hints.iter().take(count).enumerate() {
                put_u64(page, off + 8 + j * 8, *pa);
            }
        }
    }

    fn decode(page: &[u8]) -> Result<Self, WireError> {
        if get_u32(page, PAYLOAD_OFFSET) != DISCOVERY_MAGIC {
            return Err(WireError::Malformed("discovery magic missing"));
        }
        let mut out = DiscoveryPage {
            session_pid: get_u32(page, PAYLOAD_OFFSET + 4),
            ..Default::default()
        };
        for i in 0..NUM_CATEGORIES {
            let off = DIR_OFFSET + i * 16;
            out.directory[i] = CategoryDir {
                base_offset: get_u32(page, off),
                page_count: get_u32(page, off + 4),
                write_index: get_u32(page, off + 8),
                sequence: get_u32(page, off + 12),
            };
        }
        for i in 0..NUM_CATEGORIES {
            let off = HINTS_OFFSET + i * HINT_BLOCK;
            let count = (get_u32(page, off) as usize).min(MAX_HINTS_PER_CATEGORY);
            out.hints[i] = (0..count).map(|j| get_u64(page, off + 8 + j * 8)).collect();
        }
        Ok(out)
    }
}

/// One page of a PID-list generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PidListPage {
    pub total_pids: u32,
    pub page_number: u32,
    pub pages_in_generation: u32,
    pub pids: Vec<u32>,
}

impl PidListPage {
    pub fn encode_into(&self, page: &mut [u8], header: &BeaconHeader, frame: &TearFrame) {
        header.encode_into(page);
        frame.encode_into(page);
        let count = self.pids.len().min(MAX_PIDS_PER_PAGE);
        put_u32(page, PAYLOAD_OFFSET, self.total_pids);
        put_u32(page, PAYLOAD_OFFSET + 4, self.page_number);
        put_u32(page, PAYLOAD_OFFSET + 8, self.pages_in_generation);
        put_u32(page, PAYLOAD_OFFSET + 12, count as u32);
        // Clear the whole array so stale PIDs from the previous generation
        // cannot leak through a shorter list.
        page[96..96 + MAX_PIDS_PER_PAGE * 4].fill(0);
        for (i, pid) in self.pids.iter().take(count).enumerate() {
            put_u32(page, 96 + i * 4, *pid);
        }
    }

    fn decode(page: &[u8]) -> Result<Self, WireError> {
        let count = get_u32(page, PAYLOAD_OFFSET + 12) as usize;
        if count > MAX_PIDS_PER_PAGE {
            return Err(WireError::Malformed("pid count exceeds page capacity"));
        }
        Ok(PidListPage {
            total_pids: get_u32(page, PAYLOAD_OFFSET),
            page_number: get_u32(page, PAYLOAD_OFFSET + 4),
            pages_in_generation: get_u32(page, PAYLOAD_OFFSET + 8),
            pids: (0..count).map(|i| get_u32(page, 96 + i * 4)).collect(),
        })
    }
}

/// Raw bulk bytes (`BulkData` outside the PID-list category, and the
/// request/response data classes).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BulkPayload {
    pub data: Vec<u8>,
}

impl BulkPayload {
    pub fn encode_into(&self, page: &mut [u8], header: &BeaconHeader, frame: &TearFrame) {
        header.encode_into(page);
        frame.encode_into(page);
        let n = self.data.len().min(BULK_CAPACITY);
        put_u32(page, PAYLOAD_OFFSET, n as u32);
        page[PAYLOAD_OFFSET + 4..PAYLOAD_OFFSET + 4 + n].copy_from_slice(&self.data[..n]);
    }

    fn decode(page: &[u8]) -> Result<Self, WireError> {
        let n = get_u32(page, PAYLOAD_OFFSET) as usize;
        if n > BULK_CAPACITY {
            return Err(WireError::Malformed("bulk size exceeds page capacity"));
        }
        Ok(BulkPayload {
            data: page[PAYLOAD_OFFSET + 4..PAYLOAD_OFFSET + 4 + n].to_vec(),
        })
    }
}

/// A `MemoryMap` page: tagged stream of process and section records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordStream {
    pub records: Vec<MapRecord>,
}

impl RecordStream {
    /// Encodes as many records as fit; returns how many were written.
    pub fn encode_into(
        &self,
        page: &mut [u8],
        header: &BeaconHeader,
        frame: &TearFrame,
    ) -> usize {
        header.encode_into(page);
        frame.encode_into(page);
        let mut off = 96usize;
        let mut written = 0usize;
        for record in &self.records {
            let (tag, size) = match record {
                MapRecord::Process(_) => (RECORD_TAG_PROCESS, PROCESS_ENTRY_SIZE),
                MapRecord::Section(_) => (RECORD_TAG_SECTION, SECTION_ENTRY_SIZE),
            };
            if off + 4 + size > FOOTER_OFFSET {
                break;
            }
            put_u16(page, off, tag);
            put_u16(page, off + 2, size as u16);
            match record {
                MapRecord::Process(p) => p.encode_into(&mut page[off + 4..off + 4 + size]),
                MapRecord::Section(s) => s.encode_into(&mut page[off + 4..off + 4 + size]),
            }
            off += 4 + size;
            written += 1;
        }
        put_u32(page, PAYLOAD_OFFSET, written as u32);
        put_u32(page, PAYLOAD_OFFSET + 4, (off - 96) as u32);
        put_u64(page, PAYLOAD_OFFSET + 8, 0);
        written
    }

    fn decode(page: &[u8]) -> Result<Self, WireError> {
        let record_count = get_u32(page, PAYLOAD_OFFSET) as usize;
        let data_size = get_u32(page, PAYLOAD_OFFSET + 4) as usize;
        if data_size > RECORD_STREAM_CAPACITY {
            return Err(WireError::Malformed("record stream size out of range"));
        }
        let mut records = Vec::with_capacity(record_count);
        let mut off = 96usize;
        let end = 96 + data_size;
        while off + 4 <= end && records.len() < record_count {
            let tag = get_u16(page, off);
            let size = get_u16(page, off + 2) as usize;
            if off + 4 + size > end {
                return Err(WireError::Malformed("record overruns stream"));
            }
            let body = &page[off + 4..off + 4 + size];
            match tag {
                RECORD_TAG_PROCESS => records.push(MapRecord::Process(ProcessEntry::decode(body)?)),
                RECORD_TAG_SECTION => records.push(MapRecord::Section(SectionEntry::decode(body)?)),
                _ => return Err(WireError::Malformed("unknown record tag")),
            }
            off += 4 + size;
        }
        if records.len() != record_count {
            return Err(WireError::Malformed("record count mismatch"));
        }
        Ok(RecordStream { records })
    }
}

/// Heartbeat counters (`Statistics` class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsPage {
    pub uptime_secs: u64,
    pub cycles: u32,
    pub processes_seen: u32,
    pub pages_written: u64,
    pub last_pid_count: u32,
}

impl StatisticsPage {
    pub fn encode_into(&self, page: &mut [u8], header: &BeaconHeader, frame: &TearFrame) {
        header.encode_into(page);
        frame.encode_into(page);
        put_u64(page, PAYLOAD_OFFSET, self.uptime_secs);
        put_u32(page, PAYLOAD_OFFSET + 8, self.cycles);
        put_u32(page, PAYLOAD_OFFSET + 12, self.processes_seen);
        put_u64(page, PAYLOAD_OFFSET + 16, self.pages_written);
        put_u32(page, PAYLOAD_OFFSET + 24, self.last_pid_count);
        put_u32(page, PAYLOAD_OFFSET + 28, 0);
    }

    fn decode(page: &[u8]) -> Result<Self, WireError> {
        Ok(StatisticsPage {
            uptime_secs: get_u64(page, PAYLOAD_OFFSET),
            cycles: get_u32(page, PAYLOAD_OFFSET + 8),
            processes_seen: get_u32(page, PAYLOAD_OFFSET + 12),
            pages_written: get_u64(page, PAYLOAD_OFFSET + 16),
            last_pid_count: get_u32(page, PAYLOAD_OFFSET + 24),
        })
    }
}

/// Dirty page tracking bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirtyBitmapPage {
    pub base_gfn: u64,
    pub bit_count: u32,
    pub bitmap: Vec<u8>,
}

impl DirtyBitmapPage {
    pub fn encode_into(&self, page: &mut [u8], header: &BeaconHeader, frame: &TearFrame) {
        header.encode_into(page);
        frame.encode_into(page);
        let bytes = self.bitmap.len().min(FOOTER_OFFSET - 96);
        put_u64(page, PAYLOAD_OFFSET, self.base_gfn);
        put_u32(page, PAYLOAD_OFFSET + 8, self.bit_count);
        put_u32(page, PAYLOAD_OFFSET + 12, 0);
        page[96..96 + bytes].copy_from_slice(&self.bitmap[..bytes]);
    }

    fn decode(page: &[u8]) -> Result<Self, WireError> {
        let bit_count = get_u32(page, PAYLOAD_OFFSET + 8);
        let bytes = (bit_count as usize).div_ceil(8);
        if 96 + bytes > FOOTER_OFFSET {
            return Err(WireError::Malformed("bitmap exceeds page capacity"));
        }
        Ok(DirtyBitmapPage {
            base_gfn: get_u64(page, PAYLOAD_OFFSET),
            bit_count,
            bitmap: page[96..96 + bytes].to_vec(),
        })
    }
}

/// Encodes diagnostic log lines into a `LogBuffer` page. Lines that do not
/// fit are dropped; returns how many were written.
pub fn encode_log_lines(
    page: &mut [u8],
    header: &BeaconHeader,
    frame: &TearFrame,
    lines: &[String],
) -> usize {
    header.encode_into(page);
    frame.encode_into(page);
    let mut off = 88usize;
    let mut written = 0usize;
    for line in lines {
        let bytes = line.as_bytes();
        if off + 2 + bytes.len() > FOOTER_OFFSET || bytes.len() > u16::MAX as usize {
            break;
        }
        put_u16(page, off, bytes.len() as u16);
        page[off + 2..off + 2 + bytes.len()].copy_from_slice(bytes);
        off += 2 + bytes.len();
        written += 1;
    }
    put_u32(page, PAYLOAD_OFFSET, written as u32);
    put_u32(page, PAYLOAD_OFFSET + 4, (off - 88) as u32);
    written
}

fn decode_log_lines(page: &[u8]) -> Result<Vec<String>, WireError> {
    let count = get_u32(page, PAYLOAD_OFFSET) as usize;
    let data_size = get_u32(page, PAYLOAD_OFFSET + 4) as usize;
    if 88 + data_size > FOOTER_OFFSET {
        return Err(WireError::Malformed("log data size out of range"));
    }
    let mut lines = Vec::with_capacity(count);
    let mut off = 88usize;
    let end = 88 + data_size;
    while off + 2 <= end && lines.len() < count {
        let len = get_u16(page, off) as usize;
        if off + 2 + len > end {
            return Err(WireError::Malformed("log line overruns buffer"));
        }
        lines.push(String::from_utf8_lossy(&page[off + 2..off + 2 + len]).into_owned());
        off += 2 + len;
    }
    if lines.len() != count {
        return Err(WireError::Malformed("log line count mismatch"));
    }
    Ok(lines)
}

/// Encodes a ring page of request or response slots.
pub fn encode_request_ring(
    page: &mut [u8],
    header: &BeaconHeader,
    frame: &TearFrame,
    slots: &[RequestSlot],
) {
    header.encode_into(page);
    frame.encode_into(page);
    let count = slots.len().min(SLOTS_PER_RING_PAGE);
    put_u32(page, PAYLOAD_OFFSET, count as u32);
    put_u32(page, PAYLOAD_OFFSET + 4, 0);
    for (i, slot) in slots.iter().take(count).enumerate() {
        slot.encode_into(&mut page[88 + i * SLOT_SIZE..88 + (i + 1) * SLOT_SIZE]);
    }
}

pub fn encode_response_ring(
    page: &mut [u8],
    header: &BeaconHeader,
    frame: &TearFrame,
    slots: &[ResponseSlot],
) {
    header.encode_into(page);
    frame.encode_into(page);
    let count = slots.len().min(SLOTS_PER_RING_PAGE);
    put_u32(page, PAYLOAD_OFFSET, count as u32);
    put_u32(page, PAYLOAD_OFFSET + 4, 0);
    for (i, slot) in slots.iter().take(count).enumerate() {
        slot.encode_into(&mut page[88 + i * SLOT_SIZE..88 + (i + 1) * SLOT_SIZE]);
    }
}

fn decode_slot_count(page: &[u8]) -> Result<usize, WireError> {
    let count = get_u32(page, PAYLOAD_OFFSET) as usize;
    if count > SLOTS_PER_RING_PAGE {
        return Err(WireError::Malformed("slot count exceeds ring capacity"));
    }
    Ok(count)
}

/// A fully decoded beacon page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPage {
    pub header: BeaconHeader,
    /// Present on tear-versioned pages.
    pub frame: Option<TearFrame>,
    pub payload: DecodedPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPayload {
    Discovery(DiscoveryPage),
    PidList(PidListPage),
    Bulk(BulkPayload),
    Records(RecordStream),
    Requests(Vec<RequestSlot>),
    Responses(Vec<ResponseSlot>),
    Statistics(StatisticsPage),
    Log(Vec<String>),
    DirtyBitmap(DirtyBitmapPage),
}

/// Decodes one full page, dispatching on the header's class.
///
/// Total on well-formed pages; returns a [`WireError`] on anything else.
/// Torn pages (mismatched version markers) are reported before any payload
/// bytes are interpreted.
pub fn decode_page(page: &[u8]) -> Result<DecodedPage, WireError> {
    if page.len() < PAGE_SIZE {
        return Err(WireError::Truncated {
            need: PAGE_SIZE,
            got: page.len(),
        });
    }
    let header = BeaconHeader::decode(page)?;
    if header.flags & FLAG_TRIGGERED != 0 {
        return Err(WireError::Malformed(
            "triggered beacon; decode the full span instead",
        ));
    }
    let frame = if header.flags & FLAG_TEAR_VERSIONED != 0 {
        let (top, bottom) = crate::version_markers(page);
        if top != bottom {
            return Err(WireError::TornPage { top, bottom });
        }
        // Pairs with the writer's release fence before the footer store:
        // payload bytes read past this point are at least as new as the
        // footer just checked.
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        Some(TearFrame::decode(page)?)
    } else {
        None
    };

    let payload = match header.beacon_class {
        BeaconClass::Index => DecodedPayload::Discovery(DiscoveryPage::decode(page)?),
        BeaconClass::BulkData => match frame.map(|f| f.category) {
            Some(Category::PidList) => DecodedPayload::PidList(PidListPage::decode(page)?),
            _ => DecodedPayload::Bulk(BulkPayload::decode(page)?),
        },
        BeaconClass::RequestData | BeaconClass::ResponseData => {
            DecodedPayload::Bulk(BulkPayload::decode(page)?)
        }
        BeaconClass::MemoryMap => DecodedPayload::Records(RecordStream::decode(page)?),
        BeaconClass::RequestRing => {
            let count = decode_slot_count(page)?;
            let slots = (0..count)
                .map(|i| RequestSlot::decode(&page[88 + i * SLOT_SIZE..88 + (i + 1) * SLOT_SIZE]))
                .collect::<Result<Vec<_>, _>>()?;
            DecodedPayload::Requests(slots)
        }
        BeaconClass::ResponseRing => {
            let count = decode_slot_count(page)?;
            let slots = (0..count)
                .map(|i| ResponseSlot::decode(&page[88 + i * SLOT_SIZE..88 + (i + 1) * SLOT_SIZE]))
                .collect::<Result<Vec<_>, _>>()?;
            DecodedPayload::Responses(slots)
        }
        BeaconClass::Statistics => DecodedPayload::Statistics(StatisticsPage::decode(page)?),
        BeaconClass::LogBuffer => DecodedPayload::Log(decode_log_lines(page)?),
        BeaconClass::DirtyBitmap => DecodedPayload::DirtyBitmap(DirtyBitmapPage::decode(page)?),
    };

    // When the page lives in shared memory, the writer may have started a
    // rewrite while the payload was being copied out; re-reading the
    // markers catches that tear.
    if let Some(f) = frame {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        let (top, bottom) = crate::version_markers(page);
        if top != f.version || bottom != f.version {
            return Err(WireError::TornPage { top, bottom });
        }
    }

    Ok(DecodedPage {
        header,
        frame,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write_version_bottom;
    use pretty_assertions::assert_eq;

    fn versioned_header(class: BeaconClass) -> BeaconHeader {
        BeaconHeader::new(0xBEEF, class, 0, 4).with_flags(FLAG_TEAR_VERSIONED)
    }

    fn frame(category: Category, generation: u32, sub_page: u32) -> TearFrame {
        TearFrame {
            version: TearFrame::version_for(generation, sub_page),
            category,
            generation,
            sequence: 7,
        }
    }

    #[test]
    fn version_scheme() {
        assert_eq!(TearFrame::version_for(3, 2), 30_002);
    }

    #[test]
    fn discovery_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut disc = DiscoveryPage {
            session_pid: 1234,
            ..Default::default()
        };
        disc.directory[1] = CategoryDir {
            base_offset: 10 * PAGE_SIZE as u32,
            page_count: 100,
            write_index: 42,
            sequence: 9,
        };
        disc.hints[1] = vec![0x4010_0000, 0x4010_2000];
        let f = frame(Category::Master, 0, 0);
        disc.encode_into(&mut page, &versioned_header(BeaconClass::Index), &f);
        write_version_bottom(&mut page, f.version);

        let decoded = decode_page(&page).unwrap();
        assert_eq!(decoded.frame, Some(f));
        assert_eq!(decoded.payload, DecodedPayload::Discovery(disc));
    }

    #[test]
    fn pid_list_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let list = PidListPage {
            total_pids: 3,
            page_number: 0,
            pages_in_generation: 1,
            pids: vec![1, 2, 742],
        };
        let f = frame(Category::PidList, 5, 0);
        list.encode_into(&mut page, &versioned_header(BeaconClass::BulkData), &f);
        write_version_bottom(&mut page, f.version);

        match decode_page(&page).unwrap().payload {
            DecodedPayload::PidList(back) => assert_eq!(back, list),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn torn_page_is_rejected_before_payload() {
        let mut page = vec![0u8; PAGE_SIZE];
        let list = PidListPage {
            total_pids: 1,
            page_number: 0,
            pages_in_generation: 1,
            pids: vec![1],
        };
        let f = frame(Category::PidList, 0, 42);
        list.encode_into(&mut page, &versioned_header(BeaconClass::BulkData), &f);
        write_version_bottom(&mut page, f.version - 1);

        assert_eq!(
            decode_page(&page),
            Err(WireError::TornPage {
                top: 42,
                bottom: 41
            })
        );
    }

    #[test]
    fn record_stream_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let stream = RecordStream {
            records: vec![
                MapRecord::Process(ProcessEntry {
                    pid: 742,
                    comm: "sshd".into(),
                    num_sections: 1,
                    ..Default::default()
                }),
                MapRecord::Section(SectionEntry {
                    pid: 742,
                    start_addr: 0x4000,
                    end_addr: 0x8000,
                    pathname: "[heap]".into(),
                    ..Default::default()
                }),
            ],
        };
        let f = frame(Category::RoundRobin, 2, 1);
        let written =
            stream.encode_into(&mut page, &versioned_header(BeaconClass::MemoryMap), &f);
        assert_eq!(written, 2);
        write_version_bottom(&mut page, f.version);

        match decode_page(&page).unwrap().payload {
            DecodedPayload::Records(back) => assert_eq!(back, stream),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn record_stream_stops_at_capacity() {
        let mut page = vec![0u8; PAGE_SIZE];
        let many = RecordStream {
            records: (0..40)
                .map(|i| {
                    MapRecord::Process(ProcessEntry {
                        pid: i,
                        ..Default::default()
                    })
                })
                .collect(),
        };
        let f = frame(Category::Camera, 0, 0);
        let written = many.encode_into(&mut page, &versioned_header(BeaconClass::MemoryMap), &f);
        assert!(written < 40);
        assert!(written >= RECORD_STREAM_CAPACITY / (PROCESS_ENTRY_SIZE + 4));
    }

    #[test]
    fn statistics_and_log_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let stats = StatisticsPage {
            uptime_secs: 3600,
            cycles: 120,
            processes_seen: 240,
            pages_written: 9999,
            last_pid_count: 87,
        };
        let f = frame(Category::Master, 0, 1);
        stats.encode_into(&mut page, &versioned_header(BeaconClass::Statistics), &f);
        write_version_bottom(&mut page, f.version);
        match decode_page(&page).unwrap().payload {
            DecodedPayload::Statistics(back) => assert_eq!(back, stats),
            other => panic!("unexpected payload {other:?}"),
        }

        let mut page = vec![0u8; PAGE_SIZE];
        let lines = vec!["cycle 1 ok".to_string(), "cycle 2 ok".to_string()];
        let f = frame(Category::Master, 0, 2);
        let n = encode_log_lines(&mut page, &versioned_header(BeaconClass::LogBuffer), &f, &lines);
        assert_eq!(n, 2);
        write_version_bottom(&mut page, f.version);
        match decode_page(&page).unwrap().payload {
            DecodedPayload::Log(back) => assert_eq!(back, lines),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn ring_page_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let slots = vec![
            RequestSlot {
                occupied: true,
                owner_pid: 55,
                sequence: 1,
                req_type: crate::RequestType::ListProcesses,
                iterator_id: 0,
                target_pid: 0,
                timestamp: 100,
                args: crate::RequestArgs::ListProcesses {
                    flags: 0,
                    max_results: 50,
                },
            };
            3
        ];
        let f = frame(Category::Master, 0, 3);
        encode_request_ring(&mut page, &versioned_header(BeaconClass::RequestRing), &f, &slots);
        write_version_bottom(&mut page, f.version);
        match decode_page(&page).unwrap().payload {
            DecodedPayload::Requests(back) => assert_eq!(back, slots),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn malformed_counts_are_typed_errors() {
        let mut page = vec![0u8; PAGE_SIZE];
        let f = frame(Category::PidList, 0, 0);
        PidListPage::default().encode_into(&mut page, &versioned_header(BeaconClass::BulkData), &f);
        write_version_bottom(&mut page, f.version);
        // Corrupt the per-page pid count past capacity.
        put_u32(&mut page, 92, 5_000);
        assert!(matches!(decode_page(&page), Err(WireError::Malformed(_))));
    }
}
