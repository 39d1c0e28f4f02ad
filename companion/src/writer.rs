//! The beacon arena: one page-aligned allocation partitioned into category
//! rings, written with the tear-resistant protocol.
//!
//! Single writer per session per category. Every in-place rewrite goes
//! header, body, release fence, footer — the release pairs with the host
//! reader's acquire on the footer, so a footer that matches the head
//! guarantees the payload it covers.

use std::sync::atomic::{fence, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use vmscope_protocol::{
    encode_log_lines, encode_request_ring, encode_response_ring, write_version_bottom,
    BeaconClass, BeaconHeader, Category, CategoryDir, DiscoveryPage, MapRecord, PidListPage,
    RecordStream, StatisticsPage, TearFrame, FLAG_TEAR_VERSIONED, MAX_HINTS_PER_CATEGORY,
    MAX_PIDS_PER_PAGE, NUM_CATEGORIES, PAGE_SIZE,
};

use crate::pagemap::PagemapReader;

/// Ring sizes, in pages.
pub const MASTER_PAGES: usize = 8;
pub const PID_LIST_PAGES: usize = 64;
pub const ROUND_ROBIN_PAGES: usize = 256;
pub const CAMERA_PAGES: usize = 128;

/// Fixed page roles inside the Master ring.
const MASTER_DISCOVERY: usize = 0;
const MASTER_STATISTICS: usize = 1;
const MASTER_LOG: usize = 2;
const MASTER_REQUEST_RING: usize = 3;
const MASTER_RESPONSE_RING: usize = 4;

struct CategoryRing {
    start_page: usize,
    page_count: usize,
    write_index: u32,
    sequence: u32,
}

pub struct BeaconArena {
    /// Over-allocated by one page so the live area can be page-aligned.
    buf: Vec<u8>,
    align: usize,
    total_pages: usize,
    rings: [CategoryRing; NUM_CATEGORIES],
    session_id: u32,
    started: SystemTime,
    /// One-time pagemap samples, republished on every discovery rewrite.
    hints: [Vec<u64>; NUM_CATEGORIES],
    generation: u32,
    pid_write_offset: usize,
    pages_written: u64,
    cycles: u32,
    processes_seen: u32,
    last_pid_count: u32,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl BeaconArena {
    pub fn new(session_id: u32) -> Self {
        let counts = [MASTER_PAGES, PID_LIST_PAGES, ROUND_ROBIN_PAGES, CAMERA_PAGES];
        let total_pages: usize = counts.iter().sum();
        let buf = vec![0u8; (total_pages + 1) * PAGE_SIZE];
        let align = (PAGE_SIZE - (buf.as_ptr() as usize % PAGE_SIZE)) % PAGE_SIZE;

        let mut rings = Vec::with_capacity(NUM_CATEGORIES);
        let mut start_page = 0usize;
        for count in counts {
            rings.push(CategoryRing {
                start_page,
                page_count: count,
                write_index: 0,
                sequence: 0,
            });
            start_page += count;
        }
        let rings: [CategoryRing; NUM_CATEGORIES] = match rings.try_into() {
            Ok(r) => r,
            Err(_) => unreachable!("ring count is NUM_CATEGORIES"),
        };

        info!(
            "beacon arena: {total_pages} pages ({} KiB), session {session_id:#x}",
            total_pages * PAGE_SIZE / 1024
        );
        BeaconArena {
            buf,
            align,
            total_pages,
            rings,
            session_id,
            started: SystemTime::now(),
            hints: Default::default(),
            generation: 0,
            pid_write_offset: 0,
            pages_written: 0,
            cycles: 0,
            processes_seen: 0,
            last_pid_count: 0,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Address of the arena's first (aligned) page.
    pub fn base_ptr(&self) -> *const u8 {
        self.buf[self.align..].as_ptr()
    }

    fn page_mut(&mut self, global_index: usize) -> &mut [u8] {
        let start = self.align + global_index * PAGE_SIZE;
        &mut self.buf[start..start + PAGE_SIZE]
    }

    /// Read-only page view, for tests and hint sampling.
    pub fn page(&self, global_index: usize) -> &[u8] {
        let start = self.align + global_index * PAGE_SIZE;
        &self.buf[start..start + PAGE_SIZE]
    }

    fn ring(&self, category: Category) -> &CategoryRing {
        &self.rings[category as usize]
    }

    fn header(&self, class: BeaconClass, page_index: u32, total_pages: u32) -> BeaconHeader {
        let mut header = BeaconHeader::new(self.session_id, class, page_index, total_pages)
            .with_flags(FLAG_TEAR_VERSIONED);
        header.created_time = self
            .started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        header.modified_time = epoch_secs();
        header
    }

    fn frame(&self, category: Category, generation: u32, sub_page: u32) -> TearFrame {
        TearFrame {
            version: TearFrame::version_for(generation, sub_page),
            category,
            generation,
            sequence: self.rings[category as usize].sequence,
        }
    }

    /// Footer write with the ordering the readers rely on.
    fn seal(&mut self, global_index: usize, version: u32) {
        fence(Ordering::Release);
        write_version_bottom(self.page_mut(global_index), version);
        self.pages_written += 1;
    }

    /// Rewrites the discovery page: directory of ring positions plus
    /// physical hints sampled from the pagemap (once, at startup).
    pub fn write_discovery(&mut self, hints: Option<&mut PagemapReader>) {
        let mut directory = [CategoryDir::default(); NUM_CATEGORIES];
        for (i, ring) in self.rings.iter().enumerate() {
            directory[i] = CategoryDir {
                base_offset: (ring.start_page * PAGE_SIZE) as u32,
                page_count: ring.page_count as u32,
                write_index: ring.write_index,
                sequence: ring.sequence,
            };
        }

        // Hints are measured once; the pages never move, so later rewrites
        // republish the same samples.
        if let Some(reader) = hints {
            let base = self.base_ptr() as usize;
            for (i, ring) in self.rings.iter().enumerate() {
                self.hints[i] = reader.sample_range(
                    base + ring.start_page * PAGE_SIZE,
                    ring.page_count,
                    MAX_HINTS_PER_CATEGORY,
                );
                debug!("category {i}: {} physical hints", self.hints[i].len());
            }
        }

        let disc = DiscoveryPage {
            session_pid: self.session_id,
            directory,
            hints: self.hints.clone(),
        };
        let header = self.header(BeaconClass::Index, 0, 1);
        let frame = self.frame(Category::Master, self.generation, 0);
        let global = self.ring(Category::Master).start_page + MASTER_DISCOVERY;
        disc.encode_into(self.page_mut(global), &header, &frame);
        self.seal(global, frame.version);
    }

    /// Publishes one generation of the PID snapshot across as many ring
    /// pages as it needs, overwriting the oldest generation.
    pub fn write_pid_generation(&mut self, pids: &[u32]) {
        let generation = self.generation;
        let pages_needed = pids.len().div_ceil(MAX_PIDS_PER_PAGE).max(1);
        let ring_pages = self.ring(Category::PidList).page_count;
        let pages_needed = pages_needed.min(ring_pages);

        for sub_page in 0..pages_needed {
            let chunk_start = sub_page * MAX_PIDS_PER_PAGE;
            let chunk_end = (chunk_start + MAX_PIDS_PER_PAGE).min(pids.len());
            let slot = self.pid_write_offset;
            self.pid_write_offset = (self.pid_write_offset + 1) % ring_pages;

            let page_list = PidListPage {
                total_pids: pids.len() as u32,
                page_number: sub_page as u32,
                pages_in_generation: pages_needed as u32,
                pids: pids[chunk_start..chunk_end].to_vec(),
            };
            let header = self.header(
                BeaconClass::BulkData,
                slot as u32,
                ring_pages as u32,
            );
            let frame = self.frame(Category::PidList, generation, sub_page as u32);
            let global = self.ring(Category::PidList).start_page + slot;
            page_list.encode_into(self.page_mut(global), &header, &frame);
            self.seal(global, frame.version);
        }

        self.rings[Category::PidList as usize].sequence += 1;
        self.last_pid_count = pids.len() as u32;
        debug!(
            "generation {generation}: {} PIDs in {pages_needed} pages",
            pids.len()
        );
        self.generation += 1;
    }

    /// Appends detail records to a ring (round-robin or camera), one page
    /// per call batch, advancing the ring's write index. Records that do
    /// not fit the page are returned so the caller can push them into the
    /// next cycle.
    pub fn write_detail(&mut self, category: Category, records: Vec<MapRecord>) -> Vec<MapRecord> {
        debug_assert!(matches!(category, Category::RoundRobin | Category::Camera));
        if records.is_empty() {
            return records;
        }
        let ring_pages = self.ring(category).page_count;
        let slot = self.ring(category).write_index as usize % ring_pages;
        self.rings[category as usize].write_index = (slot as u32 + 1) % ring_pages as u32;

        let stream = RecordStream { records };
        let header = self.header(BeaconClass::MemoryMap, slot as u32, ring_pages as u32);
        let frame = self.frame(category, self.generation, slot as u32);
        let global = self.ring(category).start_page + slot;
        let written = stream.encode_into(self.page_mut(global), &header, &frame);
        self.seal(global, frame.version);
        self.rings[category as usize].sequence += 1;

        self.processes_seen += stream
            .records
            .iter()
            .take(written)
            .filter(|r| matches!(r, MapRecord::Process(_)))
            .count() as u32;

        let mut rest = stream.records;
        rest.drain(..written);
        rest
    }

    /// Heartbeat counters; readers use the header's modified time for
    /// staleness.
    pub fn write_heartbeat(&mut self) {
        let stats = StatisticsPage {
            uptime_secs: self.started.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            cycles: self.cycles,
            processes_seen: self.processes_seen,
            pages_written: self.pages_written,
            last_pid_count: self.last_pid_count,
        };
        let header = self.header(BeaconClass::Statistics, 0, 1);
        let frame = self.frame(Category::Master, self.generation, 1);
        let global = self.ring(Category::Master).start_page + MASTER_STATISTICS;
        stats.encode_into(self.page_mut(global), &header, &frame);
        self.seal(global, frame.version);
        self.cycles += 1;
    }

    /// Diagnostic lines for the host; best-effort, drops what doesn't fit.
    pub fn write_log(&mut self, lines: &[String]) {
        let header = self.header(BeaconClass::LogBuffer, 0, 1);
        let frame = self.frame(Category::Master, self.generation, 2);
        let global = self.ring(Category::Master).start_page + MASTER_LOG;
        encode_log_lines(self.page_mut(global), &header, &frame, lines);
        self.seal(global, frame.version);
    }

    /// Initializes empty request/response rings. The host never writes
    /// guest memory, so these stay empty unless a guest-side peer fills
    /// them; they exist so the layout is complete and scannable.
    pub fn init_message_rings(&mut self) {
        let req_header = self.header(BeaconClass::RequestRing, 0, 1);
        let req_frame = self.frame(Category::Master, 0, 3);
        let global = self.ring(Category::Master).start_page + MASTER_REQUEST_RING;
        encode_request_ring(self.page_mut(global), &req_header, &req_frame, &[]);
        self.seal(global, req_frame.version);

        let resp_header = self.header(BeaconClass::ResponseRing, 0, 1);
        let resp_frame = self.frame(Category::Master, 0, 4);
        let global = self.ring(Category::Master).start_page + MASTER_RESPONSE_RING;
        encode_response_ring(self.page_mut(global), &resp_header, &resp_frame, &[]);
        self.seal(global, resp_frame.version);
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn pages_written(&self) -> u64 {
        self.pages_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vmscope_protocol::{decode_page, DecodedPayload, ProcessEntry, SectionEntry};

    #[test]
    fn arena_pages_are_aligned() {
        let arena = BeaconArena::new(0x1234);
        assert_eq!(arena.base_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(
            arena.total_pages(),
            MASTER_PAGES + PID_LIST_PAGES + ROUND_ROBIN_PAGES + CAMERA_PAGES
        );
    }

    #[test]
    fn discovery_page_round_trips_through_the_decoder() {
        let mut arena = BeaconArena::new(0x1234);
        arena.write_discovery(None);

        let decoded = decode_page(arena.page(0)).unwrap();
        assert_eq!(decoded.header.session_id, 0x1234);
        assert_eq!(decoded.header.beacon_class, BeaconClass::Index);
        match decoded.payload {
            DecodedPayload::Discovery(disc) => {
                assert_eq!(disc.session_pid, 0x1234);
                assert_eq!(disc.directory[1].base_offset, (MASTER_PAGES * PAGE_SIZE) as u32);
                assert_eq!(disc.directory[2].page_count, ROUND_ROBIN_PAGES as u32);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn pid_generation_round_trips() {
        let mut arena = BeaconArena::new(0x77);
        let pids: Vec<u32> = (1..=1500).collect();
        arena.write_pid_generation(&pids);

        // 1500 PIDs at 999 per page is two pages, written at ring start.
        let first = decode_page(arena.page(MASTER_PAGES)).unwrap();
        let second = decode_page(arena.page(MASTER_PAGES + 1)).unwrap();
        let (DecodedPayload::PidList(p0), DecodedPayload::PidList(p1)) =
            (first.payload, second.payload)
        else {
            panic!("expected pid list pages");
        };
        assert_eq!(p0.total_pids, 1500);
        assert_eq!(p0.pages_in_generation, 2);
        assert_eq!(p0.pids.len(), MAX_PIDS_PER_PAGE);
        assert_eq!(p1.pids.len(), 1500 - MAX_PIDS_PER_PAGE);

        let mut all = p0.pids.clone();
        all.extend_from_slice(&p1.pids);
        assert_eq!(all, pids);
        assert_eq!(arena.generation(), 1);
    }

    #[test]
    fn detail_page_returns_overflow_records() {
        let mut arena = BeaconArena::new(0x77);
        let mut records = Vec::new();
        for pid in 0..20u32 {
            records.push(MapRecord::Process(ProcessEntry {
                pid,
                comm: format!("proc{pid}"),
                ..Default::default()
            }));
            records.push(MapRecord::Section(SectionEntry {
                pid,
                start_addr: 0x1000,
                end_addr: 0x2000,
                ..Default::default()
            }));
        }
        let total = records.len();
        let rest = arena.write_detail(Category::RoundRobin, records);
        assert!(!rest.is_empty());
        assert!(rest.len() < total);

        let decoded = decode_page(arena.page(MASTER_PAGES + PID_LIST_PAGES)).unwrap();
        match decoded.payload {
            DecodedPayload::Records(stream) => {
                assert_eq!(stream.records.len(), total - rest.len());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn heartbeat_counts_cycles() {
        let mut arena = BeaconArena::new(0x77);
        arena.write_heartbeat();
        arena.write_heartbeat();

        let decoded = decode_page(arena.page(MASTER_STATISTICS)).unwrap();
        match decoded.payload {
            DecodedPayload::Statistics(stats) => assert_eq!(stats.cycles, 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn message_rings_decode_empty() {
        let mut arena = BeaconArena::new(0x77);
        arena.init_message_rings();
        let req = decode_page(arena.page(MASTER_REQUEST_RING)).unwrap();
        assert!(matches!(req.payload, DecodedPayload::Requests(ref v) if v.is_empty()));
        let resp = decode_page(arena.page(MASTER_RESPONSE_RING)).unwrap();
        assert!(matches!(resp.payload, DecodedPayload::Responses(ref v) if v.is_empty()));
    }
}
