//! Beacon reader: decodes indexed pages into typed payloads.
//!
//! The reader owns the index produced by the scanner and re-checks tear
//! markers and session identity on every read — the guest rewrites these
//! pages underneath us, so a page that indexed cleanly can still be torn by
//! the time it is decoded. Torn or mismatched pages surface as
//! `StaleBeacon`; the caller retries or skips.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use vmscope_protocol::{
    decode_page, BeaconClass, Category, DecodedPage, DecodedPayload, DiscoveryPage, MapRecord,
    ProcessEntry, SectionEntry, StatisticsPage, TriggeredBeacon, FLAG_TRIGGERED, PAGE_SIZE,
};

use crate::backend::MemoryBackend;
use crate::beacon::{BeaconIndex, BeaconScanner};
use crate::error::{Error, Result};

pub struct BeaconReader {
    backend: Arc<MemoryBackend>,
    index: BeaconIndex,
}

impl BeaconReader {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        BeaconReader {
            backend,
            index: BeaconIndex::new(),
        }
    }

    /// Full rescan of the memory file. Returns the number of valid beacons.
    pub fn rescan(&mut self) -> usize {
        self.index = BeaconScanner::scan(&self.backend);
        self.index.total()
    }

    pub fn index(&self) -> &BeaconIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut BeaconIndex {
        &mut self.index
    }

    pub fn sessions(&self) -> Vec<u32> {
        self.index.sessions()
    }

    /// Decodes the page at a file offset.
    pub fn read_page(&self, file_offset: u64) -> Result<DecodedPage> {
        let page = self.backend.slice(file_offset, PAGE_SIZE)?;
        decode_page(page).map_err(|e| Error::from_wire(file_offset, e))
    }

    /// Like [`read_page`](Self::read_page) but additionally requires the
    /// page to still belong to `session` — the companion may have exited
    /// and another session reused the memory.
    pub fn read_session_page(&self, session: u32, file_offset: u64) -> Result<DecodedPage> {
        let decoded = self.read_page(file_offset)?;
        if decoded.header.session_id != session {
            return Err(Error::StaleBeacon {
                offset: file_offset,
                reason: format!(
                    "session changed: expected {session:#x}, found {:#x}",
                    decoded.header.session_id
                ),
            });
        }
        Ok(decoded)
    }

    /// The session's discovery page (Index class, page 0).
    pub fn discovery(&self, session: u32) -> Result<DiscoveryPage> {
        let info = self
            .index
            .find_by_session(session)
            .into_iter()
            .find(|b| b.beacon_class == BeaconClass::Index && b.page_index == 0)
            .ok_or(Error::NotConfigured("session has no discovery page"))?;
        match self.read_session_page(session, info.file_offset)?.payload {
            DecodedPayload::Discovery(page) => Ok(page),
            _ => Err(Error::Malformed("index page without discovery payload".into())),
        }
    }

    /// Reassembles the newest complete PID generation: every sub-page
    /// present and tear-valid, concatenated in page order. `None` when no
    /// generation is currently complete.
    pub fn latest_pid_generation(&self, session: u32) -> Result<Option<(u32, Vec<u32>)>> {
        let mut generations: BTreeMap<u32, BTreeMap<u32, vmscope_protocol::PidListPage>> =
            BTreeMap::new();

        for info in self.index.find_by_session(session) {
            if info.beacon_class != BeaconClass::BulkData {
                continue;
            }
            let decoded = match self.read_session_page(session, info.file_offset) {
                Ok(d) => d,
                Err(Error::StaleBeacon { offset, reason }) => {
                    debug!("skipping stale pid page at {offset:#x}: {reason}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(frame) = decoded.frame else { continue };
            if frame.category != Category::PidList {
                continue;
            }
            if let DecodedPayload::PidList(page) = decoded.payload {
                generations
                    .entry(frame.generation)
                    .or_default()
                    .insert(page.page_number, page);
            }
        }

        for (generation, pages) in generations.into_iter().rev() {
            let Some(first) = pages.get(&0) else { continue };
            let expected = first.pages_in_generation;
            let complete = expected as usize == pages.len()
                && (0..expected).all(|n| pages.contains_key(&n));
            if !complete {
                debug!(
                    "generation {generation} incomplete: {} of {expected} pages",
                    pages.len()
                );
                continue;
            }
            let mut pids = Vec::with_capacity(first.total_pids as usize);
            for page in pages.values() {
                pids.extend_from_slice(&page.pids);
            }
            if pids.len() != first.total_pids as usize {
                warn!(
                    "generation {generation} pid count mismatch: {} vs {}",
                    pids.len(),
                    first.total_pids
                );
                continue;
            }
            return Ok(Some((generation, pids)));
        }
        Ok(None)
    }

    /// Per-process detail published through `MemoryMap` record streams,
    /// grouped as (process, its sections), in stream order. `category`
    /// narrows to one ring (round-robin vs camera).
    pub fn process_details(
        &self,
        session: u32,
        category: Option<Category>,
    ) -> Result<Vec<(ProcessEntry, Vec<SectionEntry>)>> {
        let mut streams: BTreeMap<(u32, u64), Vec<MapRecord>> = BTreeMap::new();

        for info in self.index.find_by_session(session) {
            if info.beacon_class != BeaconClass::MemoryMap {
                continue;
            }
            let decoded = match self.read_session_page(session, info.file_offset) {
                Ok(d) => d,
                Err(Error::StaleBeacon { offset, reason }) => {
                    debug!("skipping stale detail page at {offset:#x}: {reason}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let Some(frame) = decoded.frame else { continue };
            if category.is_some_and(|c| frame.category != c) {
                continue;
            }
            if let DecodedPayload::Records(stream) = decoded.payload {
                streams.insert((frame.sequence, info.file_offset), stream.records);
            }
        }

        let mut out: Vec<(ProcessEntry, Vec<SectionEntry>)> = Vec::new();
        for records in streams.into_values() {
            for record in records {
                match record {
                    MapRecord::Process(p) => out.push((p, Vec::new())),
                    MapRecord::Section(s) => {
                        if let Some((process, sections)) = out.last_mut() {
                            if process.pid == s.pid {
                                sections.push(s);
                                continue;
                            }
                        }
                        debug!("orphan section record for pid {}", s.pid);
                    }
                }
            }
        }
        Ok(out)
    }

    /// The session's heartbeat counters plus their age in seconds.
    pub fn heartbeat(&self, session: u32) -> Result<(StatisticsPage, u64)> {
        for info in self.index.find_by_session(session) {
            if info.beacon_class != BeaconClass::Statistics {
                continue;
            }
            match self.read_session_page(session, info.file_offset) {
                Ok(decoded) => {
                    if let DecodedPayload::Statistics(stats) = decoded.payload {
                        let age = (Utc::now().timestamp() as u64)
                            .saturating_sub(decoded.header.modified_time);
                        return Ok((stats, age));
                    }
                }
                Err(Error::StaleBeacon { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotConfigured("session has no heartbeat page"))
    }

    /// True when the session's heartbeat is older than `max_age_secs` (or
    /// missing entirely).
    pub fn is_stale(&self, session: u32, max_age_secs: u64) -> bool {
        match self.heartbeat(session) {
            Ok((_, age)) => age > max_age_secs,
            Err(_) => true,
        }
    }

    /// Diagnostic log lines, in write order across the session's log pages.
    pub fn logs(&self, session: u32) -> Result<Vec<String>> {
        let mut pages: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for info in self.index.find_by_session(session) {
            if info.beacon_class != BeaconClass::LogBuffer {
                continue;
            }
            match self.read_session_page(session, info.file_offset) {
                Ok(decoded) => {
                    if let (Some(frame), DecodedPayload::Log(lines)) =
                        (decoded.frame, decoded.payload)
                    {
                        pages.insert(frame.sequence, lines);
                    }
                }
                Err(Error::StaleBeacon { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(pages.into_values().flatten().collect())
    }

    /// Locates a triggered (single-shot) beacon by its request id and
    /// decodes the full multi-page span. The companion prints a guest VA,
    /// but the request id — not the address — is the discovery key here.
    pub fn find_triggered(&self, request_id: u32) -> Result<TriggeredBeacon> {
        for info in self.index.iter() {
            if !info.active || info.page_index != 0 {
                continue;
            }
            let Ok(first) = self.backend.slice(info.file_offset, PAGE_SIZE) else {
                continue;
            };
            let Ok(header) = vmscope_protocol::BeaconHeader::decode(first) else {
                continue;
            };
            if header.flags & FLAG_TRIGGERED == 0 {
                continue;
            }
            let rid = u32::from_le_bytes([first[64], first[65], first[66], first[67]]);
            if rid != request_id {
                continue;
            }
            let span_len = header.total_pages as usize * PAGE_SIZE;
            let span = self.backend.slice(info.file_offset, span_len)?;
            return TriggeredBeacon::decode(span)
                .map_err(|e| Error::from_wire(info.file_offset, e));
        }
        Err(Error::NotConfigured("no triggered beacon with that request id"))
    }
}
