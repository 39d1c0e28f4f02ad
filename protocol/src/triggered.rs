//! Single-shot ("triggered") beacon layout.
//!
//! Unlike the continuous categories, a triggered beacon is written exactly
//! once: a 64-byte header on page 0 (with [`crate::FLAG_TRIGGERED`]), a
//! 16-byte triggered header, then a variable-length entry stream that may
//! spill into a raw data tail across `total_pages` pages. No tear footer.

use crate::{
    get_fixed_str, get_u16, get_u32, put_fixed_str, put_u16, put_u32, BeaconClass, BeaconHeader,
    WireError, FLAG_TRIGGERED, HEADER_LEN, PAGE_SIZE,
};

pub const ENTRY_TYPE_PID: u8 = 0x01;
pub const ENTRY_TYPE_MAPS: u8 = 0x11;

/// On-wire size of a triggered PID entry.
pub const TRIGGERED_PID_ENTRY_SIZE: usize = 56;
/// Header bytes before a maps entry's text body.
pub const TRIGGERED_MAPS_HEADER_SIZE: usize = 12;

const TRIG_HEADER_OFFSET: usize = HEADER_LEN;
const STREAM_OFFSET: usize = HEADER_LEN + 16;

/// Triggered header at offset 64 of page 0:
/// request_id (64), focus_pid (68), entry_count (72), data_len (76).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggeredHeader {
    pub request_id: u32,
    pub focus_pid: u32,
    pub entry_count: u32,
    /// Total stream bytes, including any tail beyond page 0.
    pub data_len: u32,
}

/// One entry in the triggered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggeredEntry {
    Pid {
        pid: u32,
        ppid: u32,
        uid: u32,
        vsize_kb: u32,
        rss_kb: u32,
        name: String,
    },
    /// Raw text of `/proc/<pid>/maps` for the focus PID.
    Maps { pid: u32, text: String },
}

impl TriggeredEntry {
    pub fn wire_size(&self) -> usize {
        match self {
            TriggeredEntry::Pid { .. } => TRIGGERED_PID_ENTRY_SIZE,
            TriggeredEntry::Maps { text, .. } => TRIGGERED_MAPS_HEADER_SIZE + text.len(),
        }
    }

    fn encode_into(&self, buf: &mut [u8]) {
        match self {
            TriggeredEntry::Pid {
                pid,
                ppid,
                uid,
                vsize_kb,
                rss_kb,
                name,
            } => {
                buf[0] = ENTRY_TYPE_PID;
                buf[1] = name.len().min(31) as u8;
                put_u16(buf, 2, TRIGGERED_PID_ENTRY_SIZE as u16);
                put_u32(buf, 4, *pid);
                put_u32(buf, 8, *ppid);
                put_u32(buf, 12, *uid);
                put_u32(buf, 16, *vsize_kb);
                put_u32(buf, 20, *rss_kb);
                put_fixed_str(buf, 24, 32, name);
            }
            TriggeredEntry::Maps { pid, text } => {
                buf[0] = ENTRY_TYPE_MAPS;
                buf[1] = 0;
                let size = (TRIGGERED_MAPS_HEADER_SIZE + text.len()).min(u16::MAX as usize);
                put_u16(buf, 2, size as u16);
                put_u32(buf, 4, *pid);
                put_u32(buf, 8, text.len() as u32);
                buf[12..12 + text.len()].copy_from_slice(text.as_bytes());
            }
        }
    }
}

/// A complete triggered beacon, encoded over one or more pages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggeredBeacon {
    pub session_id: u32,
    pub request_id: u32,
    pub focus_pid: u32,
    pub entries: Vec<TriggeredEntry>,
}

impl TriggeredBeacon {
    /// Total pages the encoded beacon occupies.
    pub fn page_count(&self) -> usize {
        let stream: usize = self.entries.iter().map(|e| e.wire_size()).sum();
        (STREAM_OFFSET + stream).div_ceil(PAGE_SIZE).max(1)
    }

    /// Encodes into `out`, which must hold `page_count() * PAGE_SIZE` bytes.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), WireError> {
        let pages = self.page_count();
        let need = pages * PAGE_SIZE;
        if out.len() < need {
            return Err(WireError::Truncated {
                need,
                got: out.len(),
            });
        }
        out[..need].fill(0);

        let mut header = BeaconHeader::new(self.session_id, BeaconClass::BulkData, 0, pages as u32);
        header.flags = FLAG_TRIGGERED;
        header.encode_into(out);

        let data_len: usize = self.entries.iter().map(|e| e.wire_size()).sum();
        put_u32(out, TRIG_HEADER_OFFSET, self.request_id);
        put_u32(out, TRIG_HEADER_OFFSET + 4, self.focus_pid);
        put_u32(out, TRIG_HEADER_OFFSET + 8, self.entries.len() as u32);
        put_u32(out, TRIG_HEADER_OFFSET + 12, data_len as u32);

        let mut off = STREAM_OFFSET;
        for entry in &self.entries {
            entry.encode_into(&mut out[off..off + entry.wire_size()]);
            off += entry.wire_size();
        }
        Ok(())
    }

    /// Decodes a beacon from its full span (page 0 plus the data tail).
    pub fn decode(span: &[u8]) -> Result<Self, WireError> {
        if span.len() < PAGE_SIZE {
            return Err(WireError::Truncated {
                need: PAGE_SIZE,
                got: span.len(),
            });
        }
        let header = BeaconHeader::decode(span)?;
        if header.flags & FLAG_TRIGGERED == 0 {
            return Err(WireError::Malformed("not a triggered beacon"));
        }
        let trig = TriggeredHeader {
            request_id: get_u32(span, TRIG_HEADER_OFFSET),
            focus_pid: get_u32(span, TRIG_HEADER_OFFSET + 4),
            entry_count: get_u32(span, TRIG_HEADER_OFFSET + 8),
            data_len: get_u32(span, TRIG_HEADER_OFFSET + 12),
        };
        let end = STREAM_OFFSET + trig.data_len as usize;
        if end > span.len() {
            return Err(WireError::Truncated {
                need: end,
                got: span.len(),
            });
        }

        let mut entries = Vec::with_capacity(trig.entry_count as usize);
        let mut off = STREAM_OFFSET;
        while off + 4 <= end && entries.len() < trig.entry_count as usize {
            let entry_type = span[off];
            let entry_size = get_u16(span, off + 2) as usize;
            if entry_size < 4 || off + entry_size > end {
                return Err(WireError::Malformed("triggered entry overruns stream"));
            }
            match entry_type {
                ENTRY_TYPE_PID => {
                    if entry_size < TRIGGERED_PID_ENTRY_SIZE {
                        return Err(WireError::Malformed("short pid entry"));
                    }
                    entries.push(TriggeredEntry::Pid {
                        pid: get_u32(span, off + 4),
                        ppid: get_u32(span, off + 8),
                        uid: get_u32(span, off + 12),
                        vsize_kb: get_u32(span, off + 16),
                        rss_kb: get_u32(span, off + 20),
                        name: get_fixed_str(span, off + 24, 32),
                    });
                }
                ENTRY_TYPE_MAPS => {
                    let text_len = get_u32(span, off + 8) as usize;
                    if off + TRIGGERED_MAPS_HEADER_SIZE + text_len > end {
                        return Err(WireError::Malformed("maps entry overruns stream"));
                    }
                    let body = &span[off + TRIGGERED_MAPS_HEADER_SIZE
                        ..off + TRIGGERED_MAPS_HEADER_SIZE + text_len];
                    entries.push(TriggeredEntry::Maps {
                        pid: get_u32(span, off + 4),
                        text: String::from_utf8_lossy(body).into_owned(),
                    });
                    // entry_size saturates at u16::MAX for big maps; trust data_len.
                    off += TRIGGERED_MAPS_HEADER_SIZE + text_len;
                    continue;
                }
                _ => return Err(WireError::Malformed("unknown triggered entry type")),
            }
            off += entry_size;
        }
        if entries.len() != trig.entry_count as usize {
            return Err(WireError::Malformed("triggered entry count mismatch"));
        }

        Ok(TriggeredBeacon {
            session_id: header.session_id,
            request_id: trig.request_id,
            focus_pid: trig.focus_pid,
            entries,
        })
    }
}
