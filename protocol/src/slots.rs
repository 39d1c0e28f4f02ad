//! Fixed-size request/response slots for the ring pages.
//!
//! The engine side is decode-only: the host never writes guest memory, so
//! these exist for the companion to maintain and for the reader to observe.

use crate::{get_u32, get_u64, put_u32, put_u64, WireError, BEACON_MAGIC1, SLOT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    None = 0,
    ListProcesses = 1,
    GetProcessInfo = 2,
    ContinueIteration = 3,
    CancelIteration = 4,
    GetMemoryMap = 5,
    ReadMemory = 6,
}

impl RequestType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::ListProcesses,
            2 => Self::GetProcessInfo,
            3 => Self::ContinueIteration,
            4 => Self::CancelIteration,
            5 => Self::GetMemoryMap,
            6 => Self::ReadMemory,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseStatus {
    Pending = 0,
    Success = 1,
    Error = 2,
    MoreData = 3,
    Complete = 4,
}

impl ResponseStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Pending,
            1 => Self::Success,
            2 => Self::Error,
            3 => Self::MoreData,
            4 => Self::Complete,
            _ => return None,
        })
    }
}

/// Typed view of a request slot's 192-byte argument area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestArgs {
    None,
    ListProcesses { flags: u32, max_results: u32 },
    ReadMemory { address: u64, size: u32 },
    /// Argument area of a type this decoder has no schema for.
    Raw(Vec<u8>),
}

/// One 256-byte request slot.
///
/// Layout: magic (0), owner_pid (4), sequence (8), type (12), iterator_id
/// (16), target_pid (20), timestamp (24), pad to 64, argument area 64..256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSlot {
    pub occupied: bool,
    pub owner_pid: u32,
    pub sequence: u32,
    pub req_type: RequestType,
    pub iterator_id: u32,
    pub target_pid: u32,
    pub timestamp: u64,
    pub args: RequestArgs,
}

impl RequestSlot {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SLOT_SIZE {
            return Err(WireError::Truncated {
                need: SLOT_SIZE,
                got: buf.len(),
            });
        }
        let occupied = get_u32(buf, 0) == BEACON_MAGIC1;
        let raw_type = get_u32(buf, 12);
        let req_type = RequestType::from_u32(raw_type)
            .ok_or(WireError::Malformed("request type out of range"))?;
        let args = match req_type {
            RequestType::ListProcesses => RequestArgs::ListProcesses {
                flags: get_u32(buf, 64),
                max_results: get_u32(buf, 68),
            },
            RequestType::ReadMemory => RequestArgs::ReadMemory {
                address: get_u64(buf, 64),
                size: get_u32(buf, 72),
            },
            RequestType::None => RequestArgs::None,
            _ => RequestArgs::Raw(buf[64..SLOT_SIZE].to_vec()),
        };
        Ok(RequestSlot {
            occupied,
            owner_pid: get_u32(buf, 4),
            sequence: get_u32(buf, 8),
            req_type,
            iterator_id: get_u32(buf, 16),
            target_pid: get_u32(buf, 20),
            timestamp: get_u64(buf, 24),
            args,
        })
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SLOT_SIZE);
        buf[..SLOT_SIZE].fill(0);
        if self.occupied {
            put_u32(buf, 0, BEACON_MAGIC1);
        }
        put_u32(buf, 4, self.owner_pid);
        put_u32(buf, 8, self.sequence);
        put_u32(buf, 12, self.req_type as u32);
        put_u32(buf, 16, self.iterator_id);
        put_u32(buf, 20, self.target_pid);
        put_u64(buf, 24, self.timestamp);
        match &self.args {
            RequestArgs::ListProcesses { flags, max_results } => {
                put_u32(buf, 64, *flags);
                put_u32(buf, 68, *max_results);
            }
            RequestArgs::ReadMemory { address, size } => {
                put_u64(buf, 64, *address);
                put_u32(buf, 72, *size);
            }
            RequestArgs::Raw(bytes) => {
                let n = bytes.len().min(SLOT_SIZE - 64);
                buf[64..64 + n].copy_from_slice(&bytes[..n]);
            }
            RequestArgs::None => {}
        }
    }
}

/// One 256-byte response slot.
///
/// Layout: magic (0), sequence (4), status (8), error_code (12), iterator_id
/// (16), items_count (20), items_remaining (24), pad to 64, data 64..256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSlot {
    pub occupied: bool,
    pub sequence: u32,
    pub status: ResponseStatus,
    pub error_code: u32,
    pub iterator_id: u32,
    pub items_count: u32,
    pub items_remaining: u32,
    pub data: Vec<u8>,
}

impl ResponseSlot {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SLOT_SIZE {
            return Err(WireError::Truncated {
                need: SLOT_SIZE,
                got: buf.len(),
            });
        }
        let raw_status = get_u32(buf, 8);
        let status = ResponseStatus::from_u32(raw_status)
            .ok_or(WireError::Malformed("response status out of range"))?;
        Ok(ResponseSlot {
            occupied: get_u32(buf, 0) == BEACON_MAGIC1,
            sequence: get_u32(buf, 4),
            status,
            error_code: get_u32(buf, 12),
            iterator_id: get_u32(buf, 16),
            items_count: get_u32(buf, 20),
            items_remaining: get_u32(buf, 24),
            data: buf[64..SLOT_SIZE].to_vec(),
        })
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SLOT_SIZE);
        buf[..SLOT_SIZE].fill(0);
        if self.occupied {
            put_u32(buf, 0, BEACON_MAGIC1);
        }
        put_u32(buf, 4, self.sequence);
        put_u32(buf, 8, self.status as u32);
        put_u32(buf, 12, self.error_code);
        put_u32(buf, 16, self.iterator_id);
        put_u32(buf, 20, self.items_count);
        put_u32(buf, 24, self.items_remaining);
        let n = self.data.len().min(SLOT_SIZE - 64);
        buf[64..64 + n].copy_from_slice(&self.data[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_slot_roundtrip() {
        let slot = RequestSlot {
            occupied: true,
            owner_pid: 777,
            sequence: 9,
            req_type: RequestType::ReadMemory,
            iterator_id: 0,
            target_pid: 1,
            timestamp: 1_700_000_000,
            args: RequestArgs::ReadMemory {
                address: 0xFFFF_0000_1000_0000,
                size: 4096,
            },
        };
        let mut buf = vec![0u8; SLOT_SIZE];
        slot.encode_into(&mut buf);
        assert_eq!(RequestSlot::decode(&buf).unwrap(), slot);
    }

    #[test]
    fn empty_slot_decodes_unoccupied() {
        let buf = vec![0u8; SLOT_SIZE];
        let slot = RequestSlot::decode(&buf).unwrap();
        assert!(!slot.occupied);
        assert_eq!(slot.req_type, RequestType::None);
    }

    #[test]
    fn response_slot_roundtrip() {
        let slot = ResponseSlot {
            occupied: true,
            sequence: 9,
            status: ResponseStatus::MoreData,
            error_code: 0,
            iterator_id: 2,
            items_count: 50,
            items_remaining: 120,
            data: vec![0u8; SLOT_SIZE - 64],
        };
        let mut buf = vec![0u8; SLOT_SIZE];
        slot.encode_into(&mut buf);
        assert_eq!(ResponseSlot::decode(&buf).unwrap(), slot);
    }

    #[test]
    fn bad_status_is_malformed() {
        let mut buf = vec![0u8; SLOT_SIZE];
        put_u32(&mut buf, 8, 99);
        assert_eq!(
            ResponseSlot::decode(&buf),
            Err(WireError::Malformed("response status out of range"))
        );
    }
}
