//! The fixed 64-byte header at the start of every beacon page.

use crate::{
    get_u32, get_u64, put_u32, put_u64, BeaconClass, WireError, BEACON_MAGIC1, BEACON_MAGIC2,
    HEADER_LEN, PROTOCOL_VERSION,
};

/// Header layout (byte offsets are wire contract):
///
/// ```text
///  0  magic1            u32   0x3142FACE
///  4  magic2            u32   0xCAFEBABE
///  8  session_id        u32
/// 12  beacon_class      u32   1..=10
/// 16  page_index        u32   index within this class, not global
/// 20  total_pages       u32   pages in this class
/// 24  protocol_version  u32
/// 28  flags             u32
/// 32  created_time      u64   epoch seconds, page allocation
/// 40  modified_time     u64   epoch seconds, last rewrite
/// 48  checksum          u32   reserved, 0 unless used
/// 52  reserved          3×u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconHeader {
    pub session_id: u32,
    pub beacon_class: BeaconClass,
    pub page_index: u32,
    pub total_pages: u32,
    pub protocol_version: u32,
    pub flags: u32,
    pub created_time: u64,
    pub modified_time: u64,
    pub checksum: u32,
}

impl BeaconHeader {
    pub fn new(session_id: u32, class: BeaconClass, page_index: u32, total_pages: u32) -> Self {
        BeaconHeader {
            session_id,
            beacon_class: class,
            page_index,
            total_pages,
            protocol_version: PROTOCOL_VERSION,
            flags: 0,
            created_time: 0,
            modified_time: 0,
            checksum: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode_into(&self, page: &mut [u8]) {
        assert!(page.len() >= HEADER_LEN);
        put_u32(page, 0, BEACON_MAGIC1);
        put_u32(page, 4, BEACON_MAGIC2);
        put_u32(page, 8, self.session_id);
        put_u32(page, 12, self.beacon_class as u32);
        put_u32(page, 16, self.page_index);
        put_u32(page, 20, self.total_pages);
        put_u32(page, 24, self.protocol_version);
        put_u32(page, 28, self.flags);
        put_u64(page, 32, self.created_time);
        put_u64(page, 40, self.modified_time);
        put_u32(page, 48, self.checksum);
        put_u32(page, 52, 0);
        put_u32(page, 56, 0);
        put_u32(page, 60, 0);
    }

    pub fn decode(page: &[u8]) -> Result<Self, WireError> {
        if page.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                need: HEADER_LEN,
                got: page.len(),
            });
        }
        if get_u32(page, 0) != BEACON_MAGIC1 || get_u32(page, 4) != BEACON_MAGIC2 {
            return Err(WireError::BadMagic);
        }
        let raw_class = get_u32(page, 12);
        let beacon_class =
            BeaconClass::from_u32(raw_class).ok_or(WireError::UnknownClass(raw_class))?;
        Ok(BeaconHeader {
            session_id: get_u32(page, 8),
            beacon_class,
            page_index: get_u32(page, 16),
            total_pages: get_u32(page, 20),
            protocol_version: get_u32(page, 24),
            flags: get_u32(page, 28),
            created_time: get_u64(page, 32),
            modified_time: get_u64(page, 40),
            checksum: get_u32(page, 48),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FLAG_TEAR_VERSIONED, PAGE_SIZE};
    use pretty_assertions::assert_eq;

    #[test]
    fn header_roundtrip() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut hdr = BeaconHeader::new(0xC0DE, BeaconClass::Statistics, 3, 8)
            .with_flags(FLAG_TEAR_VERSIONED);
        hdr.created_time = 1_700_000_000;
        hdr.modified_time = 1_700_000_042;
        hdr.encode_into(&mut page);

        let back = BeaconHeader::decode(&page).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn rejects_bad_magic_and_class() {
        let mut page = vec![0u8; PAGE_SIZE];
        assert_eq!(BeaconHeader::decode(&page), Err(WireError::BadMagic));

        BeaconHeader::new(1, BeaconClass::Index, 0, 1).encode_into(&mut page);
        put_u32(&mut page, 12, 99);
        assert_eq!(BeaconHeader::decode(&page), Err(WireError::UnknownClass(99)));
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 16];
        assert_eq!(
            BeaconHeader::decode(&buf),
            Err(WireError::Truncated { need: 64, got: 16 })
        );
    }
}
