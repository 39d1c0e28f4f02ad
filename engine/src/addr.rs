//! Typed addresses over the engine's four address spaces.

pub mod parse;

use std::fmt;

use serde::Serialize;

pub use parse::AddressParser;

/// Which space a raw number lives in. `None` is a parser-context artifact:
/// an address that never got a space assigned cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressSpace {
    None,
    /// Offset into the memory-backend file.
    SharedFileOffset,
    GuestPhysical,
    GuestVirtual {
        pid: Option<u32>,
    },
    /// Index into a process's dense virtual-region catalog.
    Crunched,
}

impl AddressSpace {
    pub fn prefix(&self) -> &'static str {
        match self {
            AddressSpace::None => "",
            AddressSpace::SharedFileOffset => "s:",
            AddressSpace::GuestPhysical => "p:",
            AddressSpace::GuestVirtual { .. } => "v:",
            AddressSpace::Crunched => "c:",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypedAddress {
    value: u64,
    space: AddressSpace,
}

impl TypedAddress {
    pub fn shared(value: u64) -> Self {
        TypedAddress {
            value,
            space: AddressSpace::SharedFileOffset,
        }
    }

    pub fn physical(value: u64) -> Self {
        TypedAddress {
            value,
            space: AddressSpace::GuestPhysical,
        }
    }

    pub fn virt(value: u64, pid: Option<u32>) -> Self {
        TypedAddress {
            value,
            space: AddressSpace::GuestVirtual { pid },
        }
    }

    pub fn crunched(value: u64) -> Self {
        TypedAddress {
            value,
            space: AddressSpace::Crunched,
        }
    }

    /// A bare number with no space yet. Not readable until a space is
    /// assigned with [`with_space`](Self::with_space).
    pub fn unspaced(value: u64) -> Self {
        TypedAddress {
            value,
            space: AddressSpace::None,
        }
    }

    pub fn with_space(mut self, space: AddressSpace) -> Self {
        self.space = space;
        self
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn is_readable(&self) -> bool {
        self.space != AddressSpace::None
    }

    pub fn offset(mut self, delta: i64) -> Self {
        self.value = self.value.wrapping_add_signed(delta);
        self
    }
}

impl fmt::Display for TypedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space {
            AddressSpace::GuestVirtual { pid: Some(pid) } => {
                write!(f, "v:{pid}:{:x}", self.value)
            }
            space => write!(f, "{}{:x}", space.prefix(), self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn formatting_carries_prefix_and_pid() {
        assert_eq!(TypedAddress::shared(0x1000).to_string(), "s:1000");
        assert_eq!(TypedAddress::physical(0x4000_0000).to_string(), "p:40000000");
        assert_eq!(TypedAddress::virt(0xFF00, Some(742)).to_string(), "v:742:ff00");
        assert_eq!(TypedAddress::virt(0xFF00, None).to_string(), "v:ff00");
        assert_eq!(TypedAddress::crunched(0x20).to_string(), "c:20");
    }

    #[test]
    fn unspaced_addresses_are_not_readable() {
        let addr = TypedAddress::unspaced(0x1234);
        assert!(!addr.is_readable());
        assert!(addr.with_space(AddressSpace::GuestPhysical).is_readable());
    }
}
