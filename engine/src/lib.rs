//! vmscope engine — host-side, out-of-band introspection of a
//! hardware-virtualization guest.
//!
//! The engine owns three read paths into the guest and never writes any of
//! them: the hypervisor's memory-backend file (mapped read-only), the
//! monitor's JSON command socket, and the beacon pages a cooperating guest
//! companion publishes into its own RAM. On top of those it reconstructs
//! RAM layout, page-table translations, the kernel's process list, and the
//! companion's published snapshots.

pub mod addr;
pub mod backend;
pub mod beacon;
pub mod crunched;
pub mod error;
pub mod monitor;
pub mod process;
pub mod region;
pub mod session;
pub mod walker;

pub use addr::{AddressSpace, TypedAddress};
pub use backend::MemoryBackend;
pub use error::{Error, Result};
pub use monitor::MonitorClient;
pub use process::{create_process_walker, ProcessRecord, ProcessWalker};
pub use region::{RamRegion, RegionMap};
pub use session::Session;
pub use walker::{create_page_walker, PageWalker};
