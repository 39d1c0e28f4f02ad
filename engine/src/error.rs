//! Engine error taxonomy.
//!
//! Walkers and readers never abort the engine: translation failures come
//! back as `Unmapped`, torn or mismatched beacon pages as `StaleBeacon`, and
//! scans simply skip bad pages. Only the monitor client is allowed to go
//! permanently bad (until reconnected), and it reports that through
//! `Network`/`Protocol`.

use thiserror::Error;
use vmscope_protocol::WireError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required resource (memory file, monitor port) is unavailable.
    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    /// Host-side I/O failure (memory file, temp files).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket failure against the hypervisor monitor.
    #[error("monitor network failure: {0}")]
    Network(#[source] std::io::Error),

    /// The monitor returned malformed or unexpected output.
    #[error("monitor protocol error: {0}")]
    Protocol(String),

    /// The requested address has no mapping at this level.
    #[error("address {addr:#x} is unmapped in {space}")]
    Unmapped { addr: u64, space: &'static str },

    /// Address outside the backing file's mapped region.
    #[error("offset {offset:#x}+{len:#x} outside mapped range of {size:#x} bytes")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    /// No kernel offset set validated against the guest.
    #[error("no kernel structure offsets validated against this guest")]
    OffsetsUnknown,

    /// A beacon page failed tear or session checks; retry or skip.
    #[error("stale beacon at offset {offset:#x}: {reason}")]
    StaleBeacon { offset: u64, reason: String },

    /// A beacon payload of a recognized class failed internal validation.
    #[error("malformed beacon payload: {0}")]
    Malformed(String),
}

impl Error {
    /// Maps a wire decode failure for a page at `offset` into the engine
    /// taxonomy: torn markers are staleness, everything else is malformed.
    pub fn from_wire(offset: u64, err: WireError) -> Self {
        match err {
            WireError::TornPage { .. } => Error::StaleBeacon {
                offset,
                reason: err.to_string(),
            },
            other => Error::Malformed(other.to_string()),
        }
    }
}
