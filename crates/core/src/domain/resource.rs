//! Access to instrument and patch lumps
//!
//! The lump loader itself lives outside the core; this is the interface the
//! arbitration pass needs from it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResourceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource IO error: {0}")]
    Io(String),
}

/// Opaque handle to a lump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub usize);

/// Name of the OPL instrument bank
pub const GENMIDI: &str = "GENMIDI";
/// Wavetable patch map for the registered/shareware releases
pub const DMXGUS: &str = "DMXGUS";
/// Wavetable patch map for the commercial release
pub const DMXGUSC: &str = "DMXGUSC";

pub trait ResourceProvider: Send {
    fn lookup(&self, name: &str) -> Result<ResourceHandle>;

    /// Load a lump; the bytes stay cached until [`release`](Self::release)
    fn load(&mut self, handle: ResourceHandle) -> Result<Vec<u8>>;

    fn release(&mut self, handle: ResourceHandle);
}
