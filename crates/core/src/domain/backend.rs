//! Hardware backend capabilities and the device registry
//!
//! A backend is the low-level driver of one card family. The core only needs
//! four capabilities from it (probe, initialize, port configuration and the
//! transport lock); everything else stays inside the driver.

use crate::domain::device::{DeviceId, RoleSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{device} isn't responding @ p=0x{port:x}")]
    DeviceNotResponding { device: DeviceId, port: u16 },

    #[error("{device} does not support {operation}")]
    Unsupported {
        device: DeviceId,
        operation: &'static str,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No backend can be registered for {0}")]
    NotRegistrable(DeviceId),
}

/// Mode a backend is brought up in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    /// Sound effects only
    Sfx,
    /// Music only
    Music,
    /// One device serving effects and music at once
    Combined,
}

impl InitMode {
    pub fn for_roles(roles: RoleSet) -> Self {
        match roles {
            RoleSet::Sfx => InitMode::Sfx,
            RoleSet::Music => InitMode::Music,
            RoleSet::Both => InitMode::Combined,
        }
    }

    pub fn roles(self) -> RoleSet {
        match self {
            InitMode::Sfx => RoleSet::Sfx,
            InitMode::Music => RoleSet::Music,
            InitMode::Combined => RoleSet::Both,
        }
    }
}

impl fmt::Display for InitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitMode::Sfx => f.write_str("sfx"),
            InitMode::Music => f.write_str("music"),
            InitMode::Combined => f.write_str("combined"),
        }
    }
}

/// Everything a backend gets when it is initialized
#[derive(Debug, Clone, Copy)]
pub struct InitRequest<'a> {
    pub mode: InitMode,
    /// Instrument/patch data; only borrowed for the duration of the call
    pub patch: Option<&'a [u8]>,
    /// Output volume for transports that have one; `None` leaves the
    /// card's own level alone
    pub volume: Option<u8>,
}

impl<'a> InitRequest<'a> {
    pub fn new(mode: InitMode) -> Self {
        Self {
            mode,
            patch: None,
            volume: None,
        }
    }

    pub fn with_patch(mut self, patch: &'a [u8]) -> Self {
        self.patch = Some(patch);
        self
    }

    pub fn with_volume(mut self, volume: u8) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Driver capabilities for one card family
///
/// `detect` must not change card state beyond probing. Backends never retry;
/// failures are reported upward.
pub trait BackendCapability: Send {
    /// Probe for the card; returns the port it answered at
    fn detect(&mut self, port: u16) -> Result<u16>;

    fn initialize(&mut self, request: &InitRequest<'_>) -> Result<()>;

    /// Point the card's output for `roles` at `port`
    fn configure_port(&mut self, port: u16, roles: RoleSet) -> Result<()>;

    /// Take exclusive control of a transport
    fn lock(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the transport lock and any card state at shutdown
    fn release(&mut self) {}
}

/// Fixed table of backends keyed by device
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<DeviceId, Box<dyn BackendCapability>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the backend for `device`, replacing any previous one
    pub fn register(&mut self, device: DeviceId, backend: Box<dyn BackendCapability>) -> Result<()> {
        if !device.needs_backend() {
            return Err(BackendError::NotRegistrable(device));
        }
        debug!(%device, "Backend registered");
        self.backends.insert(device, backend);
        Ok(())
    }

    pub fn with(mut self, device: DeviceId, backend: Box<dyn BackendCapability>) -> Result<Self> {
        self.register(device, backend)?;
        Ok(self)
    }

    pub fn lookup(&mut self, device: DeviceId) -> Option<&mut (dyn BackendCapability + 'static)> {
        self.backends.get_mut(&device).map(|b| b.as_mut())
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.backends.contains_key(&device)
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.backends.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Call `release` on the given devices
    pub fn release(&mut self, devices: impl IntoIterator<Item = DeviceId>) {
        for device in devices {
            if let Some(backend) = self.backends.get_mut(&device) {
                debug!(%device, "Releasing backend");
                backend.release();
            }
        }
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("devices", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}
