//! Simulated sound cards
//!
//! A [`SimulatedCard`] behaves like a card sitting at a fixed I/O port: it
//! answers a probe at that port (or wherever it was jumpered), accepts an
//! initialization and remembers which ports it was pointed at. Every call
//! lands in a shared [`CardJournal`] so a caller can see exactly what the
//! arbitration pass did to the hardware.

use serde::Serialize;
use soundscape_core::domain::backend::{
    BackendCapability, BackendError, BackendRegistry, InitMode, InitRequest, Result,
};
use soundscape_core::domain::device::{DeviceId, RoleSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// One hardware access made by a simulated card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CardEvent {
    Detect { device: DeviceId, port: u16, found: Option<u16> },
    Initialize { device: DeviceId, mode: InitMode, patch_bytes: usize },
    ConfigurePort { device: DeviceId, port: u16, roles: RoleSet },
    Lock { device: DeviceId },
    Release { device: DeviceId },
}

/// Shared, append-only log of card events
#[derive(Debug, Clone, Default)]
pub struct CardJournal {
    events: Arc<Mutex<Vec<CardEvent>>>,
}

impl CardJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CardEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: CardEvent) {
        trace!(?event, "Card event");
        self.lock().push(event);
    }

    pub fn events(&self) -> Vec<CardEvent> {
        self.lock().clone()
    }

    pub fn events_for(&self, device: DeviceId) -> Vec<CardEvent> {
        self.lock()
            .iter()
            .filter(|e| e.device() == device)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl CardEvent {
    pub fn device(&self) -> DeviceId {
        match self {
            CardEvent::Detect { device, .. }
            | CardEvent::Initialize { device, .. }
            | CardEvent::ConfigurePort { device, .. }
            | CardEvent::Lock { device }
            | CardEvent::Release { device } => *device,
        }
    }
}

/// OPL synths refuse to start without an instrument bank, the wavetable card
/// without its patch map
fn needs_patch(device: DeviceId, mode: InitMode) -> bool {
    match device {
        DeviceId::Gus => true,
        DeviceId::Adlib
        | DeviceId::SoundBlaster
        | DeviceId::ProAudioSpectrum
        | DeviceId::Opl2Lpt
        | DeviceId::Opl3Lpt => mode != InitMode::Sfx,
        _ => false,
    }
}

pub struct SimulatedCard {
    device: DeviceId,
    journal: CardJournal,
    responds: bool,
    /// Port the card is jumpered to; `None` answers wherever it is probed
    jumpered_at: Option<u16>,
    initialized: Option<InitMode>,
    ports: Vec<(u16, RoleSet)>,
    locked: bool,
}

impl SimulatedCard {
    pub fn new(device: DeviceId, journal: CardJournal) -> Self {
        Self {
            device,
            journal,
            responds: true,
            jumpered_at: None,
            initialized: None,
            ports: Vec::new(),
            locked: false,
        }
    }

    /// Card that never answers
    pub fn not_responding(mut self) -> Self {
        self.responds = false;
        self
    }

    /// Card that only answers a probe at `port`
    pub fn jumpered_at(mut self, port: u16) -> Self {
        self.jumpered_at = Some(port);
        self
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn initialized_mode(&self) -> Option<InitMode> {
        self.initialized
    }

    pub fn configured_ports(&self) -> &[(u16, RoleSet)] {
        &self.ports
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn not_responding_at(&self, port: u16) -> BackendError {
        BackendError::DeviceNotResponding {
            device: self.device,
            port,
        }
    }
}

impl BackendCapability for SimulatedCard {
    fn detect(&mut self, port: u16) -> Result<u16> {
        let found = match (self.responds, self.jumpered_at) {
            (false, _) => None,
            (true, Some(at)) if at == port => Some(at),
            // MPU-style cards are found by scanning; others must be probed
            // at the right address.
            (true, Some(at)) if self.device == DeviceId::Mpu => Some(at),
            (true, Some(_)) => None,
            (true, None) => Some(port),
        };
        self.journal.push(CardEvent::Detect {
            device: self.device,
            port,
            found,
        });
        found.ok_or_else(|| self.not_responding_at(port))
    }

    fn initialize(&mut self, request: &InitRequest<'_>) -> Result<()> {
        self.journal.push(CardEvent::Initialize {
            device: self.device,
            mode: request.mode,
            patch_bytes: request.patch.map(<[u8]>::len).unwrap_or(0),
        });
        if !self.responds {
            return Err(self.not_responding_at(self.jumpered_at.unwrap_or(0)));
        }
        if needs_patch(self.device, request.mode) && request.patch.map_or(true, <[u8]>::is_empty) {
            return Err(BackendError::Transport(format!(
                "{} needs patch data to start",
                self.device
            )));
        }
        debug!(device = %self.device, mode = %request.mode, "Simulated card initialized");
        self.initialized = Some(request.mode);
        Ok(())
    }

    fn configure_port(&mut self, port: u16, roles: RoleSet) -> Result<()> {
        self.journal.push(CardEvent::ConfigurePort {
            device: self.device,
            port,
            roles,
        });
        if !self.responds {
            return Err(self.not_responding_at(port));
        }
        self.ports.push((port, roles));
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        self.journal.push(CardEvent::Lock { device: self.device });
        if self.initialized.is_none() {
            return Err(BackendError::Transport(format!(
                "{} locked before initialization",
                self.device
            )));
        }
        self.locked = true;
        Ok(())
    }

    fn release(&mut self) {
        self.journal.push(CardEvent::Release { device: self.device });
        self.initialized = None;
        self.ports.clear();
        self.locked = false;
    }
}

/// Registry with a simulated card for every device that needs one
///
/// Devices listed in `silent` are installed but never respond.
pub fn simulated_registry(journal: &CardJournal, silent: &[DeviceId]) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    for device in DeviceId::ALL.into_iter().filter(|d| d.needs_backend()) {
        let mut card = SimulatedCard::new(device, journal.clone());
        if silent.contains(&device) {
            card = card.not_responding();
        }
        registry.register(device, Box::new(card))?;
    }
    debug!(cards = registry.len(), silent = silent.len(), "Simulated registry ready");
    Ok(registry)
}
