//! Playback engine that records and logs instead of mixing

use serde::Serialize;
use soundscape_core::domain::device::DeviceId;
use soundscape_core::domain::lifecycle::{EngineError, PlaybackEngine};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// What the engine has been told so far
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub initialized: bool,
    pub tic_rate: u32,
    pub music: DeviceId,
    pub sfx: DeviceId,
    pub music_paused: bool,
    /// Number of completed init/deinit cycles
    pub sessions: u32,
}

/// [`PlaybackEngine`] that only tracks its state
///
/// Clones share state, so a caller can keep one and hand the other to the
/// sound system.
#[derive(Debug, Clone, Default)]
pub struct LoggingPlaybackEngine {
    state: Arc<Mutex<EngineSnapshot>>,
}

impl LoggingPlaybackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineSnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.lock().clone()
    }
}

impl PlaybackEngine for LoggingPlaybackEngine {
    fn init(&mut self, tic_rate: u32, music: DeviceId, sfx: DeviceId) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.initialized {
            return Err(EngineError("engine already initialized".to_string()));
        }
        if tic_rate == 0 {
            return Err(EngineError("tic rate must be non-zero".to_string()));
        }
        info!(tic_rate, %music, %sfx, "Playback engine up");
        state.initialized = true;
        state.tic_rate = tic_rate;
        state.music = music;
        state.sfx = sfx;
        state.music_paused = false;
        Ok(())
    }

    fn pause_music(&mut self) {
        let mut state = self.lock();
        if !state.initialized {
            warn!("Music paused before engine init");
            return;
        }
        info!(music = %state.music, "Music paused");
        state.music_paused = true;
    }

    fn deinit(&mut self) {
        let mut state = self.lock();
        if !state.initialized {
            return;
        }
        info!("Playback engine down");
        state.initialized = false;
        state.sessions += 1;
    }
}
