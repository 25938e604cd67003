//! Configuration management for the sound subsystem
//!
//! This module provides:
//! - [`SoundSettings`], the persisted TOML settings (desired cards, ports, volumes)
//! - [`Overrides`], the command-line switches that disable sound roles
//! - [`SoundConfiguration`], the runtime record the arbitration pass fills in
//! - [`SettingsManager`], load/save with fallback to defaults

use crate::domain::device::{DeviceId, Role};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Highest volume accepted for either role
pub const MAX_VOLUME: u8 = 127;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Active {0} device already resolved for this startup cycle")]
    AlreadyResolved(Role),
}

/// Which release of the game data is loaded
///
/// The wavetable patch set differs between the commercial release and the
/// registered/shareware ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Shareware,
    #[default]
    Registered,
    Retail,
    Commercial,
}

/// Persisted sound settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundSettings {
    /// Card the user picked for sound effects
    pub sfx_device: DeviceId,

    /// Card the user picked for music
    pub music_device: DeviceId,

    /// Effects volume, 0..=127
    pub sfx_volume: u8,

    /// Music volume, 0..=127
    pub music_volume: u8,

    /// I/O port of the music device
    pub music_port: u16,

    /// I/O port of the sfx device
    pub sfx_port: u16,

    /// Mixing rate in Hz
    pub sample_rate: u32,

    /// Rate of digitized effects in Hz
    pub pcm_rate: u32,

    pub game_mode: GameMode,

    /// Install the millisecond timer used by the advanced benchmark
    pub benchmark_advanced: bool,
}

impl Default for SoundSettings {
    fn default() -> Self {
        Self {
            sfx_device: DeviceId::SoundBlaster,
            music_device: DeviceId::Adlib,
            sfx_volume: MAX_VOLUME,
            music_volume: 100,
            music_port: 0x388,
            sfx_port: 0x220,
            sample_rate: 11025,
            pcm_rate: 11025,
            game_mode: GameMode::Registered,
            benchmark_advanced: false,
        }
    }
}

impl SoundSettings {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sfx_volume > MAX_VOLUME {
            return Err(ConfigError::Invalid(format!(
                "sfx_volume {} exceeds {}",
                self.sfx_volume, MAX_VOLUME
            )));
        }
        if self.music_volume > MAX_VOLUME {
            return Err(ConfigError::Invalid(format!(
                "music_volume {} exceeds {}",
                self.music_volume, MAX_VOLUME
            )));
        }
        if self.sample_rate == 0 || self.pcm_rate == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Load settings from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading sound settings");

        let contents = fs::read_to_string(path).await?;
        let settings: Self = toml::from_str(&contents)?;
        settings.validate()?;

        debug!("Sound settings loaded successfully");
        Ok(settings)
    }

    /// Save settings to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving sound settings");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Sound settings saved successfully");
        Ok(())
    }
}

/// Command-line switches that silence one or both roles
///
/// They win over whatever the settings ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Overrides {
    pub no_sound: bool,
    pub no_sfx: bool,
    pub no_music: bool,
}

impl Overrides {
    /// Scan a raw argument list for `-nosound`, `-nosfx` and `-nomusic`
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = Self::default();
        for arg in args {
            match arg.as_ref().to_ascii_lowercase().as_str() {
                "-nosound" => overrides.no_sound = true,
                "-nosfx" => overrides.no_sfx = true,
                "-nomusic" => overrides.no_music = true,
                _ => {}
            }
        }
        overrides
    }

    /// Apply the switches to a desired (sfx, music) pair
    pub fn apply(&self, sfx: DeviceId, music: DeviceId) -> (DeviceId, DeviceId) {
        let mut sfx = sfx;
        let mut music = music;
        if self.no_sound {
            sfx = DeviceId::None;
            music = DeviceId::None;
        }
        if self.no_sfx {
            sfx = DeviceId::None;
        }
        if self.no_music {
            music = DeviceId::None;
        }
        (sfx, music)
    }
}

/// Runtime sound configuration for one startup cycle
///
/// The desired fields come from settings; the active fields are written
/// exactly once by the arbitration pass and read by everything after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoundConfiguration {
    pub desired_sfx_device: DeviceId,
    pub desired_music_device: DeviceId,
    pub sfx_volume: u8,
    pub music_volume: u8,
    pub music_port: u16,
    pub sfx_port: u16,
    pub game_mode: GameMode,
    active_sfx_device: Option<DeviceId>,
    active_music_device: Option<DeviceId>,
}

impl SoundConfiguration {
    pub fn new(desired_sfx_device: DeviceId, desired_music_device: DeviceId) -> Self {
        let defaults = SoundSettings::default();
        Self {
            desired_sfx_device,
            desired_music_device,
            sfx_volume: defaults.sfx_volume,
            music_volume: defaults.music_volume,
            music_port: defaults.music_port,
            sfx_port: defaults.sfx_port,
            game_mode: defaults.game_mode,
            active_sfx_device: None,
            active_music_device: None,
        }
    }

    pub fn from_settings(settings: &SoundSettings) -> Self {
        Self {
            desired_sfx_device: settings.sfx_device,
            desired_music_device: settings.music_device,
            sfx_volume: settings.sfx_volume.min(MAX_VOLUME),
            music_volume: settings.music_volume.min(MAX_VOLUME),
            music_port: settings.music_port,
            sfx_port: settings.sfx_port,
            game_mode: settings.game_mode,
            active_sfx_device: None,
            active_music_device: None,
        }
    }

    pub fn with_ports(mut self, music_port: u16, sfx_port: u16) -> Self {
        self.music_port = music_port;
        self.sfx_port = sfx_port;
        self
    }

    pub fn with_game_mode(mut self, game_mode: GameMode) -> Self {
        self.game_mode = game_mode;
        self
    }

    pub fn active_sfx_device(&self) -> Option<DeviceId> {
        self.active_sfx_device
    }

    pub fn active_music_device(&self) -> Option<DeviceId> {
        self.active_music_device
    }

    pub fn active_device(&self, role: Role) -> Option<DeviceId> {
        match role {
            Role::Sfx => self.active_sfx_device,
            Role::Music => self.active_music_device,
        }
    }

    pub fn port(&self, role: Role) -> u16 {
        match role {
            Role::Sfx => self.sfx_port,
            Role::Music => self.music_port,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.active_sfx_device.is_some() && self.active_music_device.is_some()
    }

    /// Record the resolved device for a role; fails on a second assignment
    pub fn assign_active(&mut self, role: Role, device: DeviceId) -> Result<()> {
        let slot = match role {
            Role::Sfx => &mut self.active_sfx_device,
            Role::Music => &mut self.active_music_device,
        };
        if slot.is_some() {
            return Err(ConfigError::AlreadyResolved(role));
        }
        *slot = Some(device);
        Ok(())
    }

    /// Forget the resolved devices at the end of a startup cycle
    pub fn invalidate(&mut self) {
        self.active_sfx_device = None;
        self.active_music_device = None;
    }
}

/// Manages the settings file at `~/.config/soundscape/sound.toml`
pub struct SettingsManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl SettingsManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("sound.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("soundscape"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load settings from file
    ///
    /// A missing file yields the defaults (and writes them out). A corrupt
    /// file is backed up as `sound.toml.corrupt` and the defaults are used.
    #[instrument(skip(self))]
    pub async fn load(&self) -> SoundSettings {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Settings file not found, creating defaults"
            );

            let settings = SoundSettings::default();
            if let Err(e) = settings.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save default settings"
                );
            }
            return settings;
        }

        match SoundSettings::load_from_file(&self.config_path).await {
            Ok(settings) => settings,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load settings, using defaults"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt settings"
                    );
                }

                SoundSettings::default()
            }
        }
    }

    #[instrument(skip(self, settings))]
    pub async fn save(&self, settings: &SoundSettings) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        settings.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
