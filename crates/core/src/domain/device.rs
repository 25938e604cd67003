//! Sound device identifiers and output roles
//!
//! Every card the subsystem knows how to drive is one variant of [`DeviceId`].
//! The set is closed: adding a card means adding a variant, a rule in the
//! arbitration table and a backend in the registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a device name or config code is not recognized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceParseError {
    #[error("Unknown device name: {0}")]
    UnknownName(String),

    #[error("Unknown device code: {0}")]
    UnknownCode(u8),
}

/// Identifier of one sound device family
///
/// The numeric codes are the values stored in the config file and must stay
/// stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceId {
    None,
    PcSpeaker,
    Adlib,
    SoundBlaster,
    ProAudioSpectrum,
    /// Gravis UltraSound wavetable card
    Gus,
    /// Roland MPU-401 compatible MIDI interface
    Mpu,
    Ensoniq,
    /// Disney Sound Source (parallel port DAC with FIFO)
    Disney,
    /// Covox-style parallel port DAC
    LptDac,
    /// Creative Music System, programmed at register level
    Cms,
    /// Sound Blaster driven without DMA
    SbDirect,
    Opl2Lpt,
    Opl3Lpt,
    /// Redbook audio from the CD-ROM drive
    Cd,
    Rs232Midi,
    LptMidi,
}

impl DeviceId {
    /// All devices, in config code order
    pub const ALL: [DeviceId; 17] = [
        DeviceId::None,
        DeviceId::PcSpeaker,
        DeviceId::Adlib,
        DeviceId::SoundBlaster,
        DeviceId::ProAudioSpectrum,
        DeviceId::Gus,
        DeviceId::Mpu,
        DeviceId::Ensoniq,
        DeviceId::Disney,
        DeviceId::LptDac,
        DeviceId::Cms,
        DeviceId::SbDirect,
        DeviceId::Opl2Lpt,
        DeviceId::Opl3Lpt,
        DeviceId::Cd,
        DeviceId::Rs232Midi,
        DeviceId::LptMidi,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DeviceParseError> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(DeviceParseError::UnknownCode(code))
    }

    /// Config/CLI name of the device
    pub fn name(self) -> &'static str {
        match self {
            DeviceId::None => "none",
            DeviceId::PcSpeaker => "pc-speaker",
            DeviceId::Adlib => "adlib",
            DeviceId::SoundBlaster => "sound-blaster",
            DeviceId::ProAudioSpectrum => "pro-audio-spectrum",
            DeviceId::Gus => "gus",
            DeviceId::Mpu => "mpu",
            DeviceId::Ensoniq => "ensoniq",
            DeviceId::Disney => "disney",
            DeviceId::LptDac => "lpt-dac",
            DeviceId::Cms => "cms",
            DeviceId::SbDirect => "sb-direct",
            DeviceId::Opl2Lpt => "opl2-lpt",
            DeviceId::Opl3Lpt => "opl3-lpt",
            DeviceId::Cd => "cd",
            DeviceId::Rs232Midi => "rs232-midi",
            DeviceId::LptMidi => "lpt-midi",
        }
    }

    /// Human readable card name, used in log output
    pub fn label(self) -> &'static str {
        match self {
            DeviceId::None => "None",
            DeviceId::PcSpeaker => "PC Speaker",
            DeviceId::Adlib => "AdLib",
            DeviceId::SoundBlaster => "Sound Blaster",
            DeviceId::ProAudioSpectrum => "Pro Audio Spectrum",
            DeviceId::Gus => "Gravis UltraSound",
            DeviceId::Mpu => "MPU-401",
            DeviceId::Ensoniq => "Ensoniq SoundScape",
            DeviceId::Disney => "Disney Sound Source",
            DeviceId::LptDac => "LPT DAC",
            DeviceId::Cms => "Creative Music System",
            DeviceId::SbDirect => "Sound Blaster (direct)",
            DeviceId::Opl2Lpt => "OPL2LPT",
            DeviceId::Opl3Lpt => "OPL3LPT",
            DeviceId::Cd => "CD Audio",
            DeviceId::Rs232Midi => "RS-232 MIDI",
            DeviceId::LptMidi => "LPT MIDI",
        }
    }

    pub fn is_none(self) -> bool {
        self == DeviceId::None
    }

    /// Whether this device needs a hardware backend at all
    pub fn needs_backend(self) -> bool {
        !matches!(self, DeviceId::None | DeviceId::PcSpeaker)
    }

    /// Devices that can legitimately serve the sfx and music roles at once
    ///
    /// This list is explicit rather than derived: each entry has its own
    /// combined handling in the arbitration table.
    pub fn is_dual_use(self) -> bool {
        matches!(
            self,
            DeviceId::Gus
                | DeviceId::Cms
                | DeviceId::Adlib
                | DeviceId::SoundBlaster
                | DeviceId::ProAudioSpectrum
                | DeviceId::Opl2Lpt
                | DeviceId::Opl3Lpt
        )
    }

    /// Digitized sfx devices play `DS*` lumps, everything at or below the
    /// PC speaker plays the `DP*` speaker lumps
    pub fn plays_digital_sfx(self) -> bool {
        self.code() > DeviceId::PcSpeaker.code()
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::None
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DeviceId {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        if let Ok(code) = wanted.parse::<u8>() {
            return Self::from_code(code);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.name() == wanted)
            .ok_or_else(|| DeviceParseError::UnknownName(s.to_string()))
    }
}

/// Output role a device is asked to serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sfx,
    Music,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sfx => f.write_str("sfx"),
            Role::Music => f.write_str("music"),
        }
    }
}

/// Non-empty set of roles served by one activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSet {
    Sfx,
    Music,
    Both,
}

impl RoleSet {
    pub fn from_flags(sfx: bool, music: bool) -> Option<Self> {
        match (sfx, music) {
            (true, true) => Some(RoleSet::Both),
            (true, false) => Some(RoleSet::Sfx),
            (false, true) => Some(RoleSet::Music),
            (false, false) => None,
        }
    }

    pub fn contains(self, role: Role) -> bool {
        matches!(
            (self, role),
            (RoleSet::Both, _) | (RoleSet::Sfx, Role::Sfx) | (RoleSet::Music, Role::Music)
        )
    }

    pub fn union(self, other: RoleSet) -> RoleSet {
        RoleSet::from_flags(
            self.contains(Role::Sfx) || other.contains(Role::Sfx),
            self.contains(Role::Music) || other.contains(Role::Music),
        )
        .unwrap_or(self)
    }

    pub fn roles(self) -> impl Iterator<Item = Role> {
        [Role::Sfx, Role::Music]
            .into_iter()
            .filter(move |r| self.contains(*r))
    }
}

impl From<Role> for RoleSet {
    fn from(role: Role) -> Self {
        match role {
            Role::Sfx => RoleSet::Sfx,
            Role::Music => RoleSet::Music,
        }
    }
}
