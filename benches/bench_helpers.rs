//! Helper utilities for benchmarks

use soundscape_core::domain::{BackendRegistry, DeviceId, SoundConfiguration};
use soundscape_infra::{simulated_registry, CardJournal};

/// Every (sfx, music) device pair
pub fn all_device_pairs() -> Vec<(DeviceId, DeviceId)> {
    DeviceId::ALL
        .iter()
        .flat_map(|sfx| DeviceId::ALL.iter().map(move |music| (*sfx, *music)))
        .collect()
}

/// Device pairs that exercise the heaviest plans
pub fn representative_pairs() -> Vec<(&'static str, DeviceId, DeviceId)> {
    vec![
        ("silent", DeviceId::None, DeviceId::None),
        ("sb_adlib", DeviceId::SoundBlaster, DeviceId::Adlib),
        ("gus_both", DeviceId::Gus, DeviceId::Gus),
        ("cms_both", DeviceId::Cms, DeviceId::Cms),
        ("sb_mpu", DeviceId::SoundBlaster, DeviceId::Mpu),
        ("opl3lpt_both", DeviceId::Opl3Lpt, DeviceId::Opl3Lpt),
        ("disney_cd", DeviceId::Disney, DeviceId::Cd),
    ]
}

/// Fresh, unresolved configuration for a device pair
pub fn configuration(sfx: DeviceId, music: DeviceId) -> SoundConfiguration {
    SoundConfiguration::new(sfx, music).with_ports(0x330, 0x220)
}

/// Registry of responsive simulated cards
pub fn responsive_registry() -> BackendRegistry {
    match simulated_registry(&CardJournal::new(), &[]) {
        Ok(registry) => registry,
        Err(e) => panic!("simulated registry: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_device_pairs() {
        let pairs = all_device_pairs();
        assert_eq!(pairs.len(), DeviceId::ALL.len() * DeviceId::ALL.len());
        assert!(pairs.contains(&(DeviceId::Cd, DeviceId::None)));
    }

    #[test]
    fn test_configuration_is_unresolved() {
        let config = configuration(DeviceId::Gus, DeviceId::Mpu);
        assert!(!config.is_resolved());
        assert_eq!(config.music_port, 0x330);
    }

    #[test]
    fn test_responsive_registry() {
        let registry = responsive_registry();
        assert!(registry.contains(DeviceId::Mpu));
        assert!(!registry.contains(DeviceId::None));
    }
}
