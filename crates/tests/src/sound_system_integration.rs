//! Integration tests for the sound subsystem
//!
//! These run the full startup/shutdown cycle over simulated cards, real lump
//! providers and settings files, checking what actually reached the hardware.

use proptest::prelude::*;
use soundscape_core::domain::{
    ArbitrationError, DeviceId, GameMode, InitMode, LifecycleState, ManualTimingSource, Overrides,
    RoleSet, RoleStatus, Scheduler, SettingsManager, SoundError, SoundSettings, SoundSystem,
    SND_TICRATE,
};
use soundscape_infra::{
    simulated_registry, CardEvent, CardJournal, LoggingPlaybackEngine, LumpDirectory,
    MemoryResources, ThreadTimingSource,
};
use std::time::Duration;
use tempfile::TempDir;

struct Rig {
    clock: ManualTimingSource,
    journal: CardJournal,
    engine: LoggingPlaybackEngine,
}

impl Rig {
    fn new() -> Self {
        Self {
            clock: ManualTimingSource::new(),
            journal: CardJournal::new(),
            engine: LoggingPlaybackEngine::new(),
        }
    }

    fn system(&self, settings: SoundSettings, silent: &[DeviceId]) -> SoundSystem<ManualTimingSource> {
        SoundSystem::new(
            settings,
            Scheduler::new(self.clock.clone()),
            Box::new(self.engine.clone()),
        )
        .with_registry(simulated_registry(&self.journal, silent).unwrap())
        .with_resources(Box::new(MemoryResources::with_default_patches()))
    }

    fn hardware_calls(&self) -> Vec<CardEvent> {
        self.journal
            .events()
            .into_iter()
            .filter(|e| !matches!(e, CardEvent::Release { .. }))
            .collect()
    }
}

fn settings(sfx: DeviceId, music: DeviceId) -> SoundSettings {
    SoundSettings {
        sfx_device: sfx,
        music_device: music,
        ..SoundSettings::default()
    }
}

// ============================================================================
// END-TO-END SCENARIOS
// ============================================================================

#[test]
fn test_silent_configuration_touches_nothing() {
    let rig = Rig::new();
    let mut system = rig.system(settings(DeviceId::None, DeviceId::None), &[]);

    system.startup().unwrap();

    assert!(rig.journal.is_empty());
    assert!(rig.clock.is_installed());
    assert_eq!(rig.engine.snapshot().tic_rate, SND_TICRATE);
}

#[test]
fn test_mpu_music_detected_at_port() {
    let rig = Rig::new();
    let mut s = settings(DeviceId::None, DeviceId::Mpu);
    s.music_port = 0x330;
    let mut system = rig.system(s, &[]);

    system.startup().unwrap();

    assert_eq!(
        rig.hardware_calls(),
        vec![
            CardEvent::Detect {
                device: DeviceId::Mpu,
                port: 0x330,
                found: Some(0x330)
            },
            CardEvent::ConfigurePort {
                device: DeviceId::Mpu,
                port: 0x330,
                roles: RoleSet::Music
            },
        ]
    );
    assert_eq!(system.active_music_device(), Some(DeviceId::Mpu));
    assert_eq!(system.active_sfx_device(), Some(DeviceId::None));
    assert_eq!(system.report().unwrap().music, RoleStatus::Active);
}

#[test]
fn test_mpu_not_responding_is_only_a_warning() {
    let rig = Rig::new();
    let mut s = settings(DeviceId::None, DeviceId::Mpu);
    s.music_port = 0x330;
    let mut system = rig.system(s, &[DeviceId::Mpu]);

    system.startup().unwrap();

    assert_eq!(system.state(), LifecycleState::Running);
    assert_eq!(system.active_music_device(), Some(DeviceId::Mpu));
    assert_eq!(
        system.report().unwrap().music,
        RoleStatus::Inert("MPU-401 isn't responding @ p=0x330".to_string())
    );
    // Port setup never reached the silent card.
    assert_eq!(rig.journal.len(), 1);
}

#[test]
fn test_cd_failure_aborts_before_anything_else() {
    let rig = Rig::new();
    let mut system = rig.system(settings(DeviceId::Cms, DeviceId::Cd), &[DeviceId::Cd]);

    let err = system.startup().unwrap_err();

    assert!(matches!(
        err,
        SoundError::Arbitration(ArbitrationError::FatalTransportInitFailure {
            device: DeviceId::Cd,
            ..
        })
    ));
    assert!(rig
        .hardware_calls()
        .iter()
        .all(|e| e.device() == DeviceId::Cd));
    assert!(!rig.engine.snapshot().initialized);

    system.shutdown();
    assert!(!rig.clock.is_installed());
}

#[test]
fn test_cd_failure_still_releases_wavetable_card() {
    let rig = Rig::new();
    let mut system = rig.system(settings(DeviceId::Gus, DeviceId::Cd), &[DeviceId::Cd]);

    assert!(system.startup().is_err());
    system.shutdown();

    assert!(matches!(
        rig.journal.events_for(DeviceId::Gus)[0],
        CardEvent::Initialize {
            device: DeviceId::Gus,
            mode: InitMode::Sfx,
            ..
        }
    ));
    assert_eq!(
        rig.journal.events().last(),
        Some(&CardEvent::Release { device: DeviceId::Gus })
    );
}

#[test]
fn test_missing_bank_keeps_sound_blaster_effects() {
    let rig = Rig::new();
    let mut system = SoundSystem::new(
        settings(DeviceId::SoundBlaster, DeviceId::SoundBlaster),
        Scheduler::new(rig.clock.clone()),
        Box::new(rig.engine.clone()),
    )
    .with_registry(simulated_registry(&rig.journal, &[]).unwrap())
    .with_resources(Box::new(MemoryResources::new()));

    system.startup().unwrap();

    let report = system.report().unwrap();
    assert_eq!(report.sfx, RoleStatus::Active);
    assert!(matches!(report.music, RoleStatus::Inert(_)));
    assert_eq!(system.sfx_lump_name("pistol"), "DSPISTOL");
}

#[test]
fn test_cd_transport_is_locked() {
    let rig = Rig::new();
    let mut system = rig.system(settings(DeviceId::SoundBlaster, DeviceId::Cd), &[]);

    system.startup().unwrap();

    assert_eq!(
        rig.journal.events_for(DeviceId::Cd),
        vec![
            CardEvent::Initialize {
                device: DeviceId::Cd,
                mode: InitMode::Music,
                patch_bytes: 0
            },
            CardEvent::Lock { device: DeviceId::Cd },
        ]
    );
}

#[test]
fn test_nosound_overrides_settings() {
    let rig = Rig::new();
    let mut system = rig
        .system(settings(DeviceId::SoundBlaster, DeviceId::Gus), &[])
        .with_overrides(Overrides {
            no_sound: true,
            ..Overrides::default()
        });

    system.startup().unwrap();

    assert!(rig.journal.is_empty());
    assert_eq!(system.active_sfx_device(), Some(DeviceId::None));
    assert_eq!(system.active_music_device(), Some(DeviceId::None));
    let engine = rig.engine.snapshot();
    assert_eq!((engine.music, engine.sfx), (DeviceId::None, DeviceId::None));
}

#[test]
fn test_gus_gets_commercial_patches_once() {
    let rig = Rig::new();
    let mut s = settings(DeviceId::Gus, DeviceId::Gus);
    s.game_mode = GameMode::Commercial;
    let mut system = rig.system(s, &[]);

    system.startup().unwrap();

    let inits: Vec<_> = rig
        .hardware_calls()
        .into_iter()
        .filter(|e| matches!(e, CardEvent::Initialize { .. }))
        .collect();
    assert_eq!(inits.len(), 1);
    assert!(matches!(
        inits[0],
        CardEvent::Initialize {
            device: DeviceId::Gus,
            mode: InitMode::Combined,
            patch_bytes
        } if patch_bytes > 0
    ));
}

#[test]
fn test_cms_on_both_roles() {
    let rig = Rig::new();
    let mut s = settings(DeviceId::Cms, DeviceId::Cms);
    s.music_port = 0x220;
    s.sfx_port = 0x220;
    let mut system = rig.system(s, &[]);

    system.startup().unwrap();

    assert_eq!(
        rig.hardware_calls(),
        vec![
            CardEvent::Initialize {
                device: DeviceId::Cms,
                mode: InitMode::Combined,
                patch_bytes: 0
            },
            CardEvent::ConfigurePort {
                device: DeviceId::Cms,
                port: 0x220,
                roles: RoleSet::Both
            },
        ]
    );
}

#[test]
fn test_shutdown_releases_cards_in_reverse() {
    let rig = Rig::new();
    let mut s = settings(DeviceId::SoundBlaster, DeviceId::Mpu);
    s.music_port = 0x330;
    let mut system = rig.system(s, &[]);
    system.startup().unwrap();

    system.shutdown();

    let releases: Vec<_> = rig
        .journal
        .events()
        .into_iter()
        .filter(|e| matches!(e, CardEvent::Release { .. }))
        .map(|e| e.device())
        .collect();
    assert_eq!(releases, vec![DeviceId::Mpu, DeviceId::SoundBlaster]);

    let engine = rig.engine.snapshot();
    assert!(engine.music_paused);
    assert!(!engine.initialized);
    assert_eq!(engine.sessions, 1);
}

#[test]
fn test_patches_from_lump_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("GENMIDI.lmp"), vec![7u8; 100]).unwrap();

    let rig = Rig::new();
    let mut system = SoundSystem::new(
        settings(DeviceId::None, DeviceId::Adlib),
        Scheduler::new(rig.clock.clone()),
        Box::new(rig.engine.clone()),
    )
    .with_registry(simulated_registry(&rig.journal, &[]).unwrap())
    .with_resources(Box::new(LumpDirectory::open(dir.path()).unwrap()));

    system.startup().unwrap();

    assert_eq!(
        rig.journal.events_for(DeviceId::Adlib)[0],
        CardEvent::Initialize {
            device: DeviceId::Adlib,
            mode: InitMode::Music,
            patch_bytes: 100
        }
    );
    assert_eq!(system.report().unwrap().music, RoleStatus::Active);
}

#[test]
fn test_master_tick_runs_on_timer_thread() {
    let engine = LoggingPlaybackEngine::new();
    let mut system = SoundSystem::new(
        settings(DeviceId::None, DeviceId::None),
        Scheduler::new(ThreadTimingSource::new()),
        Box::new(engine),
    );

    system.startup().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    let clock = system.clock();
    system.shutdown();

    let ticks = clock.ticks();
    assert!(ticks > 0, "expected master ticks after 200 ms");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(clock.ticks(), ticks);
    assert!(!system.scheduler().is_installed());
}

#[tokio::test]
async fn test_startup_from_saved_settings() {
    let dir = TempDir::new().unwrap();
    let manager = SettingsManager::new(dir.path().to_path_buf());
    let saved = SoundSettings {
        sfx_device: DeviceId::Disney,
        music_device: DeviceId::LptMidi,
        sfx_port: 0x378,
        music_port: 0x278,
        ..SoundSettings::default()
    };
    manager.save(&saved).await.unwrap();

    let rig = Rig::new();
    let mut system = rig.system(manager.load().await, &[]);
    system.startup().unwrap();

    let report = system.report().unwrap();
    assert_eq!(report.sfx, RoleStatus::Active);
    assert_eq!(report.music, RoleStatus::Active);
    assert_eq!(system.sfx_lump_name("pistol"), "DSPISTOL");
}

// ============================================================================
// PROPERTIES
// ============================================================================

fn any_device() -> impl Strategy<Value = DeviceId> {
    prop::sample::select(DeviceId::ALL.to_vec())
}

proptest! {
    #[test]
    fn prop_full_cycle_leaves_nothing_running(sfx in any_device(), music in any_device()) {
        let rig = Rig::new();
        let mut system = rig.system(settings(sfx, music), &[]);

        prop_assert!(system.startup().is_ok());
        let engine = rig.engine.snapshot();
        prop_assert_eq!((engine.sfx, engine.music), (sfx, music));

        system.shutdown();
        prop_assert!(!rig.clock.is_installed());
        prop_assert!(!rig.engine.snapshot().initialized);
        prop_assert_eq!(system.active_sfx_device(), None);
    }

    #[test]
    fn prop_every_port_configured_once(
        sfx in any_device(),
        music in any_device(),
        sfx_port in prop::sample::select(vec![0x220u16, 0x278, 0x330, 0x378]),
        music_port in prop::sample::select(vec![0x220u16, 0x278, 0x330, 0x378]),
    ) {
        let rig = Rig::new();
        let mut s = settings(sfx, music);
        s.sfx_port = sfx_port;
        s.music_port = music_port;
        let mut system = rig.system(s, &[]);
        system.startup().unwrap();

        let mut ports: Vec<u16> = rig.journal.events().into_iter().filter_map(|e| match e {
            CardEvent::ConfigurePort { port, .. } => Some(port),
            _ => None,
        }).collect();
        let total = ports.len();
        ports.sort_unstable();
        ports.dedup();
        prop_assert_eq!(ports.len(), total);
    }
}
