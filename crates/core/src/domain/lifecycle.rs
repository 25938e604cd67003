//! Sound subsystem lifecycle
//!
//! [`SoundSystem`] is the only part of the core the rest of the engine talks
//! to. Startup installs the timer tasks, arbitrates the cards and hands the
//! result to the playback engine; shutdown undoes it in reverse and is safe to
//! call at any point, including after a failed startup.

use crate::domain::arbitration::{ArbitrationError, ArbitrationReport, Resolver};
use crate::domain::backend::BackendRegistry;
use crate::domain::config::{Overrides, SoundConfiguration, SoundSettings};
use crate::domain::device::DeviceId;
use crate::domain::resource::{ResourceError, ResourceHandle, ResourceProvider};
use crate::domain::scheduler::{Scheduler, SchedulerError, TaskHandle, TimingSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, SoundError>;

/// Rate of the master game clock
pub const MASTER_TICK_HZ: u32 = 35;

/// Rate of the benchmark millisecond clock
pub const MS_TICK_HZ: u32 = 1000;

/// Rate the playback engine is told to service music at
pub const SND_TICRATE: u32 = 140;

const TIMER_PRIORITY: i32 = 1;

/// Error reported by the downstream playback engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Playback engine error: {0}")]
pub struct EngineError(pub String);

#[derive(Debug, Error)]
pub enum SoundError {
    #[error("Timer startup failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Sound subsystem already started")]
    AlreadyStarted,
}

/// Mixing/playback engine that consumes the arbitration result
pub trait PlaybackEngine: Send {
    fn init(&mut self, tic_rate: u32, music: DeviceId, sfx: DeviceId) -> std::result::Result<(), EngineError>;

    fn pause_music(&mut self);

    fn deinit(&mut self);
}

/// Counters advanced by the timer tasks
///
/// Clones share the same counters and can be read from any thread.
#[derive(Debug, Clone, Default)]
pub struct GameClock {
    ticks: Arc<AtomicU64>,
    millis: Arc<AtomicU64>,
}

impl GameClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Master ticks since startup
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Milliseconds counted by the benchmark clock
    pub fn millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }

    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }

    fn tick_ms(&self) {
        self.millis.fetch_add(1, Ordering::AcqRel);
    }
}

/// Resource provider with no lumps at all
#[derive(Debug, Default)]
pub struct NoResources;

impl ResourceProvider for NoResources {
    fn lookup(&self, name: &str) -> crate::domain::resource::Result<ResourceHandle> {
        Err(ResourceError::NotFound(name.to_string()))
    }

    fn load(&mut self, handle: ResourceHandle) -> crate::domain::resource::Result<Vec<u8>> {
        Err(ResourceError::NotFound(format!("{:?}", handle)))
    }

    fn release(&mut self, _handle: ResourceHandle) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    /// Startup aborted; only shutdown is allowed
    Failed,
    ShutDown,
}

pub struct SoundSystem<T: TimingSource> {
    settings: SoundSettings,
    overrides: Overrides,
    scheduler: Scheduler<T>,
    registry: BackendRegistry,
    resources: Box<dyn ResourceProvider>,
    engine: Box<dyn PlaybackEngine>,
    clock: GameClock,
    config: Option<SoundConfiguration>,
    report: Option<ArbitrationReport>,
    /// Backends brought up by arbitration, in bring-up order
    touched: Vec<DeviceId>,
    master_task: Option<TaskHandle>,
    ms_task: Option<TaskHandle>,
    engine_ready: bool,
    state: LifecycleState,
}

impl<T: TimingSource> SoundSystem<T> {
    pub fn new(settings: SoundSettings, scheduler: Scheduler<T>, engine: Box<dyn PlaybackEngine>) -> Self {
        Self {
            settings,
            overrides: Overrides::default(),
            scheduler,
            registry: BackendRegistry::new(),
            resources: Box::new(NoResources),
            engine,
            clock: GameClock::new(),
            config: None,
            report: None,
            touched: Vec::new(),
            master_task: None,
            ms_task: None,
            engine_ready: false,
            state: LifecycleState::Idle,
        }
    }

    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resources(mut self, resources: Box<dyn ResourceProvider>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Bring up the whole sound subsystem
    pub fn startup(&mut self) -> Result<()> {
        if self.state != LifecycleState::Idle {
            return Err(SoundError::AlreadyStarted);
        }

        let result = self.run_startup();
        match &result {
            Ok(()) => self.state = LifecycleState::Running,
            Err(e) => {
                error!(error = %e, "Sound startup failed");
                self.state = LifecycleState::Failed;
            }
        }
        result
    }

    fn run_startup(&mut self) -> Result<()> {
        self.start_timer()?;

        let mut config = SoundConfiguration::from_settings(&self.settings);
        let outcome = Resolver::new(&mut self.registry, self.resources.as_mut())
            .arbitrate(&mut config, self.overrides);
        self.config = Some(config);
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                if let ArbitrationError::FatalTransportInitFailure { touched, .. } = &e {
                    self.touched = touched.clone();
                }
                return Err(e.into());
            }
        };

        let (music, sfx) = (report.music_device, report.sfx_device);
        self.touched = report.touched.clone();
        self.report = Some(report);

        info!(tic_rate = SND_TICRATE, %music, %sfx, "Initializing playback engine");
        self.engine.init(SND_TICRATE, music, sfx)?;
        self.engine_ready = true;
        Ok(())
    }

    /// Install the master tick and, for the advanced benchmark, the
    /// millisecond tick
    fn start_timer(&mut self) -> Result<()> {
        info!("Starting timer");

        let clock = self.clock.clone();
        let master = self
            .scheduler
            .schedule_at_rate(move |_| clock.tick(), MASTER_TICK_HZ, TIMER_PRIORITY)?;
        self.master_task = Some(master);
        self.scheduler.dispatch()?;

        if self.settings.benchmark_advanced {
            let clock = self.clock.clone();
            let ms = self
                .scheduler
                .schedule_at_rate(move |_| clock.tick_ms(), MS_TICK_HZ, TIMER_PRIORITY)?;
            self.ms_task = Some(ms);
            self.scheduler.dispatch()?;
        }
        Ok(())
    }

    /// Tear everything down; safe to call repeatedly or after a failed startup
    pub fn shutdown(&mut self) {
        if self.state == LifecycleState::ShutDown {
            return;
        }
        info!("Shutting down sound");

        if self.engine_ready {
            self.engine.pause_music();
            self.engine.deinit();
            self.engine_ready = false;
        }

        let touched = std::mem::take(&mut self.touched);
        self.registry.release(touched.into_iter().rev());

        for task in [self.master_task.take(), self.ms_task.take()].into_iter().flatten() {
            if !self.scheduler.terminate(&task) {
                debug!(task = %task.id(), "Timer task already gone");
            }
        }
        self.scheduler.shutdown();

        if let Some(config) = self.config.as_mut() {
            config.invalidate();
        }
        self.state = LifecycleState::ShutDown;
    }

    /// Lump name of a sound effect for the active sfx device
    ///
    /// Digitized devices use `DS` lumps, the PC speaker (or no device) the
    /// `DP` ones. Lump names are at most 8 characters.
    pub fn sfx_lump_name(&self, sfx_name: &str) -> String {
        let digital = self
            .active_sfx_device()
            .map(DeviceId::plays_digital_sfx)
            .unwrap_or(false);
        let prefix = if digital { "DS" } else { "DP" };
        let mut name = format!("{}{}", prefix, sfx_name.to_ascii_uppercase());
        if name.len() > 8 {
            warn!(sfx = sfx_name, "Sound effect name too long, truncating");
            name.truncate(8);
        }
        name
    }

    pub fn active_sfx_device(&self) -> Option<DeviceId> {
        self.config.as_ref().and_then(|c| c.active_sfx_device())
    }

    pub fn active_music_device(&self) -> Option<DeviceId> {
        self.config.as_ref().and_then(|c| c.active_music_device())
    }

    pub fn configuration(&self) -> Option<&SoundConfiguration> {
        self.config.as_ref()
    }

    pub fn report(&self) -> Option<&ArbitrationReport> {
        self.report.as_ref()
    }

    pub fn clock(&self) -> GameClock {
        self.clock.clone()
    }

    pub fn scheduler(&self) -> &Scheduler<T> {
        &self.scheduler
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn settings(&self) -> &SoundSettings {
        &self.settings
    }
}

impl<T: TimingSource> Drop for SoundSystem<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
