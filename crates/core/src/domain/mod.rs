//! Domain entities and business rules

pub mod arbitration;
pub mod backend;
pub mod config;
pub mod device;
pub mod lifecycle;
pub mod resource;
pub mod scheduler;

// Re-export specific items to avoid ambiguous `Result` glob imports
pub use arbitration::{
    ActivationPlan, ArbitrationError, ArbitrationReport, Phase, Predicate, PredicateTable,
    Resolver, RoleStatus, Step, StepOutcome, StepRecord, RULES,
};
pub use backend::{BackendCapability, BackendError, BackendRegistry, InitMode, InitRequest};
pub use config::{
    ConfigError, GameMode, Overrides, SettingsManager, SoundConfiguration, SoundSettings,
    MAX_VOLUME,
};
pub use device::{DeviceId, DeviceParseError, Role, RoleSet};
pub use lifecycle::{
    EngineError, GameClock, LifecycleState, NoResources, PlaybackEngine, SoundError, SoundSystem,
    MASTER_TICK_HZ, MS_TICK_HZ, SND_TICRATE,
};
pub use resource::{ResourceError, ResourceHandle, ResourceProvider};
pub use scheduler::{
    interval_for_rate, ManualTimingSource, Scheduler, SchedulerError, TaskContext, TaskHandle,
    TaskId, TaskState, TimingSource, DEFAULT_CAPACITY, PIT_CLOCK_HZ,
};
