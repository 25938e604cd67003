//! Sound card arbitration
//!
//! Turns a desired (sfx, music) device pair into the hardware actions needed
//! to bring the cards up, in three stages:
//!
//! 1. [`PredicateTable`] answers independent role-membership questions
//!    ("is the wavetable card used by either role?", "is the Sound Blaster
//!    used for effects?").
//! 2. [`ActivationPlan::build`] runs the fixed [`RULES`] table over those
//!    answers and orders the resulting steps by [`Phase`]: probes, then
//!    initialization, then mode selection, then port configuration.
//! 3. [`Resolver::arbitrate`] executes the plan against the registry. Card
//!    failures are logged and leave the role inert; only the redbook
//!    transport failing is fatal.

use crate::domain::backend::{BackendError, BackendRegistry, InitMode, InitRequest};
use crate::domain::config::{ConfigError, GameMode, Overrides, SoundConfiguration, MAX_VOLUME};
use crate::domain::device::{DeviceId, Role, RoleSet};
use crate::domain::resource::{ResourceHandle, ResourceProvider, DMXGUS, DMXGUSC, GENMIDI};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, ArbitrationError>;

/// Volume the redbook transport is started at
pub const TRANSPORT_VOLUME: u8 = u8::MAX;

#[derive(Debug, Error)]
pub enum ArbitrationError {
    /// The redbook transport could not be brought up or locked
    #[error("Cannot play {device} music: {source}")]
    FatalTransportInitFailure {
        device: DeviceId,
        #[source]
        source: BackendError,
        /// Devices brought up before the failure; they still need releasing
        touched: Vec<DeviceId>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Independent role-membership questions asked of a device pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Predicate {
    /// Wavetable card used by either role
    Wavetable,
    /// Sound Blaster (DMA or direct) used for effects
    SoundBlasterFx,
    EnsoniqFx,
    /// OPL synth on a card used for music
    FmMusic,
    /// OPL synth on the parallel port used for music
    OplLptMusic,
    OplLptFx,
    MpuMusic,
    /// Parallel port DAC used for effects
    LptDacFx,
    CmsFx,
    CmsMusic,
    /// CMS used by at least one role
    Cms,
    CdMusic,
    AdlibFx,
    Rs232MidiMusic,
    LptMidiMusic,
}

impl Predicate {
    pub const ALL: [Predicate; 15] = [
        Predicate::Wavetable,
        Predicate::SoundBlasterFx,
        Predicate::EnsoniqFx,
        Predicate::FmMusic,
        Predicate::OplLptMusic,
        Predicate::OplLptFx,
        Predicate::MpuMusic,
        Predicate::LptDacFx,
        Predicate::CmsFx,
        Predicate::CmsMusic,
        Predicate::Cms,
        Predicate::CdMusic,
        Predicate::AdlibFx,
        Predicate::Rs232MidiMusic,
        Predicate::LptMidiMusic,
    ];

    pub fn holds(self, sfx: DeviceId, music: DeviceId) -> bool {
        use DeviceId as D;
        match self {
            Predicate::Wavetable => sfx == D::Gus || music == D::Gus,
            Predicate::SoundBlasterFx => matches!(sfx, D::SoundBlaster | D::SbDirect),
            Predicate::EnsoniqFx => sfx == D::Ensoniq,
            Predicate::FmMusic => matches!(music, D::Adlib | D::SoundBlaster | D::ProAudioSpectrum),
            Predicate::OplLptMusic => matches!(music, D::Opl2Lpt | D::Opl3Lpt),
            Predicate::OplLptFx => matches!(sfx, D::Opl2Lpt | D::Opl3Lpt),
            Predicate::MpuMusic => music == D::Mpu,
            Predicate::LptDacFx => matches!(sfx, D::Disney | D::LptDac),
            Predicate::CmsFx => sfx == D::Cms,
            Predicate::CmsMusic => music == D::Cms,
            Predicate::Cms => sfx == D::Cms || music == D::Cms,
            Predicate::CdMusic => music == D::Cd,
            Predicate::AdlibFx => sfx == D::Adlib,
            Predicate::Rs232MidiMusic => music == D::Rs232Midi,
            Predicate::LptMidiMusic => music == D::LptMidi,
        }
    }
}

/// Every predicate evaluated once for a device pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredicateTable {
    sfx: DeviceId,
    music: DeviceId,
    values: BTreeMap<Predicate, bool>,
}

impl PredicateTable {
    pub fn evaluate(sfx: DeviceId, music: DeviceId) -> Self {
        let values = Predicate::ALL
            .iter()
            .map(|p| (*p, p.holds(sfx, music)))
            .collect();
        Self { sfx, music, values }
    }

    pub fn holds(&self, predicate: Predicate) -> bool {
        self.values.get(&predicate).copied().unwrap_or(false)
    }

    pub fn active(&self) -> impl Iterator<Item = Predicate> + '_ {
        self.values.iter().filter(|(_, v)| **v).map(|(p, _)| *p)
    }

    pub fn device(&self, role: Role) -> DeviceId {
        match role {
            Role::Sfx => self.sfx,
            Role::Music => self.music,
        }
    }

    /// Roles in which `device` is requested
    pub fn roles_of(&self, device: DeviceId) -> Option<RoleSet> {
        RoleSet::from_flags(self.sfx == device, self.music == device)
    }
}

/// Execution phase of a step; steps run in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Probe,
    Initialize,
    Mode,
    Port,
}

/// What a rule contributes when its predicate holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Probe the role's device at the role's port
    Probe(Role),
    /// Hand the wavetable card its patch map, once for all roles using it
    InitializeWavetable,
    /// Hand the music device's OPL synth the instrument bank
    InitializeFm,
    /// Bring up and lock the redbook transport
    InitializeTransport,
    /// Pick combined or single-role mode for the register-level synth
    SelectCmsMode,
    /// Point the role's device at the role's port
    ConfigurePort(Role),
    /// Like `ConfigurePort`, but use the port the probe found
    ConfigureDetectedPort(Role),
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub predicate: Predicate,
    pub phase: Phase,
    pub action: Action,
}

const fn rule(predicate: Predicate, phase: Phase, action: Action) -> Rule {
    Rule {
        predicate,
        phase,
        action,
    }
}

/// The arbitration table, in execution order within each phase
pub const RULES: &[Rule] = &[
    rule(Predicate::EnsoniqFx, Phase::Probe, Action::Probe(Role::Sfx)),
    rule(Predicate::SoundBlasterFx, Phase::Probe, Action::Probe(Role::Sfx)),
    rule(Predicate::MpuMusic, Phase::Probe, Action::Probe(Role::Music)),
    rule(Predicate::Wavetable, Phase::Initialize, Action::InitializeWavetable),
    rule(Predicate::FmMusic, Phase::Initialize, Action::InitializeFm),
    rule(Predicate::OplLptMusic, Phase::Initialize, Action::InitializeFm),
    rule(Predicate::CdMusic, Phase::Initialize, Action::InitializeTransport),
    rule(Predicate::Cms, Phase::Mode, Action::SelectCmsMode),
    rule(Predicate::OplLptMusic, Phase::Port, Action::ConfigurePort(Role::Music)),
    rule(Predicate::OplLptFx, Phase::Port, Action::ConfigurePort(Role::Sfx)),
    rule(Predicate::MpuMusic, Phase::Port, Action::ConfigureDetectedPort(Role::Music)),
    rule(Predicate::Rs232MidiMusic, Phase::Port, Action::ConfigurePort(Role::Music)),
    rule(Predicate::LptMidiMusic, Phase::Port, Action::ConfigurePort(Role::Music)),
    rule(Predicate::LptDacFx, Phase::Port, Action::ConfigurePort(Role::Sfx)),
    rule(Predicate::CmsFx, Phase::Port, Action::ConfigurePort(Role::Sfx)),
    rule(Predicate::CmsMusic, Phase::Port, Action::ConfigurePort(Role::Music)),
    rule(Predicate::AdlibFx, Phase::Port, Action::ConfigurePort(Role::Sfx)),
];

/// One hardware action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    Probe {
        device: DeviceId,
        port: u16,
        role: Role,
    },
    Initialize {
        device: DeviceId,
        mode: InitMode,
        patch: Option<&'static str>,
        volume: Option<u8>,
        /// Failure aborts startup
        fatal: bool,
    },
    Lock {
        device: DeviceId,
    },
    ConfigurePort {
        device: DeviceId,
        port: u16,
        roles: RoleSet,
        /// Replace `port` with the port found by the probe, if any
        detected: bool,
    },
}

impl Step {
    pub fn device(&self) -> DeviceId {
        match self {
            Step::Probe { device, .. }
            | Step::Initialize { device, .. }
            | Step::Lock { device }
            | Step::ConfigurePort { device, .. } => *device,
        }
    }

    /// Roles that depend on this step succeeding
    pub fn roles(&self) -> RoleSet {
        match self {
            Step::Probe { role, .. } => (*role).into(),
            Step::Initialize { mode, .. } => mode.roles(),
            // Only the redbook transport is locked.
            Step::Lock { .. } => RoleSet::Music,
            Step::ConfigurePort { roles, .. } => *roles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub phase: Phase,
    pub step: Step,
}

/// Ordered list of hardware actions for one device pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationPlan {
    pub predicates: PredicateTable,
    pub steps: Vec<PlannedStep>,
    /// Roles dropped before any hardware is touched, with the reason
    pub inert_roles: BTreeMap<Role, String>,
}

fn wavetable_patch(mode: GameMode) -> &'static str {
    match mode {
        GameMode::Commercial => DMXGUSC,
        _ => DMXGUS,
    }
}

impl ActivationPlan {
    /// Build the plan for an already overridden device pair
    ///
    /// A single-use card asked to serve both roles keeps sfx; the music role
    /// is dropped here so no step is planned for it.
    pub fn build(sfx: DeviceId, music: DeviceId, config: &SoundConfiguration) -> Self {
        let mut inert_roles = BTreeMap::new();
        let driven_music = if sfx == music && sfx.needs_backend() && !sfx.is_dual_use() {
            inert_roles.insert(Role::Music, format!("{} cannot serve sfx and music at once", sfx));
            DeviceId::None
        } else {
            music
        };

        let predicates = PredicateTable::evaluate(sfx, driven_music);
        let mut steps: Vec<PlannedStep> = Vec::new();

        for rule in RULES.iter().filter(|r| predicates.holds(r.predicate)) {
            let phase = rule.phase;
            let mut push = |step: Step| steps.push(PlannedStep { phase, step });

            match rule.action {
                Action::Probe(role) => push(Step::Probe {
                    device: predicates.device(role),
                    port: config.port(role),
                    role,
                }),
                Action::InitializeWavetable => {
                    if let Some(roles) = predicates.roles_of(DeviceId::Gus) {
                        push(Step::Initialize {
                            device: DeviceId::Gus,
                            mode: InitMode::for_roles(roles),
                            patch: Some(wavetable_patch(config.game_mode)),
                            volume: None,
                            fatal: false,
                        });
                    }
                }
                Action::InitializeFm => push(Step::Initialize {
                    device: driven_music,
                    mode: InitMode::Music,
                    patch: Some(GENMIDI),
                    volume: None,
                    fatal: false,
                }),
                Action::InitializeTransport => {
                    push(Step::Initialize {
                        device: driven_music,
                        mode: InitMode::Music,
                        patch: None,
                        volume: Some(TRANSPORT_VOLUME),
                        fatal: true,
                    });
                    push(Step::Lock { device: driven_music });
                }
                Action::SelectCmsMode => {
                    if let Some(roles) = predicates.roles_of(DeviceId::Cms) {
                        push(Step::Initialize {
                            device: DeviceId::Cms,
                            mode: InitMode::for_roles(roles),
                            patch: None,
                            volume: None,
                            fatal: false,
                        });
                    }
                }
                Action::ConfigurePort(role) | Action::ConfigureDetectedPort(role) => {
                    push(Step::ConfigurePort {
                        device: predicates.device(role),
                        port: config.port(role),
                        roles: role.into(),
                        detected: matches!(rule.action, Action::ConfigureDetectedPort(_)),
                    })
                }
            }
        }

        merge_shared_ports(&mut steps);
        steps.sort_by_key(|s| s.phase);

        Self {
            predicates,
            steps,
            inert_roles,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().map(|s| &s.step)
    }
}

/// Fold port steps for the same device and port into one step serving both
/// roles
fn merge_shared_ports(steps: &mut Vec<PlannedStep>) {
    let mut merged: Vec<PlannedStep> = Vec::with_capacity(steps.len());
    for planned in steps.drain(..) {
        if let Step::ConfigurePort {
            device,
            port,
            roles,
            detected: false,
        } = planned.step
        {
            let existing = merged.iter_mut().find_map(|p| match &mut p.step {
                Step::ConfigurePort {
                    device: d,
                    port: pt,
                    roles: r,
                    detected: false,
                } if *d == device && *pt == port => Some(r),
                _ => None,
            });
            if let Some(existing_roles) = existing {
                *existing_roles = existing_roles.union(roles);
                continue;
            }
        }
        merged.push(planned);
    }
    *steps = merged;
}

/// What happened to one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "kebab-case")]
pub enum StepOutcome {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
}

/// Final state of one role after arbitration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "kebab-case")]
pub enum RoleStatus {
    /// Device brought up (or needs no hardware)
    Active,
    /// Device requested but not working; the role plays nothing
    Inert(String),
    /// No device requested
    Disabled,
}

impl RoleStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, RoleStatus::Active)
    }
}

/// Result of one arbitration pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbitrationReport {
    pub sfx_device: DeviceId,
    pub music_device: DeviceId,
    pub sfx: RoleStatus,
    pub music: RoleStatus,
    pub steps: Vec<StepRecord>,
    /// Devices at least one step succeeded on, in first-touch order
    pub touched: Vec<DeviceId>,
}

impl ArbitrationReport {
    pub fn status(&self, role: Role) -> &RoleStatus {
        match role {
            Role::Sfx => &self.sfx,
            Role::Music => &self.music,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
    }
}

struct HexPort(u16);

impl fmt::Display for HexPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Mutable bookkeeping while a plan executes
#[derive(Default)]
struct Execution {
    /// Roles whose card failed or lost a port conflict, with the reason
    inert_roles: BTreeMap<Role, String>,
    detected_ports: BTreeMap<DeviceId, u16>,
    claimed_ports: BTreeMap<u16, DeviceId>,
    touched: Vec<DeviceId>,
    touched_set: BTreeSet<DeviceId>,
    records: Vec<StepRecord>,
}

impl Execution {
    fn record(&mut self, step: &Step, outcome: StepOutcome) {
        if outcome == StepOutcome::Done && self.touched_set.insert(step.device()) {
            self.touched.push(step.device());
        }
        self.records.push(StepRecord {
            step: step.clone(),
            outcome,
        });
    }

    /// Record a non-fatal failure against `roles`
    fn fail(&mut self, step: &Step, roles: RoleSet, reason: String) {
        warn!(device = %step.device(), ?roles, "{}", reason);
        for role in roles.roles() {
            self.inert_roles.entry(role).or_insert_with(|| reason.clone());
        }
        self.record(step, StepOutcome::Failed(reason));
    }

    /// Roles of `roles` that are still live, or the reason none are
    fn live_roles(&self, roles: RoleSet) -> std::result::Result<RoleSet, String> {
        let sfx = roles.contains(Role::Sfx) && !self.inert_roles.contains_key(&Role::Sfx);
        let music = roles.contains(Role::Music) && !self.inert_roles.contains_key(&Role::Music);
        RoleSet::from_flags(sfx, music).ok_or_else(|| {
            roles
                .roles()
                .find_map(|r| self.inert_roles.get(&r).cloned())
                .unwrap_or_default()
        })
    }

    fn fatal(&self, device: DeviceId, source: BackendError) -> ArbitrationError {
        ArbitrationError::FatalTransportInitFailure {
            device,
            source,
            touched: self.touched.clone(),
        }
    }

    fn role_status(&self, role: Role, device: DeviceId) -> RoleStatus {
        if device.is_none() {
            return RoleStatus::Disabled;
        }
        if let Some(reason) = self.inert_roles.get(&role) {
            return RoleStatus::Inert(reason.clone());
        }
        RoleStatus::Active
    }
}

/// Executes activation plans against a registry
pub struct Resolver<'a> {
    registry: &'a mut BackendRegistry,
    resources: &'a mut dyn ResourceProvider,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a mut BackendRegistry, resources: &'a mut dyn ResourceProvider) -> Self {
        Self {
            registry,
            resources,
        }
    }

    /// Pick and bring up the cards for both roles
    ///
    /// Resets the effects volume, applies `overrides`, records the active
    /// devices in `config` and only then touches hardware.
    pub fn arbitrate(&mut self, config: &mut SoundConfiguration, overrides: Overrides) -> Result<ArbitrationReport> {
        config.sfx_volume = MAX_VOLUME;

        let (sfx, music) = overrides.apply(config.desired_sfx_device, config.desired_music_device);
        config.assign_active(Role::Sfx, sfx)?;
        config.assign_active(Role::Music, music)?;
        info!(sfx = %sfx, music = %music, "Arbitrating sound cards");

        let plan = ActivationPlan::build(sfx, music, config);
        debug!(steps = plan.steps.len(), "Activation plan built");

        let mut exec = Execution::default();
        for (role, reason) in &plan.inert_roles {
            warn!(%role, "{}", reason);
        }
        exec.inert_roles = plan.inert_roles.clone();

        for planned in &plan.steps {
            self.run_step(&planned.step, &mut exec)?;
        }

        let report = ArbitrationReport {
            sfx_device: sfx,
            music_device: music,
            sfx: exec.role_status(Role::Sfx, sfx),
            music: exec.role_status(Role::Music, music),
            steps: exec.records,
            touched: exec.touched,
        };
        info!(sfx = ?report.sfx, music = ?report.music, "Arbitration complete");
        Ok(report)
    }

    fn run_step(&mut self, step: &Step, exec: &mut Execution) -> Result<()> {
        let device = step.device();

        let roles = match exec.live_roles(step.roles()) {
            Ok(roles) => roles,
            Err(reason) => {
                let reason = format!("{} inert: {}", device, reason);
                debug!(%device, "Skipping step, role inert");
                exec.record(step, StepOutcome::Skipped(reason));
                return Ok(());
            }
        };

        let Some(backend) = self.registry.lookup(device) else {
            let reason = format!("no backend registered for {}", device);
            if let Step::Initialize { fatal: true, .. } = step {
                error!(%device, "{}", reason);
                return Err(exec.fatal(device, BackendError::Transport(reason)));
            }
            exec.fail(step, roles, reason);
            return Ok(());
        };

        match step {
            Step::Probe { port, .. } => match backend.detect(*port) {
                Ok(found) => {
                    debug!(%device, port = %HexPort(found), "Card detected");
                    exec.detected_ports.insert(device, found);
                    exec.record(step, StepOutcome::Done);
                }
                Err(e) => exec.fail(step, roles, e.to_string()),
            },

            Step::Initialize {
                mode,
                patch,
                volume,
                fatal,
                ..
            } => {
                let loaded = match patch {
                    Some(name) => match load_patch(self.resources, name) {
                        Ok(loaded) => Some(loaded),
                        Err(reason) if *fatal => {
                            return Err(exec.fatal(device, BackendError::Transport(reason)));
                        }
                        Err(reason) => {
                            exec.fail(step, roles, reason);
                            return Ok(());
                        }
                    },
                    None => None,
                };

                let mut request = InitRequest::new(*mode);
                if let Some((_, bytes)) = &loaded {
                    request = request.with_patch(bytes);
                }
                if let Some(volume) = volume {
                    request = request.with_volume(*volume);
                }
                let result = backend.initialize(&request);

                // The backend has copied what it needs by now.
                if let Some((handle, _)) = loaded {
                    self.resources.release(handle);
                }

                match result {
                    Ok(()) => {
                        info!(%device, %mode, "Card initialized");
                        exec.record(step, StepOutcome::Done);
                    }
                    Err(e) if *fatal => {
                        error!(%device, error = %e, "Transport initialization failed");
                        return Err(exec.fatal(device, e));
                    }
                    Err(e) => exec.fail(step, roles, e.to_string()),
                }
            }

            Step::Lock { .. } => match backend.lock() {
                Ok(()) => {
                    debug!(%device, "Transport locked");
                    exec.record(step, StepOutcome::Done);
                }
                Err(e) => {
                    error!(%device, error = %e, "Transport lock failed");
                    return Err(exec.fatal(device, e));
                }
            },

            Step::ConfigurePort { port, detected, .. } => {
                let port = if *detected {
                    exec.detected_ports.get(&device).copied().unwrap_or(*port)
                } else {
                    *port
                };

                match exec.claimed_ports.get(&port).copied() {
                    Some(owner) if owner == device => {
                        debug!(%device, port = %HexPort(port), "Port already configured");
                        exec.record(step, StepOutcome::Skipped(format!("port 0x{:x} already configured", port)));
                    }
                    Some(owner) => {
                        let reason = format!("port 0x{:x} already claimed by {}", port, owner);
                        warn!(%device, "{}", reason);
                        for role in roles.roles() {
                            exec.inert_roles.entry(role).or_insert_with(|| reason.clone());
                        }
                        exec.record(step, StepOutcome::Failed(reason));
                    }
                    None => match backend.configure_port(port, roles) {
                        Ok(()) => {
                            debug!(%device, port = %HexPort(port), ?roles, "Port configured");
                            exec.claimed_ports.insert(port, device);
                            exec.record(step, StepOutcome::Done);
                        }
                        Err(e) => exec.fail(step, roles, e.to_string()),
                    },
                }
            }
        }
        Ok(())
    }
}

fn load_patch<R: ResourceProvider + ?Sized>(
    resources: &mut R,
    name: &str,
) -> std::result::Result<(ResourceHandle, Vec<u8>), String> {
    let handle = resources.lookup(name).map_err(|e| e.to_string())?;
    match resources.load(handle) {
        Ok(bytes) => Ok((handle, bytes)),
        Err(e) => {
            resources.release(handle);
            Err(e.to_string())
        }
    }
}
