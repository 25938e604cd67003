//! Soundscape CLI
//!
//! Runs one startup/shutdown cycle of the sound subsystem against simulated
//! cards and prints what the arbitration pass did.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use soundscape_core::domain::{
    ArbitrationReport, DeviceId, Overrides, ResourceProvider, RoleStatus, Scheduler,
    SettingsManager, SoundSettings, SoundSystem,
};
use soundscape_infra::{
    simulated_registry, CardEvent, CardJournal, EngineSnapshot, LoggingPlaybackEngine,
    LumpDirectory, MemoryResources, ThreadTimingSource,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "soundscape")]
#[command(about = "Sound card arbitration and timer scheduling", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sound effects device, by name or config code
    #[arg(long, value_name = "DEVICE")]
    sfx: Option<DeviceId>,

    /// Music device, by name or config code
    #[arg(long, value_name = "DEVICE")]
    music: Option<DeviceId>,

    /// Music device port, decimal or 0x-prefixed hex
    #[arg(long, value_name = "PORT", value_parser = parse_port)]
    music_port: Option<u16>,

    /// Sound effects device port, decimal or 0x-prefixed hex
    #[arg(long, value_name = "PORT", value_parser = parse_port)]
    sfx_port: Option<u16>,

    /// Disable both sound effects and music
    #[arg(long)]
    nosound: bool,

    /// Disable sound effects
    #[arg(long)]
    nosfx: bool,

    /// Disable music
    #[arg(long)]
    nomusic: bool,

    /// Also run the millisecond timer
    #[arg(long)]
    benchmark_advanced: bool,

    /// Simulate a card that does not respond (repeatable)
    #[arg(long = "fail", value_name = "DEVICE")]
    fail: Vec<DeviceId>,

    /// Directory of `.lmp` files to load patches from
    #[arg(long, value_name = "DIR")]
    lumps: Option<PathBuf>,

    /// Keep the subsystem running this long before shutting down
    #[arg(long, value_name = "MS", default_value_t = 0)]
    run_ms: u64,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid port '{}': {}", raw, e))
}

#[derive(Serialize)]
struct RunSummary {
    report: ArbitrationReport,
    master_ticks: u64,
    millis: u64,
    interrupts: u64,
    sample_sfx_lump: String,
    engine: EngineSnapshot,
    cards: Vec<CardEvent>,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn load_settings(cli: &Cli) -> Result<(SoundSettings, PathBuf)> {
    match &cli.config {
        Some(path) if path.exists() => {
            let settings = SoundSettings::load_from_file(path)
                .await
                .with_context(|| format!("cannot read settings from {}", path.display()))?;
            Ok((settings, path.clone()))
        }
        Some(path) => {
            warn!(path = %path.display(), "Settings file not found, using defaults");
            Ok((SoundSettings::default(), path.clone()))
        }
        None => {
            let manager = SettingsManager::new(SettingsManager::default_config_dir()?);
            let settings = manager.load().await;
            Ok((settings, manager.config_path().to_path_buf()))
        }
    }
}

fn apply_cli(cli: &Cli, settings: &mut SoundSettings) {
    if let Some(device) = cli.sfx {
        settings.sfx_device = device;
    }
    if let Some(device) = cli.music {
        settings.music_device = device;
    }
    if let Some(port) = cli.music_port {
        settings.music_port = port;
    }
    if let Some(port) = cli.sfx_port {
        settings.sfx_port = port;
    }
    if cli.benchmark_advanced {
        settings.benchmark_advanced = true;
    }
}

fn describe(status: &RoleStatus) -> String {
    match status {
        RoleStatus::Active => "active".to_string(),
        RoleStatus::Inert(reason) => format!("inert ({})", reason),
        RoleStatus::Disabled => "disabled".to_string(),
    }
}

fn print_summary(summary: &RunSummary) {
    let report = &summary.report;
    println!("sfx:   {:<24} {}", report.sfx_device.label(), describe(&report.sfx));
    println!("music: {:<24} {}", report.music_device.label(), describe(&report.music));
    println!();
    for record in &report.steps {
        println!("  {:?} -> {:?}", record.step, record.outcome);
    }
    println!();
    println!(
        "timer: {} master ticks, {} ms ticks, {} interrupts",
        summary.master_ticks, summary.millis, summary.interrupts
    );
    println!("sfx lump for 'pistol': {}", summary.sample_sfx_lump);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("Soundscape starting");

    let (mut settings, config_path) = load_settings(&cli).await?;
    apply_cli(&cli, &mut settings);
    settings.validate()?;

    if cli.save {
        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        settings.save_to_file(&config_path).await?;
    }

    let overrides = Overrides {
        no_sound: cli.nosound,
        no_sfx: cli.nosfx,
        no_music: cli.nomusic,
    };

    let journal = CardJournal::new();
    let registry = simulated_registry(&journal, &cli.fail)?;
    let resources: Box<dyn ResourceProvider> = match &cli.lumps {
        Some(dir) => Box::new(LumpDirectory::open(dir)?),
        None => Box::new(MemoryResources::with_default_patches()),
    };
    let engine = LoggingPlaybackEngine::new();

    let mut system = SoundSystem::new(
        settings,
        Scheduler::new(ThreadTimingSource::new()),
        Box::new(engine.clone()),
    )
    .with_registry(registry)
    .with_resources(resources)
    .with_overrides(overrides);

    if let Err(e) = system.startup() {
        system.shutdown();
        return Err(e).context("sound startup failed");
    }

    if cli.run_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cli.run_ms)).await;
    }

    let clock = system.clock();
    let report = system
        .report()
        .cloned()
        .context("startup finished without an arbitration report")?;
    let sample_sfx_lump = system.sfx_lump_name("pistol");
    let interrupts = system.scheduler().interrupts_serviced();
    system.shutdown();

    let summary = RunSummary {
        report,
        master_ticks: clock.ticks(),
        millis: clock.millis(),
        interrupts,
        sample_sfx_lump,
        engine: engine.snapshot(),
        cards: journal.events(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(())
}
