// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use retune::{
    command::{CommandRunner, SystemRunner},
    config::EngineConfig,
    engine::report::{ApplyResult, RestoreResult, StatusReport},
    facts::{FactsProvider, SysfsFacts},
    path::default_config_path,
    store::SnapshotRef,
    sysfs::SysRoot,
    Engine, Mode, Overall, ProfileSet, TunableRegistry,
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Select;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    process::exit,
    sync::Arc,
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "retune [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Directory holding the lock, active marker, and snapshots.
    #[arg(long, global = true, value_name = "path")]
    pub state_dir: Option<PathBuf>,

    /// Root that /sys and /proc paths are resolved against.
    #[arg(long, global = true, value_name = "path")]
    pub sysfs_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<Overall> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let mut config = EngineConfig::load(config_path)?;
        if let Some(state_dir) = self.state_dir {
            config.settings.state_dir = Some(state_dir);
        }
        if let Some(sysfs_root) = self.sysfs_root {
            config.settings.sysfs_root = sysfs_root;
        }

        match self.command {
            Command::Apply(opts) => run_apply(&config, opts),
            Command::Restore(opts) => run_restore(&config, opts),
            Command::Status(opts) => run_status(&config, opts),
            Command::Profiles => run_profiles(&config),
            Command::Tunables => run_tunables(&config),
            Command::Snapshots => run_snapshots(&config),
            Command::Facts => run_facts(&config),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Apply tuning profile, recording prior values first.
    #[command(override_usage = "retune apply [options] <profile>")]
    Apply(ApplyOptions),

    /// Restore values recorded by an earlier apply.
    #[command(override_usage = "retune restore [options]")]
    Restore(RestoreOptions),

    /// Compare live values with a profile.
    #[command(override_usage = "retune status [options] [<profile>]")]
    Status(StatusOptions),

    /// List known profiles.
    Profiles,

    /// List known tunables and whether they apply to this host.
    Tunables,

    /// List saved snapshots, newest first.
    Snapshots,

    /// Show host facts that profile targets depend on.
    Facts,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ApplyOptions {
    /// Name of profile to apply.
    #[arg(required = true, value_name = "profile")]
    pub profile: String,

    /// Show what would change without changing anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RestoreOptions {
    /// Snapshot to restore instead of the most recent one.
    #[arg(short, long, group = "target", value_name = "ref")]
    pub snapshot: Option<SnapshotRef>,

    /// Pick snapshot to restore interactively.
    #[arg(short, long, group = "target")]
    pub pick: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Profile to compare against instead of the active one.
    #[arg(value_name = "profile")]
    pub profile: Option<String>,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time()
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match run() {
        Ok(overall) => exit(overall.exit_code()),
        Err(error) => {
            error!("{error:?}");
            exit(2);
        }
    }
}

fn run() -> Result<Overall> {
    Cli::parse().run()
}

fn host(config: &EngineConfig) -> (SysRoot, Arc<dyn CommandRunner>) {
    let settings = &config.settings;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(Duration::from_millis(
        settings.command_timeout_ms,
    )));
    (SysRoot::new(&settings.sysfs_root), runner)
}

fn open_engine(config: &EngineConfig) -> Result<Engine> {
    let (root, runner) = host(config);
    let registry = TunableRegistry::with_builtins(&root, runner.clone())?;
    let facts = SysfsFacts::new(root, runner);

    Ok(Engine::new(registry, facts, config.state_dir()?)?)
}

fn progress_bar() -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<30}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    Ok(bar)
}

fn run_apply(config: &EngineConfig, opts: ApplyOptions) -> Result<Overall> {
    let profiles = ProfileSet::load(config.profile_dir()?)?;
    let profile = profiles.get(&opts.profile)?;
    let engine = open_engine(config)?;

    let mode = if opts.dry_run { Mode::DryRun } else { Mode::Real };
    let bar = progress_bar()?;
    let result = engine.apply(profile, mode, &bar)?;
    bar.finish_and_clear();

    print_apply(&result);
    Ok(result.overall)
}

fn run_restore(config: &EngineConfig, opts: RestoreOptions) -> Result<Overall> {
    let engine = open_engine(config)?;

    let target = if opts.pick {
        Some(pick_snapshot(&engine)?)
    } else {
        opts.snapshot
    };

    let bar = progress_bar()?;
    let result = engine.restore(target.as_ref(), &bar)?;
    bar.finish_and_clear();

    print_restore(&result);
    Ok(result.overall)
}

fn run_status(config: &EngineConfig, opts: StatusOptions) -> Result<Overall> {
    let profiles = ProfileSet::load(config.profile_dir()?)?;
    let engine = open_engine(config)?;

    let name = match opts.profile {
        Some(name) => Some(name),
        None => engine.active_marker().map(|marker| marker.profile),
    };
    let profile = name.as_deref().map(|name| profiles.get(name)).transpose()?;

    print_status(&engine.status(profile));
    Ok(Overall::Complete)
}

fn run_profiles(config: &EngineConfig) -> Result<Overall> {
    let profiles = ProfileSet::load(config.profile_dir()?)?;
    for profile in profiles.iter() {
        let origin = if profile.is_builtin() { "built-in" } else { "user" };
        println!("{:<16} {:<9} {}", profile.name(), origin, profile.description());
        for assignment in profile.assignments() {
            println!("    {:<30} {}", assignment.tunable, assignment.target);
        }
    }

    Ok(Overall::Complete)
}

fn run_tunables(config: &EngineConfig) -> Result<Overall> {
    let engine = open_engine(config)?;
    let registry = engine.registry();
    for tunable in registry.iter() {
        let marker = if registry.is_applicable(tunable.name()) { "yes" } else { "no" };
        println!("{:<30} {:<4} {}", tunable.name(), marker, tunable.description());
    }

    Ok(Overall::Complete)
}

fn run_snapshots(config: &EngineConfig) -> Result<Overall> {
    let engine = open_engine(config)?;
    info!("snapshots stored in {:?}", engine.store().path().display());
    let active = engine.active_marker().map(|marker| marker.snapshot);
    for choice in snapshot_choices(&engine)? {
        let flag = if Some(&choice.snapshot_ref) == active.as_ref() { "*" } else { " " };
        println!("{flag} {choice}");
    }

    Ok(Overall::Complete)
}

fn run_facts(config: &EngineConfig) -> Result<Overall> {
    let (root, runner) = host(config);
    print!("{}", SysfsFacts::new(root, runner).gather());

    Ok(Overall::Complete)
}

struct SnapshotChoice {
    snapshot_ref: SnapshotRef,
    label: String,
}

impl Display for SnapshotChoice {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}  {}", self.snapshot_ref, self.label)
    }
}

fn snapshot_choices(engine: &Engine) -> Result<Vec<SnapshotChoice>> {
    let store = engine.store();
    let mut choices = Vec::new();
    for snapshot_ref in store.list()? {
        let label = match store.load(&snapshot_ref) {
            Ok(snapshot) => format!(
                "{:<16} created {} ({} tunables{})",
                snapshot.profile,
                snapshot.created_at,
                snapshot.records.len(),
                if snapshot.finalized { "" } else { ", interrupted" }
            ),
            Err(error) => format!("unreadable: {error}"),
        };
        choices.push(SnapshotChoice { snapshot_ref, label });
    }

    Ok(choices)
}

fn pick_snapshot(engine: &Engine) -> Result<SnapshotRef> {
    let choices = snapshot_choices(engine)?;
    if choices.is_empty() {
        return Err(anyhow!("no snapshot to restore"));
    }

    let choice = Select::new("snapshot to restore", choices).prompt()?;
    info!("picked snapshot {}", choice.snapshot_ref);
    Ok(choice.snapshot_ref)
}

fn print_apply(result: &ApplyResult) {
    for entry in &result.outcomes {
        println!("{:<30} {}", entry.tunable, entry.outcome);
    }

    match &result.snapshot_ref {
        Some(snapshot_ref) => println!(
            "profile {:?} {} (snapshot {snapshot_ref})",
            result.profile, result.overall
        ),
        None => println!("profile {:?} dry run {}", result.profile, result.overall),
    }
}

fn print_restore(result: &RestoreResult) {
    for entry in &result.outcomes {
        println!("{:<30} {}", entry.tunable, entry.outcome);
    }

    println!(
        "snapshot {} of profile {:?} restored {}",
        result.snapshot_ref, result.profile, result.overall
    );
}

fn print_status(report: &StatusReport) {
    match &report.active {
        Some(marker) => println!(
            "active profile {:?} (snapshot {}, pid {})",
            marker.profile, marker.snapshot, marker.pid
        ),
        None => println!("no active profile"),
    }

    let Some(profile) = &report.profile else {
        return;
    };

    println!("compared with {profile:?}");
    for entry in &report.entries {
        println!("{:<30} {}", entry.tunable, entry.state);
    }
}
