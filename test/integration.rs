// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{FakeHost, NoTools, NvidiaSettings, LAPTOP};

use anyhow::Result;
use indicatif::ProgressBar;
use indoc::indoc;
use pretty_assertions::assert_eq;
use retune::{
    engine::report::{TunableOutcome, TunableState},
    EngineError, Mode, Outcome, Overall, ProfileSet, Value,
};
use sealed_test::prelude::*;
use std::fs::{create_dir_all, write};

fn outcome_of<'a>(outcomes: &'a [TunableOutcome], tunable: &str) -> &'a Outcome {
    outcomes
        .iter()
        .find(|entry| entry.tunable == tunable)
        .map(|entry| &entry.outcome)
        .unwrap_or_else(|| panic!("no outcome for {tunable}"))
}

#[sealed_test]
fn gaming_round_trip_restores_every_file() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let profiles = ProfileSet::builtin();
    let bar = ProgressBar::hidden();
    let before = host.read_all(LAPTOP)?;

    let applied = engine.apply(profiles.get("gaming")?, Mode::Real, &bar)?;
    assert_eq!(applied.overall, Overall::Partial);
    assert_eq!(applied.overall.exit_code(), 1);
    assert_eq!(host.read("/sys/devices/system/cpu/intel_pstate/no_turbo")?, "0");
    assert_eq!(host.read("/sys/devices/system/cpu/cpu1/cpufreq/scaling_governor")?, "performance");
    assert_eq!(host.read("/proc/sys/kernel/randomize_va_space")?, "0");
    assert_eq!(host.read("/proc/sys/kernel/split_lock_mitigate")?, "0");
    assert_eq!(host.read("/proc/sys/vm/swappiness")?, "10");
    for skipped in ["gpu_power_level", "nvidia_powermizer", "compositor", "wifi_power_save"] {
        assert_eq!(outcome_of(&applied.outcomes, skipped), &Outcome::SkippedUnsupported);
    }

    let restored = engine.restore(None, &bar)?;
    assert_eq!(restored.overall, Overall::Complete);
    assert!(restored.marker_cleared);
    assert_eq!(host.read_all(LAPTOP)?, before);

    Ok(())
}

#[sealed_test]
fn applying_twice_matches_applying_once() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let profiles = ProfileSet::builtin();
    let gaming = profiles.get("gaming")?;
    let bar = ProgressBar::hidden();

    engine.apply(gaming, Mode::Real, &bar)?;
    let once = host.read_all(LAPTOP)?;

    let again = engine.apply(gaming, Mode::Real, &bar)?;
    assert_eq!(again.overall, Overall::Partial);
    assert_eq!(host.read_all(LAPTOP)?, once);
    assert_eq!(
        outcome_of(&again.outcomes, "vm_swappiness"),
        &Outcome::Applied {
            from: Value::scalar("10"),
            to: Value::scalar("10"),
        }
    );

    Ok(())
}

#[sealed_test]
fn performance_picks_scheduler_per_device() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let bar = ProgressBar::hidden();

    let applied = engine.apply(ProfileSet::builtin().get("performance")?, Mode::Real, &bar)?;
    assert_eq!(
        outcome_of(&applied.outcomes, "io_scheduler").to_string(),
        "applied (nvme0n1=none, sda=bfq -> nvme0n1=none, sda=mq-deadline)"
    );
    assert_eq!(host.read("/sys/block/sda/queue/scheduler")?, "mq-deadline");
    assert_eq!(
        host.read("/sys/devices/system/cpu/cpu0/cpufreq/energy_performance_preference")?,
        "performance"
    );

    engine.restore(None, &bar)?;
    let io_scheduler = engine.registry().resolve("io_scheduler")?.read()?;
    assert_eq!(
        io_scheduler,
        Some(Value::PerInstance(
            [("nvme0n1".into(), "none".into()), ("sda".into(), "bfq".into())].into()
        ))
    );

    Ok(())
}

#[sealed_test]
fn dry_run_leaves_host_and_state_untouched() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let before = host.read_all(LAPTOP)?;

    let planned = engine.apply(
        ProfileSet::builtin().get("battery-saver")?,
        Mode::DryRun,
        &ProgressBar::hidden(),
    )?;
    assert_eq!(planned.snapshot_ref, None);
    assert_eq!(
        outcome_of(&planned.outcomes, "turbo_boost"),
        &Outcome::Planned {
            current: Value::scalar("off"),
            desired: Value::scalar("off"),
        }
    );
    assert_eq!(host.read_all(LAPTOP)?, before);
    assert!(engine.store().list()?.is_empty());
    assert_eq!(engine.active_marker(), None);

    Ok(())
}

#[sealed_test]
fn dev_follows_battery_and_reports_status() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let profiles = ProfileSet::builtin();
    let dev = profiles.get("dev")?;

    engine.apply(dev, Mode::Real, &ProgressBar::hidden())?;
    assert_eq!(host.read("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor")?, "powersave");
    assert_eq!(host.read("/proc/sys/fs/inotify/max_user_watches")?, "524288");

    let report = engine.status(Some(dev));
    assert_eq!(report.active.map(|marker| marker.profile).as_deref(), Some("dev"));
    let states = report
        .entries
        .iter()
        .map(|entry| (entry.tunable.as_str(), &entry.state))
        .collect::<Vec<_>>();
    assert_eq!(
        states,
        vec![
            ("inotify_max_user_watches", &TunableState::Matches(Value::scalar("524288"))),
            ("inotify_max_user_instances", &TunableState::Unsupported),
            ("fs_file_max", &TunableState::Unsupported),
            ("vm_swappiness", &TunableState::Matches(Value::scalar("10"))),
            (
                "cpu_governor",
                &TunableState::Matches(Value::PerInstance(
                    [("cpu0".into(), "powersave".into()), ("cpu1".into(), "powersave".into())]
                        .into()
                ))
            ),
        ]
    );

    Ok(())
}

#[sealed_test]
fn vendor_tool_round_trip() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let runner = NvidiaSettings::new("0");
    let mode = runner.mode.clone();
    let engine = host.engine(runner)?;
    let bar = ProgressBar::hidden();

    let applied = engine.apply(ProfileSet::builtin().get("gaming")?, Mode::Real, &bar)?;
    assert_eq!(
        outcome_of(&applied.outcomes, "nvidia_powermizer"),
        &Outcome::Applied {
            from: Value::scalar("0"),
            to: Value::scalar("1"),
        }
    );
    assert_eq!(*mode.lock().unwrap(), "1");

    engine.restore(None, &bar)?;
    assert_eq!(*mode.lock().unwrap(), "0");

    Ok(())
}

#[sealed_test]
fn user_profile_applies_over_builtin() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    create_dir_all("profiles")?;
    write(
        "profiles/gaming.toml",
        indoc! {r#"
            name = "gaming"
            description = "Only harden less"

            [[assignment]]
            tunable = "aslr"
            target = 1
        "#},
    )?;

    let profiles = ProfileSet::load("profiles")?;
    let applied = engine.apply(profiles.get("gaming")?, Mode::Real, &ProgressBar::hidden())?;
    assert_eq!(applied.overall, Overall::Complete);
    assert_eq!(applied.outcomes.len(), 1);
    assert_eq!(host.read("/proc/sys/kernel/randomize_va_space")?, "1");
    assert_eq!(host.read("/sys/devices/system/cpu/intel_pstate/no_turbo")?, "1");

    Ok(())
}

#[sealed_test]
fn user_profile_with_unknown_tunable_changes_nothing() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let before = host.read_all(LAPTOP)?;
    create_dir_all("profiles")?;
    write(
        "profiles/typo.toml",
        indoc! {r#"
            name = "typo"

            [[assignment]]
            tunable = "vm_swappiness"
            target = 1

            [[assignment]]
            tunable = "vm_swapiness"
            target = 1
        "#},
    )?;

    let profiles = ProfileSet::load("profiles")?;
    let result = engine.apply(profiles.get("typo")?, Mode::Real, &ProgressBar::hidden());
    assert!(matches!(result, Err(EngineError::Registry(_))));
    assert_eq!(host.read_all(LAPTOP)?, before);
    assert!(engine.store().list()?.is_empty());

    Ok(())
}

#[sealed_test]
fn stacked_applies_unwind_one_at_a_time() -> Result<()> {
    let host = FakeHost::new(LAPTOP)?;
    let engine = host.engine(NoTools)?;
    let profiles = ProfileSet::builtin();
    let bar = ProgressBar::hidden();

    let first = engine.apply(profiles.get("gaming")?, Mode::Real, &bar)?;
    engine.apply(profiles.get("dev")?, Mode::Real, &bar)?;
    assert_eq!(engine.store().list()?.len(), 2);

    // Restoring the older snapshot leaves the newer marker in place.
    let restored = engine.restore(first.snapshot_ref.as_ref(), &bar)?;
    assert!(!restored.marker_cleared);
    assert_eq!(engine.active_marker().map(|marker| marker.profile).as_deref(), Some("dev"));
    assert_eq!(host.read("/proc/sys/vm/swappiness")?, "60");
    assert_eq!(host.read("/proc/sys/kernel/randomize_va_space")?, "2");

    Ok(())
}
