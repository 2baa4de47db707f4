// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Built-in tunable catalog.

use crate::{
    command::CommandRunner,
    sysfs::SysRoot,
    tunable::{
        cpu::TurboBoost,
        file::{Choices, FileTunable},
        vendor::{Compositor, NvidiaPowerMizer, WifiPowerSave},
        RegistryError, TunableRegistry,
    },
};

use std::sync::Arc;

const SYSCTLS: &[(&str, &str, &str)] = &[
    ("aslr", "kernel.randomize_va_space", "Address space layout randomization (0 off, 2 full)"),
    ("nmi_watchdog", "kernel.nmi_watchdog", "NMI watchdog (0 off, 1 on)"),
    ("split_lock_mitigate", "kernel.split_lock_mitigate", "Split lock mitigation (0 off, 1 on)"),
    ("vm_swappiness", "vm.swappiness", "Kernel preference for swapping over dropping page cache"),
    ("vm_dirty_ratio", "vm.dirty_ratio", "Dirty page percentage that blocks writers"),
    (
        "vm_dirty_background_ratio",
        "vm.dirty_background_ratio",
        "Dirty page percentage that starts background writeback",
    ),
    (
        "vm_dirty_writeback_centisecs",
        "vm.dirty_writeback_centisecs",
        "Interval between writeback flusher wakeups",
    ),
    ("vm_laptop_mode", "vm.laptop_mode", "Laptop mode disk write batching"),
    (
        "vm_vfs_cache_pressure",
        "vm.vfs_cache_pressure",
        "Reclaim pressure on dentry and inode caches",
    ),
    ("net_somaxconn", "net.core.somaxconn", "Listen backlog limit"),
    ("net_tcp_fastopen", "net.ipv4.tcp_fastopen", "TCP Fast Open mode"),
    ("inotify_max_user_watches", "fs.inotify.max_user_watches", "Inotify watch limit per user"),
    (
        "inotify_max_user_instances",
        "fs.inotify.max_user_instances",
        "Inotify instance limit per user",
    ),
    ("fs_file_max", "fs.file-max", "System-wide open file limit"),
];

impl TunableRegistry {
    /// Construct new registry holding the built-in catalog.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::DuplicateTunable`] if the catalog names a
    ///   tunable twice.
    pub fn with_builtins(
        root: &SysRoot,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        register_builtins(&mut registry, root, runner)?;
        Ok(registry)
    }
}

/// Register built-in tunables into target registry.
///
/// # Errors
///
/// - Return [`RegistryError::DuplicateTunable`] if any built-in name is
///   already registered.
pub fn register_builtins(
    registry: &mut TunableRegistry,
    root: &SysRoot,
    runner: Arc<dyn CommandRunner>,
) -> Result<(), RegistryError> {
    registry.register(TurboBoost::new(root))?;
    registry.register(
        FileTunable::fanout(
            root,
            "cpu_governor",
            "/sys/devices/system/cpu/cpu[0-9]*/cpufreq/scaling_governor",
            "CPU frequency scaling governor per CPU",
        )
        .with_choices(Choices::Sibling("scaling_available_governors")),
    )?;
    registry.register(
        FileTunable::fanout(
            root,
            "energy_perf_preference",
            "/sys/devices/system/cpu/cpu[0-9]*/cpufreq/energy_performance_preference",
            "Energy performance preference hint per CPU",
        )
        .with_choices(Choices::Sibling("energy_performance_available_preferences")),
    )?;
    registry.register(
        FileTunable::fanout(
            root,
            "io_scheduler",
            "/sys/block/*/queue/scheduler",
            "I/O scheduler per block device",
        )
        .bracketed(),
    )?;
    registry.register(
        FileTunable::fanout(
            root,
            "gpu_power_level",
            "/sys/class/drm/card[0-9]*/device/power_dpm_force_performance_level",
            "AMD GPU DPM forced performance level per card",
        )
        .with_choices(Choices::Fixed(
            [
                "auto",
                "low",
                "high",
                "manual",
                "profile_standard",
                "profile_min_sclk",
                "profile_min_mclk",
                "profile_peak",
            ]
            .map(String::from)
            .to_vec(),
        )),
    )?;
    registry.register(NvidiaPowerMizer::new(runner.clone()))?;
    registry.register(Compositor::new(runner.clone()))?;
    registry.register(WifiPowerSave::new(root, runner))?;
    registry.register(FileTunable::single(
        root,
        "usb_autosuspend",
        "/sys/module/usbcore/parameters/autosuspend",
        "Default USB autosuspend delay in seconds (-1 disables)",
    ))?;
    registry.register(
        FileTunable::single(
            root,
            "pcie_aspm",
            "/sys/module/pcie_aspm/parameters/policy",
            "PCIe active state power management policy",
        )
        .bracketed(),
    )?;
    registry.register(
        FileTunable::fanout(
            root,
            "sata_link_power",
            "/sys/class/scsi_host/host*/link_power_management_policy",
            "SATA aggressive link power management policy per host",
        )
        .with_choices(Choices::Fixed(
            ["max_performance", "medium_power", "min_power", "med_power_with_dipm"]
                .map(String::from)
                .to_vec(),
        )),
    )?;

    for (name, key, description) in SYSCTLS {
        registry.register(FileTunable::sysctl(root, *name, key, *description))?;
    }

    registry.register(
        FileTunable::sysctl(
            root,
            "net_tcp_congestion",
            "net.ipv4.tcp_congestion_control",
            "TCP congestion control algorithm",
        )
        .with_choices(Choices::Sibling("tcp_available_congestion_control")),
    )?;

    Ok(())
}
