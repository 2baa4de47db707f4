// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Host hardware facts.
//!
//! Profiles choose target values based on what the host looks like: SSD or
//! spinning disk, on battery or on AC, Intel or AMD. The [`FactsProvider`]
//! gathers these facts once per invocation. Gathering never fails. Anything
//! that cannot be probed is simply reported as absent.

use crate::{command::CommandRunner, sysfs::SysRoot};

use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    sync::Arc,
};
use tracing::{debug, instrument};

/// Facts about the current host.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    /// CPU vendor from `/proc/cpuinfo`.
    pub cpu_vendor: CpuVendor,

    /// Number of CPUs exposing a cpufreq interface.
    pub cpu_count: usize,

    /// Intel P-State driver is loaded.
    pub intel_pstate: bool,

    /// System battery is present (peripheral batteries do not count).
    pub battery_present: bool,

    /// Mains power state, if a mains supply is reported at all.
    pub ac_online: Option<bool>,

    /// AMD GPU with a DPM performance level control is present.
    pub amd_gpu: bool,

    /// NVIDIA driver tooling is installed.
    pub nvidia_tools: bool,

    /// Wireless network interfaces.
    pub wireless_interfaces: Vec<String>,

    /// Block devices mapped to their rotational flag.
    pub block_devices: BTreeMap<String, bool>,
}

impl HostFacts {
    /// Check if host is currently running from its battery.
    pub fn on_battery(&self) -> bool {
        self.battery_present && self.ac_online == Some(false)
    }
}

impl Display for HostFacts {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let facts = toml::to_string_pretty(self).map_err(|_| FmtError)?;
        fmt.write_str(&facts)
    }
}

/// CPU vendor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuVendor {
    Intel,
    Amd,
    #[default]
    Other,
}

/// Source of host facts.
pub trait FactsProvider: Send + Sync + 'static {
    /// Gather facts about the current host.
    fn gather(&self) -> HostFacts;
}

/// Facts provider that probes kernel interface files.
pub struct SysfsFacts {
    root: SysRoot,
    runner: Arc<dyn CommandRunner>,
}

impl SysfsFacts {
    /// Construct new provider probing files under `root`.
    pub fn new(root: SysRoot, runner: Arc<dyn CommandRunner>) -> Self {
        Self { root, runner }
    }

    fn cpu_vendor(&self) -> CpuVendor {
        let Ok(cpuinfo) = self.root.read("/proc/cpuinfo") else {
            return CpuVendor::Other;
        };

        let vendor = cpuinfo
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                (key.trim() == "vendor_id").then(|| value.trim().to_string())
            })
            .unwrap_or_default();

        match vendor.as_str() {
            "GenuineIntel" => CpuVendor::Intel,
            "AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Other,
        }
    }

    fn power_supplies(&self) -> (bool, Option<bool>) {
        let mut battery_present = false;
        let mut ac_online = None;
        let Ok(supplies) = self.root.instances("/sys/class/power_supply/*/type") else {
            return (battery_present, ac_online);
        };

        for supply in supplies {
            let base = format!("/sys/class/power_supply/{}", supply.name);
            match self.root.read(&supply.path).as_deref() {
                Ok("Battery") => {
                    // INVARIANT: Mice and headsets report scope "Device".
                    let scope = self.root.read(format!("{base}/scope")).unwrap_or_default();
                    if scope != "Device" {
                        battery_present = true;
                    }
                }
                Ok("Mains") => {
                    let online = self.root.read(format!("{base}/online")).ok();
                    if let Some(online) = online {
                        ac_online = Some(ac_online.unwrap_or(false) || online == "1");
                    }
                }
                _ => continue,
            }
        }

        (battery_present, ac_online)
    }

    fn block_devices(&self) -> BTreeMap<String, bool> {
        let Ok(devices) = self.root.instances("/sys/block/*/queue/rotational") else {
            return BTreeMap::new();
        };

        devices
            .into_iter()
            .filter(|device| !is_virtual_block_device(&device.name))
            .filter_map(|device| {
                let rotational = self.root.read(&device.path).ok()?;
                Some((device.name, rotational == "1"))
            })
            .collect()
    }
}

impl FactsProvider for SysfsFacts {
    #[instrument(skip(self), level = "debug")]
    fn gather(&self) -> HostFacts {
        let (battery_present, ac_online) = self.power_supplies();
        let facts = HostFacts {
            cpu_vendor: self.cpu_vendor(),
            cpu_count: self
                .root
                .instances("/sys/devices/system/cpu/cpu[0-9]*/cpufreq")
                .map(|cpus| cpus.len())
                .unwrap_or(0),
            intel_pstate: self.root.exists("/sys/devices/system/cpu/intel_pstate"),
            battery_present,
            ac_online,
            block_devices: self.block_devices(),
            amd_gpu: self
                .root
                .instances("/sys/class/drm/card[0-9]*/device/power_dpm_force_performance_level")
                .map(|cards| !cards.is_empty())
                .unwrap_or(false),
            nvidia_tools: self.runner.available("nvidia-settings"),
            wireless_interfaces: self
                .root
                .instances("/sys/class/net/*/wireless")
                .map(|ifaces| ifaces.into_iter().map(|iface| iface.name).collect())
                .unwrap_or_default(),
        };
        debug!("gathered host facts: {facts:?}");

        facts
    }
}

/// Facts provider returning a fixed set of facts.
#[derive(Debug, Default, Clone)]
pub struct StaticFacts(pub HostFacts);

impl FactsProvider for StaticFacts {
    fn gather(&self) -> HostFacts {
        self.0.clone()
    }
}

fn is_virtual_block_device(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md", "sr"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}
