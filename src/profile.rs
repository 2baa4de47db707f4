// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tuning profiles.
//!
//! A __profile__ is a named, ordered list of tunable assignments. Each
//! assignment pairs a tunable name with a [`TargetPolicy`] that picks the
//! desired value from the facts of the current host. Four profiles ship
//! built-in, and users can add their own or override a built-in by dropping
//! a TOML definition into the profile directory.

use crate::{
    config::{ConfigError, ProfileDefinition},
    facts::{CpuVendor, HostFacts},
    tunable::Value,
};

use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Rule choosing a desired value from host facts.
///
/// In a profile definition a fixed target is written as a plain string or
/// integer, and every other policy as an inline table whose keys select the
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetPolicy {
    /// Same value on every host.
    Fixed(#[serde(deserialize_with = "string_or_integer")] String),

    /// Per block device, by rotational flag.
    ByMedia { ssd: String, hdd: String },

    /// By power source.
    ByPower { ac: String, battery: String },

    /// By CPU vendor, with `other` as fallback.
    ByVendor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other: Option<String>,
    },
}

impl TargetPolicy {
    /// Construct new fixed target.
    pub fn fixed(value: impl Into<String>) -> Self {
        Self::Fixed(value.into())
    }

    /// Resolve desired value for the given host.
    ///
    /// Returns `None` if the policy has nothing to say about this host, e.g.,
    /// a media policy on a host without block devices.
    pub fn desired(&self, facts: &HostFacts) -> Option<Value> {
        match self {
            Self::Fixed(value) => Some(Value::scalar(value)),
            Self::ByMedia { ssd, hdd } => {
                if facts.block_devices.is_empty() {
                    return None;
                }

                let values = facts
                    .block_devices
                    .iter()
                    .map(|(device, rotational)| {
                        let value = if *rotational { hdd } else { ssd };
                        (device.clone(), value.clone())
                    })
                    .collect::<BTreeMap<_, _>>();
                Some(Value::PerInstance(values))
            }
            Self::ByPower { ac, battery } => {
                let value = if facts.on_battery() { battery } else { ac };
                Some(Value::scalar(value))
            }
            Self::ByVendor { intel, amd, other } => {
                let value = match facts.cpu_vendor {
                    CpuVendor::Intel => intel.as_ref().or(other.as_ref()),
                    CpuVendor::Amd => amd.as_ref().or(other.as_ref()),
                    CpuVendor::Other => other.as_ref(),
                };
                value.map(Value::scalar)
            }
        }
    }
}

impl Display for TargetPolicy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Fixed(value) => fmt.write_str(value),
            Self::ByMedia { ssd, hdd } => write!(fmt, "ssd: {ssd}, hdd: {hdd}"),
            Self::ByPower { ac, battery } => write!(fmt, "ac: {ac}, battery: {battery}"),
            Self::ByVendor { intel, amd, other } => {
                let choices = [("intel", intel), ("amd", amd), ("other", other)]
                    .into_iter()
                    .filter_map(|(key, value)| {
                        value.as_ref().map(|value| format!("{key}: {value}"))
                    })
                    .collect::<Vec<_>>();
                fmt.write_str(&choices.join(", "))
            }
        }
    }
}

fn string_or_integer<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Integer(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(value) => value,
        Raw::Integer(value) => value.to_string(),
    })
}

/// Pairing of a tunable name with its target policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunableAssignment {
    /// Name of tunable in the registry.
    pub tunable: String,

    /// Policy choosing the desired value.
    pub target: TargetPolicy,
}

impl TunableAssignment {
    /// Construct new assignment.
    pub fn new(tunable: impl Into<String>, target: TargetPolicy) -> Self {
        Self {
            tunable: tunable.into(),
            target,
        }
    }
}

/// Named, ordered set of tunable assignments.
///
/// # Invariant
///
/// - No tunable is assigned twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    name: String,
    description: String,
    assignments: Vec<TunableAssignment>,
    builtin: bool,
}

impl Profile {
    /// Construct new profile.
    ///
    /// # Errors
    ///
    /// - Return [`ProfileError::DuplicateAssignment`] if a tunable is assigned
    ///   more than once.
    /// - Return [`ProfileError::InvalidTarget`] if a vendor policy names no
    ///   vendor at all.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        assignments: impl IntoIterator<Item = TunableAssignment>,
    ) -> Result<Self> {
        let name = name.into();
        let assignments = assignments.into_iter().collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for assignment in &assignments {
            if !seen.insert(assignment.tunable.as_str()) {
                return Err(ProfileError::DuplicateAssignment {
                    profile: name,
                    tunable: assignment.tunable.clone(),
                });
            }

            if let TargetPolicy::ByVendor {
                intel: None,
                amd: None,
                other: None,
            } = assignment.target
            {
                return Err(ProfileError::InvalidTarget {
                    profile: name,
                    tunable: assignment.tunable.clone(),
                });
            }
        }

        Ok(Self {
            name,
            description: description.into(),
            assignments,
            builtin: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn assignments(&self) -> &[TunableAssignment] {
        &self.assignments
    }

    /// Check if profile ships with retune rather than a user definition.
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }
}

impl TryFrom<ProfileDefinition> for Profile {
    type Error = ProfileError;

    fn try_from(definition: ProfileDefinition) -> Result<Self, Self::Error> {
        Self::new(definition.name, definition.description, definition.assignments)
    }
}

fn fixed(tunable: &str, value: &str) -> TunableAssignment {
    TunableAssignment::new(tunable, TargetPolicy::fixed(value))
}

/// Profiles that ship with retune.
pub fn builtin_profiles() -> Vec<Profile> {
    let performance = vec![
        fixed("turbo_boost", "on"),
        fixed("cpu_governor", "performance"),
        fixed("energy_perf_preference", "performance"),
        TunableAssignment::new(
            "io_scheduler",
            TargetPolicy::ByMedia {
                ssd: "none".into(),
                hdd: "mq-deadline".into(),
            },
        ),
        fixed("vm_swappiness", "10"),
        fixed("vm_dirty_ratio", "20"),
        fixed("vm_dirty_background_ratio", "10"),
        fixed("gpu_power_level", "high"),
        fixed("pcie_aspm", "performance"),
        fixed("sata_link_power", "max_performance"),
        fixed("net_somaxconn", "4096"),
        fixed("net_tcp_fastopen", "3"),
    ];

    let gaming = vec![
        fixed("turbo_boost", "on"),
        fixed("cpu_governor", "performance"),
        fixed("gpu_power_level", "high"),
        fixed("nvidia_powermizer", "1"),
        fixed("compositor", "off"),
        fixed("aslr", "0"),
        fixed("vm_swappiness", "10"),
        fixed("wifi_power_save", "off"),
        fixed("split_lock_mitigate", "0"),
    ];

    let battery_saver = vec![
        fixed("turbo_boost", "off"),
        fixed("cpu_governor", "powersave"),
        fixed("energy_perf_preference", "power"),
        fixed("gpu_power_level", "low"),
        fixed("wifi_power_save", "on"),
        fixed("usb_autosuspend", "2"),
        fixed("pcie_aspm", "powersave"),
        fixed("sata_link_power", "med_power_with_dipm"),
        fixed("vm_dirty_writeback_centisecs", "1500"),
        fixed("vm_laptop_mode", "5"),
        fixed("nmi_watchdog", "0"),
    ];

    let dev = vec![
        fixed("inotify_max_user_watches", "524288"),
        fixed("inotify_max_user_instances", "1024"),
        fixed("fs_file_max", "2097152"),
        fixed("vm_swappiness", "10"),
        TunableAssignment::new(
            "cpu_governor",
            TargetPolicy::ByPower {
                ac: "performance".into(),
                battery: "powersave".into(),
            },
        ),
    ];

    [
        ("performance", "Maximum throughput for sustained workloads", performance),
        ("gaming", "Low latency for games at the cost of power and hardening", gaming),
        ("battery-saver", "Stretch battery life on laptops", battery_saver),
        ("dev", "Raise limits for file watchers and large builds", dev),
    ]
    .into_iter()
    .map(|(name, description, assignments)| Profile {
        name: name.into(),
        description: description.into(),
        assignments,
        builtin: true,
    })
    .collect()
}

/// Collection of known profiles.
///
/// # Invariant
///
/// - Profile names are unique. A user profile replaces a built-in profile of
///   the same name in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSet {
    profiles: Vec<Profile>,
}

impl ProfileSet {
    /// Construct new set holding only built-in profiles.
    pub fn builtin() -> Self {
        Self {
            profiles: builtin_profiles(),
        }
    }

    /// Construct new set of built-in profiles overlaid with user profiles.
    ///
    /// Every `*.toml` file in `dir` is a profile definition. A missing
    /// directory is the same as an empty one.
    ///
    /// # Errors
    ///
    /// - Return [`ProfileError::Read`] if a definition cannot be read.
    /// - Return [`ProfileError::Definition`] if a definition is malformed.
    /// - Return [`ProfileError::DuplicateProfile`] if two user definitions
    ///   share a name.
    #[instrument(skip(dir), level = "debug")]
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut set = Self::builtin();
        if !dir.is_dir() {
            debug!("no profile directory at {:?}", dir.display());
            return Ok(set);
        }

        let pattern = glob::Pattern::escape(&dir.to_string_lossy()) + "/*.toml";
        let mut paths = glob::glob(&pattern)?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(error) => {
                    debug!("skipping unreadable profile entry: {error}");
                    None
                }
            })
            .collect::<Vec<_>>();
        paths.sort();

        let mut user = HashSet::new();
        for path in paths {
            let data = read_to_string(&path).map_err(|err| ProfileError::Read {
                source: err,
                path: path.clone(),
            })?;
            let definition: ProfileDefinition =
                data.parse().map_err(|err| ProfileError::Definition {
                    source: err,
                    path: path.clone(),
                })?;
            let profile = Profile::try_from(definition)?;

            if !user.insert(profile.name().to_string()) {
                return Err(ProfileError::DuplicateProfile(profile.name().to_string()));
            }

            info!("loaded profile {:?} from {:?}", profile.name(), path.display());
            set.insert(profile);
        }

        Ok(set)
    }

    /// Add profile, replacing any profile with the same name.
    pub fn insert(&mut self, profile: Profile) {
        match self.profiles.iter_mut().find(|known| known.name == profile.name) {
            Some(known) => {
                debug!("profile {:?} overrides an existing profile", profile.name);
                *known = profile;
            }
            None => self.profiles.push(profile),
        }
    }

    /// Look up profile by name.
    ///
    /// # Errors
    ///
    /// - Return [`ProfileError::UnknownProfile`] if no profile has that name.
    pub fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .iter()
            .find(|profile| profile.name == name)
            .ok_or_else(|| ProfileError::UnknownProfile(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Profile error types.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// No profile with requested name.
    #[error("unknown profile {0:?}")]
    UnknownProfile(String),

    /// Two user definitions share a name.
    #[error("profile {0:?} is defined more than once")]
    DuplicateProfile(String),

    /// Profile assigns the same tunable twice.
    #[error("profile {profile:?} assigns {tunable:?} more than once")]
    DuplicateAssignment { profile: String, tunable: String },

    /// Target policy cannot produce a value on any host.
    #[error("profile {profile:?} gives {tunable:?} a target with no values")]
    InvalidTarget { profile: String, tunable: String },

    /// Definition file cannot be read.
    #[error("failed to read profile definition {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Definition file is malformed.
    #[error("invalid profile definition {:?}", path.display())]
    Definition {
        #[source]
        source: ConfigError,
        path: PathBuf,
    },

    /// Profile directory cannot be searched.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// Friendly result alias :3
type Result<T, E = ProfileError> = std::result::Result<T, E>;
