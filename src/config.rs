// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for configuration files that retune uses to simplify
//! the process of serialization and deserialization. Two kinds of files
//! exist: the engine configuration file, and one profile definition file per
//! user profile.

use crate::{path, profile::TunableAssignment};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

/// Engine configuration layout.
///
/// # General Layout
///
/// All engine configuration lives under a single `[settings]` table. Every
/// setting is optional. Missing settings fall back to their defaults, and a
/// missing configuration file is the same as an empty one.
///
/// ```toml
/// [settings]
/// state_dir = "$XDG_STATE_HOME/retune"
/// profile_dir = "~/.config/retune/profiles"
/// sysfs_root = "/"
/// command_timeout_ms = 5000
/// ```
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Settings for the engine.
    #[serde(default)]
    pub settings: EngineSettings,
}

impl EngineConfig {
    /// Load configuration file, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if the file is malformed.
    /// - Return [`ConfigError::ShellExpansion`] if a path cannot be expanded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no configuration at {:?}, using defaults", path.display());
            return Ok(Self::default());
        }

        read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.into(),
            })?
            .parse()
    }

    /// Directory holding the lock file, active marker, and snapshot store.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if no state directory is configured
    ///   and the default one cannot be determined.
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.settings.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(path::default_state_dir()?),
        }
    }

    /// Directory holding user profile definitions.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if no profile directory is
    ///   configured and the default one cannot be determined.
    pub fn profile_dir(&self) -> Result<PathBuf> {
        match &self.settings.profile_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(path::default_profile_dir()?),
        }
    }
}

impl FromStr for EngineConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: EngineConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        let settings = &mut config.settings;
        settings.state_dir = settings.state_dir.as_deref().map(expand).transpose()?;
        settings.profile_dir = settings.profile_dir.as_deref().map(expand).transpose()?;
        settings.sysfs_root = expand(&settings.sysfs_root)?;

        Ok(config)
    }
}

impl Display for EngineConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Engine configuration settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory for the lock file, active marker, and snapshot store.
    pub state_dir: Option<PathBuf>,

    /// Directory of user profile definitions.
    pub profile_dir: Option<PathBuf>,

    /// Root directory that `/sys` and `/proc` paths are resolved against.
    pub sysfs_root: PathBuf,

    /// Upper bound on any vendor command run by a tunable.
    pub command_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_dir: None,
            profile_dir: None,
            sysfs_root: PathBuf::from("/"),
            command_timeout_ms: 5000,
        }
    }
}

/// Profile definition layout.
///
/// Each user profile lives in its own TOML file. Assignments are applied in
/// the order they are listed.
///
/// ```toml
/// name = "quiet"
/// description = "Keep the fans down"
///
/// [[assignment]]
/// tunable = "turbo_boost"
/// target = "off"
///
/// [[assignment]]
/// tunable = "io_scheduler"
/// target = { ssd = "none", hdd = "bfq" }
/// ```
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ProfileDefinition {
    /// Unique name of the profile.
    pub name: String,

    /// Brief description of the optimization intent.
    #[serde(default)]
    pub description: String,

    /// Ordered tunable assignments.
    #[serde(rename = "assignment", default)]
    pub assignments: Vec<TunableAssignment>,
}

impl FromStr for ProfileDefinition {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(ConfigError::Deserialize)
    }
}

impl Display for ProfileDefinition {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to determine a default directory.
    #[error(transparent)]
    NoWayHome(#[from] path::NoWayHome),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::TargetPolicy;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("RETUNE_STATE", "/var/lib/retune")])]
    fn deserialize_engine_config() -> anyhow::Result<()> {
        let result: EngineConfig = r#"
            [settings]
            state_dir = "$RETUNE_STATE"
            sysfs_root = "/mnt/host"
            command_timeout_ms = 250
        "#
        .parse()?;

        let expect = EngineConfig {
            settings: EngineSettings {
                state_dir: Some("/var/lib/retune".into()),
                profile_dir: None,
                sysfs_root: "/mnt/host".into(),
                command_timeout_ms: 250,
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn empty_engine_config_uses_defaults() -> anyhow::Result<()> {
        let result: EngineConfig = "".parse()?;
        assert_eq!(result, EngineConfig::default());
        assert_eq!(result.settings.sysfs_root, PathBuf::from("/"));
        assert_eq!(result.settings.command_timeout_ms, 5000);
        Ok(())
    }

    #[sealed_test]
    fn missing_engine_config_file_uses_defaults() -> anyhow::Result<()> {
        let result = EngineConfig::load("does-not-exist.toml")?;
        assert_eq!(result, EngineConfig::default());
        Ok(())
    }

    #[test]
    fn deserialize_profile_definition() -> anyhow::Result<()> {
        let result: ProfileDefinition = indoc! {r#"
            name = "quiet"
            description = "Keep the fans down"

            [[assignment]]
            tunable = "turbo_boost"
            target = "off"

            [[assignment]]
            tunable = "vm_swappiness"
            target = 10

            [[assignment]]
            tunable = "io_scheduler"
            target = { ssd = "none", hdd = "bfq" }

            [[assignment]]
            tunable = "cpu_governor"
            target = { ac = "performance", battery = "powersave" }
        "#}
        .parse()?;

        let expect = ProfileDefinition {
            name: "quiet".into(),
            description: "Keep the fans down".into(),
            assignments: vec![
                TunableAssignment::new("turbo_boost", TargetPolicy::Fixed("off".into())),
                TunableAssignment::new("vm_swappiness", TargetPolicy::Fixed("10".into())),
                TunableAssignment::new(
                    "io_scheduler",
                    TargetPolicy::ByMedia {
                        ssd: "none".into(),
                        hdd: "bfq".into(),
                    },
                ),
                TunableAssignment::new(
                    "cpu_governor",
                    TargetPolicy::ByPower {
                        ac: "performance".into(),
                        battery: "powersave".into(),
                    },
                ),
            ],
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn serialize_profile_definition() {
        let result = ProfileDefinition {
            name: "quiet".into(),
            description: "Keep the fans down".into(),
            assignments: vec![
                TunableAssignment::new("turbo_boost", TargetPolicy::Fixed("off".into())),
                TunableAssignment::new("aslr", TargetPolicy::Fixed("2".into())),
            ],
        }
        .to_string();

        let expect = indoc! {r#"
            name = "quiet"
            description = "Keep the fans down"

            [[assignment]]
            tunable = "turbo_boost"
            target = "off"

            [[assignment]]
            tunable = "aslr"
            target = "2"
        "#};

        assert_eq!(result, expect);
    }
}
