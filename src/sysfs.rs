// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Kernel interface file access.
//!
//! Every tunable and every host fact bottoms out in a small text file under
//! `/sys` or `/proc`. Retune never touches those paths directly. Instead all
//! access goes through a [`SysRoot`], which resolves absolute kernel paths
//! against a configurable root directory. On a real host the root is `/`.
//! Tests point it at a scratch directory populated with fake kernel files.
//!
//! # Fan-out Files
//!
//! Many settings exist once per kernel object, e.g., one scaling governor per
//! CPU, or one I/O scheduler per block device. These are addressed through
//! glob patterns such as `/sys/block/*/queue/scheduler`. The path component
//! that holds the first wildcard names the __instance__ ("sda", "cpu3").
//!
//! # Bracketed Selection Files
//!
//! Some kernel files list every option and mark the active one with square
//! brackets, e.g., `none [mq-deadline] bfq`. Writing a single option name
//! selects it. See [`parse_bracketed`].

use std::{
    fs::{read_to_string, OpenOptions},
    io::Write,
    path::{Component, Path, PathBuf},
};
use tracing::debug;

/// Root directory that kernel interface paths are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysRoot(PathBuf);

impl SysRoot {
    /// Construct new root at target directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Root of the running host, i.e., `/`.
    pub fn host() -> Self {
        Self::new("/")
    }

    /// Treat root as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }

    /// Resolve absolute kernel path against this root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let relative = path
            .as_ref()
            .components()
            .filter(|component| !matches!(component, Component::RootDir | Component::Prefix(_)))
            .collect::<PathBuf>();
        self.0.join(relative)
    }

    /// Check if kernel path exists under this root.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).exists()
    }

    /// Read kernel file with surrounding whitespace trimmed.
    ///
    /// # Errors
    ///
    /// - Return [`SysfsError::Read`] if the file cannot be read.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<String> {
        let full = self.resolve(path);
        read_to_string(&full)
            .map(|content| content.trim().to_string())
            .map_err(|err| SysfsError::Read {
                source: err,
                path: full,
            })
    }

    /// Write value into existing kernel file.
    ///
    /// Never creates the file. Kernel interfaces either exist or they do not,
    /// and a missing file must surface as an error rather than a new regular
    /// file.
    ///
    /// # Errors
    ///
    /// - Return [`SysfsError::Write`] if the file cannot be opened or written.
    pub fn write(&self, path: impl AsRef<Path>, value: &str) -> Result<()> {
        let full = self.resolve(path);
        debug!("write {value:?} to {}", full.display());
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&full)
            .and_then(|mut file| file.write_all(value.as_bytes()))
            .map_err(|err| SysfsError::Write {
                source: err,
                path: full,
            })
    }

    /// Expand glob pattern of kernel paths into named instances.
    ///
    /// Returned pairs hold the instance name and the absolute kernel path of
    /// the match (not the resolved path), sorted by path.
    ///
    /// # Errors
    ///
    /// - Return [`SysfsError::Pattern`] if the glob pattern is malformed.
    pub fn instances(&self, pattern: &str) -> Result<Vec<Instance>> {
        let index = wildcard_component(pattern).unwrap_or(0);
        let root = glob::Pattern::escape(&self.0.to_string_lossy());
        let full_pattern = format!(
            "{}/{}",
            root.trim_end_matches('/'),
            pattern.trim_start_matches('/')
        );

        let mut instances = Vec::new();
        for path in glob::glob(&full_pattern)?.flatten() {
            let Ok(relative) = path.strip_prefix(&self.0) else {
                continue;
            };
            let kernel_path = Path::new("/").join(relative);
            let name = kernel_path
                .components()
                .filter(|component| matches!(component, Component::Normal(_)))
                .nth(index)
                .map(|component| component.as_os_str().to_string_lossy().into_owned());
            if let Some(name) = name {
                instances.push(Instance {
                    name,
                    path: kernel_path,
                });
            }
        }

        Ok(instances)
    }
}

impl Default for SysRoot {
    fn default() -> Self {
        Self::host()
    }
}

/// One match of a fan-out kernel path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Name of the kernel object, e.g., "cpu0" or "sda".
    pub name: String,

    /// Absolute kernel path of the file for this object.
    pub path: PathBuf,
}

/// Parse a bracketed selection file.
///
/// Returns the selected option (if any option is bracketed) and the full list
/// of offered options with brackets removed.
///
/// ```text
/// "none [mq-deadline] bfq" -> (Some("mq-deadline"), ["none", "mq-deadline", "bfq"])
/// ```
pub fn parse_bracketed(content: &str) -> (Option<String>, Vec<String>) {
    let mut selected = None;
    let mut options = Vec::new();
    for word in content.split_whitespace() {
        match word.strip_prefix('[').and_then(|word| word.strip_suffix(']')) {
            Some(inner) => {
                selected = Some(inner.to_string());
                options.push(inner.to_string());
            }
            None => options.push(word.to_string()),
        }
    }

    (selected, options)
}

fn wildcard_component(pattern: &str) -> Option<usize> {
    Path::new(pattern)
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .position(|component| {
            let text = component.as_os_str().to_string_lossy();
            text.contains(['*', '?', '['])
        })
}

/// Kernel interface access error types.
#[derive(Debug, thiserror::Error)]
pub enum SysfsError {
    /// Kernel file cannot be read from.
    #[error("failed to read from {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Kernel file cannot be written to.
    #[error("failed to write to {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Glob pattern for fan-out files is malformed.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

impl SysfsError {
    /// Check if error was caused by a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            Self::Pattern(_) => false,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SysfsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use simple_test_case::test_case;
    use std::fs::{create_dir_all, write};

    const SCHEDULERS: &[&str] = &["none", "mq-deadline", "bfq"];
    const GOVERNORS: &[&str] = &["default", "performance", "powersave"];

    #[test_case("none [mq-deadline] bfq", Some("mq-deadline"), SCHEDULERS; "middle selection")]
    #[test_case("[none] mq-deadline", Some("none"), &["none", "mq-deadline"]; "first selection")]
    #[test_case("default performance powersave", None, GOVERNORS; "no selection")]
    #[test_case("", None, &[]; "empty file")]
    #[test]
    fn bracketed_selection(content: &str, selected: Option<&str>, options: &[&str]) {
        let (result_selected, result_options) = parse_bracketed(content);
        pretty_assertions::assert_eq!(result_selected.as_deref(), selected);
        pretty_assertions::assert_eq!(result_options, options);
    }

    #[test]
    fn resolve_strips_absolute_root() {
        let root = SysRoot::new("/tmp/fake");
        assert_eq!(
            root.resolve("/sys/block/sda/queue/scheduler"),
            PathBuf::from("/tmp/fake/sys/block/sda/queue/scheduler")
        );
        assert_eq!(
            SysRoot::host().resolve("/proc/sys/vm/swappiness"),
            PathBuf::from("/proc/sys/vm/swappiness")
        );
    }

    #[sealed_test]
    fn instances_name_first_wildcard_component() -> anyhow::Result<()> {
        let root = SysRoot::new(std::env::current_dir()?);
        for cpu in ["cpu0", "cpu1", "cpufreq"] {
            create_dir_all(root.resolve(format!("/sys/devices/system/cpu/{cpu}/cpufreq")))?;
            write(
                root.resolve(format!("/sys/devices/system/cpu/{cpu}/cpufreq/scaling_governor")),
                "powersave\n",
            )?;
        }

        let result = root
            .instances("/sys/devices/system/cpu/cpu[0-9]*/cpufreq/scaling_governor")?
            .into_iter()
            .map(|instance| instance.name)
            .collect::<Vec<_>>();
        assert_eq!(result, vec!["cpu0".to_string(), "cpu1".to_string()]);

        Ok(())
    }

    #[sealed_test]
    fn write_never_creates_missing_file() -> anyhow::Result<()> {
        let root = SysRoot::new(std::env::current_dir()?);
        let result = root.write("/proc/sys/vm/swappiness", "10");
        assert!(matches!(result, Err(ref err) if err.is_not_found()));

        create_dir_all(root.resolve("/proc/sys/vm"))?;
        write(root.resolve("/proc/sys/vm/swappiness"), "60\n")?;
        root.write("/proc/sys/vm/swappiness", "10")?;
        assert_eq!(root.read("/proc/sys/vm/swappiness")?, "10");

        Ok(())
    }
}
