// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations for the files retune reads and writes: the
//! configuration file, the user profile directory, and the state directory
//! that holds the lock file, the active profile marker, and the snapshot
//! store.

use std::path::PathBuf;

/// Determine default absolute path to the configuration file.
///
/// Uses `$XDG_CONFIG_HOME/retune/config.toml`. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the configuration directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("retune").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the user profile directory.
///
/// Uses `$XDG_CONFIG_HOME/retune/profiles`. Every `*.toml` file inside is
/// treated as one profile definition.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the configuration directory cannot be determined.
pub fn default_profile_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("retune").join("profiles"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to the state directory.
///
/// Uses XDG Base Directory path `$XDG_STATE_HOME/retune`, falling back to
/// `$XDG_DATA_HOME/retune` on platforms without a state directory. Does not
/// check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_state_dir() -> Result<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|path| path.join("retune"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
