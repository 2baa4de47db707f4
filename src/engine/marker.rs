// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Active profile marker.
//!
//! Records which profile was last applied and which snapshot undoes it. Apply
//! writes the marker before touching any tunable, and a successful restore of
//! the referenced snapshot removes it again.

use crate::store::{write_atomic, SnapshotRef, StoreError};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActiveProfileMarker {
    /// Name of applied profile.
    pub profile: String,

    /// Snapshot that undoes the application.
    pub snapshot: SnapshotRef,

    /// Process that performed the application.
    pub pid: u32,

    /// Start of the application in seconds since the Unix epoch.
    pub started_at: u64,
}

impl ActiveProfileMarker {
    /// Load marker from `path`.
    ///
    /// A missing marker and an unreadable one are both reported as absent.
    pub fn load(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("cannot read active profile marker {:?}: {err}", path.display());
                return None;
            }
        };

        match data.parse() {
            Ok(marker) => Some(marker),
            Err(err) => {
                warn!("ignoring malformed active profile marker {:?}: {err}", path.display());
                None
            }
        }
    }

    /// Save marker to `path`, replacing any previous marker.
    ///
    /// # Errors
    ///
    /// - Return [`MarkerError`] if the marker cannot be encoded or written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = toml::ser::to_string_pretty(self)?;
        Ok(write_atomic(path.as_ref(), &data)?)
    }

    /// Remove marker at `path`, if any.
    ///
    /// # Errors
    ///
    /// - Return [`MarkerError::Remove`] if the marker exists but cannot be
    ///   removed.
    pub fn clear(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MarkerError::Remove {
                source: err,
                path: path.into(),
            }),
        }
    }
}

impl FromStr for ActiveProfileMarker {
    type Err = MarkerError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        Ok(toml::de::from_str(data)?)
    }
}

impl Display for ActiveProfileMarker {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(|_| FmtError)?
                .as_str(),
        )
    }
}

/// Active profile marker error types.
#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Write(#[from] StoreError),

    #[error("failed to remove active profile marker {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = MarkerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test]
    fn save_load_clear() -> anyhow::Result<()> {
        let marker = ActiveProfileMarker {
            profile: "gaming".into(),
            snapshot: "1700000000000000000".parse()?,
            pid: 4242,
            started_at: 1700000000,
        };

        marker.save("active.toml")?;
        assert_eq!(ActiveProfileMarker::load("active.toml"), Some(marker));

        ActiveProfileMarker::clear("active.toml")?;
        assert_eq!(ActiveProfileMarker::load("active.toml"), None);
        ActiveProfileMarker::clear("active.toml")?;

        Ok(())
    }

    #[sealed_test]
    fn torn_marker_is_absent() -> anyhow::Result<()> {
        fs::write("active.toml", "profile = \"gam")?;
        assert_eq!(ActiveProfileMarker::load("active.toml"), None);
        Ok(())
    }
}
