// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot store management.
//!
//! Retune records the prior value of every tunable a profile touches before
//! touching it. These records are grouped together into a __snapshot__, and
//! all snapshots live in one place called the __snapshot store__.
//!
//! # Snapshot Store Layout
//!
//! The snapshot store lives in `<state_dir>/snapshots`. Each snapshot gets its
//! own directory named after its [`SnapshotRef`], a zero-padded nanosecond
//! timestamp, holding a single `snapshot.toml` file. Because references are
//! zero-padded, sorting them as strings sorts snapshots by creation time.
//!
//! # Durability
//!
//! A snapshot is saved __before__ any tunable is written, and saved again
//! once every write has been attempted with the finalized flag set. Every
//! save goes through a temporary file that is synced and then renamed over
//! the real one. Readers either see the old contents or the new contents,
//! never a torn file. A snapshot that is never finalized means the apply that
//! created it was interrupted.

use crate::tunable::Value;

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, instrument, warn};

const SNAPSHOT_FILE: &str = "snapshot.toml";

/// Stable identifier of a saved snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SnapshotRef(String);

impl SnapshotRef {
    fn from_nanos(nanos: u128) -> Self {
        Self(format!("{nanos:020}"))
    }

    fn nanos(&self) -> u128 {
        // INVARIANT: References are validated on construction.
        self.0.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SnapshotRef {
    type Err = StoreError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        if data.is_empty() || !data.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(StoreError::InvalidRef(data.to_string()));
        }

        let nanos: u128 = data
            .parse()
            .map_err(|_| StoreError::InvalidRef(data.to_string()))?;
        Ok(Self::from_nanos(nanos))
    }
}

impl Display for SnapshotRef {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.0)
    }
}

/// Prior state of one tunable, and what happened when writing it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunableRecord {
    /// Name of recorded tunable.
    pub tunable: String,

    /// Tunable could be read on this host.
    pub was_supported: bool,

    /// A write of the desired value was started.
    #[serde(default)]
    pub write_attempted: bool,

    /// The write of the desired value went through.
    #[serde(default)]
    pub write_succeeded: bool,

    /// Reason the write failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Value read before any write, absent if unsupported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_value: Option<Value>,
}

impl TunableRecord {
    /// Construct new record for a tunable that could be read.
    pub fn supported(tunable: impl Into<String>, prior_value: Value) -> Self {
        Self {
            tunable: tunable.into(),
            was_supported: true,
            write_attempted: false,
            write_succeeded: false,
            error: None,
            prior_value: Some(prior_value),
        }
    }

    /// Construct new record for a tunable that does not exist on this host.
    pub fn unsupported(tunable: impl Into<String>) -> Self {
        Self {
            tunable: tunable.into(),
            was_supported: false,
            write_attempted: false,
            write_succeeded: false,
            error: None,
            prior_value: None,
        }
    }
}

/// Prior values of all tunables a profile application touched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Snapshot {
    /// Name of profile that was applied.
    pub profile: String,

    /// Creation time in seconds since the Unix epoch.
    pub created_at: u64,

    /// Every write of the application was attempted.
    pub finalized: bool,

    /// Records in profile declaration order.
    #[serde(rename = "record", default)]
    pub records: Vec<TunableRecord>,
}

impl Snapshot {
    /// Construct new unfinalized snapshot for a profile, stamped now.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            created_at: unix_time().as_secs(),
            finalized: false,
            records: Vec::new(),
        }
    }

    /// Check if restoring this snapshot should write the given record back.
    ///
    /// A finalized snapshot knows exactly which writes were attempted. An
    /// unfinalized one does not, so every supported record is restored.
    pub fn needs_restore(&self, record: &TunableRecord) -> bool {
        record.prior_value.is_some()
            && (record.write_attempted || (!self.finalized && record.was_supported))
    }
}

impl FromStr for Snapshot {
    type Err = StoreError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(StoreError::Deserialize)
    }
}

/// Durable store of snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    store_path: PathBuf,
}

impl SnapshotStore {
    /// Open snapshot store at `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if the store directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store_path = path.as_ref().to_path_buf();
        mkdirp::mkdirp(&store_path).map_err(|err| StoreError::Io {
            source: err,
            path: store_path.clone(),
        })?;

        Ok(Self { store_path })
    }

    /// Directory holding every snapshot.
    pub fn path(&self) -> &Path {
        &self.store_path
    }

    /// Persist new snapshot, returning its reference.
    ///
    /// References are strictly increasing: a new snapshot always sorts after
    /// every snapshot already in the store, even if the clock went backwards.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if the snapshot cannot be written.
    /// - Return [`StoreError::Serialize`] if the snapshot cannot be encoded.
    #[instrument(skip(self, snapshot), level = "debug")]
    pub fn save(&self, snapshot: &Snapshot) -> Result<SnapshotRef> {
        let data = toml::ser::to_string_pretty(snapshot)?;

        let mut nanos = unix_time().as_nanos();
        if let Some(latest) = self.list()?.first() {
            nanos = nanos.max(latest.nanos() + 1);
        }

        // INVARIANT: Exclusive directory creation claims the reference.
        let snapshot_ref = loop {
            let candidate = SnapshotRef::from_nanos(nanos);
            let dir = self.store_path.join(candidate.as_str());
            match fs::create_dir(&dir) {
                Ok(()) => break candidate,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => nanos += 1,
                Err(err) => return Err(StoreError::Io { source: err, path: dir }),
            }
        };

        write_atomic(&self.snapshot_file(&snapshot_ref), &data)?;
        debug!("saved snapshot {snapshot_ref} for profile {:?}", snapshot.profile);

        Ok(snapshot_ref)
    }

    /// Replace saved snapshot with its finalized form.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if no snapshot has that reference.
    /// - Return [`StoreError::AlreadyFinalized`] if the saved snapshot is
    ///   already finalized.
    /// - Return [`StoreError::Io`] if the snapshot cannot be written.
    #[instrument(skip(self, snapshot), level = "debug")]
    pub fn finalize(&self, snapshot_ref: &SnapshotRef, snapshot: &Snapshot) -> Result<()> {
        if self.load(snapshot_ref)?.finalized {
            return Err(StoreError::AlreadyFinalized(snapshot_ref.clone()));
        }

        let mut snapshot = snapshot.clone();
        snapshot.finalized = true;
        write_atomic(
            &self.snapshot_file(snapshot_ref),
            &toml::ser::to_string_pretty(&snapshot)?,
        )
    }

    /// Load snapshot by reference.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if no snapshot has that reference.
    /// - Return [`StoreError::Deserialize`] if the snapshot is malformed.
    pub fn load(&self, snapshot_ref: &SnapshotRef) -> Result<Snapshot> {
        let path = self.snapshot_file(snapshot_ref);
        match fs::read_to_string(&path) {
            Ok(data) => data.parse(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(snapshot_ref.clone()))
            }
            Err(err) => Err(StoreError::Io { source: err, path }),
        }
    }

    /// Load most recent snapshot.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Empty`] if the store holds no snapshots.
    /// - Return [`StoreError::Deserialize`] if the snapshot is malformed.
    pub fn load_latest(&self) -> Result<(SnapshotRef, Snapshot)> {
        let latest = self.list()?.into_iter().next().ok_or(StoreError::Empty)?;
        let snapshot = self.load(&latest)?;
        Ok((latest, snapshot))
    }

    /// List references of all saved snapshots, newest first.
    ///
    /// Directories that do not hold a snapshot file are skipped. Those are
    /// left behind by a save that died between claiming a reference and
    /// writing to it.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if the store cannot be read.
    pub fn list(&self) -> Result<Vec<SnapshotRef>> {
        let entries = fs::read_dir(&self.store_path).map_err(|err| StoreError::Io {
            source: err,
            path: self.store_path.clone(),
        })?;

        let mut refs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::Io {
                source: err,
                path: self.store_path.clone(),
            })?;

            let name = entry.file_name();
            let Some(snapshot_ref) = name.to_str().and_then(|name| name.parse::<SnapshotRef>().ok())
            else {
                debug!("ignoring {:?} in snapshot store", name);
                continue;
            };

            if !self.snapshot_file(&snapshot_ref).is_file() {
                warn!("snapshot {snapshot_ref} was never written, ignoring it");
                continue;
            }

            refs.push(snapshot_ref);
        }

        refs.sort_by(|a, b| b.cmp(a));
        Ok(refs)
    }

    fn snapshot_file(&self, snapshot_ref: &SnapshotRef) -> PathBuf {
        self.store_path.join(snapshot_ref.as_str()).join(SNAPSHOT_FILE)
    }
}

/// Replace file contents through a synced temporary file and a rename.
///
/// # Errors
///
/// - Return [`StoreError::Io`] if any step fails.
pub(crate) fn write_atomic(path: &Path, data: &str) -> Result<()> {
    let temp_path = PathBuf::from(format!("{}.tmp", path.display()));
    let io_error = |err| StoreError::Io {
        source: err,
        path: path.to_path_buf(),
    };

    let mut file = File::create(&temp_path).map_err(io_error)?;
    file.write_all(data.as_bytes()).map_err(io_error)?;
    file.sync_all().map_err(io_error)?;
    fs::rename(&temp_path, path).map_err(io_error)?;

    if let Some(parent) = path.parent() {
        if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!("failed to sync {:?}: {err}", parent.display());
        }
    }

    Ok(())
}

fn unix_time() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Snapshot store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store file system access fails.
    #[error("snapshot store I/O failed at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Snapshot cannot be decoded.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Snapshot cannot be encoded.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// No snapshot with requested reference.
    #[error("no snapshot {0}")]
    NotFound(SnapshotRef),

    /// Store holds no snapshots at all.
    #[error("no snapshots have been taken")]
    Empty,

    /// Snapshot was finalized already.
    #[error("snapshot {0} is already finalized")]
    AlreadyFinalized(SnapshotRef),

    /// Text is not a snapshot reference.
    #[error("invalid snapshot reference {0:?}")]
    InvalidRef(String),
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::collections::BTreeMap;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new("gaming");
        snapshot.records.push(TunableRecord::supported("aslr", Value::scalar("2")));
        snapshot.records.push(TunableRecord::supported(
            "cpu_governor",
            Value::PerInstance(BTreeMap::from([
                ("cpu0".into(), "powersave".into()),
                ("cpu1".into(), "schedutil".into()),
            ])),
        ));
        snapshot.records.push(TunableRecord::unsupported("nvidia_powermizer"));
        snapshot
    }

    #[sealed_test]
    fn save_then_load() -> anyhow::Result<()> {
        let store = SnapshotStore::open("state/snapshots")?;
        let snapshot = sample();
        let snapshot_ref = store.save(&snapshot)?;

        assert_eq!(store.load(&snapshot_ref)?, snapshot);
        assert_eq!(store.load_latest()?, (snapshot_ref, snapshot));

        Ok(())
    }

    #[sealed_test]
    fn references_strictly_increase() -> anyhow::Result<()> {
        let store = SnapshotStore::open("snapshots")?;
        let first = store.save(&sample())?;
        let second = store.save(&sample())?;
        let third = store.save(&sample())?;

        assert!(first < second && second < third);
        assert_eq!(store.list()?, vec![third.clone(), second, first]);
        assert_eq!(store.load_latest()?.0, third);

        Ok(())
    }

    #[sealed_test]
    fn finalize_exactly_once() -> anyhow::Result<()> {
        let store = SnapshotStore::open("snapshots")?;
        let mut snapshot = sample();
        let snapshot_ref = store.save(&snapshot)?;
        assert!(!store.load(&snapshot_ref)?.finalized);

        snapshot.records[0].write_attempted = true;
        snapshot.records[0].write_succeeded = true;
        store.finalize(&snapshot_ref, &snapshot)?;

        let result = store.load(&snapshot_ref)?;
        assert!(result.finalized);
        assert!(result.records[0].write_succeeded);

        let again = store.finalize(&snapshot_ref, &snapshot);
        assert!(matches!(again, Err(StoreError::AlreadyFinalized(_))));

        Ok(())
    }

    #[sealed_test]
    fn empty_store_has_no_latest() -> anyhow::Result<()> {
        let store = SnapshotStore::open("snapshots")?;
        assert!(matches!(store.load_latest(), Err(StoreError::Empty)));

        let missing: SnapshotRef = "42".parse()?;
        assert!(matches!(store.load(&missing), Err(StoreError::NotFound(_))));

        Ok(())
    }

    #[sealed_test]
    fn skip_unwritten_and_foreign_entries() -> anyhow::Result<()> {
        let store = SnapshotStore::open("snapshots")?;
        let snapshot_ref = store.save(&sample())?;
        fs::create_dir("snapshots/99999999999999999999")?;
        fs::create_dir("snapshots/lost+found")?;

        assert_eq!(store.list()?, vec![snapshot_ref]);

        Ok(())
    }

    #[test]
    fn parse_snapshot_ref() -> anyhow::Result<()> {
        let result: SnapshotRef = "1700000000000000000".parse()?;
        assert_eq!(result.as_str(), "01700000000000000000");
        assert!("latest".parse::<SnapshotRef>().is_err());
        assert!("".parse::<SnapshotRef>().is_err());
        Ok(())
    }

    #[test]
    fn restore_selection_depends_on_finalization() {
        let mut snapshot = sample();
        snapshot.records[0].write_attempted = true;

        assert!(snapshot.needs_restore(&snapshot.records[0]));
        assert!(snapshot.needs_restore(&snapshot.records[1]));
        assert!(!snapshot.needs_restore(&snapshot.records[2]));

        snapshot.finalized = true;
        assert!(snapshot.needs_restore(&snapshot.records[0]));
        assert!(!snapshot.needs_restore(&snapshot.records[1]));
        assert!(!snapshot.needs_restore(&snapshot.records[2]));
    }

    #[test]
    fn deserialize_snapshot() -> anyhow::Result<()> {
        let result: Snapshot = indoc! {r#"
            profile = "dev"
            created_at = 1700000000
            finalized = true

            [[record]]
            tunable = "vm_swappiness"
            was_supported = true
            write_attempted = true
            write_succeeded = false
            error = "permission denied"
            prior_value = "60"

            [[record]]
            tunable = "cpu_governor"
            was_supported = true
            write_attempted = true
            write_succeeded = true

            [record.prior_value]
            cpu0 = "powersave"
        "#}
        .parse()?;

        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].prior_value, Some(Value::scalar("60")));
        assert_eq!(result.records[0].error.as_deref(), Some("permission denied"));
        assert_eq!(
            result.records[1].prior_value,
            Some(Value::PerInstance(BTreeMap::from([("cpu0".into(), "powersave".into())])))
        );

        Ok(())
    }
}
