// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tunable system settings.
//!
//! A __tunable__ is a single named, reversible OS-level setting, e.g., the CPU
//! scaling governor or the kernel's ASLR mode. Every tunable can report
//! whether it exists on the current host, read its live value, and write a new
//! one.
//!
//! # Round-trip Safety
//!
//! Restoring a snapshot writes back exactly what was read before a profile was
//! applied. Hence, every tunable must accept any value its own `read` returned
//! on the same host. Tunables that fan out over many kernel objects read a
//! [`Value::PerInstance`] map so that per-object differences survive the
//! round trip.
//!
//! # Tunable Registry
//!
//! All tunables are registered once at startup into a [`TunableRegistry`].
//! Profiles refer to tunables by name only, and the registry resolves them.
//! Applicability checks go through the registry, which turns any probe error
//! into "not applicable" rather than failing the caller.

pub mod catalog;
pub mod cpu;
pub mod file;
pub mod vendor;

use crate::{command::CommandError, sysfs::SysfsError};

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::debug;

/// Value of a tunable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// One value for the whole setting.
    Scalar(String),

    /// One value per kernel object, keyed by instance name.
    PerInstance(BTreeMap<String, String>),
}

impl Value {
    /// Construct new scalar value.
    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(value.into())
    }

    /// Value that applies to the given instance, if any.
    pub fn for_instance(&self, instance: &str) -> Option<&str> {
        match self {
            Self::Scalar(value) => Some(value.as_str()),
            Self::PerInstance(values) => values.get(instance).map(String::as_str),
        }
    }

    /// Check if this live value satisfies a desired value.
    ///
    /// A scalar on one side matches a per-instance map on the other when
    /// every instance holds that scalar. Two maps match when every instance
    /// listed in the desired map holds the desired value.
    pub fn satisfies(&self, desired: &Value) -> bool {
        match (self, desired) {
            (Self::Scalar(live), Self::Scalar(want)) => live == want,
            (Self::PerInstance(live), Self::Scalar(want)) => {
                !live.is_empty() && live.values().all(|value| value == want)
            }
            (Self::Scalar(live), Self::PerInstance(want)) => {
                want.values().all(|value| value == live)
            }
            (Self::PerInstance(live), Self::PerInstance(want)) => want
                .iter()
                .all(|(instance, value)| live.get(instance) == Some(value)),
        }
    }
}

impl Display for Value {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Scalar(value) => fmt.write_str(value),
            Self::PerInstance(values) => {
                let mut distinct = values.values().collect::<Vec<_>>();
                distinct.dedup();
                if distinct.len() == 1 && values.len() > 1 {
                    return write!(fmt, "{} (all {})", distinct[0], values.len());
                }

                let listing = values
                    .iter()
                    .map(|(instance, value)| format!("{instance}={value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                fmt.write_str(&listing)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::scalar(value)
    }
}

/// A named, reversible OS-level setting.
pub trait Tunable: Send + Sync + 'static {
    /// Unique name of tunable.
    fn name(&self) -> &str;

    /// Brief description of what the tunable controls.
    fn description(&self) -> &str;

    /// Check if the underlying hardware or kernel feature exists.
    ///
    /// # Errors
    ///
    /// - Return [`TunableError`] if the host cannot be probed.
    fn applicable(&self) -> Result<bool>;

    /// Read live value.
    ///
    /// Returns `None` if the setting is not supported on this host.
    ///
    /// # Errors
    ///
    /// - Return [`TunableError`] if the value cannot be read.
    fn read(&self) -> Result<Option<Value>>;

    /// Write new value.
    ///
    /// # Errors
    ///
    /// - Return [`TunableError`] if the value is invalid or cannot be written.
    fn write(&self, value: &Value) -> Result<()>;
}

/// Catalog of known tunables keyed by name.
///
/// # Invariant
///
/// - No two tunables share a name.
/// - Iteration follows registration order.
#[derive(Default)]
pub struct TunableRegistry {
    tunables: Vec<Box<dyn Tunable>>,
    index: HashMap<String, usize>,
}

impl TunableRegistry {
    /// Construct new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunable.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::DuplicateTunable`] if a tunable with the same
    ///   name is already registered.
    pub fn register(&mut self, tunable: impl Tunable) -> Result<(), RegistryError> {
        self.register_boxed(Box::new(tunable))
    }

    /// Register an already boxed tunable.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::DuplicateTunable`] if a tunable with the same
    ///   name is already registered.
    pub fn register_boxed(&mut self, tunable: Box<dyn Tunable>) -> Result<(), RegistryError> {
        let name = tunable.name().to_string();
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateTunable(name));
        }

        self.index.insert(name, self.tunables.len());
        self.tunables.push(tunable);

        Ok(())
    }

    /// Resolve tunable by name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownTunable`] if no tunable has that name.
    pub fn resolve(&self, name: &str) -> Result<&dyn Tunable, RegistryError> {
        self.index
            .get(name)
            .map(|position| self.tunables[*position].as_ref())
            .ok_or_else(|| RegistryError::UnknownTunable(name.to_string()))
    }

    /// Check if named tunable applies to the current host.
    ///
    /// Never fails. Unknown names and probe errors both count as not
    /// applicable.
    pub fn is_applicable(&self, name: &str) -> bool {
        let Ok(tunable) = self.resolve(name) else {
            debug!("{name} is not registered");
            return false;
        };

        match tunable.applicable() {
            Ok(applicable) => applicable,
            Err(error) => {
                debug!("cannot probe {name}, treating as not applicable: {error}");
                false
            }
        }
    }

    /// Iterate over registered tunables in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Tunable> {
        self.tunables.iter().map(AsRef::as_ref)
    }

    /// Number of registered tunables.
    pub fn len(&self) -> usize {
        self.tunables.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tunables.is_empty()
    }
}

/// Tunable registry error types.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Tunable name registered twice.
    #[error("tunable {0:?} is already registered")]
    DuplicateTunable(String),

    /// Tunable name not registered.
    #[error("unknown tunable {0:?}")]
    UnknownTunable(String),
}

/// Tunable read and write error types.
#[derive(Debug, thiserror::Error)]
pub enum TunableError {
    /// Kernel interface file access fails.
    #[error(transparent)]
    Sysfs(#[from] SysfsError),

    /// Vendor command fails.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Value is not accepted by the setting.
    #[error("{value:?} is not a valid value for {tunable} (expected one of: {})", allowed.join(", "))]
    InvalidValue {
        tunable: String,
        value: String,
        allowed: Vec<String>,
    },

    /// Per-instance value names an instance that does not exist.
    #[error("{tunable} has no instance named {instance:?}")]
    UnknownInstance { tunable: String, instance: String },

    /// Setting has no interface on this host.
    #[error("{0} is not supported on this host")]
    Unsupported(String),

    /// Some instances of a fan-out setting could not be written.
    #[error("failed to write {tunable} for {}: {reason}", failed.join(", "))]
    PartialWrite {
        tunable: String,
        failed: Vec<String>,
        reason: String,
    },

    /// Live value cannot be interpreted.
    #[error("unexpected value {value:?} read from {tunable}")]
    Malformed { tunable: String, value: String },
}

/// Friendly result alias :3
pub type Result<T, E = TunableError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// In-memory tunable for engine and registry tests.
    pub(crate) struct MemoryTunable {
        pub(crate) name: String,
        pub(crate) value: Mutex<Option<Value>>,
        pub(crate) applicable: Result<bool, String>,
        pub(crate) fail_writes: bool,
        pub(crate) writes: Mutex<Vec<Value>>,
    }

    impl MemoryTunable {
        pub(crate) fn new(name: &str, value: &str) -> Self {
            Self {
                name: name.into(),
                value: Mutex::new(Some(Value::scalar(value))),
                applicable: Ok(true),
                fail_writes: false,
                writes: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn inapplicable(mut self) -> Self {
            self.applicable = Ok(false);
            self.value = Mutex::new(None);
            self
        }

        pub(crate) fn failing(mut self) -> Self {
            self.fail_writes = true;
            self
        }
    }

    impl Tunable for MemoryTunable {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "in-memory test setting"
        }

        fn applicable(&self) -> Result<bool> {
            self.applicable
                .clone()
                .map_err(|_| TunableError::Unsupported(self.name.clone()))
        }

        fn read(&self) -> Result<Option<Value>> {
            Ok(self.value.lock().unwrap().clone())
        }

        fn write(&self, value: &Value) -> Result<()> {
            self.writes.lock().unwrap().push(value.clone());
            if self.fail_writes {
                return Err(TunableError::Unsupported(self.name.clone()));
            }
            *self.value.lock().unwrap() = Some(value.clone());
            Ok(())
        }
    }

    #[test]
    fn register_rejects_duplicate_names() -> anyhow::Result<()> {
        let mut registry = TunableRegistry::new();
        registry.register(MemoryTunable::new("aslr", "2"))?;
        let result = registry.register(MemoryTunable::new("aslr", "0"));
        assert_eq!(result, Err(RegistryError::DuplicateTunable("aslr".into())));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn resolve_unknown_name() {
        let registry = TunableRegistry::new();
        let result = registry.resolve("cpu_governor").map(|tunable| tunable.name().to_string());
        assert_eq!(result, Err(RegistryError::UnknownTunable("cpu_governor".into())));
    }

    #[test]
    fn probe_errors_are_not_applicable() -> anyhow::Result<()> {
        let mut registry = TunableRegistry::new();
        let mut broken = MemoryTunable::new("broken", "1");
        broken.applicable = Err("no permission".into());
        registry.register(broken)?;
        registry.register(MemoryTunable::new("gpu", "auto").inapplicable())?;
        registry.register(MemoryTunable::new("aslr", "2"))?;

        assert!(!registry.is_applicable("broken"));
        assert!(!registry.is_applicable("gpu"));
        assert!(!registry.is_applicable("missing"));
        assert!(registry.is_applicable("aslr"));
        Ok(())
    }

    #[test]
    fn iteration_follows_registration_order() -> anyhow::Result<()> {
        let mut registry = TunableRegistry::new();
        for name in ["turbo_boost", "cpu_governor", "aslr"] {
            registry.register(MemoryTunable::new(name, "x"))?;
        }
        let result = registry.iter().map(|tunable| tunable.name()).collect::<Vec<_>>();
        assert_eq!(result, vec!["turbo_boost", "cpu_governor", "aslr"]);
        Ok(())
    }

    #[test]
    fn value_satisfies_desired() {
        let live = Value::PerInstance(BTreeMap::from([
            ("cpu0".to_string(), "performance".to_string()),
            ("cpu1".to_string(), "performance".to_string()),
        ]));
        assert!(live.satisfies(&Value::scalar("performance")));
        assert!(!live.satisfies(&Value::scalar("powersave")));

        let mixed = Value::PerInstance(BTreeMap::from([
            ("sda".to_string(), "bfq".to_string()),
            ("nvme0n1".to_string(), "none".to_string()),
        ]));
        let want = Value::PerInstance(BTreeMap::from([("sda".to_string(), "bfq".to_string())]));
        assert!(mixed.satisfies(&want));
        assert!(!mixed.satisfies(&Value::scalar("bfq")));
        assert!(Value::scalar("0").satisfies(&Value::scalar("0")));
    }

    #[test]
    fn value_display() {
        let uniform = Value::PerInstance(BTreeMap::from([
            ("cpu0".to_string(), "powersave".to_string()),
            ("cpu1".to_string(), "powersave".to_string()),
        ]));
        assert_eq!(uniform.to_string(), "powersave (all 2)");

        let mixed = Value::PerInstance(BTreeMap::from([
            ("nvme0n1".to_string(), "none".to_string()),
            ("sda".to_string(), "bfq".to_string()),
        ]));
        assert_eq!(mixed.to_string(), "nvme0n1=none, sda=bfq");
    }
}
