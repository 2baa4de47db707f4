// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! CPU turbo boost control.
//!
//! Intel P-State and the generic cpufreq driver expose turbo boost through
//! different files with opposite polarity. [`TurboBoost`] hides that behind
//! the two logical values "on" and "off".

use crate::{
    sysfs::SysRoot,
    tunable::{Result, Tunable, TunableError, Value},
};

use tracing::instrument;

const INTEL_NO_TURBO: &str = "/sys/devices/system/cpu/intel_pstate/no_turbo";
const CPUFREQ_BOOST: &str = "/sys/devices/system/cpu/cpufreq/boost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    IntelPstate,
    Cpufreq,
}

impl Backend {
    fn path(self) -> &'static str {
        match self {
            Self::IntelPstate => INTEL_NO_TURBO,
            Self::Cpufreq => CPUFREQ_BOOST,
        }
    }

    fn encode(self, enabled: bool) -> &'static str {
        match (self, enabled) {
            (Self::IntelPstate, true) | (Self::Cpufreq, false) => "0",
            (Self::IntelPstate, false) | (Self::Cpufreq, true) => "1",
        }
    }

    fn decode(self, raw: &str) -> Option<bool> {
        match (self, raw) {
            (Self::IntelPstate, "0") | (Self::Cpufreq, "1") => Some(true),
            (Self::IntelPstate, "1") | (Self::Cpufreq, "0") => Some(false),
            _ => None,
        }
    }
}

/// Turbo boost tunable, values "on" and "off".
#[derive(Debug, Clone)]
pub struct TurboBoost {
    root: SysRoot,
}

impl TurboBoost {
    /// Construct new turbo boost tunable.
    pub fn new(root: &SysRoot) -> Self {
        Self { root: root.clone() }
    }

    fn backend(&self) -> Option<Backend> {
        // INVARIANT: Intel P-State wins when both files exist.
        [Backend::IntelPstate, Backend::Cpufreq]
            .into_iter()
            .find(|backend| self.root.exists(backend.path()))
    }
}

impl Tunable for TurboBoost {
    fn name(&self) -> &str {
        "turbo_boost"
    }

    fn description(&self) -> &str {
        "CPU turbo boost (Intel P-State no_turbo or cpufreq boost)"
    }

    fn applicable(&self) -> Result<bool> {
        Ok(self.backend().is_some())
    }

    #[instrument(skip(self), level = "debug")]
    fn read(&self) -> Result<Option<Value>> {
        let Some(backend) = self.backend() else {
            return Ok(None);
        };

        let raw = self.root.read(backend.path())?;
        match backend.decode(&raw) {
            Some(true) => Ok(Some(Value::scalar("on"))),
            Some(false) => Ok(Some(Value::scalar("off"))),
            None => Err(TunableError::Malformed {
                tunable: self.name().into(),
                value: raw,
            }),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn write(&self, value: &Value) -> Result<()> {
        let Some(backend) = self.backend() else {
            return Err(TunableError::Unsupported(self.name().into()));
        };

        let enabled = match value {
            Value::Scalar(value) if value == "on" => true,
            Value::Scalar(value) if value == "off" => false,
            _ => {
                return Err(TunableError::InvalidValue {
                    tunable: self.name().into(),
                    value: value.to_string(),
                    allowed: vec!["on".into(), "off".into()],
                })
            }
        };

        Ok(self.root.write(backend.path(), backend.encode(enabled))?)
    }
}
