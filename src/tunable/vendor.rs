// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tunables driven through vendor command line tools.
//!
//! These settings have no kernel file. They are read and written by running
//! an external tool through a [`CommandRunner`], which bounds every call with
//! a timeout. A tool that is missing makes the tunable inapplicable. A tool
//! that fails or hangs surfaces as a read or write error.

use crate::{
    command::CommandRunner,
    sysfs::SysRoot,
    tunable::{Result, Tunable, TunableError, Value},
};

use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, instrument};

const NVIDIA_SETTINGS: &str = "nvidia-settings";
const POWERMIZER_ATTRIBUTE: &str = "[gpu:0]/GpuPowerMizerMode";
const QDBUS: [&str; 2] = ["qdbus", "qdbus6"];
const IW: &str = "iw";

fn on_off(tunable: &str, value: &str) -> Result<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(TunableError::InvalidValue {
            tunable: tunable.into(),
            value: value.into(),
            allowed: vec!["on".into(), "off".into()],
        }),
    }
}

fn scalar<'a>(tunable: &str, value: &'a Value) -> Result<&'a str> {
    match value {
        Value::Scalar(value) => Ok(value.as_str()),
        Value::PerInstance(_) => Err(TunableError::InvalidValue {
            tunable: tunable.into(),
            value: value.to_string(),
            allowed: vec!["a single value".into()],
        }),
    }
}

/// NVIDIA PowerMizer mode: 0 adaptive, 1 prefer maximum performance, 2 auto.
pub struct NvidiaPowerMizer {
    runner: Arc<dyn CommandRunner>,
}

impl NvidiaPowerMizer {
    /// Construct new PowerMizer tunable.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Tunable for NvidiaPowerMizer {
    fn name(&self) -> &str {
        "nvidia_powermizer"
    }

    fn description(&self) -> &str {
        "NVIDIA PowerMizer mode via nvidia-settings (0 adaptive, 1 max performance, 2 auto)"
    }

    fn applicable(&self) -> Result<bool> {
        Ok(self.runner.available(NVIDIA_SETTINGS))
    }

    #[instrument(skip(self), level = "debug")]
    fn read(&self) -> Result<Option<Value>> {
        if !self.runner.available(NVIDIA_SETTINGS) {
            return Ok(None);
        }

        let args: [String; 3] = ["-q".into(), POWERMIZER_ATTRIBUTE.into(), "-t".into()];
        let mode = self.runner.run(NVIDIA_SETTINGS, &args)?;
        if !matches!(mode.as_str(), "0" | "1" | "2") {
            return Err(TunableError::Malformed {
                tunable: self.name().into(),
                value: mode,
            });
        }

        Ok(Some(Value::Scalar(mode)))
    }

    #[instrument(skip(self), level = "debug")]
    fn write(&self, value: &Value) -> Result<()> {
        let mode = scalar(self.name(), value)?;
        if !matches!(mode, "0" | "1" | "2") {
            return Err(TunableError::InvalidValue {
                tunable: self.name().into(),
                value: mode.into(),
                allowed: vec!["0".into(), "1".into(), "2".into()],
            });
        }

        let args: [String; 2] = ["-a".into(), format!("{POWERMIZER_ATTRIBUTE}={mode}")];
        self.runner.run(NVIDIA_SETTINGS, &args)?;

        Ok(())
    }
}

/// KWin compositor state, values "on" and "off".
pub struct Compositor {
    runner: Arc<dyn CommandRunner>,
}

impl Compositor {
    /// Construct new compositor tunable.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn qdbus(&self) -> Option<&'static str> {
        QDBUS.into_iter().find(|program| self.runner.available(program))
    }

    fn call(&self, program: &str, method: &str) -> Result<String> {
        let args: [String; 3] = [
            "org.kde.KWin".into(),
            "/Compositor".into(),
            format!("org.kde.kwin.Compositing.{method}"),
        ];
        Ok(self.runner.run(program, &args)?)
    }
}

impl Tunable for Compositor {
    fn name(&self) -> &str {
        "compositor"
    }

    fn description(&self) -> &str {
        "KWin desktop compositing via qdbus"
    }

    fn applicable(&self) -> Result<bool> {
        Ok(self.qdbus().is_some())
    }

    #[instrument(skip(self), level = "debug")]
    fn read(&self) -> Result<Option<Value>> {
        let Some(program) = self.qdbus() else {
            return Ok(None);
        };

        match self.call(program, "active")?.as_str() {
            "true" => Ok(Some(Value::scalar("on"))),
            "false" => Ok(Some(Value::scalar("off"))),
            other => Err(TunableError::Malformed {
                tunable: self.name().into(),
                value: other.into(),
            }),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn write(&self, value: &Value) -> Result<()> {
        let enabled = on_off(self.name(), scalar(self.name(), value)?)?;
        let Some(program) = self.qdbus() else {
            return Err(TunableError::Unsupported(self.name().into()));
        };

        self.call(program, if enabled { "resume" } else { "suspend" })?;

        Ok(())
    }
}

/// WiFi power saving per wireless interface, values "on" and "off".
pub struct WifiPowerSave {
    root: SysRoot,
    runner: Arc<dyn CommandRunner>,
}

impl WifiPowerSave {
    /// Construct new WiFi power save tunable.
    pub fn new(root: &SysRoot, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.clone(),
            runner,
        }
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self
            .root
            .instances("/sys/class/net/*/wireless")?
            .into_iter()
            .map(|iface| iface.name)
            .collect())
    }

    fn query(&self, iface: &str) -> Result<String> {
        let args: [String; 4] = ["dev".into(), iface.into(), "get".into(), "power_save".into()];
        let output = self.runner.run(IW, &args)?;

        // INVARIANT: iw answers with "Power save: on".
        let state = output
            .split_once(':')
            .map(|(_, state)| state.trim().to_string())
            .unwrap_or_default();
        match state.as_str() {
            "on" | "off" => Ok(state),
            _ => Err(TunableError::Malformed {
                tunable: self.name().into(),
                value: output,
            }),
        }
    }
}

impl Tunable for WifiPowerSave {
    fn name(&self) -> &str {
        "wifi_power_save"
    }

    fn description(&self) -> &str {
        "WiFi power saving per wireless interface via iw"
    }

    fn applicable(&self) -> Result<bool> {
        Ok(self.runner.available(IW) && !self.interfaces()?.is_empty())
    }

    #[instrument(skip(self), level = "debug")]
    fn read(&self) -> Result<Option<Value>> {
        if !self.applicable()? {
            return Ok(None);
        }

        let mut states = BTreeMap::new();
        for iface in self.interfaces()? {
            let state = self.query(&iface)?;
            states.insert(iface, state);
        }

        Ok(Some(Value::PerInstance(states)))
    }

    #[instrument(skip(self), level = "debug")]
    fn write(&self, value: &Value) -> Result<()> {
        if !self.applicable()? {
            return Err(TunableError::Unsupported(self.name().into()));
        }

        let interfaces = self.interfaces()?;
        let mut failed = Vec::new();
        let mut reason = None;
        if let Value::PerInstance(states) = value {
            for missing in states.keys().filter(|iface| !interfaces.contains(iface)) {
                let error = TunableError::UnknownInstance {
                    tunable: self.name().into(),
                    instance: missing.clone(),
                };
                debug!("{error}");
                reason.get_or_insert_with(|| error.to_string());
                failed.push(missing.clone());
            }
        }

        for iface in interfaces {
            let Some(state) = value.for_instance(&iface) else {
                continue;
            };

            let result = on_off(self.name(), state).and_then(|_| {
                let args: [String; 5] = [
                    "dev".into(),
                    iface.clone(),
                    "set".into(),
                    "power_save".into(),
                    state.into(),
                ];
                Ok(self.runner.run(IW, &args).map(|_| ())?)
            });
            if let Err(error) = result {
                debug!("{iface} rejected power_save {state}: {error}");
                reason.get_or_insert_with(|| error.to_string());
                failed.push(iface);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TunableError::PartialWrite {
                tunable: self.name().into(),
                failed,
                reason: reason.unwrap_or_default(),
            })
        }
    }
}
