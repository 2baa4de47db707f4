// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tunables backed by kernel interface files.
//!
//! Most tunables are nothing more than a text file under `/sys` or `/proc`.
//! [`FileTunable`] covers all of them: a single file (sysctls, module
//! parameters) or a glob pattern that fans out over many kernel objects
//! (per-CPU governors, per-device schedulers).

use crate::{
    sysfs::{parse_bracketed, SysRoot},
    tunable::{Result, Tunable, TunableError, Value},
};

use std::{collections::BTreeMap, path::{Path, PathBuf}};
use tracing::{debug, instrument};

/// Layout of the kernel file's content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// File holds the value itself.
    #[default]
    Plain,

    /// File lists all options and brackets the active one.
    Bracketed,
}

/// Where the set of valid values comes from.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Choices {
    /// Any value is passed through to the kernel.
    #[default]
    Any,

    /// Fixed listing of values.
    Fixed(Vec<String>),

    /// Whitespace separated listing in a file next to the value file.
    Sibling(&'static str),

    /// Options offered by the bracketed file itself.
    Offered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Single(PathBuf),
    Fanout(String),
}

/// Tunable stored in one or many kernel interface files.
#[derive(Debug, Clone)]
pub struct FileTunable {
    name: String,
    description: String,
    root: SysRoot,
    target: Target,
    format: Format,
    choices: Choices,
}

impl FileTunable {
    /// Construct new tunable backed by a single kernel file.
    pub fn single(
        root: &SysRoot,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            root: root.clone(),
            target: Target::Single(path.into()),
            format: Format::Plain,
            choices: Choices::Any,
        }
    }

    /// Construct new tunable backed by a sysctl key, e.g., "vm.swappiness".
    pub fn sysctl(
        root: &SysRoot,
        name: impl Into<String>,
        key: &str,
        description: impl Into<String>,
    ) -> Self {
        let path = Path::new("/proc/sys").join(key.replace('.', "/"));
        Self::single(root, name, path, description)
    }

    /// Construct new tunable fanning out over every file matching `pattern`.
    pub fn fanout(
        root: &SysRoot,
        name: impl Into<String>,
        pattern: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            root: root.clone(),
            target: Target::Fanout(pattern.into()),
            format: Format::Plain,
            choices: Choices::Any,
        }
    }

    /// Treat file content as a bracketed selection.
    pub fn bracketed(mut self) -> Self {
        self.format = Format::Bracketed;
        self.choices = Choices::Offered;
        self
    }

    /// Restrict values to the given choices.
    pub fn with_choices(mut self, choices: Choices) -> Self {
        self.choices = choices;
        self
    }

    fn paths(&self) -> Result<Vec<(Option<String>, PathBuf)>> {
        match &self.target {
            Target::Single(path) => {
                if self.root.exists(path) {
                    Ok(vec![(None, path.clone())])
                } else {
                    Ok(Vec::new())
                }
            }
            Target::Fanout(pattern) => Ok(self
                .root
                .instances(pattern)?
                .into_iter()
                .map(|instance| (Some(instance.name), instance.path))
                .collect()),
        }
    }

    fn read_path(&self, path: &Path) -> Result<String> {
        let content = self.root.read(path)?;
        match self.format {
            Format::Plain => Ok(content),
            Format::Bracketed => match parse_bracketed(&content) {
                (Some(selected), _) => Ok(selected),
                (None, mut options) if options.len() == 1 => Ok(options.remove(0)),
                (None, _) => Err(TunableError::Malformed {
                    tunable: self.name.clone(),
                    value: content,
                }),
            },
        }
    }

    fn allowed(&self, path: &Path) -> Result<Option<Vec<String>>> {
        let allowed = match &self.choices {
            Choices::Any => return Ok(None),
            Choices::Fixed(values) => values.clone(),
            Choices::Sibling(file) => {
                let sibling = path.parent().map(|dir| dir.join(file));
                match sibling {
                    // INVARIANT: Missing listing means the kernel decides.
                    Some(sibling) if self.root.exists(&sibling) => self
                        .root
                        .read(&sibling)?
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    _ => return Ok(None),
                }
            }
            Choices::Offered => match parse_bracketed(&self.root.read(path)?) {
                (Some(_), offered) => offered,
                (None, _) => return Ok(None),
            },
        };

        Ok(Some(allowed))
    }

    fn write_path(&self, path: &Path, value: &str) -> Result<()> {
        if let Some(allowed) = self.allowed(path)? {
            if !allowed.iter().any(|choice| choice == value) {
                return Err(TunableError::InvalidValue {
                    tunable: self.name.clone(),
                    value: value.into(),
                    allowed,
                });
            }
        }

        Ok(self.root.write(path, value)?)
    }
}

impl Tunable for FileTunable {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn applicable(&self) -> Result<bool> {
        Ok(!self.paths()?.is_empty())
    }

    #[instrument(skip(self), fields(tunable = %self.name), level = "debug")]
    fn read(&self) -> Result<Option<Value>> {
        let paths = self.paths()?;
        if paths.is_empty() {
            return Ok(None);
        }

        if let Target::Single(path) = &self.target {
            return Ok(Some(Value::Scalar(self.read_path(path)?)));
        }

        let mut values = BTreeMap::new();
        for (instance, path) in paths {
            let name = instance.unwrap_or_default();
            values.insert(name, self.read_path(&path)?);
        }

        Ok(Some(Value::PerInstance(values)))
    }

    #[instrument(skip(self), fields(tunable = %self.name), level = "debug")]
    fn write(&self, value: &Value) -> Result<()> {
        let paths = self.paths()?;
        if paths.is_empty() {
            return Err(TunableError::Unsupported(self.name.clone()));
        }

        match (&self.target, value) {
            (Target::Single(path), Value::Scalar(value)) => return self.write_path(path, value),
            (Target::Single(_), Value::PerInstance(_)) => {
                return Err(TunableError::InvalidValue {
                    tunable: self.name.clone(),
                    value: value.to_string(),
                    allowed: vec!["a single value".into()],
                });
            }
            _ => {}
        }

        // INVARIANT: Attempt every instance even if an earlier one fails or
        //   has vanished since the value was read.
        let mut failed = Vec::new();
        let mut reason = None;
        if let Value::PerInstance(values) = value {
            for missing in values.keys().filter(|name| {
                !paths
                    .iter()
                    .any(|(instance, _)| instance.as_deref() == Some(name.as_str()))
            }) {
                let error = TunableError::UnknownInstance {
                    tunable: self.name.clone(),
                    instance: missing.clone(),
                };
                debug!("{error}");
                failed.push(missing.clone());
                reason.get_or_insert_with(|| error.to_string());
            }
        }

        for (instance, path) in &paths {
            let instance = instance.as_deref().unwrap_or_default();
            let Some(target) = value.for_instance(instance) else {
                continue;
            };

            if let Err(error) = self.write_path(path, target) {
                debug!("{instance} rejected {target:?}: {error}");
                failed.push(instance.to_string());
                reason.get_or_insert_with(|| error.to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TunableError::PartialWrite {
                tunable: self.name.clone(),
                failed,
                reason: reason.unwrap_or_default(),
            })
        }
    }
}
