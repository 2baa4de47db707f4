// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reversible system tuning.
//!
//! Retune applies named __profiles__ of kernel and driver settings to the
//! host, e.g., CPU governor, I/O scheduler, ASLR mode, and GPU power level.
//! Before any setting is touched, its prior value is recorded in a durable
//! __snapshot__, so any application can be undone later, even if it was
//! interrupted halfway through.
//!
//! # Host Access
//!
//! Settings are reached through kernel interface files under `/sys` and
//! `/proc`, resolved against a configurable [`sysfs::SysRoot`], or through
//! vendor tools run by a [`command::CommandRunner`]. Both seams can be
//! swapped out, which is how the test suite runs against fake hosts.

pub mod command;
pub mod config;
pub mod engine;
pub mod facts;
pub mod path;
pub mod profile;
pub mod store;
pub mod sysfs;
pub mod tunable;

pub use engine::{
    report::{Mode, Outcome, Overall},
    Engine, EngineError,
};
pub use profile::{Profile, ProfileSet};
pub use tunable::{Tunable, TunableRegistry, Value};
