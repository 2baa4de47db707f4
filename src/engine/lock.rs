// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Engine-wide exclusive lock.
//!
//! Apply and restore must never overlap, both within one process and across
//! processes. The lock is an advisory `flock` held on a file that records the
//! PID of its owner. The kernel drops the lock when its owner dies, so a lock
//! file left behind by a dead process is simply locked again.

use std::{
    fs::{self, File, OpenOptions, TryLockError},
    io::{Read, Seek, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Held engine lock, released on drop.
#[derive(Debug)]
pub struct EngineLock {
    path: PathBuf,
    _file: File,
}

impl EngineLock {
    /// Acquire lock at `path` without waiting.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Busy`] if another live owner holds the lock.
    /// - Return [`LockError::Io`] if the lock file cannot be managed.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let io_error = |source| LockError::Io {
            source,
            path: path.clone(),
        };

        for _ in 0..3 {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(io_error)?;

            match file.try_lock() {
                Ok(()) => {}
                Err(TryLockError::WouldBlock) => {
                    return Err(LockError::Busy {
                        pid: recorded_pid(&mut file),
                    })
                }
                Err(TryLockError::Error(err)) => return Err(io_error(err)),
            }

            // INVARIANT: Locked file must still be the one linked at `path`,
            //   otherwise a releasing owner unlinked it under us.
            if !still_linked(&file, &path) {
                continue;
            }

            if let Some(pid) = recorded_pid(&mut file) {
                warn!("reclaiming engine lock left by pid {pid}");
            }

            file.set_len(0)
                .and_then(|()| file.rewind())
                .and_then(|()| file.write_all(std::process::id().to_string().as_bytes()))
                .and_then(|()| file.sync_all())
                .map_err(io_error)?;
            debug!("acquired engine lock {:?}", path.display());
            return Ok(Self { path, _file: file });
        }

        Err(LockError::Busy { pid: None })
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        // INVARIANT: Unlink while still locked, the flock goes with `_file`.
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to release engine lock {:?}: {err}", self.path.display());
        }
    }
}

fn recorded_pid(file: &mut File) -> Option<u32> {
    let mut data = String::new();
    file.rewind().ok()?;
    file.read_to_string(&mut data).ok()?;
    data.trim().parse().ok()
}

fn still_linked(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(linked)) => held.dev() == linked.dev() && held.ino() == linked.ino(),
        _ => false,
    }
}

/// Engine lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another apply or restore is in progress.
    #[error("another apply or restore is in progress{}", pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default())]
    Busy { pid: Option<u32> },

    /// Lock file cannot be managed.
    #[error("failed to manage engine lock {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
type Result<T, E = LockError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    #[sealed_test]
    fn exclusive_until_dropped() -> anyhow::Result<()> {
        let own = std::process::id();
        let lock = EngineLock::acquire("lock")?;
        assert_eq!(fs::read_to_string("lock")?, own.to_string());

        let second = EngineLock::acquire("lock");
        assert!(matches!(second, Err(LockError::Busy { pid: Some(pid) }) if pid == own));

        drop(lock);
        assert!(!Path::new("lock").exists());
        let _again = EngineLock::acquire("lock")?;

        Ok(())
    }

    #[sealed_test]
    fn reclaim_lock_of_dead_process() -> anyhow::Result<()> {
        fs::write("lock", "999999999")?;
        let _lock = EngineLock::acquire("lock")?;
        assert_eq!(fs::read_to_string("lock")?, std::process::id().to_string());
        Ok(())
    }

    #[sealed_test]
    fn reclaim_unreadable_lock() -> anyhow::Result<()> {
        fs::write("lock", "")?;
        let _lock = EngineLock::acquire("lock")?;
        assert!(matches!(EngineLock::acquire("lock"), Err(LockError::Busy { .. })));
        Ok(())
    }

    #[sealed_test]
    fn racing_reclaimers_never_share_lock() -> anyhow::Result<()> {
        for round in 0..200 {
            fs::write("lock", "999999999")?;
            let barrier = Arc::new(Barrier::new(2));
            let racers = (0..2)
                .map(|_| {
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        EngineLock::acquire("lock")
                    })
                })
                .collect::<Vec<_>>();

            let results = racers
                .into_iter()
                .map(|racer| racer.join().expect("racer panicked"))
                .collect::<Vec<_>>();
            let holders = results.iter().filter(|result| result.is_ok()).count();
            assert_eq!(holders, 1, "round {round}");
            assert!(results
                .iter()
                .any(|result| matches!(result, Err(LockError::Busy { .. }))));
        }

        Ok(())
    }
}
