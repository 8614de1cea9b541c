// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Cross-process advisory file locks.

Coarse operations (a channel update) take an exclusive lock named after the
group and channel so concurrent client invocations do not race on the same
installation directory. Locks are advisory, per-name lock files under a
dedicated directory, acquired with a bounded poll.
*/

use {
    crate::error::{ClientError, Result},
    std::{
        fs::{File, OpenOptions},
        path::PathBuf,
        time::{Duration, Instant},
    },
};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock flavor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory file locker rooted at a locks directory.
pub struct FileLocker {
    locks_dir: PathBuf,
}

impl FileLocker {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Result<Self> {
        let locks_dir = locks_dir.into();
        std::fs::create_dir_all(&locks_dir)?;

        Ok(Self { locks_dir })
    }

    /// Run `f` while holding the named lock.
    ///
    /// Acquisition polls until `timeout` elapses, then fails with
    /// [ClientError::LockTimeout]. The lock is released when `f` returns,
    /// panics included.
    pub fn with_lock<T>(
        &self,
        name: &str,
        mode: LockMode,
        timeout: Duration,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.locks_dir.join(name))?;

        let deadline = Instant::now() + timeout;

        loop {
            let attempt = match mode {
                LockMode::Shared => file.try_lock_shared(),
                LockMode::Exclusive => file.try_lock(),
            };

            match attempt {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(ACQUIRE_POLL_INTERVAL)
                }
                Err(_) => {
                    return Err(ClientError::LockTimeout {
                        name: name.to_string(),
                        seconds: timeout.as_secs(),
                    })
                }
            }
        }

        let _guard = UnlockOnDrop(&file);

        f()
    }
}

struct UnlockOnDrop<'a>(&'a File);

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}
