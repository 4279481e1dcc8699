//! In-memory [`Mounter`] for tests.
//!
//! Nothing is mounted; the mount table lives in a `Vec` and directories on
//! disk are left untouched, so a "mounted" export is simply the local
//! directory the caller created.  Bind mounts resolve to the device of the
//! mount they were made from, like the kernel reports them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{BIND_OPTION, MountPoint, Mounter};
use crate::error::CsiError;

/// Operations recorded by [`FakeMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeAction {
    Mount { source: String, target: PathBuf },
    Unmount { target: PathBuf },
}

#[derive(Default)]
struct State {
    mounts: Vec<MountPoint>,
    log: Vec<FakeAction>,
    /// Errors returned by the next mount on a target.
    mount_errors: HashMap<PathBuf, CsiError>,
    /// Errors returned by the next `n` unmounts of a target.
    unmount_errors: HashMap<PathBuf, (CsiError, usize)>,
    /// How long a mount call takes to return after it took effect.
    mount_delay: Duration,
}

#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<State>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fake with pre-existing mount points.
    pub fn with_mounts(mounts: Vec<MountPoint>) -> Self {
        let fake = Self::default();
        fake.lock().mounts = mounts;
        fake
    }

    /// Make the next mount on `target` fail with `err`.
    pub fn fail_mount(&self, target: impl Into<PathBuf>, err: CsiError) {
        self.lock().mount_errors.insert(target.into(), err);
    }

    /// Make the next `times` unmounts of `target` fail with `err`.
    pub fn fail_unmount(&self, target: impl Into<PathBuf>, err: CsiError, times: usize) {
        self.lock().unmount_errors.insert(target.into(), (err, times));
    }

    /// Make every later mount return only after `delay`, the way a slow
    /// mount helper does.  The mount is in the table for the whole wait.
    pub fn set_mount_delay(&self, delay: Duration) {
        self.lock().mount_delay = delay;
    }

    /// Every mount and unmount performed so far, in order.
    pub fn actions(&self) -> Vec<FakeAction> {
        self.lock().log.clone()
    }

    /// Number of mounts performed so far.
    pub fn mount_calls(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|a| matches!(a, FakeAction::Mount { .. }))
            .count()
    }

    /// Snapshot of the current mount table.
    pub fn mounts(&self) -> Vec<MountPoint> {
        self.lock().mounts.clone()
    }

    fn record_mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<Duration, CsiError> {
        let mut state = self.lock();
        if let Some(err) = state.mount_errors.remove(target) {
            return Err(err);
        }

        let mut device = source.to_owned();
        let mut fs_type = fs_type.to_owned();
        if options.iter().any(|o| o == BIND_OPTION)
            && let Some(origin) = state
                .mounts
                .iter()
                .rev()
                .find(|mp| mp.path == Path::new(source))
        {
            device = origin.device.clone();
            fs_type = origin.fs_type.clone();
        }

        state.log.push(FakeAction::Mount {
            source: source.to_owned(),
            target: target.to_path_buf(),
        });
        state.mounts.push(MountPoint {
            device,
            path: target.to_path_buf(),
            fs_type,
            options: options.to_vec(),
        });
        Ok(state.mount_delay)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let delay = self.record_mount(source, target, fs_type, options)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        let mut state = self.lock();
        if let Some((err, remaining)) = state.unmount_errors.get_mut(target)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(err.clone());
        }

        let Some(idx) = state.mounts.iter().rposition(|mp| mp.path == target) else {
            return Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: "not mounted".into(),
            });
        };
        state.mounts.remove(idx);
        state.log.push(FakeAction::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<MountPoint>, CsiError> {
        Ok(self.lock().mounts.clone())
    }
}
