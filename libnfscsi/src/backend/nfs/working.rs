//! Scratch mounts of whole NFS exports.
//!
//! The controller creates and removes volume directories by mounting the
//! export under a private working directory.  Concurrent operations on the
//! same export share one mount; it is torn down when the last user
//! releases it.
//!
//! ```text
//! <working_mount_dir>/
//!   <uuid-v5 of server:/baseDir>/   # export mounted here while in use
//!     <subDir>/                     # one per volume
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

use super::volume::NfsVolume;
use crate::error::CsiError;
use crate::mount::{Mounter, split_options};

/// Filesystem type used for export mounts.
pub const NFS_FS_TYPE: &str = "nfs";

/// Identity of an export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Export {
    pub server: String,
    pub base_dir: String,
}

impl Export {
    pub fn new(server: impl Into<String>, base_dir: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            base_dir: base_dir.into(),
        }
    }

    pub fn source(&self) -> String {
        format!("{}:/{}", self.server, self.base_dir)
    }
}

impl From<&NfsVolume> for Export {
    fn from(vol: &NfsVolume) -> Self {
        Self::new(vol.server.clone(), vol.base_dir.clone())
    }
}

#[derive(Debug, Default)]
struct ExportState {
    refs: usize,
}

/// An acquired working mount.  Hand it back with [`WorkingMounts::release`];
/// a mount dropped without that is released on a background task.
#[must_use = "working mounts must be released"]
pub struct WorkingMount {
    registry: Arc<Registry>,
    export: Export,
    path: PathBuf,
    released: bool,
}

impl WorkingMount {
    /// Where the export is mounted.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for WorkingMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingMount")
            .field("export", &self.export)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for WorkingMount {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let export = self.export.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(export = %export.source(), "working mount abandoned, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = registry.drop_ref(&export).await {
                        warn!(export = %export.source(), error = %e, "background release failed");
                    }
                });
            }
            Err(_) => {
                warn!(export = %self.export.source(), "no runtime left to release working mount");
            }
        }
    }
}

/// Reference-counted registry of working mounts.
///
/// Mounting and unmounting run on their own tasks, so a caller that stops
/// waiting (a request past its deadline) never leaves the count out of step
/// with the mount table.
pub struct WorkingMounts {
    inner: Arc<Registry>,
}

struct Registry {
    root: PathBuf,
    mounter: Arc<dyn Mounter>,
    exports: DashMap<Export, Arc<Mutex<ExportState>>>,
    retry_delay: Duration,
}

impl WorkingMounts {
    /// * `root` - directory under which exports are mounted
    /// * `mounter` - mount backend
    /// * `retry_delay` - pause before retrying a failed unmount
    pub fn new(root: impl Into<PathBuf>, mounter: Arc<dyn Mounter>, retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Registry {
                root: root.into(),
                mounter,
                exports: DashMap::new(),
                retry_delay,
            }),
        }
    }

    /// Deterministic mount path of `export`.
    pub fn path_for(&self, export: &Export) -> PathBuf {
        self.inner.path_for(export)
    }

    /// Number of operations currently using `export`.
    pub async fn refs(&self, export: &Export) -> usize {
        let state = self.inner.exports.get(export).map(|s| Arc::clone(s.value()));
        match state {
            Some(state) => state.lock().await.refs,
            None => 0,
        }
    }

    /// Mount `export` unless it is mounted already, and take a reference to
    /// it.
    #[instrument(skip(self), fields(export = %export.source()))]
    pub async fn acquire(
        &self,
        export: &Export,
        mount_options: Option<&str>,
    ) -> Result<WorkingMount, CsiError> {
        let registry = Arc::clone(&self.inner);
        let export = export.clone();
        let options = mount_options.map(split_options).unwrap_or_default();
        // If this future is dropped the task still finishes, and the
        // unclaimed WorkingMount it returns releases itself.
        tokio::spawn(
            async move {
                let path = registry.take_ref(&export, &options).await?;
                Ok::<_, CsiError>(WorkingMount {
                    registry,
                    export,
                    path,
                    released: false,
                })
            }
            .in_current_span(),
        )
        .await
        .map_err(CsiError::internal)?
    }

    /// Drop a reference; the last one unmounts the export and removes the
    /// working directory.
    ///
    /// An unmount failure is retried once.  If it persists the reference is
    /// still dropped and [`CsiError::CleanupFailed`] is returned.  The mount
    /// stays in place; the next acquire reuses it and the release after
    /// that tries the teardown again.
    #[instrument(skip_all, fields(export = %mount.export.source()))]
    pub async fn release(&self, mut mount: WorkingMount) -> Result<(), CsiError> {
        mount.released = true;
        let registry = Arc::clone(&self.inner);
        let export = mount.export.clone();
        drop(mount);
        tokio::spawn(async move { registry.drop_ref(&export).await }.in_current_span())
            .await
            .map_err(CsiError::internal)?
    }
}

impl Registry {
    fn path_for(&self, export: &Export) -> PathBuf {
        let name = Uuid::new_v5(&Uuid::NAMESPACE_URL, export.source().as_bytes());
        self.root.join(name.to_string())
    }

    fn state(&self, export: &Export) -> Arc<Mutex<ExportState>> {
        Arc::clone(self.exports.entry(export.clone()).or_default().value())
    }

    async fn take_ref(&self, export: &Export, options: &[String]) -> Result<PathBuf, CsiError> {
        let entry = self.state(export);
        let mut state = entry.lock().await;
        let path = self.path_for(export);

        if state.refs == 0 {
            if self.mounter.is_mount_point(&path).await? {
                warn!(path = %path.display(), "reusing working mount left by an earlier teardown");
            } else {
                self.mount(export, &path, options).await?;
            }
        }
        state.refs += 1;
        debug!(refs = state.refs, "working mount acquired");
        Ok(path)
    }

    async fn mount(&self, export: &Export, path: &Path, options: &[String]) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: path.display().to_string(),
                reason: format!("create working dir: {e}"),
            })?;
        if let Err(e) = self
            .mounter
            .mount(&export.source(), path, NFS_FS_TYPE, options)
            .await
        {
            remove_empty_dir(path).await;
            return Err(e);
        }
        info!(path = %path.display(), "working mount created");
        Ok(())
    }

    async fn drop_ref(&self, export: &Export) -> Result<(), CsiError> {
        let entry = self.state(export);
        let mut state = entry.lock().await;
        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 {
            debug!(refs = state.refs, "working mount still in use");
            return Ok(());
        }

        let result = self.teardown(&self.path_for(export)).await;
        drop(state);
        drop(entry);
        // Forget the export unless someone is already waiting to mount it.
        self.exports
            .remove_if(export, |_, s| Arc::strong_count(s) == 1);
        result
    }

    async fn teardown(&self, path: &Path) -> Result<(), CsiError> {
        if let Err(first) = self.mounter.unmount(path).await {
            warn!(path = %path.display(), error = %first, "working unmount failed, retrying");
            tokio::time::sleep(self.retry_delay).await;
            if let Err(e) = self.mounter.unmount(path).await {
                return Err(CsiError::CleanupFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        remove_empty_dir(path).await;
        info!(path = %path.display(), "working mount removed");
        Ok(())
    }
}

/// Remove `path` if it is an empty directory.  Never recursive: a non-empty
/// directory here means the export is still mounted or was never unmounted
/// cleanly, and its contents belong to the server.
async fn remove_empty_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "leaving working directory in place");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::FakeMounter;

    fn manager(dir: &Path) -> (Arc<FakeMounter>, WorkingMounts) {
        let fake = Arc::new(FakeMounter::new());
        let mounts = WorkingMounts::new(dir, fake.clone(), Duration::from_millis(1));
        (fake, mounts)
    }

    #[tokio::test]
    async fn shared_by_concurrent_users() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("test-server", "test-base-dir");

        let a = mounts.acquire(&export, None).await.unwrap();
        let b = mounts.acquire(&export, None).await.unwrap();
        assert_eq!(a.path(), b.path());
        assert_eq!(fake.mount_calls(), 1);
        assert_eq!(mounts.refs(&export).await, 2);

        let path = a.path().to_path_buf();
        mounts.release(a).await.unwrap();
        assert!(fake.is_mount_point(&path).await.unwrap());

        mounts.release(b).await.unwrap();
        assert!(!fake.is_mount_point(&path).await.unwrap());
        assert!(!path.exists());
        assert_eq!(mounts.refs(&export).await, 0);
    }

    #[test]
    fn export_of_volume() {
        let export = Export::from(&NfsVolume::new("test-server", "/test-base-dir/", "test-csi"));
        assert_eq!(export.source(), "test-server:/test-base-dir");
    }

    #[tokio::test]
    async fn exports_get_distinct_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());

        let a = mounts.acquire(&Export::new("s1", "data"), None).await.unwrap();
        let b = mounts.acquire(&Export::new("s2", "data"), None).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert_eq!(fake.mount_calls(), 2);

        let mounted: Vec<_> = fake.mounts().into_iter().map(|m| m.device).collect();
        assert!(mounted.contains(&"s1:/data".to_owned()));
        assert!(mounted.contains(&"s2:/data".to_owned()));

        mounts.release(a).await.unwrap();
        mounts.release(b).await.unwrap();
    }

    #[tokio::test]
    async fn mount_failure_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("down", "data");
        let path = mounts.path_for(&export);
        fake.fail_mount(&path, CsiError::Unavailable("no route to host".into()));

        let err = mounts.acquire(&export, None).await.unwrap_err();
        assert!(matches!(err, CsiError::Unavailable(_)));
        assert!(!path.exists());
        assert_eq!(mounts.refs(&export).await, 0);

        // Next attempt mounts again.
        let m = mounts.acquire(&export, None).await.unwrap();
        mounts.release(m).await.unwrap();
    }

    #[tokio::test]
    async fn unmount_retried_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("s", "data");

        let m = mounts.acquire(&export, None).await.unwrap();
        fake.fail_unmount(m.path(), CsiError::internal("device busy"), 1);
        mounts.release(m).await.unwrap();
        assert!(fake.mounts().is_empty());
    }

    #[tokio::test]
    async fn persistent_unmount_failure_is_cleanup_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("s", "data");

        let m = mounts.acquire(&export, None).await.unwrap();
        let path = m.path().to_path_buf();
        fake.fail_unmount(&path, CsiError::internal("device busy"), 2);
        let err = mounts.release(m).await.unwrap_err();
        assert!(matches!(err, CsiError::CleanupFailed { .. }));
        assert_eq!(mounts.refs(&export).await, 0);
    }

    /// Wait for background releases to finish: `export` unreferenced and
    /// nothing left in the mount table.
    async fn wait_released(fake: &FakeMounter, mounts: &WorkingMounts, export: &Export) {
        for _ in 0..200 {
            if fake.mounts().is_empty() && mounts.refs(export).await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("working mount of {} never released", export.source());
    }

    #[tokio::test]
    async fn dropped_mount_is_released() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("s", "data");

        let m = mounts.acquire(&export, None).await.unwrap();
        let path = m.path().to_path_buf();
        drop(m);
        wait_released(&fake, &mounts, &export).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn abandoned_acquire_is_released() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("s", "data");
        fake.set_mount_delay(Duration::from_millis(200));

        let res = tokio::time::timeout(Duration::from_millis(50), mounts.acquire(&export, None)).await;
        assert!(res.is_err());
        assert_eq!(fake.mount_calls(), 1);
        wait_released(&fake, &mounts, &export).await;

        // The next user mounts once and cleans up after itself.
        fake.set_mount_delay(Duration::ZERO);
        let m = mounts.acquire(&export, None).await.unwrap();
        assert_eq!(fake.mounts().len(), 1);
        mounts.release(m).await.unwrap();
        assert!(fake.mounts().is_empty());
        assert_eq!(fake.mount_calls(), 2);
    }

    #[tokio::test]
    async fn leftover_mount_is_reused_then_torn_down() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("s", "data");

        let m = mounts.acquire(&export, None).await.unwrap();
        fake.fail_unmount(m.path(), CsiError::internal("device busy"), 2);
        assert!(mounts.release(m).await.is_err());
        assert_eq!(fake.mounts().len(), 1);

        // Reused rather than mounted on top, and the teardown is retried.
        let m = mounts.acquire(&export, None).await.unwrap();
        assert_eq!(fake.mounts().len(), 1);
        assert_eq!(fake.mount_calls(), 1);
        mounts.release(m).await.unwrap();
        assert!(fake.mounts().is_empty());

        let m = mounts.acquire(&export, None).await.unwrap();
        assert_eq!(fake.mount_calls(), 2);
        mounts.release(m).await.unwrap();
    }

    #[tokio::test]
    async fn mount_options_are_split() {
        let tmp = tempfile::tempdir().unwrap();
        let (fake, mounts) = manager(tmp.path());
        let export = Export::new("s", "data");

        let m = mounts
            .acquire(&export, Some("nfsvers=4.1,hard"))
            .await
            .unwrap();
        assert_eq!(fake.mounts()[0].options, vec!["nfsvers=4.1", "hard"]);
        mounts.release(m).await.unwrap();
    }
}
