//! Mount abstraction consumed by the Controller and Node services.
//!
//! The services never call mount syscalls directly; they go through the
//! [`Mounter`] trait so that tests can substitute [`FakeMounter`] for the
//! Linux implementation.  Bind mounts are requested the usual way, with an
//! empty filesystem type and a `bind` option.

pub mod fake;
pub mod linux;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CsiError;

pub use fake::FakeMounter;
pub use linux::LinuxMounter;

/// Mount option that turns a mount request into a bind mount.
pub const BIND_OPTION: &str = "bind";
/// Mount option for read-only mounts.
pub const READ_ONLY_OPTION: &str = "ro";

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Mounted device, `server:/export` for NFS.
    pub device: String,
    /// Where the device is mounted.
    pub path: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

impl MountPoint {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == READ_ONLY_OPTION)
    }
}

/// OS mount capability.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `source` on `target`.  `target` must already exist.
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Unmount whatever is mounted on `target`.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;

    /// Current mount table.
    async fn list(&self) -> Result<Vec<MountPoint>, CsiError>;

    /// Topmost mount on `path`, if any.
    async fn mount_point(&self, path: &Path) -> Result<Option<MountPoint>, CsiError> {
        let path = normalize(path);
        Ok(self
            .list()
            .await?
            .into_iter()
            .rev()
            .find(|mp| normalize(&mp.path) == path))
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError> {
        Ok(self.mount_point(path).await?.is_some())
    }
}

/// Strip trailing separators so `/a/b/` and `/a/b` compare equal.
fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Split a comma separated option string, dropping empty items.
pub fn split_options(options: &str) -> Vec<String> {
    options
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse the contents of `/proc/self/mounts`.
///
/// Fields use octal escapes (`\040` for space) which are decoded here.
pub fn parse_mount_table(contents: &str) -> Vec<MountPoint> {
    contents
        .lines()
        .filter_map(|line| {
            // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
            let mut fields = line.split_whitespace();
            let device = unescape(fields.next()?);
            let path = PathBuf::from(unescape(fields.next()?));
            let fs_type = fields.next()?.to_owned();
            let options = fields.next().map(split_options).unwrap_or_default();
            Some(MountPoint {
                device,
                path,
                fs_type,
                options,
            })
        })
        .collect()
}

fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        });
        if let Some(digits) = escape {
            let code = digits
                .iter()
                .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            out.push(code as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
nfs-server:/exports /var/lib/kubelet/pods/p1/volumes/my\\040vol nfs4 rw,relatime,vers=4.1 0 0
nfs-server:/exports /mnt/ro nfs4 ro,relatime 0 0
";

    #[test]
    fn parses_table_and_unescapes() {
        let mounts = parse_mount_table(TABLE);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].device, "nfs-server:/exports");
        assert_eq!(
            mounts[1].path,
            PathBuf::from("/var/lib/kubelet/pods/p1/volumes/my vol")
        );
        assert_eq!(mounts[1].fs_type, "nfs4");
        assert!(!mounts[1].is_read_only());
        assert!(mounts[2].is_read_only());
    }

    #[test]
    fn split_options_skips_empty() {
        assert_eq!(
            split_options("nfsvers=4.1, hard,,ro"),
            vec!["nfsvers=4.1", "hard", "ro"]
        );
        assert!(split_options("").is_empty());
    }

    #[test]
    fn normalize_ignores_trailing_slash() {
        assert_eq!(normalize(Path::new("/a/b/")), normalize(Path::new("/a/b")));
    }
}
