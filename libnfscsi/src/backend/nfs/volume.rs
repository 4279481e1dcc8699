//! NFS volume identity, creation parameters, and volume context.
//!
//! A volume id is the string `<server>/<baseDir>/<subDir>`; holding the id
//! is enough to find the export and the directory again, so nothing else is
//! persisted.  None of the three fields may contain `/`.

use std::collections::HashMap;
use std::fmt;

use crate::error::CsiError;
use crate::types::VolumeId;

pub const PARAM_SERVER: &str = "server";
pub const PARAM_SHARE: &str = "share";
pub const PARAM_SUB_DIR: &str = "subDir";
pub const PARAM_MOUNT_OPTIONS: &str = "mountOptions";
pub const PARAM_MOUNT_PERMISSIONS: &str = "mountPermissions";

/// Orchestrator-supplied metadata keys (external-provisioner
/// `--extra-create-metadata`).
pub const PARAM_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
pub const PARAM_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
pub const PARAM_PV_NAME: &str = "csi.storage.k8s.io/pv/name";

const SEPARATOR: char = '/';

/// The decoded form of a volume id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NfsVolume {
    pub server: String,
    /// Export path without surrounding separators.
    pub base_dir: String,
    pub sub_dir: String,
}

impl NfsVolume {
    pub fn new(server: &str, base_dir: &str, sub_dir: &str) -> Self {
        Self {
            server: server.to_owned(),
            base_dir: trim_separators(base_dir),
            sub_dir: sub_dir.to_owned(),
        }
    }

    /// Encode into the opaque id handed to the orchestrator.
    pub fn encode(&self) -> VolumeId {
        VolumeId(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.server, self.base_dir, self.sub_dir
        ))
    }

    /// Decode an id produced by [`NfsVolume::encode`].
    ///
    /// The last two segments are the sub-directory and base directory; the
    /// remainder is the server.
    pub fn decode(id: &VolumeId) -> Result<Self, CsiError> {
        let malformed = || CsiError::MalformedVolumeId(id.0.clone());
        let normalized = id.0.replace('\\', "/");
        let (rest, sub_dir) = normalized.rsplit_once(SEPARATOR).ok_or_else(malformed)?;
        let (server, base_dir) = rest.rsplit_once(SEPARATOR).ok_or_else(malformed)?;
        if server.is_empty() || base_dir.is_empty() || sub_dir.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            server: server.to_owned(),
            base_dir: base_dir.to_owned(),
            sub_dir: sub_dir.to_owned(),
        })
    }

    /// Path of the volume on the server, `/baseDir/subDir`.
    pub fn share(&self) -> String {
        format!("/{}/{}", self.base_dir, self.sub_dir)
    }
}

impl fmt::Display for NfsVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode().0)
    }
}

fn trim_separators(s: &str) -> String {
    s.replace('\\', "/").trim_matches(SEPARATOR).to_owned()
}

fn validate_segment(key: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{key} must not be empty")));
    }
    if value.contains(SEPARATOR) || value.contains('\\') {
        return Err(CsiError::InvalidArgument(format!(
            "{key} {value:?} must not contain a path separator"
        )));
    }
    if value == "." || value == ".." {
        return Err(CsiError::InvalidArgument(format!(
            "{key} {value:?} is not a valid directory name"
        )));
    }
    Ok(())
}

/// Validated `CreateVolume` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    pub server: String,
    pub base_dir: String,
    /// Pattern for the sub-directory name, defaults to the volume name.
    pub sub_dir: Option<String>,
    pub mount_options: Option<String>,
    /// Mode of the created directory.
    pub mount_permissions: Option<u32>,
    pub pvc_name: Option<String>,
    pub pvc_namespace: Option<String>,
    pub pv_name: Option<String>,
}

impl CreateParams {
    /// Parse storage-class parameters against a strict allow-list.
    pub fn parse(parameters: &HashMap<String, String>) -> Result<Self, CsiError> {
        let mut server = None;
        let mut base_dir = None;
        let mut params = Self {
            server: String::new(),
            base_dir: String::new(),
            sub_dir: None,
            mount_options: None,
            mount_permissions: None,
            pvc_name: None,
            pvc_namespace: None,
            pv_name: None,
        };

        for (key, value) in parameters {
            match key.as_str() {
                PARAM_SERVER => server = Some(value.trim().to_owned()),
                PARAM_SHARE => base_dir = Some(trim_separators(value.trim())),
                PARAM_SUB_DIR => params.sub_dir = Some(value.clone()),
                PARAM_MOUNT_OPTIONS => params.mount_options = Some(value.clone()),
                PARAM_MOUNT_PERMISSIONS => {
                    let mode = u32::from_str_radix(value.trim(), 8).map_err(|_| {
                        CsiError::InvalidArgument(format!(
                            "{PARAM_MOUNT_PERMISSIONS} {value:?} is not an octal mode"
                        ))
                    })?;
                    params.mount_permissions = Some(mode);
                }
                PARAM_PVC_NAME => params.pvc_name = Some(value.clone()),
                PARAM_PVC_NAMESPACE => params.pvc_namespace = Some(value.clone()),
                PARAM_PV_NAME => params.pv_name = Some(value.clone()),
                other => {
                    return Err(CsiError::InvalidArgument(format!(
                        "unknown parameter {other:?}"
                    )));
                }
            }
        }

        params.server =
            server.ok_or_else(|| CsiError::invalid(format!("{PARAM_SERVER} is required")))?;
        params.base_dir =
            base_dir.ok_or_else(|| CsiError::invalid(format!("{PARAM_SHARE} is required")))?;
        validate_segment(PARAM_SERVER, &params.server)?;
        validate_segment(PARAM_SHARE, &params.base_dir)?;
        Ok(params)
    }

    /// Directory name for volume `name`, expanding the `subDir` pattern.
    pub fn sub_dir_for(&self, name: &str) -> Result<String, CsiError> {
        let sub_dir = match &self.sub_dir {
            None => name.to_owned(),
            Some(pattern) => {
                let mut dir = pattern.clone();
                for (placeholder, value) in [
                    ("${pvc.metadata.name}", &self.pvc_name),
                    ("${pvc.metadata.namespace}", &self.pvc_namespace),
                    ("${pv.metadata.name}", &self.pv_name),
                ] {
                    if !dir.contains(placeholder) {
                        continue;
                    }
                    let value = value.as_deref().ok_or_else(|| {
                        CsiError::InvalidArgument(format!(
                            "{PARAM_SUB_DIR} uses {placeholder} but the orchestrator did not supply it"
                        ))
                    })?;
                    dir = dir.replace(placeholder, value);
                }
                dir
            }
        };
        validate_segment(PARAM_SUB_DIR, &sub_dir)?;
        Ok(sub_dir)
    }

    /// Volume context returned from `CreateVolume`.
    pub fn volume_context(&self, volume: &NfsVolume) -> HashMap<String, String> {
        let mut ctx = HashMap::from([
            (PARAM_SERVER.to_owned(), volume.server.clone()),
            (PARAM_SHARE.to_owned(), volume.share()),
        ]);
        if let Some(options) = &self.mount_options {
            ctx.insert(PARAM_MOUNT_OPTIONS.to_owned(), options.clone());
        }
        ctx
    }
}

/// How a Node request reaches the volume, read from the volume context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMountSource {
    pub server: String,
    pub share: String,
    pub mount_options: Option<String>,
}

impl NodeMountSource {
    pub fn from_context(ctx: &HashMap<String, String>) -> Result<Self, CsiError> {
        let get = |key: &str| {
            ctx.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| CsiError::InvalidArgument(format!("volume context is missing {key}")))
        };
        let server = get(PARAM_SERVER)?;
        let share = get(PARAM_SHARE)?;
        Ok(Self {
            server,
            share: format!("/{}", trim_separators(&share)),
            mount_options: ctx.get(PARAM_MOUNT_OPTIONS).cloned(),
        })
    }

    /// `server:/path` as passed to `mount`.
    pub fn source(&self) -> String {
        format!("{}:{}", self.server, self.share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn encode_joins_with_separator() {
        let vol = NfsVolume::new("test-server", "/test-base-dir/", "test-csi");
        assert_eq!(vol.encode().0, "test-server/test-base-dir/test-csi");
        assert_eq!(vol.share(), "/test-base-dir/test-csi");
    }

    #[test]
    fn decode_recovers_fields() {
        for (server, base, sub) in [
            ("test-server", "test-base-dir", "test-csi"),
            ("10.0.0.7", "exports", "pvc-1234"),
            ("[fd00::1]", "data", "vol.with.dots"),
        ] {
            let vol = NfsVolume::new(server, base, sub);
            assert_eq!(NfsVolume::decode(&vol.encode()).unwrap(), vol);
        }
    }

    #[test]
    fn decode_rejects_short_ids() {
        for id in ["", "vol", "server/vol", "/base/vol", "server//vol", "server/base/"] {
            let err = NfsVolume::decode(&VolumeId::from(id)).unwrap_err();
            assert!(matches!(err, CsiError::MalformedVolumeId(_)), "{id}: {err}");
        }
    }

    #[test]
    fn decode_normalizes_backslashes() {
        let vol = NfsVolume::decode(&VolumeId::from("srv\\base\\vol")).unwrap();
        assert_eq!(vol, NfsVolume::new("srv", "base", "vol"));
    }

    #[test]
    fn parse_requires_server_and_share() {
        assert!(CreateParams::parse(&params(&[("server", "s")])).is_err());
        assert!(CreateParams::parse(&params(&[("share", "b")])).is_err());
        assert!(CreateParams::parse(&params(&[("server", ""), ("share", "b")])).is_err());
    }

    #[test]
    fn parse_rejects_unknown_keys() {
        let err = CreateParams::parse(&params(&[
            ("server", "s"),
            ("share", "b"),
            ("unknown-parameter", "foo"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("unknown-parameter"));
    }

    #[test]
    fn parse_rejects_nested_share() {
        let err =
            CreateParams::parse(&params(&[("server", "s"), ("share", "/exports/data")])).unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn parse_mount_permissions_octal() {
        let p = CreateParams::parse(&params(&[
            ("server", "s"),
            ("share", "/b/"),
            ("mountPermissions", "0777"),
        ]))
        .unwrap();
        assert_eq!(p.base_dir, "b");
        assert_eq!(p.mount_permissions, Some(0o777));

        assert!(
            CreateParams::parse(&params(&[
                ("server", "s"),
                ("share", "b"),
                ("mountPermissions", "rwx"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn sub_dir_pattern_expansion() {
        let p = CreateParams::parse(&params(&[
            ("server", "s"),
            ("share", "b"),
            ("subDir", "${pvc.metadata.namespace}-${pvc.metadata.name}"),
            (PARAM_PVC_NAMESPACE, "default"),
            (PARAM_PVC_NAME, "data"),
        ]))
        .unwrap();
        assert_eq!(p.sub_dir_for("pvc-1").unwrap(), "default-data");
    }

    #[test]
    fn sub_dir_pattern_missing_metadata() {
        let p = CreateParams::parse(&params(&[
            ("server", "s"),
            ("share", "b"),
            ("subDir", "${pv.metadata.name}"),
        ]))
        .unwrap();
        assert!(p.sub_dir_for("pvc-1").is_err());
    }

    #[test]
    fn sub_dir_rejects_separators() {
        let p = CreateParams::parse(&params(&[("server", "s"), ("share", "b")])).unwrap();
        assert!(p.sub_dir_for("a/b").is_err());
        assert!(p.sub_dir_for("..").is_err());
    }

    #[test]
    fn context_includes_mount_options_only_when_set() {
        let p = CreateParams::parse(&params(&[("server", "s"), ("share", "b")])).unwrap();
        let vol = NfsVolume::new("s", "b", "v");
        assert_eq!(
            p.volume_context(&vol),
            params(&[("server", "s"), ("share", "/b/v")])
        );

        let p = CreateParams::parse(&params(&[
            ("server", "s"),
            ("share", "b"),
            ("mountOptions", "nfsvers=4.1"),
        ]))
        .unwrap();
        assert_eq!(
            p.volume_context(&vol).get("mountOptions").map(String::as_str),
            Some("nfsvers=4.1")
        );
    }

    #[test]
    fn node_source_from_context() {
        let src =
            NodeMountSource::from_context(&params(&[("server", "s"), ("share", "b/v")])).unwrap();
        assert_eq!(src.source(), "s:/b/v");
        assert!(NodeMountSource::from_context(&params(&[("server", "s")])).is_err());
    }
}
