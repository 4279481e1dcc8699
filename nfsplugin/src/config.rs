//! Plugin configuration.
//!
//! Settings are read from an optional YAML file and then overridden by
//! command-line flags, each of which also has an `NFS_CSI_*` environment
//! variable.  Example file:
//!
//! ```yaml
//! listen_addr: 0.0.0.0:7443
//! tls_cert: /etc/nfs-csi/tls.crt
//! tls_key: /etc/nfs-csi/tls.key
//! request_timeout_secs: 120
//! log_format: json
//! driver:
//!   node_id: worker-1
//!   working_mount_dir: /var/lib/nfs-csi/working
//!   enable_staging: true
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use libnfscsi::NfsDriverConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Default)]
#[command(name = "nfsplugin", version, about = "CSI plugin serving NFS exports as volumes")]
pub struct Args {
    /// YAML configuration file.
    #[arg(short, long, env = "NFS_CSI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the QUIC endpoint listens on.
    #[arg(long, env = "NFS_CSI_LISTEN_ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Node identifier reported by NodeGetInfo.
    #[arg(long, env = "NFS_CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Driver name reported by GetPluginInfo.
    #[arg(long, env = "NFS_CSI_DRIVER_NAME")]
    pub driver_name: Option<String>,

    /// Directory for temporary export mounts.
    #[arg(long, env = "NFS_CSI_WORKING_MOUNT_DIR")]
    pub working_mount_dir: Option<PathBuf>,

    /// Stage volumes once per node and bind-mount them into targets.
    #[arg(long, env = "NFS_CSI_ENABLE_STAGING")]
    pub enable_staging: bool,

    /// PEM certificate chain for the QUIC endpoint.
    #[arg(long, env = "NFS_CSI_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the QUIC endpoint.
    #[arg(long, env = "NFS_CSI_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, value_enum, env = "NFS_CSI_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Default filter when `RUST_LOG` is unset.
    #[arg(long, env = "NFS_CSI_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub listen_addr: SocketAddr,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Deadline for a single request.
    pub request_timeout_secs: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub driver: NfsDriverConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 7443)),
            tls_cert: None,
            tls_key: None,
            request_timeout_secs: 120,
            log_level: "info".to_owned(),
            log_format: LogFormat::Text,
            driver: NfsDriverConfig::default(),
        }
    }
}

impl PluginConfig {
    /// Build the effective configuration from the file named in `args` (if
    /// any) and the flag overrides.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    fn apply(&mut self, args: &Args) {
        if let Some(addr) = args.listen_addr {
            self.listen_addr = addr;
        }
        if let Some(node_id) = &args.node_id {
            self.driver.node_id = node_id.clone();
        }
        if let Some(name) = &args.driver_name {
            self.driver.driver_name = name.clone();
        }
        if let Some(dir) = &args.working_mount_dir {
            self.driver.working_mount_dir = dir.clone();
        }
        if args.enable_staging {
            self.driver.enable_staging = true;
        }
        if let Some(cert) = &args.tls_cert {
            self.tls_cert = Some(cert.clone());
        }
        if let Some(key) = &args.tls_key {
            self.tls_key = Some(key.clone());
        }
        if let Some(format) = args.log_format {
            self.log_format = format;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.driver.node_id.is_empty() {
            bail!("node id is required (--node-id or driver.node_id)");
        }
        if self.driver.driver_name.is_empty() {
            bail!("driver name must not be empty");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        if !self.driver.working_mount_dir.is_absolute() {
            bail!(
                "working mount dir {} must be absolute",
                self.driver.working_mount_dir.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "listen_addr: 127.0.0.1:9000\nlog_format: json\ndriver:\n  node_id: from-file\n  enable_staging: false\n"
        )
        .unwrap();

        let args = Args::try_parse_from([
            "nfsplugin",
            "--config",
            file.path().to_str().unwrap(),
            "--node-id",
            "from-flag",
            "--enable-staging",
        ])
        .unwrap();
        let config = PluginConfig::load(&args).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.driver.node_id, "from-flag");
        assert!(config.driver.enable_staging);
        assert_eq!(config.driver.driver_name, "nfs.csi.k8s.io");
        assert_eq!(config.request_timeout_secs, 120);
    }

    #[test]
    fn node_id_required() {
        let args = Args::try_parse_from(["nfsplugin"]).unwrap();
        let err = PluginConfig::load(&args).unwrap_err();
        assert!(err.to_string().contains("node id"));
    }

    #[test]
    fn relative_working_dir_rejected() {
        let args = Args::try_parse_from([
            "nfsplugin",
            "--node-id",
            "n1",
            "--working-mount-dir",
            "relative/dir",
        ])
        .unwrap();
        assert!(PluginConfig::load(&args).is_err());
    }

    #[test]
    fn unreadable_file_has_context() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/nfs-csi.yaml")),
            ..Default::default()
        };
        let err = PluginConfig::load(&args).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nfs-csi.yaml"));
    }
}
