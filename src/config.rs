//! Layered settings: command line over settings file over built-in defaults.
//!
//! The settings file is TOML with keys matching the long command-line flags:
//!
//! ```toml
//! basedir = "~/vms"
//! iso = "~/isos/winxp.iso"
//! host_ip = "192.168.56.1"
//! ramsize = 2048
//! hwvirt = false
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendType, OsType};
use crate::error::ProvisionError;
use crate::validation;

pub const DEFAULT_RAMSIZE_MB: u32 = 1024;
pub const DEFAULT_HDSIZE_MB: u64 = 256 * 1024;
pub const DEFAULT_RESOLUTION: &str = "1024x768";
pub const DEFAULT_HOST_IP: &str = "192.168.56.1";
pub const DEFAULT_GUEST_IP: &str = "192.168.56.101";
pub const DEFAULT_GUEST_GATEWAY: &str = "192.168.0.1";
pub const DEFAULT_ANSWER_FILE: &str = "winnt.sif";
pub const DEFAULT_BOOTSTRAP_DIR: &str = "bootstrap";
pub const DEFAULT_BUILD_SCRIPT: &str = "./utils/buildiso.sh";
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_SETTLE_SECS: u64 = 10;
pub const DEFAULT_SNAPSHOT_LABEL: &str = "vmcloak";
pub const DEFAULT_SERVICE_PACK: u8 = 3;

/// Settings from one source; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialSettings {
    #[serde(alias = "vm")]
    pub backend: Option<String>,
    pub basedir: Option<String>,
    pub iso: Option<String>,
    pub ramsize: Option<u32>,
    pub hdsize: Option<u64>,
    pub resolution: Option<String>,
    #[serde(alias = "host-ip")]
    pub host_ip: Option<String>,
    #[serde(alias = "guest-ip")]
    pub guest_ip: Option<String>,
    #[serde(alias = "guest-ip-gateway")]
    pub guest_ip_gateway: Option<String>,
    pub hwvirt: Option<bool>,
    #[serde(alias = "serial-key")]
    pub serial_key: Option<String>,
    pub os: Option<String>,
    #[serde(alias = "service-pack")]
    pub service_pack: Option<u8>,
    pub vboxmanage: Option<String>,
    #[serde(alias = "answer-file")]
    pub answer_file: Option<String>,
    #[serde(alias = "bootstrap-dir")]
    pub bootstrap_dir: Option<String>,
    pub buildiso: Option<String>,
    #[serde(alias = "install-timeout-secs", alias = "install_timeout")]
    pub install_timeout_secs: Option<u64>,
    #[serde(alias = "settle-secs")]
    pub settle_secs: Option<u64>,
    #[serde(alias = "identity-pool")]
    pub identity_pool: Option<String>,
    #[serde(alias = "snapshot-label")]
    pub snapshot_label: Option<String>,
}

impl PartialSettings {
    /// Load a settings file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_str(&content)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    /// Parse settings from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            anyhow::Error::from(ProvisionError::config(format!(
                "Failed to parse settings: {}",
                e
            )))
        })
    }

    /// Fill every unset key from `lower`.
    pub fn or(self, lower: PartialSettings) -> PartialSettings {
        PartialSettings {
            backend: self.backend.or(lower.backend),
            basedir: self.basedir.or(lower.basedir),
            iso: self.iso.or(lower.iso),
            ramsize: self.ramsize.or(lower.ramsize),
            hdsize: self.hdsize.or(lower.hdsize),
            resolution: self.resolution.or(lower.resolution),
            host_ip: self.host_ip.or(lower.host_ip),
            guest_ip: self.guest_ip.or(lower.guest_ip),
            guest_ip_gateway: self.guest_ip_gateway.or(lower.guest_ip_gateway),
            hwvirt: self.hwvirt.or(lower.hwvirt),
            serial_key: self.serial_key.or(lower.serial_key),
            os: self.os.or(lower.os),
            service_pack: self.service_pack.or(lower.service_pack),
            vboxmanage: self.vboxmanage.or(lower.vboxmanage),
            answer_file: self.answer_file.or(lower.answer_file),
            bootstrap_dir: self.bootstrap_dir.or(lower.bootstrap_dir),
            buildiso: self.buildiso.or(lower.buildiso),
            install_timeout_secs: self.install_timeout_secs.or(lower.install_timeout_secs),
            settle_secs: self.settle_secs.or(lower.settle_secs),
            identity_pool: self.identity_pool.or(lower.identity_pool),
            snapshot_label: self.snapshot_label.or(lower.snapshot_label),
        }
    }
}

/// Fully resolved and validated settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub vm_name: String,
    pub backend: BackendType,
    pub basedir: PathBuf,
    pub iso: Option<PathBuf>,
    pub ramsize: u32,
    pub hdsize: u64,
    pub resolution: String,
    pub host_ip: IpAddr,
    pub guest_ip: IpAddr,
    pub guest_ip_gateway: IpAddr,
    pub hwvirt: Option<bool>,
    pub serial_key: Option<String>,
    pub os: OsType,
    pub service_pack: u8,
    pub vboxmanage: Option<PathBuf>,
    pub answer_file: PathBuf,
    pub bootstrap_dir: PathBuf,
    pub buildiso: PathBuf,
    /// `None` waits for the guest indefinitely.
    pub install_timeout: Option<Duration>,
    pub settle: Duration,
    pub identity_pool: Option<PathBuf>,
    pub snapshot_label: String,
}

/// Expand a leading `~` against the home directory.
pub fn expand_path(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix('~')
        && (rest.is_empty() || rest.starts_with('/'))
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest.trim_start_matches('/'));
    }
    PathBuf::from(value)
}

impl Settings {
    /// Merge command-line and file settings over the defaults and validate.
    pub fn resolve(
        vm_name: &str,
        cli: PartialSettings,
        file: Option<PartialSettings>,
    ) -> Result<Self> {
        validation::validate_vm_name(vm_name)?;

        let merged = match file {
            Some(file) => cli.or(file),
            None => cli,
        };

        let basedir = match merged.basedir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => expand_path(dir),
            _ => bail!(ProvisionError::config(
                "Please provide the base directory for the VM (--basedir)"
            )),
        };

        let backend = match merged.backend.as_deref() {
            Some(b) => b.parse::<BackendType>().map_err(ProvisionError::Config)?,
            None => BackendType::VirtualBox,
        };

        let os = match merged.os.as_deref() {
            Some(os) => os.parse::<OsType>().map_err(ProvisionError::Config)?,
            None => OsType::Xp,
        };

        let ramsize = merged.ramsize.unwrap_or(DEFAULT_RAMSIZE_MB);
        if ramsize == 0 {
            bail!(ProvisionError::config("RAM size must be a positive number of MB"));
        }
        let hdsize = merged.hdsize.unwrap_or(DEFAULT_HDSIZE_MB);
        if hdsize == 0 {
            bail!(ProvisionError::config("Disk size must be a positive number of MB"));
        }

        let resolution = merged
            .resolution
            .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string());
        validation::parse_resolution(&resolution)?;

        let host_ip = validation::parse_ip(
            "--host-ip",
            merged.host_ip.as_deref().unwrap_or(DEFAULT_HOST_IP),
        )?;
        let guest_ip = validation::parse_ip(
            "--guest-ip",
            merged.guest_ip.as_deref().unwrap_or(DEFAULT_GUEST_IP),
        )?;
        let guest_ip_gateway = validation::parse_ip(
            "--guest-ip-gateway",
            merged
                .guest_ip_gateway
                .as_deref()
                .unwrap_or(DEFAULT_GUEST_GATEWAY),
        )?;

        let install_timeout = match merged
            .install_timeout_secs
            .unwrap_or(DEFAULT_INSTALL_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Settings {
            vm_name: vm_name.to_string(),
            backend,
            basedir,
            iso: merged.iso.as_deref().map(expand_path),
            ramsize,
            hdsize,
            resolution,
            host_ip,
            guest_ip,
            guest_ip_gateway,
            hwvirt: merged.hwvirt,
            serial_key: merged.serial_key,
            os,
            service_pack: merged.service_pack.unwrap_or(DEFAULT_SERVICE_PACK),
            vboxmanage: merged.vboxmanage.as_deref().map(expand_path),
            answer_file: expand_path(merged.answer_file.as_deref().unwrap_or(DEFAULT_ANSWER_FILE)),
            bootstrap_dir: expand_path(
                merged
                    .bootstrap_dir
                    .as_deref()
                    .unwrap_or(DEFAULT_BOOTSTRAP_DIR),
            ),
            buildiso: expand_path(merged.buildiso.as_deref().unwrap_or(DEFAULT_BUILD_SCRIPT)),
            install_timeout,
            settle: Duration::from_secs(merged.settle_secs.unwrap_or(DEFAULT_SETTLE_SECS)),
            identity_pool: merged.identity_pool.as_deref().map(expand_path),
            snapshot_label: merged
                .snapshot_label
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_LABEL.to_string()),
        })
    }

    /// The installer ISO, which provisioning cannot do without.
    pub fn require_iso(&self) -> Result<&Path> {
        match self.iso.as_deref() {
            Some(iso) => Ok(iso),
            None => bail!(ProvisionError::config(
                "Please specify a Windows installer ISO image (--iso)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with_basedir(dir: &str) -> PartialSettings {
        PartialSettings {
            basedir: Some(dir.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let s = Settings::resolve("cuckoo1", cli_with_basedir("/vms"), None).unwrap();
        assert_eq!(s.backend, BackendType::VirtualBox);
        assert_eq!(s.ramsize, 1024);
        assert_eq!(s.hdsize, 262144);
        assert_eq!(s.resolution, "1024x768");
        assert_eq!(s.host_ip.to_string(), "192.168.56.1");
        assert_eq!(s.guest_ip.to_string(), "192.168.56.101");
        assert_eq!(s.guest_ip_gateway.to_string(), "192.168.0.1");
        assert_eq!(s.hwvirt, None);
        assert_eq!(s.os, OsType::Xp);
        assert_eq!(s.service_pack, 3);
        assert_eq!(s.install_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(s.settle, Duration::from_secs(10));
        assert_eq!(s.snapshot_label, "vmcloak");
        assert_eq!(s.buildiso, PathBuf::from("./utils/buildiso.sh"));
        assert!(s.iso.is_none());
        assert!(s.require_iso().is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = PartialSettings::from_str(
            r#"
            basedir = "/from-file"
            ramsize = 2048
            resolution = "800x600"
            host-ip = "10.0.0.1"
            hwvirt = true
            "#,
        )
        .unwrap();
        let cli = PartialSettings {
            ramsize: Some(512),
            hwvirt: Some(false),
            ..Default::default()
        };

        let s = Settings::resolve("vm1", cli, Some(file)).unwrap();
        assert_eq!(s.basedir, PathBuf::from("/from-file"));
        assert_eq!(s.ramsize, 512);
        assert_eq!(s.resolution, "800x600");
        assert_eq!(s.host_ip.to_string(), "10.0.0.1");
        assert_eq!(s.hwvirt, Some(false));
    }

    #[test]
    fn test_missing_basedir_is_config_error() {
        let err = Settings::resolve("vm1", PartialSettings::default(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_ip = PartialSettings {
            host_ip: Some("300.1.1.1".to_string()),
            ..cli_with_basedir("/vms")
        };
        assert!(Settings::resolve("vm1", bad_ip, None).is_err());

        let bad_res = PartialSettings {
            resolution: Some("big".to_string()),
            ..cli_with_basedir("/vms")
        };
        assert!(Settings::resolve("vm1", bad_res, None).is_err());

        let bad_os = PartialSettings {
            os: Some("beos".to_string()),
            ..cli_with_basedir("/vms")
        };
        assert!(Settings::resolve("vm1", bad_os, None).is_err());

        let zero_ram = PartialSettings {
            ramsize: Some(0),
            ..cli_with_basedir("/vms")
        };
        assert!(Settings::resolve("vm1", zero_ram, None).is_err());

        assert!(Settings::resolve("bad name", cli_with_basedir("/vms"), None).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(PartialSettings::from_str("ramsiz = 10\n").is_err());
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let cli = PartialSettings {
            install_timeout_secs: Some(0),
            ..cli_with_basedir("/vms")
        };
        let s = Settings::resolve("vm1", cli, None).unwrap();
        assert_eq!(s.install_timeout, None);
    }

    #[test]
    fn test_tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/vms"), home.join("vms"));
            assert_eq!(expand_path("~"), home);
        }
        assert_eq!(expand_path("/abs/~x"), PathBuf::from("/abs/~x"));
        assert_eq!(expand_path("~other/x"), PathBuf::from("~other/x"));
    }
}
