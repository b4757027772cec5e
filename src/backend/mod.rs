//! Hypervisor backend abstraction.
//!
//! The provisioning pipeline and the identity randomizer only talk to a
//! [`VmBackend`]. Drivers for concrete virtualization products implement it:
//! - VirtualBox (`VBoxManage`)

#[cfg(test)]
pub mod testing;
pub mod virtualbox;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::identity::FieldTree;

pub use virtualbox::VirtualBox;

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Oracle VirtualBox
    VirtualBox,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::VirtualBox => write!(f, "virtualbox"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "virtualbox" | "vbox" => Ok(BackendType::VirtualBox),
            _ => Err(format!(
                "Unknown backend '{}'. Only virtualbox is supported",
                s
            )),
        }
    }
}

/// Guest operating system profile hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    /// Windows XP
    Xp,
    /// Windows 7, 32-bit
    Win7,
    /// Windows 7, 64-bit
    Win7x64,
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsType::Xp => write!(f, "xp"),
            OsType::Win7 => write!(f, "win7"),
            OsType::Win7x64 => write!(f, "win7x64"),
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xp" => Ok(OsType::Xp),
            "win7" => Ok(OsType::Win7),
            "win7x64" => Ok(OsType::Win7x64),
            _ => Err(format!(
                "Unknown OS type '{}'. Valid options: xp, win7, win7x64",
                s
            )),
        }
    }
}

/// Capability set every hypervisor driver provides.
///
/// All operations are synchronous from the caller's point of view: they
/// return once the underlying tool has finished. Failures carry the tool's
/// diagnostic text and are fatal to the current provisioning run.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Name of the VM this handle drives
    fn name(&self) -> &str;

    /// Directory owning the VM's on-disk artifacts
    fn basedir(&self) -> &Path;

    /// Hardware identity keys this driver knows how to set
    fn identity_fields(&self) -> Result<FieldTree>;

    /// Create and register a powered-off VM
    async fn create_vm(&mut self) -> Result<String>;

    /// Unregister the VM and delete everything it owns
    async fn delete_vm(&mut self) -> Result<()>;

    /// Set memory size in MB
    async fn ramsize(&mut self, mb: u32) -> Result<()>;

    /// Set the guest OS profile hint
    async fn os_type(&mut self, os: OsType, service_pack: u8) -> Result<()>;

    /// Create the primary disk and attach it on a fresh controller
    async fn create_hd(&mut self, size_mb: u64) -> Result<()>;

    /// Insert an ISO into the optical drive slot
    async fn attach_iso(&mut self, path: &Path) -> Result<()>;

    /// Set one opaque configuration datum; returns diagnostic text if any
    async fn set_field(&mut self, key: &str, value: &str) -> Result<Option<String>>;

    /// Apply `mac`, or a freshly generated one; returns the applied address
    async fn modify_mac(&mut self, mac: Option<&str>) -> Result<String>;

    /// Attach a host-only adapter at interface `index`
    async fn hostonly(&mut self, index: u32) -> Result<()>;

    /// Toggle hardware-assisted virtualization
    async fn hwvirt(&mut self, enable: bool) -> Result<()>;

    /// Power on without waiting for boot
    async fn start_vm(&mut self) -> Result<String>;

    /// Take a live snapshot
    async fn snapshot(&mut self, label: &str, description: &str) -> Result<String>;

    /// Hard power-off
    async fn stop_vm(&mut self) -> Result<String>;

    /// Every configuration datum previously applied with `set_field`
    async fn list_settings(&mut self) -> Result<Vec<(String, String)>>;
}

/// Driver-specific options collected from configuration.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Explicit path to the hypervisor control tool
    pub tool_path: Option<PathBuf>,
}

/// Create a backend handle for the VM `name` under `basedir`
pub fn create_backend(
    backend: BackendType,
    name: &str,
    basedir: &Path,
    options: &BackendOptions,
) -> Result<Box<dyn VmBackend>> {
    match backend {
        BackendType::VirtualBox => Ok(Box::new(VirtualBox::new(
            name,
            basedir,
            options.tool_path.as_deref(),
        )?)),
    }
}
