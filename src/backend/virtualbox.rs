//! VirtualBox backend implementing the VmBackend trait via `VBoxManage`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::{OsType, VmBackend};
use crate::error::ProvisionError;
use crate::identity::random::{is_valid_mac, random_mac};
use crate::identity::{Category, FieldLeaf, FieldTree};

const IDE_CONTROLLER: &str = "IDE Controller";

const PCBIOS_CONFIG: &str = "VBoxInternal/Devices/pcbios/0/Config";
const IDE_PRIMARY_MASTER: &str = "VBoxInternal/Devices/piix3ide/0/Config/PrimaryMaster";

/// Locate `VBoxManage`. An explicit path must exist; otherwise the
/// `VBOXMANAGE` env var and common install locations are tried before
/// falling back to a bare `VBoxManage` resolved through PATH.
pub fn find_vboxmanage(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!(ProvisionError::config(format!(
                "The configured VBoxManage path does not exist: {}",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("VBOXMANAGE") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    let locations = [
        "/usr/bin/VBoxManage",
        "/usr/local/bin/VBoxManage",
        "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
        r"C:\Program Files\Oracle\VirtualBox\VBoxManage.exe",
    ];

    for loc in locations {
        let path = PathBuf::from(loc);
        if path.is_file() {
            return Ok(path);
        }
    }

    Ok(PathBuf::from("VBoxManage"))
}

fn os_type_id(os: OsType) -> &'static str {
    match os {
        OsType::Xp => "WindowsXP",
        OsType::Win7 => "Windows7",
        OsType::Win7x64 => "Windows7_64",
    }
}

fn hostonly_adapter_name() -> &'static str {
    if cfg!(unix) {
        "vboxnet0"
    } else {
        "VirtualBox Host-Only Ethernet Adapter"
    }
}

/// DMI and IDE identity keys understood by VirtualBox's extradata store.
pub fn virtualbox_fields() -> Result<FieldTree> {
    use Category::*;

    FieldTree::new()
        .with_group(
            PCBIOS_CONFIG,
            vec![
                ("DmiBIOSVendor", FieldLeaf::pool(Bios, "vendor")),
                ("DmiBIOSVersion", FieldLeaf::pool(Bios, "version")),
                ("DmiBIOSReleaseDate", FieldLeaf::pool(Bios, "release_date")),
                ("DmiSystemVendor", FieldLeaf::pool(System, "vendor")),
                ("DmiSystemProduct", FieldLeaf::pool(System, "product")),
                ("DmiSystemVersion", FieldLeaf::pool(System, "version")),
                ("DmiSystemSerial", FieldLeaf::pool(System, "serial")),
                ("DmiSystemSKU", FieldLeaf::pool(System, "sku")),
                ("DmiSystemFamily", FieldLeaf::pool(System, "family")),
                ("DmiSystemUuid", FieldLeaf::pool(System, "uuid")),
                ("DmiBoardVendor", FieldLeaf::pool(Board, "vendor")),
                ("DmiBoardProduct", FieldLeaf::pool(Board, "product")),
                ("DmiBoardVersion", FieldLeaf::pool(Board, "version")),
                ("DmiBoardSerial", FieldLeaf::pool(Board, "serial")),
                ("DmiBoardAssetTag", FieldLeaf::pool(Board, "asset")),
                ("DmiBoardLocInChass", FieldLeaf::pool(Board, "location")),
                ("DmiChassisVendor", FieldLeaf::pool(Chassis, "vendor")),
                ("DmiChassisVersion", FieldLeaf::pool(Chassis, "version")),
                ("DmiChassisSerial", FieldLeaf::pool(Chassis, "serial")),
                ("DmiChassisAssetTag", FieldLeaf::pool(Chassis, "asset")),
            ],
        )?
        .with_group(
            IDE_PRIMARY_MASTER,
            vec![
                ("SerialNumber", FieldLeaf::pool(Harddisk, "serial")),
                ("FirmwareRevision", FieldLeaf::pool(Harddisk, "revision")),
                ("ModelNumber", FieldLeaf::pool(Harddisk, "model")),
            ],
        )
}

/// Parse `VBoxManage getextradata <vm> enumerate` output.
fn parse_extradata(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Key: ")?;
            let (key, value) = rest.split_once(", Value: ")?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// VirtualBox VM driven through `VBoxManage`
pub struct VirtualBox {
    name: String,
    basedir: PathBuf,
    vboxmanage: PathBuf,
}

impl VirtualBox {
    pub fn new(name: &str, basedir: &Path, vboxmanage: Option<&Path>) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            basedir: basedir.to_path_buf(),
            vboxmanage: find_vboxmanage(vboxmanage)?,
        })
    }

    fn hd_path(&self) -> PathBuf {
        self.basedir
            .join(&self.name)
            .join(format!("{}.vdi", self.name))
    }

    /// Run VBoxManage and return its trimmed stdout.
    async fn call(&self, args: &[&str]) -> Result<String> {
        let cmdline = format!("{} {}", self.vboxmanage.display(), args.join(" "));
        debug!("exec: {}", cmdline);

        let output = Command::new(&self.vboxmanage)
            .args(args)
            .output()
            .await
            .map_err(|e| ProvisionError::backend(&cmdline, format!("failed to execute: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            };
            bail!(ProvisionError::backend(cmdline, message));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VmBackend for VirtualBox {
    fn name(&self) -> &str {
        &self.name
    }

    fn basedir(&self) -> &Path {
        &self.basedir
    }

    fn identity_fields(&self) -> Result<FieldTree> {
        virtualbox_fields()
    }

    async fn create_vm(&mut self) -> Result<String> {
        let basefolder = self.basedir.to_string_lossy().to_string();
        self.call(&[
            "createvm",
            "--name",
            &self.name,
            "--basefolder",
            &basefolder,
            "--register",
        ])
        .await
    }

    async fn delete_vm(&mut self) -> Result<()> {
        self.call(&["unregistervm", &self.name, "--delete"]).await?;
        Ok(())
    }

    async fn ramsize(&mut self, mb: u32) -> Result<()> {
        if mb == 0 {
            bail!(ProvisionError::config("RAM size must be a positive number of MB"));
        }
        self.call(&["modifyvm", &self.name, "--memory", &mb.to_string()])
            .await?;
        Ok(())
    }

    async fn os_type(&mut self, os: OsType, service_pack: u8) -> Result<()> {
        // VirtualBox has no service pack notion; the OS id alone selects the profile.
        debug!("OS hint {} service pack {}", os, service_pack);
        self.call(&["modifyvm", &self.name, "--ostype", os_type_id(os)])
            .await?;
        Ok(())
    }

    async fn create_hd(&mut self, size_mb: u64) -> Result<()> {
        let hd_path = self.hd_path();
        if hd_path.exists() {
            bail!(ProvisionError::backend(
                "createhd",
                format!("disk already exists at {}", hd_path.display())
            ));
        }
        let hd = hd_path.to_string_lossy().to_string();

        self.call(&["createhd", "--filename", &hd, "--size", &size_mb.to_string()])
            .await?;
        self.call(&["storagectl", &self.name, "--name", IDE_CONTROLLER, "--add", "ide"])
            .await?;
        self.call(&[
            "storageattach",
            &self.name,
            "--storagectl",
            IDE_CONTROLLER,
            "--type",
            "hdd",
            "--device",
            "0",
            "--port",
            "0",
            "--medium",
            &hd,
        ])
        .await?;
        Ok(())
    }

    async fn attach_iso(&mut self, path: &Path) -> Result<()> {
        let iso = path.to_string_lossy().to_string();
        self.call(&[
            "storageattach",
            &self.name,
            "--storagectl",
            IDE_CONTROLLER,
            "--type",
            "dvddrive",
            "--port",
            "1",
            "--device",
            "0",
            "--medium",
            &iso,
        ])
        .await?;
        Ok(())
    }

    async fn set_field(&mut self, key: &str, value: &str) -> Result<Option<String>> {
        let out = self.call(&["setextradata", &self.name, key, value]).await?;
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    async fn modify_mac(&mut self, mac: Option<&str>) -> Result<String> {
        let mac = match mac {
            Some(mac) if !is_valid_mac(mac) => {
                bail!(ProvisionError::config(format!("Invalid MAC address '{}'", mac)))
            }
            Some(mac) => mac.to_string(),
            None => random_mac(),
        };

        // VBoxManage wants the address without separators.
        let vbox_mac = mac.replace(':', "");
        self.call(&["modifyvm", &self.name, "--macaddress1", &vbox_mac])
            .await?;
        Ok(mac)
    }

    async fn hostonly(&mut self, index: u32) -> Result<()> {
        let nic = index + 1;
        let args = [
            "modifyvm".to_string(),
            self.name.clone(),
            format!("--nic{}", nic),
            "hostonly".to_string(),
            format!("--nictype{}", nic),
            "Am79C973".to_string(),
            format!("--nicpromisc{}", nic),
            "allow-all".to_string(),
            format!("--hostonlyadapter{}", nic),
            hostonly_adapter_name().to_string(),
        ];
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.call(&args).await?;
        Ok(())
    }

    async fn hwvirt(&mut self, enable: bool) -> Result<()> {
        let value = if enable { "on" } else { "off" };
        self.call(&["modifyvm", &self.name, "--hwvirtex", value])
            .await?;
        Ok(())
    }

    async fn start_vm(&mut self) -> Result<String> {
        self.call(&["startvm", &self.name]).await
    }

    async fn snapshot(&mut self, label: &str, description: &str) -> Result<String> {
        self.call(&[
            "snapshot",
            &self.name,
            "take",
            label,
            "--description",
            description,
            "--live",
        ])
        .await
    }

    async fn stop_vm(&mut self) -> Result<String> {
        self.call(&["controlvm", &self.name, "poweroff"]).await
    }

    async fn list_settings(&mut self) -> Result<Vec<(String, String)>> {
        let out = self
            .call(&["getextradata", &self.name, "enumerate"])
            .await
            .context("Failed to enumerate extradata")?;
        Ok(parse_extradata(&out))
    }
}
