//! Installer media preparation.
//!
//! Renders the unattended-install answer file, writes the settings files the
//! guest bootstrap scripts read, and runs the external script that burns both
//! into a bootable installer image.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::io::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::identity::random::random_string;

/// Token delimiter in answer-file templates (`@TOKEN@`).
const TOKEN_DELIMITER: &str = "@";

/// Produces a bootable installer image that knows where to call back.
#[async_trait]
pub trait MediaBuilder: Send + Sync {
    async fn build(&self, vm_name: &str, basedir: &Path, callback: SocketAddr) -> Result<PathBuf>;
}

/// Replace every `@KEY@` token in `template` with its value. Plain byte
/// substitution; the template is never parsed.
pub fn render_template(template: &[u8], values: &[(&str, String)]) -> Vec<u8> {
    let mut buf = template.to_vec();
    for (key, value) in values {
        let token = format!("{d}{k}{d}", d = TOKEN_DELIMITER, k = key);
        buf = replace_bytes(&buf, token.as_bytes(), value.as_bytes());
    }
    buf
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

/// Randomized answer-file values for one install.
pub fn answer_values(serial_key: Option<&str>) -> Vec<(&'static str, String)> {
    vec![
        ("PRODUCTKEY", serial_key.unwrap_or_default().to_string()),
        ("COMPUTERNAME", random_string(8, Some(16))),
        (
            "FULLNAME",
            format!("{} {}", random_string(4, Some(8)), random_string(4, Some(10))),
        ),
        ("ORGANIZATION", String::new()),
        ("WORKGROUP", random_string(4, Some(8))),
    ]
}

/// Values handed to the guest bootstrap scripts.
#[derive(Debug, Clone)]
pub struct GuestSettings {
    pub guest_ip: IpAddr,
    pub guest_gateway: IpAddr,
    pub callback: SocketAddr,
    pub resolution: String,
}

impl GuestSettings {
    /// Contents of `settings.bat`, read by the early-boot batch script.
    pub fn batch(&self) -> String {
        format!(
            "set HOSTONLYIP={}\r\nset HOSTONLYGATEWAY={}\r\n",
            self.guest_ip, self.guest_gateway
        )
    }

    /// Contents of `settings.py`, read by the post-login script.
    pub fn python(&self) -> String {
        format!(
            "HOST_IP = '{}'\nHOST_PORT = {}\nRESOLUTION = '{}'\n",
            self.callback.ip(),
            self.callback.port(),
            self.resolution
        )
    }

    pub fn write(&self, bootstrap_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(bootstrap_dir).with_context(|| {
            format!("Failed to create bootstrap dir: {}", bootstrap_dir.display())
        })?;
        std::fs::write(bootstrap_dir.join("settings.bat"), self.batch())
            .context("Failed to write settings.bat")?;
        std::fs::write(bootstrap_dir.join("settings.py"), self.python())
            .context("Failed to write settings.py")?;
        Ok(())
    }
}

/// Installer image built by an external script from a base ISO and a
/// rendered answer file.
#[derive(Debug, Clone)]
pub struct InstallerMedia {
    pub base_iso: PathBuf,
    pub answer_template: PathBuf,
    pub bootstrap_dir: PathBuf,
    pub build_script: PathBuf,
    pub serial_key: Option<String>,
    pub resolution: String,
    pub guest_ip: IpAddr,
    pub guest_gateway: IpAddr,
}

impl InstallerMedia {
    fn render_answer_file(&self) -> Result<tempfile::NamedTempFile> {
        let template = std::fs::read(&self.answer_template).with_context(|| {
            format!("Failed to read answer file: {}", self.answer_template.display())
        })?;
        let rendered = render_template(&template, &answer_values(self.serial_key.as_deref()));

        let mut file = tempfile::Builder::new()
            .prefix("vmcloak-")
            .suffix(".sif")
            .tempfile()
            .context("Failed to create answer file")?;
        file.write_all(&rendered)?;
        file.flush()?;
        Ok(file)
    }

    async fn run_build_script(&self, answer_file: &Path, output: &Path) -> Result<()> {
        let script = self.build_script.display().to_string();
        debug!(
            "exec: {} {} {} {}",
            script,
            self.base_iso.display(),
            answer_file.display(),
            output.display()
        );

        let result = Command::new(&self.build_script)
            .arg(&self.base_iso)
            .arg(answer_file)
            .arg(output)
            .output()
            .await
            .map_err(|e| {
                ProvisionError::Build(format!("could not execute {} (is it executable?): {}", script, e))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(ProvisionError::Build(format!(
                "{} exited with {}: {}",
                script,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaBuilder for InstallerMedia {
    async fn build(&self, vm_name: &str, basedir: &Path, callback: SocketAddr) -> Result<PathBuf> {
        info!("Configuring answer file {}", self.answer_template.display());
        let answer_file = self.render_answer_file()?;

        info!("Using static IP address {} on the guest", self.guest_ip);
        GuestSettings {
            guest_ip: self.guest_ip,
            guest_gateway: self.guest_gateway,
            callback,
            resolution: self.resolution.clone(),
        }
        .write(&self.bootstrap_dir)?;

        let vm_dir = basedir.join(vm_name);
        std::fs::create_dir_all(&vm_dir)
            .with_context(|| format!("Failed to create VM directory: {}", vm_dir.display()))?;
        let iso_path = vm_dir.join("image.iso");

        info!("Creating installer image {}", iso_path.display());
        self.run_build_script(answer_file.path(), &iso_path).await?;

        Ok(iso_path)
    }
}
