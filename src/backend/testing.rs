//! In-memory backend that records every call, for unit tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{OsType, VmBackend};
use crate::error::ProvisionError;
use crate::identity::random::random_mac;
use crate::identity::{Category, FieldLeaf, FieldTree};

type StartHook = Box<dyn FnOnce() + Send + Sync>;

pub struct RecordingBackend {
    name: String,
    basedir: PathBuf,
    created: bool,
    calls: Vec<String>,
    fields: HashMap<String, String>,
    fail_on: Option<String>,
    on_start: Option<StartHook>,
}

impl RecordingBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            basedir: PathBuf::from("/nonexistent"),
            created: false,
            calls: Vec::new(),
            fields: HashMap::new(),
            fail_on: None,
            on_start: None,
        }
    }

    /// Fail the named operation with a backend error.
    pub fn fail_on(mut self, op: &str) -> Self {
        self.fail_on = Some(op.to_string());
        self
    }

    /// Run `hook` when the VM is started, standing in for the guest.
    pub fn on_start(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    fn record(&mut self, op: &str, detail: String) -> Result<()> {
        if self.fail_on.as_deref() == Some(op) {
            return Err(ProvisionError::backend(op, "injected failure").into());
        }
        if detail.is_empty() {
            self.calls.push(op.to_string());
        } else {
            self.calls.push(format!("{} {}", op, detail));
        }
        Ok(())
    }
}

#[async_trait]
impl VmBackend for RecordingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn basedir(&self) -> &Path {
        &self.basedir
    }

    fn identity_fields(&self) -> Result<FieldTree> {
        FieldTree::new().with_group(
            "dmi",
            vec![
                ("SystemVendor", FieldLeaf::pool(Category::System, "vendor")),
                ("SystemSerial", FieldLeaf::pool(Category::System, "serial")),
            ],
        )
    }

    async fn create_vm(&mut self) -> Result<String> {
        self.record("create_vm", String::new())?;
        self.created = true;
        Ok(format!("Virtual machine '{}' is created and registered.", self.name))
    }

    async fn delete_vm(&mut self) -> Result<()> {
        self.record("delete_vm", String::new())?;
        if !self.created {
            bail!(ProvisionError::backend(
                "delete_vm",
                format!("Could not find a registered machine named '{}'", self.name)
            ));
        }
        self.created = false;
        Ok(())
    }

    async fn ramsize(&mut self, mb: u32) -> Result<()> {
        self.record("ramsize", mb.to_string())
    }

    async fn os_type(&mut self, os: OsType, service_pack: u8) -> Result<()> {
        self.record("os_type", format!("{} sp{}", os, service_pack))
    }

    async fn create_hd(&mut self, size_mb: u64) -> Result<()> {
        self.record("create_hd", size_mb.to_string())
    }

    async fn attach_iso(&mut self, path: &Path) -> Result<()> {
        self.record("attach_iso", path.display().to_string())
    }

    async fn set_field(&mut self, key: &str, value: &str) -> Result<Option<String>> {
        self.record("set_field", key.to_string())?;
        self.fields.insert(key.to_string(), value.to_string());
        Ok(None)
    }

    async fn modify_mac(&mut self, mac: Option<&str>) -> Result<String> {
        let mac = mac.map(str::to_string).unwrap_or_else(random_mac);
        self.record("modify_mac", mac.clone())?;
        Ok(mac)
    }

    async fn hostonly(&mut self, index: u32) -> Result<()> {
        self.record("hostonly", index.to_string())
    }

    async fn hwvirt(&mut self, enable: bool) -> Result<()> {
        self.record("hwvirt", enable.to_string())
    }

    async fn start_vm(&mut self) -> Result<String> {
        self.record("start_vm", String::new())?;
        if let Some(hook) = self.on_start.take() {
            hook();
        }
        Ok(String::new())
    }

    async fn snapshot(&mut self, label: &str, _description: &str) -> Result<String> {
        self.record("snapshot", label.to_string())?;
        Ok(String::new())
    }

    async fn stop_vm(&mut self) -> Result<String> {
        self.record("stop_vm", String::new())?;
        Ok(String::new())
    }

    async fn list_settings(&mut self) -> Result<Vec<(String, String)>> {
        self.record("list_settings", String::new())?;
        let mut settings: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        settings.sort();
        Ok(settings)
    }
}
