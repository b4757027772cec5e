//! Provisioning pipeline.
//!
//! Drives one VM from installer-image build to a powered-off machine with a
//! clean snapshot. Stages run strictly in order; the first failure ends the
//! run and nothing already created is rolled back, so the operator can
//! inspect what was left behind.

use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::{Pin, pin};
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{OsType, VmBackend};
use crate::config::Settings;
use crate::error::ProvisionError;
use crate::identity::{FieldTree, IdentityPool, Randomizer, ResolvedField};
use crate::media::MediaBuilder;
use crate::rendezvous::{GuestReport, RendezvousListener};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Listen,
    MediaBuild,
    Create,
    Configure,
    Identity,
    Network,
    VirtOverride,
    Boot,
    AwaitInstall,
    Settle,
    Snapshot,
    PowerOff,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Listen => "listen",
            Stage::MediaBuild => "media build",
            Stage::Create => "create",
            Stage::Configure => "configure",
            Stage::Identity => "identity",
            Stage::Network => "network",
            Stage::VirtOverride => "hwvirt override",
            Stage::Boot => "boot",
            Stage::AwaitInstall => "await install",
            Stage::Settle => "settle",
            Stage::Snapshot => "snapshot",
            Stage::PowerOff => "power off",
        };
        f.write_str(name)
    }
}

fn failed(stage: Stage) -> String {
    format!("Stage '{}' failed", stage)
}

/// Timed-out and interrupted runs leave the VM where it stopped.
fn left_in_place(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::InstallTimedOut { .. } | ProvisionError::Interrupted)
    )
}

/// Drive one stage to completion unless `interrupt` fires first. A pending
/// interrupt wins over a stage that is also ready.
async fn interruptible<T, F>(
    stage: Stage,
    work: impl Future<Output = Result<T>>,
    interrupt: Pin<&mut F>,
) -> Result<T>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = interrupt => {
            Err(anyhow::Error::from(ProvisionError::Interrupted).context(failed(stage)))
        }
        outcome = work => outcome.with_context(|| failed(stage)),
    }
}

/// Knobs for one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub ramsize: u32,
    pub hdsize: u64,
    pub os: OsType,
    pub service_pack: u8,
    pub hwvirt: Option<bool>,
    pub host_ip: IpAddr,
    pub install_timeout: Option<Duration>,
    pub settle: Duration,
    pub snapshot_label: String,
}

impl From<&Settings> for ProvisionPlan {
    fn from(s: &Settings) -> Self {
        Self {
            ramsize: s.ramsize,
            hdsize: s.hdsize,
            os: s.os,
            service_pack: s.service_pack,
            hwvirt: s.hwvirt,
            host_ip: s.host_ip,
            install_timeout: s.install_timeout,
            settle: s.settle,
            snapshot_label: s.snapshot_label.clone(),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    pub image: PathBuf,
    pub mac: String,
    pub fields: Vec<ResolvedField>,
    pub guest: GuestReport,
    pub snapshot_label: String,
}

pub struct Pipeline<'a> {
    backend: &'a mut dyn VmBackend,
    media: &'a dyn MediaBuilder,
    pool: &'a IdentityPool,
    fields: FieldTree,
    plan: ProvisionPlan,
}

impl<'a> Pipeline<'a> {
    /// Prepare a run. The backend's identity field tree is built here so a
    /// malformed tree fails before anything is created.
    pub fn new(
        backend: &'a mut dyn VmBackend,
        media: &'a dyn MediaBuilder,
        pool: &'a IdentityPool,
        plan: ProvisionPlan,
    ) -> Result<Self> {
        let fields = backend
            .identity_fields()
            .context("Invalid identity field specification")?;
        Ok(Self {
            backend,
            media,
            pool,
            fields,
            plan,
        })
    }

    /// Run every stage. `interrupt` is raced against each stage; if it fires
    /// the stage is abandoned, the listener is closed and the VM is left as
    /// it is.
    pub async fn run<F>(self, interrupt: F) -> Result<ProvisionReport>
    where
        F: Future<Output = ()>,
    {
        let Pipeline {
            backend,
            media,
            pool,
            fields,
            plan,
        } = self;
        let name = backend.name().to_string();
        let mut interrupt = pin!(interrupt);

        let outcome = async {
            info!("Using {} as host IP", plan.host_ip);
            let listener = RendezvousListener::bind(plan.host_ip)
                .with_context(|| failed(Stage::Listen))?;
            let callback = listener.local_addr();

            let image = interruptible(
                Stage::MediaBuild,
                media.build(&name, backend.basedir(), callback),
                interrupt.as_mut(),
            )
            .await?;

            info!("Creating VM '{}'", name);
            let out = interruptible(Stage::Create, backend.create_vm(), interrupt.as_mut()).await?;
            if !out.is_empty() {
                println!("{}", out);
            }

            let configure = async {
                backend.ramsize(plan.ramsize).await?;
                backend.os_type(plan.os, plan.service_pack).await?;
                info!("Creating {} MB harddisk", plan.hdsize);
                backend.create_hd(plan.hdsize).await?;
                info!("Attaching installer image {}", image.display());
                backend.attach_iso(&image).await
            };
            interruptible(Stage::Configure, configure, interrupt.as_mut()).await?;

            if fields.is_empty() {
                warn!("Backend '{}' declares no identity fields", backend.name());
            } else {
                info!("Randomizing {} hardware identity fields", fields.len());
            }
            let applied = interruptible(
                Stage::Identity,
                Randomizer::new(pool, &fields).apply(&mut *backend),
                interrupt.as_mut(),
            )
            .await?;

            let network = async {
                let mac = backend.modify_mac(None).await?;
                info!("Randomized MAC address: {}", mac);
                backend.hostonly(0).await?;
                Ok::<_, anyhow::Error>(mac)
            };
            let mac = interruptible(Stage::Network, network, interrupt.as_mut()).await?;

            if let Some(enable) = plan.hwvirt {
                info!(
                    "{} hardware virtualization",
                    if enable { "Enabling" } else { "Disabling" }
                );
                interruptible(
                    Stage::VirtOverride,
                    backend.hwvirt(enable),
                    interrupt.as_mut(),
                )
                .await?;
            }

            info!("Starting VM '{}' to install the guest OS", name);
            interruptible(Stage::Boot, backend.start_vm(), interrupt.as_mut()).await?;

            match plan.install_timeout {
                Some(limit) => info!(
                    "Waiting up to {} minutes for the guest to connect back on {}",
                    limit.as_secs() / 60,
                    callback
                ),
                None => info!("Waiting for the guest to connect back on {}", callback),
            }
            let guest = listener
                .wait_or_interrupt(plan.install_timeout, interrupt.as_mut())
                .await
                .with_context(|| failed(Stage::AwaitInstall))?;
            info!("Guest install took {} seconds", guest.waited.as_secs());
            if guest.status.is_success() {
                info!("Resolution was set successfully");
            } else {
                warn!("Guest reported an error setting the resolution");
            }

            // Let the freshly installed OS finish its background initialization.
            let settle = async {
                tokio::time::sleep(plan.settle).await;
                Ok::<_, anyhow::Error>(())
            };
            interruptible(Stage::Settle, settle, interrupt.as_mut()).await?;

            info!("Taking snapshot '{}'", plan.snapshot_label);
            let description = format!(
                "Snapshot created by VM Cloak on {}.",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            interruptible(
                Stage::Snapshot,
                backend.snapshot(&plan.snapshot_label, &description),
                interrupt.as_mut(),
            )
            .await?;

            info!("Powering off VM '{}'", name);
            interruptible(Stage::PowerOff, backend.stop_vm(), interrupt.as_mut()).await?;

            Ok::<_, anyhow::Error>(ProvisionReport {
                image,
                mac,
                fields: applied,
                guest,
                snapshot_label: plan.snapshot_label.clone(),
            })
        }
        .await;

        if let Err(e) = &outcome
            && left_in_place(e)
        {
            warn!("VM '{}' left in its current state for inspection", name);
        }
        outcome
    }
}

/// Every configuration datum applied to an existing VM.
pub async fn list_settings(backend: &mut dyn VmBackend) -> Result<Vec<(String, String)>> {
    backend
        .list_settings()
        .await
        .with_context(|| format!("Failed to list settings of VM '{}'", backend.name()))
}

/// Unregister an existing VM and delete its files.
pub async fn delete_vm(backend: &mut dyn VmBackend) -> Result<()> {
    info!(
        "Unregistering and deleting VM '{}' and its associated files",
        backend.name()
    );
    let name = backend.name().to_string();
    backend
        .delete_vm()
        .await
        .with_context(|| format!("Failed to delete VM '{}'", name))
}
