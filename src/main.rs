use anyhow::Result;
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use vmcloak::backend::{BackendOptions, create_backend};
use vmcloak::config::{PartialSettings, Settings};
use vmcloak::identity::{IdentityPool, OEM_PLACEHOLDER};
use vmcloak::media::InstallerMedia;
use vmcloak::pipeline::{self, Pipeline, ProvisionPlan};

#[derive(Parser)]
#[command(name = "vmcloak")]
#[command(about = "Provision analysis VMs with randomized, consistent hardware identities")]
#[command(version)]
struct Cli {
    /// Name of the virtual machine
    vmname: String,
    /// Base directory for the virtual machine and its associated files
    #[arg(long)]
    basedir: Option<String>,
    /// Virtualization software (virtualbox)
    #[arg(long = "vm")]
    backend: Option<String>,
    /// List the cloaked settings of the virtual machine
    #[arg(long, conflicts_with = "delete")]
    list: bool,
    /// Print the listed settings as JSON
    #[arg(long, requires = "list")]
    json: bool,
    /// Completely delete the virtual machine and its associated files
    #[arg(long)]
    delete: bool,
    /// Available memory (in MB) for the virtual machine
    #[arg(long)]
    ramsize: Option<u32>,
    /// Display resolution to set in the guest, e.g. 1024x768
    #[arg(long)]
    resolution: Option<String>,
    /// Maximum size (in MB) of the dynamically allocated harddisk
    #[arg(long)]
    hdsize: Option<u64>,
    /// Windows installer ISO image
    #[arg(long)]
    iso: Option<String>,
    /// Static IP address to bind to on the host
    #[arg(long)]
    host_ip: Option<String>,
    /// Static IP address to use on the guest
    #[arg(long)]
    guest_ip: Option<String>,
    /// Gateway for the guest's static IP address
    #[arg(long)]
    guest_ip_gateway: Option<String>,
    /// Explicitly enable hardware virtualization
    #[arg(long, conflicts_with = "no_hwvirt")]
    hwvirt: bool,
    /// Explicitly disable hardware virtualization
    #[arg(long)]
    no_hwvirt: bool,
    /// Windows product key
    #[arg(long)]
    serial_key: Option<String>,
    /// Guest OS profile (xp, win7, win7x64)
    #[arg(long)]
    os: Option<String>,
    /// Guest OS service pack
    #[arg(long)]
    service_pack: Option<u8>,
    /// Path to VBoxManage
    #[arg(long)]
    vboxmanage: Option<String>,
    /// Unattended-install answer file template
    #[arg(long)]
    answer_file: Option<String>,
    /// Directory receiving the guest bootstrap settings files
    #[arg(long)]
    bootstrap_dir: Option<String>,
    /// Script that builds the installer image
    #[arg(long)]
    buildiso: Option<String>,
    /// Seconds to wait for the guest install to call back (0 waits forever)
    #[arg(long)]
    install_timeout: Option<u64>,
    /// Seconds to let the installed guest settle before the snapshot
    #[arg(long)]
    settle: Option<u64>,
    /// TOML file with hardware identity profiles
    #[arg(long)]
    identity_pool: Option<String>,
    /// Label of the snapshot taken after install
    #[arg(long)]
    snapshot_label: Option<String>,
    /// Settings file providing defaults for any of the above
    #[arg(short, long)]
    settings: Option<PathBuf>,
    /// Verbose logging (includes every backend command)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn partial(&self) -> PartialSettings {
        let hwvirt = match (self.hwvirt, self.no_hwvirt) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        };

        PartialSettings {
            backend: self.backend.clone(),
            basedir: self.basedir.clone(),
            iso: self.iso.clone(),
            ramsize: self.ramsize,
            hdsize: self.hdsize,
            resolution: self.resolution.clone(),
            host_ip: self.host_ip.clone(),
            guest_ip: self.guest_ip.clone(),
            guest_ip_gateway: self.guest_ip_gateway.clone(),
            hwvirt,
            serial_key: self.serial_key.clone(),
            os: self.os.clone(),
            service_pack: self.service_pack,
            vboxmanage: self.vboxmanage.clone(),
            answer_file: self.answer_file.clone(),
            bootstrap_dir: self.bootstrap_dir.clone(),
            buildiso: self.buildiso.clone(),
            install_timeout_secs: self.install_timeout,
            settle_secs: self.settle,
            identity_pool: self.identity_pool.clone(),
            snapshot_label: self.snapshot_label.clone(),
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "vmcloak=debug" } else { "vmcloak=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolves when the operator hits Ctrl-C. Never resolves if the handler
/// cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let file = cli
        .settings
        .as_deref()
        .map(PartialSettings::from_file)
        .transpose()?;
    let settings = Settings::resolve(&cli.vmname, cli.partial(), file)?;

    let mut backend = create_backend(
        settings.backend,
        &settings.vm_name,
        &settings.basedir,
        &BackendOptions {
            tool_path: settings.vboxmanage.clone(),
        },
    )?;

    if cli.list {
        let listed = pipeline::list_settings(backend.as_mut()).await?;
        if cli.json {
            let map: BTreeMap<String, String> = listed.into_iter().collect();
            println!("{}", serde_json::to_string_pretty(&map)?);
        } else {
            for (key, value) in listed {
                println!("{} = {}", key, value);
            }
        }
        return Ok(());
    }

    if cli.delete {
        pipeline::delete_vm(backend.as_mut()).await?;
        println!("VM '{}' deleted.", settings.vm_name);
        return Ok(());
    }

    let iso = settings.require_iso()?.to_path_buf();
    let pool = IdentityPool::load(settings.identity_pool.as_deref())?;
    if pool.is_empty() {
        warn!(
            "Identity pool is empty; every hardware identity field will read {:?}",
            OEM_PLACEHOLDER
        );
    }

    let media = InstallerMedia {
        base_iso: iso,
        answer_template: settings.answer_file.clone(),
        bootstrap_dir: settings.bootstrap_dir.clone(),
        build_script: settings.buildiso.clone(),
        serial_key: settings.serial_key.clone(),
        resolution: settings.resolution.clone(),
        guest_ip: settings.guest_ip,
        guest_gateway: settings.guest_ip_gateway,
    };

    let report = Pipeline::new(
        backend.as_mut(),
        &media,
        &pool,
        ProvisionPlan::from(&settings),
    )?
    .run(interrupted())
    .await?;

    println!("\nVM '{}' provisioned.", settings.vm_name);
    println!("  MAC address: {}", report.mac);
    println!("  Identity fields set: {}", report.fields.len());
    println!("  Install time: {}s", report.guest.waited.as_secs());
    println!("  Snapshot: {}", report.snapshot_label);

    Ok(())
}
