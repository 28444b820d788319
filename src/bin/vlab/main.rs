use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vlab::cli::{Cli, Command, VfioCommand};
use vlab::config::Profile;
use vlab::selector::{self, RoleFilter};
use vlab::service::{self, Service, ServiceConfig};
use vlab::vm::{AssetSources, InstallerArchives, ManagedVm, PostInstallPolicy, ToolNames};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vlab=info")))
        .init();
}

fn assets_from_dir(dir: &Path, nbd_device: String) -> AssetSources {
    AssetSources {
        os_image: dir.join("os.img"),
        efi_code: dir.join("efi_code.fd"),
        efi_vars: dir.join("efi_vars.fd"),
        control_ignition: dir.join("ignition-control.json"),
        server_ignition: dir.join("ignition-server.json"),
        control_installer: dir.join("installer-control.tar.gz"),
        server_installer: dir.join("installer-server.tar.gz"),
        onie_eeprom_template: dir.join("onie-eeprom.yaml.tmpl"),
        nbd_device,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(e) = run().await {
        tracing::error!(error = ?e, "vlab failed");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Up {
            wiring,
            profile,
            lab_dir,
            restrict_servers,
            kill_stale_vms,
            dry_run,
            assets_dir,
            nbd_device,
            identity_file,
            install_timeout_secs,
            exit_after_install,
            run_hook,
            wait_for_switches_then_run_hooks,
        } => {
            let post_install = if let Some(hook) = wait_for_switches_then_run_hooks {
                PostInstallPolicy::WaitForSwitchesThenRunHooks(hook)
            } else if let Some(hook) = run_hook {
                PostInstallPolicy::RunHookThenExit(hook)
            } else if exit_after_install {
                PostInstallPolicy::ExitAfterInstall
            } else {
                PostInstallPolicy::Continue
            };
            cmd_up(
                wiring,
                profile,
                lab_dir,
                restrict_servers,
                kill_stale_vms,
                dry_run,
                assets_dir,
                nbd_device,
                identity_file,
                install_timeout_secs,
                post_install,
            )
            .await
        }
        Command::Ssh { name, lab_dir } => cmd_ssh(name, lab_dir).await,
        Command::Serial { name, lab_dir } => cmd_serial(name, lab_dir).await,
        Command::List { lab_dir } => cmd_list(lab_dir).await,
        Command::Vfio { command: VfioCommand::Bind { lab_dir } } => cmd_vfio_bind(lab_dir).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_up(
    wiring: PathBuf,
    profile: Profile,
    lab_dir: PathBuf,
    restrict_servers: bool,
    kill_stale_vms: bool,
    dry_run: bool,
    assets_dir: PathBuf,
    nbd_device: String,
    identity_file: Option<PathBuf>,
    install_timeout_secs: u64,
    post_install: PostInstallPolicy,
) -> Result<()> {
    let assets = assets_from_dir(&assets_dir, nbd_device);
    let config = ServiceConfig {
        wiring_path: wiring,
        lab_basedir: lab_dir,
        profile,
        restrict_default_servers: restrict_servers,
        kill_stale_vms,
        dry_run,
        install_timeout: Duration::from_secs(install_timeout_secs),
        installer_archives: InstallerArchives {
            control: assets.control_installer.clone(),
            server: assets.server_installer.clone(),
            identity_file,
            post_install,
            switch_ready_markers: Vec::new(),
        },
        assets,
        tools: ToolNames::default(),
    };

    let service = Service::load(config)?;

    // Persist the config used for this run so later operator subcommands
    // (ssh/serial/list/vfio) can reconstruct the same plan without a
    // long-lived daemon to ask (spec.md §1 Non-goals: no RPC API).
    service::write_run_record(&service.config).context("recording this run for later `vlab` subcommands")?;
    service.start().await
}

fn reopen_service(lab_dir: PathBuf) -> Result<Service> {
    let config = service::read_run_record(&lab_dir)?;
    Service::load(config)
}

async fn cmd_ssh(name: Option<String>, lab_dir: PathBuf) -> Result<()> {
    let service = reopen_service(lab_dir)?;
    let target_name = selector::select_vm(&service.plan, name.as_deref(), RoleFilter::SshCapable)?;
    let vm = service.find_vm(&target_name).context("VM vanished from plan")?;
    let port = vm.ssh_port().context("VM has no forwarded SSH port")?;

    let status = tokio::process::Command::new("ssh")
        .arg("-p")
        .arg(port.to_string())
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("core@127.0.0.1")
        .status()
        .await
        .context("spawning ssh")?;
    if !status.success() {
        anyhow::bail!("ssh exited with {status}");
    }
    Ok(())
}

async fn cmd_serial(name: Option<String>, lab_dir: PathBuf) -> Result<()> {
    let service = reopen_service(lab_dir.clone())?;
    let target_name = selector::select_vm(&service.plan, name.as_deref(), RoleFilter::SerialCapable)?;
    let vm = service.find_vm(&target_name).context("VM vanished from plan")?;

    if let Some(endpoint) = &vm.serial_endpoint {
        let (host, port) = endpoint
            .split_once(':')
            .context("hardware switch serial endpoint must be host:port")?;
        let status = tokio::process::Command::new("telnet")
            .arg(host)
            .arg(port)
            .status()
            .await
            .context("spawning telnet")?;
        if !status.success() {
            anyhow::bail!("telnet exited with {status}");
        }
    } else {
        let socket = vm.basedir.join("serial.sock");
        let status = tokio::process::Command::new("socat")
            .arg("-,raw,echo=0,escape=0x1d")
            .arg(format!("unix-connect:{}", socket.display()))
            .status()
            .await
            .context("spawning socat")?;
        if !status.success() {
            anyhow::bail!("socat exited with {status}");
        }
    }
    Ok(())
}

async fn cmd_list(lab_dir: PathBuf) -> Result<()> {
    let service = reopen_service(lab_dir)?;

    println!("{:<20} {:<10} {:<5} {:<9} {}", "NAME", "TYPE", "ID", "SSH PORT", "STAGE");
    for vm in service.plan.in_order() {
        let id = vm.id.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
        let ssh_port = vm.ssh_port().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let stage = ManagedVm::new(vm.clone()).stage();
        println!("{:<20} {:<10} {:<5} {:<9} {}", vm.name, format!("{:?}", vm.vm_type), id, ssh_port, stage);
    }
    Ok(())
}

async fn cmd_vfio_bind(lab_dir: PathBuf) -> Result<()> {
    let service = reopen_service(lab_dir)?;
    service.vfio_bind_all().await
}
