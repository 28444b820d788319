//! Service Facade (spec.md §4.3): the top-level coordinator. Validates
//! configuration, loads wiring, instantiates the plan, runs the host
//! guard, launches every VM under the structured-concurrency group, and
//! exposes the operator subcommands.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Profile;
use crate::exec::{Spec, Supervisor};
use crate::hostguard::{self, VfioBinder};
use crate::plan::{self, Plan, SynthesisInput};
use crate::vm::{AssetSources, InstallerArchives, ManagedVm, ToolNames};
use crate::wiring::Wiring;

/// The pacing gap between VM launches in ID order, to avoid a
/// hypervisor-startup thundering herd (spec.md §5).
const LAUNCH_PACING: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceConfig {
    pub wiring_path: PathBuf,
    pub lab_basedir: PathBuf,
    pub profile: Profile,
    pub restrict_default_servers: bool,
    pub kill_stale_vms: bool,
    pub dry_run: bool,
    pub install_timeout: Duration,
    pub assets: AssetSources,
    pub tools: ToolNames,
    pub installer_archives: InstallerArchives,
}

impl ServiceConfig {
    /// spec.md §4.3: "validate all path/file configuration fields are
    /// non-empty".
    pub fn validate(&self) -> Result<()> {
        let fields: [(&str, &Path); 8] = [
            ("wiring_path", &self.wiring_path),
            ("lab_basedir", &self.lab_basedir),
            ("assets.os_image", &self.assets.os_image),
            ("assets.efi_code", &self.assets.efi_code),
            ("assets.efi_vars", &self.assets.efi_vars),
            ("assets.control_installer", &self.assets.control_installer),
            ("assets.server_installer", &self.assets.server_installer),
            ("assets.onie_eeprom_template", &self.assets.onie_eeprom_template),
        ];
        for (name, path) in fields {
            if path.as_os_str().is_empty() {
                bail!("configuration field {name:?} must not be empty");
            }
        }
        Ok(())
    }
}

/// File name of the run-record sidecar written into a lab's basedir at
/// `vlab up` time, so later operator subcommands (ssh/serial/list/vfio)
/// can reconstruct the same `ServiceConfig` without a long-lived daemon
/// to ask (spec.md §1 Non-goals: no RPC API).
const RUN_RECORD_FILE: &str = "vlab-run.json";

/// Persists `config` to `{lab_basedir}/vlab-run.json`, atomically
/// (write to a `.tmp` sibling, fsync, then rename into place), mirroring
/// `wormhole` dctl's `write_env`.
pub fn write_run_record(config: &ServiceConfig) -> Result<()> {
    fs::create_dir_all(&config.lab_basedir)
        .with_context(|| format!("creating lab directory {}", config.lab_basedir.display()))?;

    let json = serde_json::to_string_pretty(config).context("serializing run record")?;
    let final_path = config.lab_basedir.join(RUN_RECORD_FILE);
    let tmp_path = config.lab_basedir.join(format!("{RUN_RECORD_FILE}.tmp"));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .with_context(|| format!("opening {}", tmp_path.display()))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("renaming {} into place", tmp_path.display()))?;
    Ok(())
}

/// Reads back the run record written by [`write_run_record`] for a
/// previous `vlab up` invocation under `lab_basedir`.
pub fn read_run_record(lab_basedir: &Path) -> Result<ServiceConfig> {
    let path = lab_basedir.join(RUN_RECORD_FILE);
    let json = fs::read_to_string(&path).with_context(|| {
        format!(
            "no previous `vlab up` run found under {} (missing {})",
            lab_basedir.display(),
            path.display()
        )
    })?;
    serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
}

const REQUIRED_TOOLS: &[&str] = &[
    "ssh",
    "scp",
    "qemu-img",
];

pub struct Service {
    pub config: ServiceConfig,
    pub plan: Plan,
    sup: Supervisor,
}

impl Service {
    pub fn load(config: ServiceConfig) -> Result<Self> {
        config.validate()?;

        let wiring = Wiring::load(&config.wiring_path)
            .with_context(|| format!("loading wiring file {}", config.wiring_path.display()))?;

        let plan = plan::synthesize(SynthesisInput {
            wiring: &wiring,
            profile: config.profile,
            restrict_default_servers: config.restrict_default_servers,
            lab_basedir: &config.lab_basedir,
        })
        .context("synthesizing VM plan")?;

        let sup = Supervisor::new(config.dry_run);
        Ok(Service { config, plan, sup })
    }

    /// spec.md §4.3 `StartServer` contract.
    pub async fn start(&self) -> Result<()> {
        let mut required = REQUIRED_TOOLS.to_vec();
        required.push(self.config.tools.hypervisor.as_str());
        required.push(self.config.tools.swtpm.as_str());
        hostguard::check_tools_present(&required)?;
        self.ensure_tpm_config_files().await?;

        let stale = hostguard::find_stale_vms(&self.config.tools.hypervisor)?;
        if !stale.is_empty() {
            if self.config.kill_stale_vms {
                hostguard::kill_stale_vms(&stale)?;
                info!("killed {} stale VM process(es); restart without --kill-stale-vms", stale.len());
                return Ok(());
            }
            let pids: Vec<String> = stale.iter().map(|p| p.pid.to_string()).collect();
            bail!("stale vlab VM processes found (pids: {}); rerun with --kill-stale-vms", pids.join(", "));
        }

        self.check_passthrough_bound()?;
        self.prepare_all().await?;
        self.run_all().await
    }

    /// spec.md §6 "Environment": materializes the software-TPM daemon's
    /// user config files once per host, across whichever of the two
    /// historical helper layouts is present.
    async fn ensure_tpm_config_files(&self) -> Result<()> {
        let helper = hostguard::resolve_tpm_config_helper().context("resolving software-TPM config helper")?;
        let (program, args) = hostguard::tpm_config_helper_command(&helper);
        let spec = Spec::new(program, &self.config.lab_basedir, "tpm-config-files").args(args);
        let token = CancellationToken::new();
        self.sup.run(spec, &token).await.context("materializing software-TPM config files")
    }

    fn check_passthrough_bound(&self) -> Result<()> {
        let mut unbound = Vec::new();
        for vm in self.plan.in_order() {
            for iface in &vm.interfaces {
                if let Some(pci) = &iface.passthrough {
                    if !hostguard::is_vfio_bound(pci) {
                        unbound.push(pci.clone());
                    }
                }
            }
        }
        if !unbound.is_empty() {
            bail!(
                "PCI device(s) not bound to vfio-pci: {}. Run `vlab vfio bind` first.",
                unbound.join(", ")
            );
        }
        Ok(())
    }

    /// spec.md §4.3 `VFIOPCIBindAll`.
    pub async fn vfio_bind_all(&self) -> Result<()> {
        let binder = VfioBinder::default();
        let mut seen = std::collections::HashSet::new();
        for vm in self.plan.in_order() {
            for iface in &vm.interfaces {
                if let Some(pci) = &iface.passthrough {
                    if !seen.insert(pci.clone()) {
                        continue;
                    }
                    info!(pci = %pci, "binding to vfio-pci");
                    binder.bind(pci).await?;
                }
            }
        }
        Ok(())
    }

    /// Prepare across every VM, strictly sequential (spec.md §5).
    async fn prepare_all(&self) -> Result<()> {
        let token = CancellationToken::new();
        for vm in self.plan.in_order() {
            let managed = ManagedVm::new(vm.clone());
            managed
                .prepare(&self.sup, &self.config.assets, &self.config.tools, &token)
                .await
                .with_context(|| format!("preparing VM {:?}", vm.name))?;
        }
        Ok(())
    }

    /// Run across every VM, concurrently inside a cancellation-propagating
    /// group (spec.md §4.2 "Run", §5).
    async fn run_all(&self) -> Result<()> {
        let token = CancellationToken::new();
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        let mut installer_archives = self.config.installer_archives.clone();
        installer_archives.switch_ready_markers = self
            .plan
            .in_order()
            .filter(|vm| vm.vm_type == plan::VmType::SwitchVs)
            .map(|vm| vm.basedir.join("ready"))
            .collect();

        for vm in self.plan.in_order() {
            let managed = Arc::new(ManagedVm::new(vm.clone()));
            managed.clone().spawn_run_tasks(
                self.sup.clone(),
                self.config.tools.clone(),
                installer_archives.clone(),
                &mut join_set,
                token.clone(),
            );
            tokio::time::sleep(LAUNCH_PACING).await;
        }

        let install_deadline = tokio::time::sleep(self.config.install_timeout);
        tokio::pin!(install_deadline);

        let mut first_error = None;
        loop {
            tokio::select! {
                res = join_set.join_next() => {
                    match res {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => {
                            warn!(error = %e, "a VM task failed; cancelling the run");
                            token.cancel();
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "a VM task panicked; cancelling the run");
                            token.cancel();
                        }
                        None => break,
                    }
                }
                _ = &mut install_deadline => {
                    warn!("install timeout elapsed; cancelling the run");
                    token.cancel();
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(())
    }

    pub fn find_vm(&self, name: &str) -> Option<&plan::Vm> {
        self.plan.get(name)
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.plan.order.clone()
    }
}

/// Builds the SSH ProxyCommand arguments for reaching a switch management
/// IP through the control VM (spec.md §4.3 "SSH" operator command), for
/// targets that have no directly forwarded SSH port of their own.
pub fn ssh_proxy_args(control_ssh_port: u16, management_ip: &str) -> Vec<String> {
    vec![
        "-o".to_string(),
        format!(
            "ProxyCommand=ssh -p {control_ssh_port} -o StrictHostKeyChecking=no core@127.0.0.1 nc {management_ip} 22"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_paths() {
        let config = ServiceConfig {
            wiring_path: PathBuf::new(),
            lab_basedir: PathBuf::from("/tmp/lab"),
            profile: Profile::Default,
            restrict_default_servers: false,
            kill_stale_vms: false,
            dry_run: true,
            install_timeout: Duration::from_secs(1),
            assets: AssetSources {
                os_image: PathBuf::from("/tmp/os.img"),
                efi_code: PathBuf::from("/tmp/efi_code.fd"),
                efi_vars: PathBuf::from("/tmp/efi_vars.fd"),
                control_ignition: PathBuf::from("/tmp/c.json"),
                server_ignition: PathBuf::from("/tmp/s.json"),
                control_installer: PathBuf::from("/tmp/c.tar.gz"),
                server_installer: PathBuf::from("/tmp/s.tar.gz"),
                onie_eeprom_template: PathBuf::from("/tmp/eeprom.tmpl"),
                nbd_device: "/dev/nbd0".to_string(),
            },
            tools: ToolNames::default(),
            installer_archives: InstallerArchives {
                control: PathBuf::from("/tmp/c.tar.gz"),
                server: PathBuf::from("/tmp/s.tar.gz"),
                identity_file: None,
                post_install: Default::default(),
                switch_ready_markers: Vec::new(),
            },
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wiring_path"));
    }

    #[test]
    fn ssh_proxy_command_references_control_port_and_target() {
        let args = ssh_proxy_args(22000, "10.0.0.5");
        let joined = args.join(" ");
        assert!(joined.contains("-p 22000"));
        assert!(joined.contains("10.0.0.5"));
    }

    fn sample_config(lab_basedir: PathBuf) -> ServiceConfig {
        ServiceConfig {
            wiring_path: PathBuf::from("/tmp/wiring.yaml"),
            lab_basedir,
            profile: Profile::Compact,
            restrict_default_servers: true,
            kill_stale_vms: false,
            dry_run: true,
            install_timeout: Duration::from_secs(42),
            assets: AssetSources {
                os_image: PathBuf::from("/tmp/os.img"),
                efi_code: PathBuf::from("/tmp/efi_code.fd"),
                efi_vars: PathBuf::from("/tmp/efi_vars.fd"),
                control_ignition: PathBuf::from("/tmp/c.json"),
                server_ignition: PathBuf::from("/tmp/s.json"),
                control_installer: PathBuf::from("/tmp/c.tar.gz"),
                server_installer: PathBuf::from("/tmp/s.tar.gz"),
                onie_eeprom_template: PathBuf::from("/tmp/eeprom.tmpl"),
                nbd_device: "/dev/nbd3".to_string(),
            },
            tools: ToolNames::default(),
            installer_archives: InstallerArchives {
                control: PathBuf::from("/tmp/c.tar.gz"),
                server: PathBuf::from("/tmp/s.tar.gz"),
                identity_file: Some(PathBuf::from("/tmp/id_ed25519")),
                post_install: Default::default(),
                switch_ready_markers: Vec::new(),
            },
        }
    }

    #[test]
    fn run_record_round_trips() {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("vlab-run-record-test-{}-{n}", std::process::id()));
        let config = sample_config(dir.clone());

        write_run_record(&config).unwrap();
        let reread = read_run_record(&dir).unwrap();

        assert_eq!(reread.wiring_path, config.wiring_path);
        assert_eq!(reread.profile, config.profile);
        assert_eq!(reread.restrict_default_servers, config.restrict_default_servers);
        assert_eq!(reread.install_timeout, config.install_timeout);
        assert_eq!(reread.assets.nbd_device, config.assets.nbd_device);
        assert_eq!(reread.installer_archives.identity_file, config.installer_archives.identity_file);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_run_record_reports_missing_run() {
        let dir = std::env::temp_dir().join(format!("vlab-run-record-missing-{}", std::process::id()));
        let err = read_run_record(&dir).unwrap_err();
        assert!(err.to_string().contains("vlab up"));
    }
}
