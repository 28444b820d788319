//! The VM entity (spec.md §4.2): binds plan output to an on-disk base
//! directory and orchestrates its own Prepare and Run phases.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::exec::{Spec, Supervisor};
use crate::installer::{self, SshTarget};
use crate::marker::Marker;
use crate::plan::{self, Netdev, Vm as PlanVm, VmType};

/// Assets shared by every VM of a given lab: the firmware/OS image sources
/// that Prepare copies into each VM's basedir under canonical names.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AssetSources {
    pub os_image: PathBuf,
    pub efi_code: PathBuf,
    pub efi_vars: PathBuf,
    pub control_ignition: PathBuf,
    pub server_ignition: PathBuf,
    pub control_installer: PathBuf,
    pub server_installer: PathBuf,
    pub onie_eeprom_template: PathBuf,
    pub nbd_device: String,
}

/// External tool binary names, overridable for tests and unusual hosts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolNames {
    pub hypervisor: String,
    pub img_resize: String,
    pub eeprom_edit: String,
    pub swtpm: String,
    pub swtpm_setup: String,
}

impl Default for ToolNames {
    fn default() -> Self {
        ToolNames {
            hypervisor: "qemu-system-x86_64".to_string(),
            img_resize: "qemu-img".to_string(),
            eeprom_edit: "onie-qemu-eeprom".to_string(),
            swtpm: "swtpm".to_string(),
            swtpm_setup: "swtpm_setup".to_string(),
        }
    }
}

/// One VM's phase state (spec.md §4.2 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Planned,
    Prepared,
    Running,
    Installed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Planned => "planned",
            Stage::Prepared => "prepared",
            Stage::Running => "running",
            Stage::Installed => "installed",
        })
    }
}

pub struct ManagedVm {
    pub plan: PlanVm,
    ready: Marker,
    installed: Marker,
}

impl ManagedVm {
    pub fn new(plan: PlanVm) -> Self {
        let ready = Marker::new(plan.basedir.join("ready"));
        let installed = Marker::new(plan.basedir.join("installed"));
        ManagedVm { plan, ready, installed }
    }

    pub fn stage(&self) -> Stage {
        if self.plan.vm_type != VmType::SwitchHw && self.installed.is_set() {
            Stage::Installed
        } else if self.ready.is_set() {
            // Prepared is subsumed by Running once a hypervisor task is
            // actually alive; callers track that separately.
            Stage::Prepared
        } else {
            Stage::Planned
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.plan.vm_type != VmType::SwitchHw
    }

    /// Prepare (spec.md §4.2): idempotent, sequential across VMs.
    #[instrument(skip_all, fields(vm = %self.plan.name))]
    pub async fn prepare(
        &self,
        sup: &Supervisor,
        assets: &AssetSources,
        tools: &ToolNames,
        token: &CancellationToken,
    ) -> Result<()> {
        if !self.is_runnable() {
            return Ok(());
        }
        if self.ready.is_set() {
            info!("already prepared, skipping");
            return Ok(());
        }

        std::fs::create_dir_all(&self.plan.basedir)
            .with_context(|| format!("creating basedir {}", self.plan.basedir.display()))?;

        self.copy_assets(assets)?;
        self.resize_disk(sup, tools, token).await?;

        if self.plan.vm_type == VmType::SwitchVs {
            self.render_eeprom(sup, assets, tools, token).await?;
        }

        if matches!(self.plan.vm_type, VmType::Control | VmType::SwitchVs) {
            self.init_tpm(sup, tools, token).await?;
        }

        self.ready.set()?;
        Ok(())
    }

    fn copy_assets(&self, assets: &AssetSources) -> Result<()> {
        let base = &self.plan.basedir;
        copy_with_progress(&assets.os_image, &base.join("os.img"))?;
        copy_with_progress(&assets.efi_code, &base.join("efi_code.fd"))?;
        copy_with_progress(&assets.efi_vars, &base.join("efi_vars.fd"))?;

        match self.plan.vm_type {
            VmType::Control => {
                copy_with_progress(&assets.control_ignition, &base.join("ignition.json"))?;
            }
            VmType::Server => {
                copy_with_progress(&assets.server_ignition, &base.join("ignition.json"))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn resize_disk(&self, sup: &Supervisor, tools: &ToolNames, token: &CancellationToken) -> Result<()> {
        let spec = Spec::new(&tools.img_resize, &self.plan.basedir, "resize")
            .arg("resize")
            .arg(self.plan.basedir.join("os.img").display().to_string())
            .arg(format!("{}G", self.plan.config.disk_gb));
        sup.run(spec, token).await.context("resizing os.img")
    }

    async fn render_eeprom(
        &self,
        sup: &Supervisor,
        assets: &AssetSources,
        tools: &ToolNames,
        token: &CancellationToken,
    ) -> Result<()> {
        let template = std::fs::read_to_string(&assets.onie_eeprom_template)
            .context("reading ONIE EEPROM template")?;

        let vm_id = self.plan.id.expect("virtual switches always have an id");
        let uuid = uuid::Uuid::new_v4();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let rendered = template
            .replace("{{NAME}}", &self.plan.name)
            .replace("{{UUID}}", &uuid.to_string())
            .replace("{{MAC_BASE}}", &format!("{vm_id:02x}"))
            .replace("{{TIMESTAMP}}", &now.to_string())
            .replace("{{IFACE_COUNT}}", &self.plan.interfaces.len().to_string());

        let eeprom_path = self.plan.basedir.join("onie-eeprom.yaml");
        std::fs::write(&eeprom_path, rendered).context("writing rendered ONIE EEPROM config")?;

        let spec = Spec::new(&tools.eeprom_edit, &self.plan.basedir, "eeprom")
            .arg("--config")
            .arg(eeprom_path.display().to_string())
            .arg("--image")
            .arg(self.plan.basedir.join("os.img").display().to_string())
            .arg("--nbd")
            .arg(&assets.nbd_device);
        sup.run(spec, token).await.context("writing ONIE EEPROM into os.img")
    }

    async fn init_tpm(&self, sup: &Supervisor, tools: &ToolNames, token: &CancellationToken) -> Result<()> {
        let tpm_dir = self.plan.basedir.join("tpm");
        std::fs::create_dir_all(&tpm_dir)
            .with_context(|| format!("creating tpm dir {}", tpm_dir.display()))?;

        let vmid_arg = format!("vmid={}", self.plan.name);
        for op in ["createek", "create-ek-cert", "create-platform-cert", "create-spk"] {
            let spec = Spec::new(&tools.swtpm_setup, &self.plan.basedir, format!("tpm-{op}"))
                .arg(format!("--{op}"))
                .arg("--tpm-state")
                .arg(tpm_dir.display().to_string())
                .arg(&vmid_arg);
            sup.run(spec, token).await.with_context(|| format!("swtpm_setup --{op}"))?;
        }
        Ok(())
    }

    /// Run (spec.md §4.2): spawns up to three cooperating tasks into the
    /// caller's supervising `JoinSet`. The caller (the Service Facade) owns
    /// the `JoinSet` so that one shared cancellation token aborts every
    /// VM's tasks together (spec.md §5).
    pub fn spawn_run_tasks(
        self: std::sync::Arc<Self>,
        sup: Supervisor,
        tools: ToolNames,
        installer_archives: InstallerArchives,
        join_set: &mut JoinSet<Result<()>>,
        token: CancellationToken,
    ) {
        if !self.is_runnable() {
            return;
        }

        let runs_tpm_helper = matches!(self.plan.vm_type, VmType::Control | VmType::SwitchVs);

        if runs_tpm_helper {
            let vm = self.clone();
            let sup2 = sup.clone();
            let tools2 = tools.clone();
            let token2 = token.clone();
            join_set.spawn(async move { vm.tpm_helper_task(&sup2, &tools2, &token2).await });
        }

        {
            let vm = self.clone();
            let sup2 = sup.clone();
            let tools2 = tools.clone();
            let token2 = token.clone();
            join_set.spawn(async move { vm.hypervisor_task(&sup2, &tools2, runs_tpm_helper, &token2).await });
        }

        if matches!(self.plan.vm_type, VmType::Control | VmType::Server) {
            let vm = self.clone();
            let sup2 = sup.clone();
            let token2 = token.clone();
            let archives = installer_archives.clone();
            join_set.spawn(async move { vm.installer_task(&sup2, &archives, &token2).await });
        }
    }

    #[instrument(skip_all, fields(vm = %self.plan.name))]
    async fn tpm_helper_task(&self, sup: &Supervisor, tools: &ToolNames, token: &CancellationToken) -> Result<()> {
        let tpm_dir = self.plan.basedir.join("tpm");
        let spec = Spec::new(&tools.swtpm, &self.plan.basedir, "tpm-daemon")
            .arg("socket")
            .arg("--tpmstate")
            .arg(format!("dir={}", tpm_dir.display()))
            .arg("--ctrl")
            .arg(format!("type=unixio,path={}", self.plan.basedir.join("tpm.sock.ctrl").display()))
            .arg("--server")
            .arg(format!("type=unixio,path={}", self.plan.basedir.join("tpm.sock").display()))
            .arg("--pid")
            .arg(format!("file={}", self.plan.basedir.join("tpm.pid").display()))
            .arg("--flags")
            .arg("startup-clear");

        let Some(mut child) = sup.spawn(spec)? else {
            return Ok(());
        };

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    anyhow::bail!("swtpm exited with {status}");
                }
                Ok(())
            }
            _ = token.cancelled() => {
                let _ = child.start_kill();
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(vm = %self.plan.name))]
    async fn hypervisor_task(
        &self,
        sup: &Supervisor,
        tools: &ToolNames,
        has_tpm_helper: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        // short settle delay so the TPM helper's sockets exist before we
        // reference them (spec.md §9 open question: a robust
        // implementation should await tpm.sock's appearance instead).
        tokio::time::sleep(Duration::from_millis(200)).await;

        if has_tpm_helper {
            self.tpm_startup_workaround(sup, tools, token).await?;
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        let args = build_hypervisor_args(&self.plan, has_tpm_helper);
        let spec = Spec::new(&tools.hypervisor, &self.plan.basedir, "hypervisor").args(args);

        let Some(mut child) = sup.spawn(spec)? else {
            return Ok(());
        };

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    anyhow::bail!("hypervisor exited with {status}");
                }
                Ok(())
            }
            _ = token.cancelled() => {
                let _ = child.start_kill();
                Ok(())
            }
        }
    }

    /// Issues a TPM startup command before the hypervisor opens both
    /// sockets directly — otherwise the TPM daemon exits (spec.md §4.2
    /// "Run", hypervisor task).
    async fn tpm_startup_workaround(&self, sup: &Supervisor, tools: &ToolNames, token: &CancellationToken) -> Result<()> {
        let spec = Spec::new(&tools.swtpm, &self.plan.basedir, "tpm-startup")
            .arg("socket")
            .arg("--ctrl")
            .arg(format!("type=unixio,path={}", self.plan.basedir.join("tpm.sock.ctrl").display()))
            .arg("--ctrl-only")
            .arg("startup");
        sup.run(spec, token).await.context("issuing TPM startup command")
    }

    #[instrument(skip_all, fields(vm = %self.plan.name))]
    async fn installer_task(&self, sup: &Supervisor, archives: &InstallerArchives, token: &CancellationToken) -> Result<()> {
        if self.installed.is_set() {
            info!("already installed, skipping");
            return Ok(());
        }

        let is_control = self.plan.vm_type == VmType::Control;
        let archive = if is_control { &archives.control } else { &archives.server };

        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            port: self.plan.ssh_port().expect("installable VMs always have an id"),
            user: "core".to_string(),
            identity_file: archives.identity_file.clone(),
        };

        let result = installer::install(sup, &target, archive, is_control, &self.plan.basedir, token).await;
        match result {
            Ok(()) => {
                self.installed.set()?;
                if is_control {
                    self.apply_post_install_policy(sup, archives, token).await?;
                }
                Ok(())
            }
            Err(e) => {
                // installer errors are logged but not propagated (spec.md
                // §4.2 "Failure semantics") so a failed install doesn't
                // tear down the hypervisor task; the overall timeout is
                // enforced by `token` upstream, not by this function.
                warn!(error = %e, "installer task failed; hypervisor keeps running");
                Ok(())
            }
        }
    }

    /// Honors the control VM's post-install policy (spec.md §4.2, §6).
    /// `ExitAfterInstall` and the hook variants terminate the process
    /// directly from here — documented as a deliberate non-graceful exit,
    /// not a panic or error path.
    async fn apply_post_install_policy(
        &self,
        sup: &Supervisor,
        archives: &InstallerArchives,
        token: &CancellationToken,
    ) -> Result<()> {
        match &archives.post_install {
            PostInstallPolicy::Continue => Ok(()),
            PostInstallPolicy::ExitAfterInstall => {
                info!("post-install policy: exiting after control install");
                std::process::exit(0);
            }
            PostInstallPolicy::RunHookThenExit(hook) => {
                self.run_hook(sup, hook, token).await?;
                info!("post-install policy: hook ran, exiting");
                std::process::exit(0);
            }
            PostInstallPolicy::WaitForSwitchesThenRunHooks(hook) => {
                self.wait_for_switch_markers(&archives.switch_ready_markers, token).await?;
                self.run_hook(sup, hook, token).await?;
                info!("post-install policy: switches ready, hook ran, exiting");
                std::process::exit(0);
            }
        }
    }

    async fn run_hook(&self, sup: &Supervisor, hook: &Path, token: &CancellationToken) -> Result<()> {
        let spec = Spec::new(hook.display().to_string(), &self.plan.basedir, "post-install-hook").echo();
        sup.run(spec, token).await.with_context(|| format!("running post-install hook {}", hook.display()))
    }

    async fn wait_for_switch_markers(&self, markers: &[PathBuf], token: &CancellationToken) -> Result<()> {
        const POLL: Duration = Duration::from_secs(2);
        loop {
            if markers.iter().all(|m| m.is_file()) {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL) => {}
                _ = token.cancelled() => anyhow::bail!("cancelled while waiting for switches to become ready"),
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstallerArchives {
    pub control: PathBuf,
    pub server: PathBuf,
    pub identity_file: Option<PathBuf>,
    /// What to do after the control VM's install succeeds (spec.md §4.2,
    /// §6). Defaults to leaving the lab running.
    pub post_install: PostInstallPolicy,
    /// Ready-marker paths of every switch-vs VM in the plan, consulted by
    /// [`PostInstallPolicy::WaitForSwitchesThenRunHooks`].
    pub switch_ready_markers: Vec<PathBuf>,
}

/// Post-control-install policy options (spec.md §4.2 "Installer task",
/// §6 "Exit codes"): the control install is the one point where the
/// operator may ask vlab to hand off to a hook script and exit instead
/// of running indefinitely.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub enum PostInstallPolicy {
    /// Leave the lab running; Run continues as normal.
    #[default]
    Continue,
    /// Exit the whole process immediately after a successful control
    /// install. Spec.md §6 documents this as a deliberate, non-graceful
    /// shutdown triggered directly from the installer task.
    ExitAfterInstall,
    /// Run the named hook command, then exit the same way.
    RunHookThenExit(PathBuf),
    /// Wait until every switch-vs VM's `ready` marker is set, run the
    /// named hook command, then exit.
    WaitForSwitchesThenRunHooks(PathBuf),
}

fn copy_with_progress(src: &Path, dest: &Path) -> Result<()> {
    let metadata = std::fs::metadata(src)
        .with_context(|| format!("statting asset {}", src.display()))?;
    const PROGRESS_THRESHOLD: u64 = 10 * 1024 * 1024;
    if metadata.len() > PROGRESS_THRESHOLD {
        info!(src = %src.display(), dest = %dest.display(), bytes = metadata.len(), "copying large asset");
    }
    std::fs::copy(src, dest)
        .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
    Ok(())
}

const INTERFACES_PER_BRIDGE: usize = 32;

/// Builds the hypervisor argument vector deterministically from the VM's
/// config and ordered interface list (spec.md §4.2 "Run", hypervisor task).
pub fn build_hypervisor_args(vm: &PlanVm, has_tpm_helper: bool) -> Vec<String> {
    let vm_id = vm.id.unwrap_or(0);
    let mut args = vec![
        "-name".to_string(),
        vm.name.clone(),
        "-uuid".to_string(),
        plan::uuid_for(vm_id),
        "-enable-kvm".to_string(),
        "-m".to_string(),
        format!("{}M", vm.config.ram_mb),
        "-smp".to_string(),
        vm.config.cpu.to_string(),
        "-drive".to_string(),
        format!("file={},format=raw,if=virtio", vm.basedir.join("os.img").display()),
        "-drive".to_string(),
        format!("if=pflash,format=raw,readonly=on,file={}", vm.basedir.join("efi_code.fd").display()),
        "-drive".to_string(),
        format!("if=pflash,format=raw,file={}", vm.basedir.join("efi_vars.fd").display()),
        "-nographic".to_string(),
        "-serial".to_string(),
        format!("unix:{},server,nowait", vm.basedir.join("serial.sock").display()),
        "-monitor".to_string(),
        format!("unix:{},server,nowait", vm.basedir.join("monitor.sock").display()),
        "-qmp".to_string(),
        format!("unix:{},server,nowait", vm.basedir.join("qmp.sock").display()),
        "-pidfile".to_string(),
        vm.basedir.join("hypervisor.pid").display().to_string(),
    ];

    if has_tpm_helper {
        args.push("-chardev".to_string());
        args.push(format!("socket,id=chrtpm,path={}", vm.basedir.join("tpm.sock").display()));
        args.push("-tpmdev".to_string());
        args.push("emulator,id=tpm0,chardev=chrtpm".to_string());
        args.push("-device".to_string());
        args.push("tpm-tis,tpmdev=tpm0".to_string());
    }

    let bridge_count = vm.interfaces.len().div_ceil(INTERFACES_PER_BRIDGE).max(1);
    for bridge_idx in 0..bridge_count {
        args.push("-device".to_string());
        args.push(format!("pci-bridge,id=pci.{bridge_idx},chassis_nr={}", bridge_idx + 1));
    }

    for iface in &vm.interfaces {
        let mac = iface.mac(vm_id);
        let netdev_id = format!("net{}", iface.slot);

        if let Some(pci) = &iface.passthrough {
            args.push("-device".to_string());
            args.push(format!("vfio-pci,host={pci},id=pt{}", iface.slot));
            continue;
        }

        match &iface.netdev {
            Some(Netdev::HostNat(nat)) => {
                let mut desc = format!("user,id={netdev_id}");
                if nat.restrict {
                    desc.push_str(",restrict=on");
                }
                for (host_port, guest_port) in &nat.hostfwd {
                    desc.push_str(&format!(",hostfwd=tcp:0.0.0.0:{host_port}-:{guest_port}"));
                }
                args.push("-netdev".to_string());
                args.push(desc);
                args.push("-device".to_string());
                args.push(format!("virtio-net-pci,netdev={netdev_id},mac={mac}"));
            }
            Some(Netdev::Udp(peer)) => {
                let mut desc = format!("socket,id={netdev_id},udp=127.0.0.1:{}", peer.local_port);
                if let Some(remote_port) = peer.remote_port {
                    desc.push_str(&format!(",localaddr=127.0.0.1:{remote_port}"));
                }
                args.push("-netdev".to_string());
                args.push(desc);
                args.push("-device".to_string());
                args.push(format!("virtio-net-pci,netdev={netdev_id},mac={mac}"));
            }
            None => {
                // empty placeholder slot: still emits a device so the
                // hypervisor's positional device indexing stays stable.
                args.push("-device".to_string());
                args.push(format!("virtio-net-pci,mac={mac}"));
            }
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VMConfig;
    use crate::plan::{HostNat, UdpPeer, VmInterface};
    use std::path::PathBuf;

    fn sample_vm() -> PlanVm {
        PlanVm {
            id: Some(1),
            name: "server-01".to_string(),
            vm_type: VmType::Server,
            config: VMConfig { cpu: 2, ram_mb: 4096, disk_gb: 50 },
            interfaces: vec![
                VmInterface {
                    slot: 0,
                    connection_name: None,
                    netdev: Some(Netdev::HostNat(HostNat { hostfwd: vec![(22001, 22)], restrict: false })),
                    passthrough: None,
                },
                VmInterface {
                    slot: 1,
                    connection_name: Some("conn-1".to_string()),
                    netdev: Some(Netdev::Udp(UdpPeer { local_port: 30101, remote_port: Some(30202) })),
                    passthrough: None,
                },
            ],
            basedir: PathBuf::from("/tmp/vlab/server-01"),
            serial_endpoint: None,
        }
    }

    #[test]
    fn hypervisor_args_include_uuid_and_macs() {
        let vm = sample_vm();
        let args = build_hypervisor_args(&vm, false);
        assert!(args.contains(&plan::uuid_for(1)));
        let joined = args.join(" ");
        assert!(joined.contains("mac=0c:20:12:fe:01:00"));
        assert!(joined.contains("mac=0c:20:12:fe:01:01"));
        assert!(joined.contains("hostfwd=tcp:0.0.0.0:22001-:22"));
        assert!(joined.contains("udp=127.0.0.1:30101"));
        assert!(joined.contains("localaddr=127.0.0.1:30202"));
    }

    #[test]
    fn bridges_scale_with_interface_count() {
        let mut vm = sample_vm();
        vm.interfaces = (0..65)
            .map(|slot| VmInterface { slot, connection_name: None, netdev: None, passthrough: None })
            .collect();
        let joined = build_hypervisor_args(&vm, false).join(" ");
        assert!(joined.contains("chassis_nr=3"));
    }

    #[test]
    fn tpm_devices_only_present_when_helper_runs() {
        let vm = sample_vm();
        let with_tpm = build_hypervisor_args(&vm, true).join(" ");
        let without_tpm = build_hypervisor_args(&vm, false).join(" ");
        assert!(with_tpm.contains("tpm-tis"));
        assert!(!without_tpm.contains("tpm-tis"));
    }

    #[test]
    fn post_install_policy_defaults_to_continue() {
        assert!(matches!(PostInstallPolicy::default(), PostInstallPolicy::Continue));
    }

    #[test]
    fn stage_reflects_markers_and_displays_lowercase() {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("vlab-stage-test-{}-{n}", std::process::id()));
        let mut plan_vm = sample_vm();
        plan_vm.basedir = dir.clone();
        std::fs::create_dir_all(&dir).unwrap();

        let managed = ManagedVm::new(plan_vm.clone());
        assert_eq!(managed.stage().to_string(), "planned");

        std::fs::write(dir.join("ready"), b"").unwrap();
        let managed = ManagedVm::new(plan_vm.clone());
        assert_eq!(managed.stage().to_string(), "prepared");

        std::fs::write(dir.join("installed"), b"").unwrap();
        let managed = ManagedVm::new(plan_vm);
        assert_eq!(managed.stage().to_string(), "installed");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn wait_for_switch_markers_returns_once_all_present() {
        static COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("vlab-switch-markers-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("ready");
        std::fs::write(&marker, b"").unwrap();

        let vm = ManagedVm::new(sample_vm());
        let token = CancellationToken::new();
        vm.wait_for_switch_markers(&[marker], &token).await.unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn wait_for_switch_markers_bails_when_cancelled() {
        let missing = PathBuf::from("/tmp/vlab-switch-markers-never-exists-xyz");
        let vm = ManagedVm::new(sample_vm());
        let token = CancellationToken::new();
        token.cancel();
        let err = vm.wait_for_switch_markers(&[missing], &token).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
