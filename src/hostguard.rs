//! Host Guard (spec.md §4.4, §4.3's `VFIOPCIBindAll`): safe coexistence
//! with the host OS — stale-VM detection by process command-line
//! signature, PCI→VFIO binding/verification, and external-tool presence
//! checks.
//!
//! The process-table walk is grounded in `wormhole/src/bin/wormhole-attach/proc.rs`'s
//! `iter_pids_from_dirfd`, generalized from "find my own children" to "find
//! any process whose argv matches the vlab hypervisor signature".

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::UUID_RESERVED_PREFIX;

#[derive(Debug, Clone)]
pub struct StaleProcess {
    pub pid: i32,
    pub argv: Vec<String>,
}

/// A process qualifies as a stale vlab-managed VM when its command line
/// begins with the exact tokens `<hypervisor>`, `-name`, `<anything>`,
/// `-uuid`, and the UUID at index 4 starts with the vlab-reserved prefix
/// (spec.md §4.4, §8).
pub fn matches_stale_signature(hypervisor_binary: &str, argv: &[String]) -> bool {
    if argv.len() < 6 {
        return false;
    }
    if argv[0] != hypervisor_binary {
        return false;
    }
    if argv[1] != "-name" {
        return false;
    }
    if argv[3] != "-uuid" {
        return false;
    }
    argv[4].starts_with(UUID_RESERVED_PREFIX)
}

/// Scans `/proc` for processes matching the stale signature. Transient
/// process-disappearance errors (ENOENT, ESRCH) are swallowed, matching
/// spec.md §4.4's "errors like *no such file or directory* on a transient
/// process are swallowed".
pub fn find_stale_vms(hypervisor_binary: &str) -> Result<Vec<StaleProcess>> {
    let mut found = Vec::new();
    let proc_dir = std::fs::read_dir("/proc").context("reading /proc")?;

    for entry in proc_dir {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let Some(pid_str) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Ok(pid) = pid_str.parse::<i32>() else {
            continue;
        };

        match read_cmdline(pid) {
            Ok(argv) => {
                if matches_stale_signature(hypervisor_binary, &argv) {
                    found.push(StaleProcess { pid, argv });
                }
            }
            Err(e) => {
                if is_transient(&e) {
                    continue;
                }
                return Err(e).with_context(|| format!("reading cmdline for pid {pid}"));
            }
        }
    }

    Ok(found)
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
    )
}

fn read_cmdline(pid: i32) -> std::io::Result<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline"))?;
    Ok(raw
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

/// Kills every stale VM found, for `--kill-stale-vms`. spec.md §4.3: after
/// killing, the caller is expected to exit so the operator restarts
/// without the flag.
pub fn kill_stale_vms(procs: &[StaleProcess]) -> Result<()> {
    for p in procs {
        info!(pid = p.pid, "killing stale vlab VM process");
        if let Err(e) = kill(Pid::from_raw(p.pid), Signal::SIGTERM) {
            warn!(pid = p.pid, error = %e, "failed to signal stale VM");
        }
    }
    Ok(())
}

/// Verifies every required external tool is resolvable on PATH (spec.md
/// §4.3 StartServer contract).
pub fn check_tools_present(tools: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    for tool in tools {
        if which::which(tool).is_err() {
            missing.push(*tool);
        }
    }
    if !missing.is_empty() {
        bail!("missing required external tools on PATH: {}", missing.join(", "));
    }
    Ok(())
}

/// The software-TPM setup helper has shipped under two historical
/// layouts across distributions (spec.md §6 "Environment"): an older
/// standalone script, and the newer `swtpm_setup` subcommand form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmConfigHelper {
    LegacyScript(PathBuf),
    SwtpmSetupSubcommand,
}

/// Resolves which of the two layouts is present on this host, preferring
/// the legacy script when both exist since it predates the subcommand
/// form and some distributions still ship only it.
pub fn resolve_tpm_config_helper() -> Result<TpmConfigHelper> {
    const LEGACY_PATH: &str = "/usr/share/swtpm/swtpm-create-user-config-files";
    if Path::new(LEGACY_PATH).is_file() {
        return Ok(TpmConfigHelper::LegacyScript(PathBuf::from(LEGACY_PATH)));
    }
    if which::which("swtpm_setup").is_ok() {
        return Ok(TpmConfigHelper::SwtpmSetupSubcommand);
    }
    bail!("no software-TPM config-file helper found (neither {LEGACY_PATH} nor swtpm_setup on PATH)");
}

/// Builds the one-time argv that materializes the TPM setup's user config
/// files, per whichever layout [`resolve_tpm_config_helper`] found.
pub fn tpm_config_helper_command(helper: &TpmConfigHelper) -> (String, Vec<String>) {
    match helper {
        TpmConfigHelper::LegacyScript(path) => (path.display().to_string(), Vec::new()),
        TpmConfigHelper::SwtpmSetupSubcommand => (
            "swtpm_setup".to_string(),
            vec!["--create-config-files".to_string(), "skip-if-exist".to_string()],
        ),
    }
}

const VFIO_DRIVERS_PATH: &str = "/sys/bus/pci/drivers/vfio-pci";

/// A device is bound iff `/sys/bus/pci/drivers/vfio-pci/{dev}` exists
/// (spec.md §4.4).
pub fn is_vfio_bound(pci_address: &str) -> bool {
    Path::new(VFIO_DRIVERS_PATH).join(pci_address).exists()
}

pub struct VfioBinder {
    sysfs_root: PathBuf,
}

impl Default for VfioBinder {
    fn default() -> Self {
        VfioBinder { sysfs_root: PathBuf::from("/sys/bus/pci/devices") }
    }
}

impl VfioBinder {
    pub fn with_sysfs_root(sysfs_root: impl Into<PathBuf>) -> Self {
        VfioBinder { sysfs_root: sysfs_root.into() }
    }

    fn device_dir(&self, pci_address: &str) -> PathBuf {
        self.sysfs_root.join(pci_address)
    }

    fn read_id(&self, pci_address: &str, file: &str) -> Result<String> {
        let path = self.device_dir(pci_address).join(file);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(raw.trim().trim_start_matches("0x").to_string())
    }

    /// Binds one PCI device to vfio-pci, with up to six retries at 500ms
    /// back-off (spec.md §4.3). Total failure after retries is fatal.
    pub async fn bind(&self, pci_address: &str) -> Result<()> {
        const MAX_ATTEMPTS: u32 = 6;
        const BACKOFF: Duration = Duration::from_millis(500);

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.bind_once(pci_address) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(pci_address, attempt, error = %e, "vfio bind attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(BACKOFF).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("vfio bind failed for {pci_address}"))
            .context(format!("binding {pci_address} to vfio-pci after {MAX_ATTEMPTS} attempts")))
    }

    fn bind_once(&self, pci_address: &str) -> Result<()> {
        let vendor = self.read_id(pci_address, "vendor")?;
        let device = self.read_id(pci_address, "device")?;

        let unbind_path = self.device_dir(pci_address).join("driver/unbind");
        if unbind_path.exists() {
            if let Err(e) = std::fs::write(&unbind_path, pci_address) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e).context("unbinding current driver");
                }
            }
        }

        let new_id_path = Path::new(VFIO_DRIVERS_PATH).join("new_id");
        let id_pair = format!("{vendor} {device}");
        if let Err(e) = std::fs::write(&new_id_path, &id_pair) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e).context("writing vfio-pci new_id");
            }
        }

        let bind_path = Path::new(VFIO_DRIVERS_PATH).join("bind");
        std::fs::write(&bind_path, pci_address).context("writing vfio-pci bind")?;

        if !is_vfio_bound(pci_address) {
            bail!("{pci_address} did not appear under vfio-pci after bind");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_signature_matches_exact_tokens() {
        let argv = vec![
            "qemu-system-x86_64".to_string(),
            "-name".to_string(),
            "leaf-01".to_string(),
            "-uuid".to_string(),
            "00000000-0000-0000-0000-000000000003".to_string(),
            "-nographic".to_string(),
        ];
        assert!(matches_stale_signature("qemu-system-x86_64", &argv));
    }

    #[test]
    fn stale_signature_rejects_wrong_binary() {
        let argv = vec![
            "some-other-binary".to_string(),
            "-name".to_string(),
            "leaf-01".to_string(),
            "-uuid".to_string(),
            "00000000-0000-0000-0000-000000000003".to_string(),
            "-nographic".to_string(),
        ];
        assert!(!matches_stale_signature("qemu-system-x86_64", &argv));
    }

    #[test]
    fn stale_signature_rejects_foreign_uuid() {
        let argv = vec![
            "qemu-system-x86_64".to_string(),
            "-name".to_string(),
            "leaf-01".to_string(),
            "-uuid".to_string(),
            "11111111-2222-3333-4444-555555555555".to_string(),
            "-nographic".to_string(),
        ];
        assert!(!matches_stale_signature("qemu-system-x86_64", &argv));
    }

    #[test]
    fn stale_signature_rejects_too_short() {
        let argv = vec!["qemu-system-x86_64".to_string(), "-name".to_string()];
        assert!(!matches_stale_signature("qemu-system-x86_64", &argv));
    }

    #[test]
    fn stale_signature_rejects_wrong_position() {
        let mut argv = vec![
            "qemu-system-x86_64".to_string(),
            "-name".to_string(),
            "leaf-01".to_string(),
            "-notuuid".to_string(),
            "00000000-0000-0000-0000-000000000003".to_string(),
            "-nographic".to_string(),
        ];
        assert!(!matches_stale_signature("qemu-system-x86_64", &argv));
        argv[3] = "-uuid".to_string();
        assert!(matches_stale_signature("qemu-system-x86_64", &argv));
    }

    #[test]
    fn legacy_script_command_takes_no_arguments() {
        let helper = TpmConfigHelper::LegacyScript(PathBuf::from("/usr/share/swtpm/swtpm-create-user-config-files"));
        let (program, args) = tpm_config_helper_command(&helper);
        assert_eq!(program, "/usr/share/swtpm/swtpm-create-user-config-files");
        assert!(args.is_empty());
    }

    #[test]
    fn subcommand_form_passes_skip_if_exist() {
        let (program, args) = tpm_config_helper_command(&TpmConfigHelper::SwtpmSetupSubcommand);
        assert_eq!(program, "swtpm_setup");
        assert_eq!(args, vec!["--create-config-files", "skip-if-exist"]);
    }
}
