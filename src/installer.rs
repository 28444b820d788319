//! SSH-based post-boot install driver (spec.md §4.2 "Installer task"). The
//! SSH and SCP binaries are explicit out-of-scope external collaborators
//! (spec.md §1) — we drive them through the Process Supervisor exactly as
//! every other external program, never embedding an SSH client library.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::exec::{Spec, Supervisor};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    fn common_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=5".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Polls the guest over SSH (a `hostname` probe) until it responds, bounded
/// by `token`'s cancellation (the overall install timeout, spec.md §5).
pub async fn wait_for_ssh(
    sup: &Supervisor,
    target: &SshTarget,
    log_dir: &Path,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        if token.is_cancelled() {
            anyhow::bail!("timed out waiting for SSH on {}", target.host);
        }

        let spec = Spec::new("ssh", log_dir, "ssh-probe")
            .args(target.common_ssh_args())
            .arg(target.destination())
            .arg("hostname");

        match sup.run(spec, token).await {
            Ok(()) => return Ok(()),
            Err(_) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = token.cancelled() => {
                        anyhow::bail!("timed out waiting for SSH on {}", target.host);
                    }
                }
            }
        }
    }
}

/// Uploads `archive_path` to the guest's home directory via `scp`.
pub async fn upload_installer(
    sup: &Supervisor,
    target: &SshTarget,
    archive_path: &Path,
    log_dir: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let mut args = vec!["-P".to_string(), target.port.to_string()];
    if let Some(identity) = &target.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push("-o".to_string());
    args.push("StrictHostKeyChecking=no".to_string());
    args.push(archive_path.display().to_string());
    args.push(format!("{}:~/", target.destination()));

    let spec = Spec::new("scp", log_dir, "scp-upload").args(args);
    sup.run(spec, token).await.context("uploading installer archive")
}

/// Extracts and runs `./hhfab-recipe run` under sudo on the guest (spec.md
/// §4.2).
pub async fn run_remote_install(
    sup: &Supervisor,
    target: &SshTarget,
    archive_name: &str,
    log_dir: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let remote_cmd = format!(
        "tar xzf {archive_name} && sudo ./hhfab-recipe run",
    );
    let spec = Spec::new("ssh", log_dir, "ssh-install")
        .args(target.common_ssh_args())
        .arg(target.destination())
        .arg(remote_cmd)
        .echo();

    sup.run(spec, token).await.context("running remote installer")
}

/// Downloads `/etc/rancher/k3s/k3s.yaml` from the control VM to
/// `{basedir}/kubeconfig.yaml` (spec.md §4.2, control only).
pub async fn fetch_kubeconfig(
    sup: &Supervisor,
    target: &SshTarget,
    dest: &Path,
    log_dir: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let mut args = vec!["-P".to_string(), target.port.to_string()];
    if let Some(identity) = &target.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push("-o".to_string());
    args.push("StrictHostKeyChecking=no".to_string());
    args.push(format!("{}:/etc/rancher/k3s/k3s.yaml", target.destination()));
    args.push(dest.display().to_string());

    let spec = Spec::new("scp", log_dir, "scp-kubeconfig").args(args);
    sup.run(spec, token).await.context("fetching kubeconfig")
}

/// Full installer task for one control/server VM (spec.md §4.2 "Installer
/// task"). Errors are logged as a warning and returned to the caller, which
/// is responsible for treating them as non-fatal (except for the overall
/// timeout, which the caller enforces via `token`).
pub async fn install(
    sup: &Supervisor,
    target: &SshTarget,
    archive_path: &Path,
    is_control: bool,
    basedir: &Path,
    token: &CancellationToken,
) -> Result<()> {
    info!(host = %target.host, "waiting for guest to accept SSH");
    if let Err(e) = wait_for_ssh(sup, target, basedir, token).await {
        warn!(error = %e, "installer: guest never became reachable over SSH");
        return Err(e);
    }

    let archive_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "installer.tar.gz".to_string());

    upload_installer(sup, target, archive_path, basedir, token).await?;
    run_remote_install(sup, target, &archive_name, basedir, token).await?;

    if is_control {
        fetch_kubeconfig(sup, target, &basedir.join("kubeconfig.yaml"), basedir, token).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_ssh_args_include_port_and_identity() {
        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            port: 22001,
            user: "core".to_string(),
            identity_file: Some(PathBuf::from("/tmp/id_ed25519")),
        };
        let args = target.common_ssh_args();
        assert!(args.contains(&"22001".to_string()));
        assert!(args.contains(&"/tmp/id_ed25519".to_string()));
        assert_eq!(target.destination(), "core@127.0.0.1");
    }
}
