//! Process Supervisor (spec.md §4.5): a single entrypoint for every
//! external command vlab runs, whether that's a one-shot helper (resize,
//! EEPROM edit, VFIO sysfs write) or a long-lived child the caller holds
//! onto (the hypervisor, the software-TPM daemon).
//!
//! Every invocation: resolves the binary, inherits the process environment
//! plus an explicit overlay, opens a per-invocation append-mode log file,
//! and fans stdout/stderr out to {log file, caller-optional console}.
//! Dry-run mode logs the intended command and returns success without
//! executing, mirroring `wormhole`'s preference for `tokio::process::Command`
//! over hand-rolled process spawning (`wormhole/src/bin/server/main.rs`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace};

#[derive(Debug, Clone, Default)]
pub struct Spec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Directory the per-invocation log file is written under. Falls back
    /// to the lab root when no per-VM basedir applies (§4.5).
    pub log_dir: PathBuf,
    pub log_name: String,
    pub echo_to_console: bool,
}

impl Spec {
    pub fn new(program: impl Into<String>, log_dir: impl Into<PathBuf>, log_name: impl Into<String>) -> Self {
        Spec {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            log_dir: log_dir.into(),
            log_name: log_name.into(),
            echo_to_console: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn echo(mut self) -> Self {
        self.echo_to_console = true;
        self
    }

    fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("exec-{}.log", self.log_name))
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone)]
pub struct Supervisor {
    dry_run: bool,
}

impl Supervisor {
    pub fn new(dry_run: bool) -> Self {
        Supervisor { dry_run }
    }

    fn open_log(&self, spec: &Spec) -> Result<std::fs::File> {
        std::fs::create_dir_all(&spec.log_dir)
            .with_context(|| format!("creating log directory {}", spec.log_dir.display()))?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.log_path())
            .with_context(|| format!("opening log file {}", spec.log_path().display()))
    }

    fn build_command(&self, spec: &Spec) -> Result<Command> {
        which::which(&spec.program)
            .with_context(|| format!("resolving external tool {:?} on PATH", spec.program))?;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        Ok(cmd)
    }

    /// Runs a command to completion, waiting for exit. Used for the short,
    /// bounded operations in Prepare (copy/resize/EEPROM edit) and in the
    /// VFIO binder.
    pub async fn run(&self, spec: Spec, token: &tokio_util::sync::CancellationToken) -> Result<()> {
        let mut log_file = self.open_log(&spec)?;
        use std::io::Write as _;
        writeln!(log_file, "+ {}", spec.command_line())?;

        if self.dry_run {
            info!(cmd = %spec.command_line(), "dry-run: not executing");
            return Ok(());
        }

        let mut cmd = self.build_command(&spec)?;
        debug!(cmd = %spec.command_line(), "spawning");
        let mut child = cmd.spawn().with_context(|| format!("spawning {:?}", spec.program))?;

        let status = tokio::select! {
            status = drain_and_wait(&mut child, log_file, spec.echo_to_console) => status?,
            _ = token.cancelled() => {
                let _ = child.start_kill();
                anyhow::bail!("{} cancelled", spec.program);
            }
        };

        if !status.success() {
            anyhow::bail!("{} exited with {status}", spec.program);
        }
        Ok(())
    }

    /// Spawns a long-lived child without waiting for it, for callers (the
    /// hypervisor task, the TPM helper task) that need to hold the handle
    /// and wait on it themselves under the supervising group.
    pub fn spawn(&self, spec: Spec) -> Result<Option<Child>> {
        let mut log_file = self.open_log(&spec)?;
        use std::io::Write as _;
        writeln!(log_file, "+ {}", spec.command_line())?;

        if self.dry_run {
            info!(cmd = %spec.command_line(), "dry-run: not spawning");
            return Ok(None);
        }

        let mut cmd = self.build_command(&spec)?;
        trace!(cmd = %spec.command_line(), "spawning long-lived child");
        let child = cmd.spawn().with_context(|| format!("spawning {:?}", spec.program))?;
        Ok(Some(child))
    }
}

async fn drain_and_wait(
    child: &mut Child,
    mut log_file: std::fs::File,
    echo: bool,
) -> Result<std::process::ExitStatus> {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = out_lines.next_line() => {
                match line? {
                    Some(l) => fan_out(&mut log_file, &l, echo)?,
                    None => break,
                }
            }
            line = err_lines.next_line() => {
                match line? {
                    Some(l) => fan_out(&mut log_file, &l, echo)?,
                    None => {}
                }
            }
        }
    }
    // drain any trailing stderr after stdout closes
    while let Some(l) = err_lines.next_line().await? {
        fan_out(&mut log_file, &l, echo)?;
    }

    Ok(child.wait().await?)
}

fn fan_out(log_file: &mut std::fs::File, line: &str, echo: bool) -> Result<()> {
    use std::io::Write as _;
    writeln!(log_file, "{line}")?;
    if echo {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_does_not_execute_and_logs_intent() {
        let dir = std::env::temp_dir().join(format!("vlab-exec-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let sup = Supervisor::new(true);
        let spec = Spec::new("definitely-not-a-real-binary", &dir, "test").arg("--flag");
        let token = tokio_util::sync::CancellationToken::new();
        sup.run(spec, &token).await.unwrap();

        let log = std::fs::read_to_string(dir.join("exec-test.log")).unwrap();
        assert!(log.contains("definitely-not-a-real-binary --flag"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn unresolvable_binary_errors() {
        let dir = std::env::temp_dir().join(format!("vlab-exec-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let sup = Supervisor::new(false);
        let spec = Spec::new("definitely-not-a-real-binary-xyz", &dir, "test");
        let token = tokio_util::sync::CancellationToken::new();
        let err = sup.run(spec, &token).await.unwrap_err();
        assert!(err.to_string().contains("resolving external tool"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
