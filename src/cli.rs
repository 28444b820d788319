//! Operator CLI surface (spec.md §4.3), matching `wormhole/src/bin/dctl/main.rs`'s
//! clap derive style.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Profile;

#[derive(Parser)]
#[command(name = "vlab", version, about = "Virtual laboratory orchestrator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Synthesize the VM plan, prepare every VM, and launch the lab.
    Up {
        /// Path to the wiring YAML file.
        wiring: PathBuf,

        /// Sizing profile applied to every VM.
        #[arg(long, value_enum, default_value = "default")]
        profile: Profile,

        /// Directory the lab's per-VM state is rooted under.
        #[arg(long, default_value = ".vlab")]
        lab_dir: PathBuf,

        /// Block outbound traffic from default-server NAT interfaces.
        #[arg(long)]
        restrict_servers: bool,

        /// Terminate any stale vlab VM processes found on the host, then exit.
        #[arg(long)]
        kill_stale_vms: bool,

        /// Log intended commands without executing anything.
        #[arg(long)]
        dry_run: bool,

        /// Directory holding the shared firmware/OS image/installer assets
        /// (os.img, efi_code.fd, efi_vars.fd, ignition-control.json,
        /// ignition-server.json, installer-control.tar.gz,
        /// installer-server.tar.gz, onie-eeprom.yaml.tmpl).
        #[arg(long, default_value = "/usr/share/vlab/assets")]
        assets_dir: PathBuf,

        /// Character NBD device used by the ONIE EEPROM editor.
        #[arg(long, default_value = "/dev/nbd0")]
        nbd_device: String,

        /// SSH identity file used to reach control/server VMs.
        #[arg(long)]
        identity_file: Option<PathBuf>,

        /// Seconds to wait for the control/server installer before aborting the run.
        #[arg(long, default_value_t = 600)]
        install_timeout_secs: u64,

        /// Exit immediately (non-gracefully) once the control install succeeds.
        #[arg(long, conflicts_with_all = ["run_hook", "wait_for_switches_then_run_hooks"])]
        exit_after_install: bool,

        /// Run the given hook command after the control install succeeds, then exit.
        #[arg(long)]
        run_hook: Option<PathBuf>,

        /// Wait for every switch to become ready, run the given hook command, then exit.
        #[arg(long, conflicts_with = "run_hook")]
        wait_for_switches_then_run_hooks: Option<PathBuf>,
    },

    /// SSH into a VM (direct, or proxied through the control VM for switch
    /// management IPs).
    Ssh {
        /// VM name; prompted interactively when omitted.
        name: Option<String>,

        #[arg(long, default_value = ".vlab")]
        lab_dir: PathBuf,
    },

    /// Attach to a VM's serial console.
    Serial {
        /// VM name; prompted interactively when omitted.
        name: Option<String>,

        #[arg(long, default_value = ".vlab")]
        lab_dir: PathBuf,
    },

    /// List every VM in the plan with its role, ID, and state.
    List {
        #[arg(long, default_value = ".vlab")]
        lab_dir: PathBuf,
    },

    /// PCI passthrough device management.
    Vfio {
        #[command(subcommand)]
        command: VfioCommand,
    },
}

#[derive(Subcommand)]
pub enum VfioCommand {
    /// Bind every passthrough device named in the plan to vfio-pci.
    Bind {
        #[arg(long, default_value = ".vlab")]
        lab_dir: PathBuf,
    },
}
