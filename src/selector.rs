//! Interactive Selector (spec.md §2 component 8): a terminal picker for
//! choosing a VM for SSH/serial, with role-aware filtering.

use anyhow::{bail, Context, Result};
use dialoguer::Select;

use crate::plan::{Plan, VmType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFilter {
    Any,
    SshCapable,
    SerialCapable,
}

impl RoleFilter {
    fn accepts(&self, vm_type: VmType) -> bool {
        match self {
            // every VM type exposes a serial console: socat to
            // serial.sock for virtual VMs, telnet to the configured
            // host:port for hardware-switch placeholders.
            RoleFilter::Any | RoleFilter::SerialCapable => true,
            RoleFilter::SshCapable => matches!(vm_type, VmType::Control | VmType::Server),
        }
    }
}

/// Picks one VM name from the plan. When `preselected` names a VM it is
/// used directly (non-interactively) as long as it passes `filter`;
/// otherwise the operator is prompted.
pub fn select_vm(plan: &Plan, preselected: Option<&str>, filter: RoleFilter) -> Result<String> {
    let candidates: Vec<&String> = plan
        .order
        .iter()
        .filter(|name| filter.accepts(plan.vms[*name].vm_type))
        .collect();

    if candidates.is_empty() {
        bail!("no VMs in this lab match the requested filter");
    }

    if let Some(name) = preselected {
        if !candidates.iter().any(|c| c.as_str() == name) {
            bail!("{name:?} is not a valid target for this operation");
        }
        return Ok(name.to_string());
    }

    let labels: Vec<String> = candidates
        .iter()
        .map(|name| {
            let vm = &plan.vms[*name];
            match vm.id {
                Some(id) => format!("{name} (id {id})"),
                None => format!("{name} (hardware switch)"),
            }
        })
        .collect();

    let selection = Select::new()
        .with_prompt("Select a VM")
        .items(&labels)
        .default(0)
        .interact()
        .context("reading interactive selection")?;

    Ok(candidates[selection].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{SynthesisInput, synthesize};
    use crate::config::Profile;
    use crate::wiring::Wiring;
    use std::path::PathBuf;

    fn sample_plan() -> Plan {
        let yaml = r#"
kind: Server
metadata: { name: control-1 }
spec: { role: control }
---
kind: Server
metadata: { name: server-01 }
spec: { role: default }
---
kind: Switch
metadata: { name: leaf-01 }
"#;
        let wiring = Wiring::parse(yaml).unwrap();
        synthesize(SynthesisInput {
            wiring: &wiring,
            profile: Profile::Default,
            restrict_default_servers: false,
            lab_basedir: &PathBuf::from("/tmp/vlab-selector-test"),
        })
        .unwrap()
    }

    #[test]
    fn preselected_name_is_used_when_valid() {
        let plan = sample_plan();
        let name = select_vm(&plan, Some("server-01"), RoleFilter::SshCapable).unwrap();
        assert_eq!(name, "server-01");
    }

    #[test]
    fn preselected_name_rejected_when_filtered_out() {
        let plan = sample_plan();
        let err = select_vm(&plan, Some("leaf-01"), RoleFilter::SshCapable).unwrap_err();
        assert!(err.to_string().contains("leaf-01"));
    }
}
