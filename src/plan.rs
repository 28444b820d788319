//! Plan Synthesizer (spec.md §4.1): a pure-ish function from the wiring
//! graph + sizing profile to an immutable [`Plan`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

use crate::config::{resolve_shapes, Profile, RoleShapes, VMConfig};
use crate::wiring::{decode_port_slot, ServerRole, SwitchKind, Wiring};

/// Configuration-surface synthesis failures (spec.md §7): reported, never
/// retried. Matched on by `qarax-node`-style callers that care about the
/// specific failure mode; everything else just displays via `anyhow`.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("wiring defines zero control servers; exactly one is required")]
    NoControlServer,
    #[error("wiring defines {0} control servers; exactly one is required")]
    MultipleControlServers(usize),
    #[error("duplicate VM name {0:?}")]
    DuplicateVmName(String),
    #[error("connection {connection:?}: unknown device {device:?}")]
    UnknownDevice { connection: String, device: String },
    #[error("connection {connection:?}: duplicate interface slot {slot} on {device:?}")]
    DuplicateSlot { connection: String, device: String, slot: u32 },
    #[error(
        "connection {connection:?}: {device:?} has a PCI passthrough override but its remote endpoint is not a hardware switch"
    )]
    PciWithoutHwRemote { connection: String, device: String },
    #[error("connection {connection:?}: {device:?} links to a hardware switch without a configured PCI address")]
    HwLinkWithoutPci { connection: String, device: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Control,
    Server,
    SwitchVs,
    SwitchHw,
}

/// A host-NAT backend, present on slot 0 of control and server VMs.
#[derive(Debug, Clone)]
pub struct HostNat {
    /// `(host_port, guest_port)` TCP forwards.
    pub hostfwd: Vec<(u16, u16)>,
    /// Blocks outbound traffic from the guest when true (default servers
    /// only, see spec.md §4.1 step 2).
    pub restrict: bool,
}

/// A UDP-socket peer backend realizing a point-to-point link to another
/// VM's interface.
#[derive(Debug, Clone)]
pub struct UdpPeer {
    pub local_port: u32,
    /// Absent when the remote endpoint is a hardware-switch placeholder or
    /// an unmodeled external peer (spec.md §4.1 step 4, §9 Open Question).
    pub remote_port: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum Netdev {
    HostNat(HostNat),
    Udp(UdpPeer),
}

#[derive(Debug, Clone)]
pub struct VmInterface {
    pub slot: u32,
    pub connection_name: Option<String>,
    pub netdev: Option<Netdev>,
    pub passthrough: Option<String>,
}

impl VmInterface {
    fn empty(slot: u32) -> Self {
        VmInterface {
            slot,
            connection_name: None,
            netdev: None,
            passthrough: None,
        }
    }

    pub fn mac(&self, vm_id: u32) -> String {
        mac_for(vm_id, self.slot)
    }
}

#[derive(Debug, Clone)]
pub struct Vm {
    pub id: Option<u32>,
    pub name: String,
    pub vm_type: VmType,
    pub config: VMConfig,
    pub interfaces: Vec<VmInterface>,
    pub basedir: PathBuf,
    pub serial_endpoint: Option<String>,
}

impl Vm {
    pub fn uuid(&self) -> Option<String> {
        self.id.map(uuid_for)
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.id.map(|id| 22000 + id as u16)
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }
}

/// `00000000-0000-0000-0000-{id:012}` — spec.md §3.
pub fn uuid_for(vm_id: u32) -> String {
    format!("00000000-0000-0000-0000-{vm_id:012}")
}

/// `0c:20:12:fe:{vm_id:02x}:{slot:02x}` — spec.md §3.
pub fn mac_for(vm_id: u32, slot: u32) -> String {
    format!("0c:20:12:fe:{vm_id:02x}:{slot:02x}")
}

/// `30000 + vm_id*100 + slot` — spec.md §3.
pub fn interface_udp_port(vm_id: u32, slot: u32) -> u32 {
    30000 + vm_id * 100 + slot
}

/// spec.md §3 prose reads "Kubernetes API at 6443→21443", but scenario 1
/// in §8 (marked literal) pins the control VM's interface-0 netdev to
/// `hostfwd=tcp:0.0.0.0:6443-:6443` — host and guest port identical, no
/// 21443 remap. The literal scenario is the authoritative behavioral
/// contract (§8 is "Testable Properties"/"End-to-end scenarios"), so the
/// host port matches the guest port here.
pub const CONTROL_API_HOST_PORT: u16 = 6443;
pub const CONTROL_API_GUEST_PORT: u16 = 6443;
pub const CONTROL_REGISTRY_PORT: u16 = 31000;

pub struct Plan {
    pub vms: BTreeMap<String, Vm>,
    /// Stable iteration order by VM ID then slot (§8 determinism).
    pub order: Vec<String>,
}

impl Plan {
    pub fn get(&self, name: &str) -> Option<&Vm> {
        self.vms.get(name)
    }

    pub fn in_order(&self) -> impl Iterator<Item = &Vm> {
        self.order.iter().map(move |n| &self.vms[n])
    }
}

pub struct SynthesisInput<'a> {
    pub wiring: &'a Wiring,
    pub profile: Profile,
    pub restrict_default_servers: bool,
    pub lab_basedir: &'a Path,
}

/// Runs the full algorithm of spec.md §4.1. All-or-nothing: any validation
/// error aborts with no partial plan returned.
pub fn synthesize(input: SynthesisInput) -> Result<Plan> {
    let shapes = resolve_shapes(input.profile, input.wiring.vlab_config.sizing.as_ref());

    let mut vms: BTreeMap<String, Vm> = BTreeMap::new();
    let mut next_id: u32 = 0;

    assign_servers(input.wiring, &shapes, input.restrict_default_servers, input.lab_basedir, &mut vms, &mut next_id)?;
    assign_switches(input.wiring, &shapes, input.lab_basedir, &mut vms, &mut next_id)?;
    expand_connections(input.wiring, &mut vms)?;
    fill_interface_gaps(&mut vms);

    let mut order: Vec<String> = vms.keys().cloned().collect();
    order.sort_by_key(|name| {
        let vm = &vms[name];
        (vm.id.unwrap_or(u32::MAX), name.clone())
    });

    Ok(Plan { vms, order })
}

fn assign_servers(
    wiring: &Wiring,
    shapes: &RoleShapes,
    restrict_default_servers: bool,
    lab_basedir: &Path,
    vms: &mut BTreeMap<String, Vm>,
    next_id: &mut u32,
) -> Result<()> {
    let control_count = wiring.servers.iter().filter(|(_, r)| *r == ServerRole::Control).count();
    if control_count == 0 {
        return Err(SynthesisError::NoControlServer.into());
    }
    if control_count > 1 {
        return Err(SynthesisError::MultipleControlServers(control_count).into());
    }

    for (name, role) in &wiring.servers {
        if *role != ServerRole::Control {
            continue;
        }
        let id = *next_id;
        *next_id += 1;
        let netdev = HostNat {
            hostfwd: vec![
                (id as u16 + 22000, 22),
                (CONTROL_API_HOST_PORT, CONTROL_API_GUEST_PORT),
                (CONTROL_REGISTRY_PORT as u16, CONTROL_REGISTRY_PORT as u16),
            ],
            restrict: false,
        };
        insert_vm(vms, name.clone(), Some(id), VmType::Control, shapes.control, lab_basedir, netdev)?;
    }

    for (name, role) in &wiring.servers {
        if *role != ServerRole::Default {
            continue;
        }
        let id = *next_id;
        *next_id += 1;
        let netdev = HostNat {
            hostfwd: vec![(id as u16 + 22000, 22)],
            restrict: restrict_default_servers,
        };
        insert_vm(vms, name.clone(), Some(id), VmType::Server, shapes.server, lab_basedir, netdev)?;
    }

    Ok(())
}

fn insert_vm(
    vms: &mut BTreeMap<String, Vm>,
    name: String,
    id: Option<u32>,
    vm_type: VmType,
    config: VMConfig,
    lab_basedir: &Path,
    netdev: HostNat,
) -> Result<()> {
    if vms.contains_key(&name) {
        return Err(SynthesisError::DuplicateVmName(name).into());
    }
    let basedir = lab_basedir.join(&name);
    let mut vm = Vm {
        id,
        name: name.clone(),
        vm_type,
        config,
        interfaces: Vec::new(),
        basedir,
        serial_endpoint: None,
    };
    vm.interfaces.push(VmInterface {
        slot: 0,
        connection_name: None,
        netdev: Some(Netdev::HostNat(netdev)),
        passthrough: None,
    });
    vms.insert(name, vm);
    Ok(())
}

fn assign_switches(
    wiring: &Wiring,
    shapes: &RoleShapes,
    lab_basedir: &Path,
    vms: &mut BTreeMap<String, Vm>,
    next_id: &mut u32,
) -> Result<()> {
    for name in &wiring.switches {
        if vms.contains_key(name) {
            return Err(SynthesisError::DuplicateVmName(name.clone()).into());
        }
        let entry = wiring.vlab_config.switches.get(name);
        let is_hw = matches!(entry.map(|e| &e.kind), Some(SwitchKind::Hw));

        if is_hw {
            let serial = entry.and_then(|e| e.serial.clone());
            vms.insert(
                name.clone(),
                Vm {
                    id: None,
                    name: name.clone(),
                    vm_type: VmType::SwitchHw,
                    config: VMConfig::default(),
                    interfaces: Vec::new(),
                    basedir: lab_basedir.join(name),
                    serial_endpoint: serial,
                },
            );
        } else {
            let id = *next_id;
            *next_id += 1;
            vms.insert(
                name.clone(),
                Vm {
                    id: Some(id),
                    name: name.clone(),
                    vm_type: VmType::SwitchVs,
                    config: shapes.switch,
                    interfaces: Vec::new(),
                    basedir: lab_basedir.join(name),
                    serial_endpoint: None,
                },
            );
        }
    }
    Ok(())
}

fn expand_connections(wiring: &Wiring, vms: &mut BTreeMap<String, Vm>) -> Result<()> {
    for conn in &wiring.connections {
        for link in &conn.directed {
            let local_device = link.local.device();
            let local_slot = decode_port_slot(link.local.port_name())
                .with_context(|| format!("connection {:?}", conn.name))?;

            let remote_is_hw = link
                .remote
                .as_ref()
                .map(|r| {
                    vms.get(r.device())
                        .map(|v| v.vm_type == VmType::SwitchHw)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            // spec.md §6 + scenario 3 (§8): per-link PCI overrides are
            // keyed on the hardware-switch endpoint's `device/port`
            // (`leaf-hw/Ethernet1`), not the local (server) endpoint's.
            let link_key = if remote_is_hw {
                let remote = link.remote.as_ref().expect("remote_is_hw implies a remote endpoint");
                format!("{}/{}", remote.device(), remote.port_name())
            } else {
                format!("{}/{}", local_device, link.local.port_name())
            };
            let pci_override = wiring.vlab_config.links.get(&link_key);

            let Some(local_vm) = vms.get_mut(local_device) else {
                return Err(SynthesisError::UnknownDevice {
                    connection: conn.name.clone(),
                    device: local_device.to_string(),
                }
                .into());
            };

            if local_vm.vm_type == VmType::SwitchHw {
                // hardware-switch placeholders own no interfaces; the link
                // is recorded entirely on the other endpoint.
                continue;
            }

            if local_vm.interfaces.iter().any(|i| i.slot == local_slot) {
                return Err(SynthesisError::DuplicateSlot {
                    connection: conn.name.clone(),
                    device: local_device.to_string(),
                    slot: local_slot,
                }
                .into());
            }

            let interface = if let Some(pci) = pci_override {
                if !remote_is_hw {
                    return Err(SynthesisError::PciWithoutHwRemote {
                        connection: conn.name.clone(),
                        device: local_device.to_string(),
                    }
                    .into());
                }
                VmInterface {
                    slot: local_slot,
                    connection_name: Some(conn.name.clone()),
                    netdev: None,
                    passthrough: Some(pci.pci.clone()),
                }
            } else {
                if remote_is_hw {
                    return Err(SynthesisError::HwLinkWithoutPci {
                        connection: conn.name.clone(),
                        device: local_device.to_string(),
                    }
                    .into());
                }
                let local_port = interface_udp_port(
                    local_vm.id.expect("non-hardware VM always has an id"),
                    local_slot,
                );
                let remote_port = match &link.remote {
                    Some(remote) if !remote_is_hw => {
                        vms.get(remote.device()).and_then(|r| r.id).map(|remote_id| {
                            let remote_slot =
                                decode_port_slot(remote.port_name()).unwrap_or(local_slot);
                            interface_udp_port(remote_id, remote_slot)
                        })
                    }
                    _ => None,
                };
                VmInterface {
                    slot: local_slot,
                    connection_name: Some(conn.name.clone()),
                    netdev: Some(Netdev::Udp(UdpPeer { local_port, remote_port })),
                    passthrough: None,
                }
            };

            local_vm.interfaces.push(interface);
        }
    }
    Ok(())
}

fn fill_interface_gaps(vms: &mut BTreeMap<String, Vm>) {
    for vm in vms.values_mut() {
        let max_slot = vm.interfaces.iter().map(|i| i.slot).max();
        let Some(max_slot) = max_slot else { continue };
        let mut by_slot: BTreeMap<u32, VmInterface> =
            vm.interfaces.drain(..).map(|i| (i.slot, i)).collect();
        for slot in 0..=max_slot {
            by_slot.entry(slot).or_insert_with(|| VmInterface::empty(slot));
        }
        vm.interfaces = by_slot.into_values().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wiring::Wiring;
    use std::path::PathBuf;

    fn plan_from(yaml: &str) -> Result<Plan> {
        let wiring = Wiring::parse(yaml)?;
        synthesize(SynthesisInput {
            wiring: &wiring,
            profile: Profile::Default,
            restrict_default_servers: false,
            lab_basedir: &PathBuf::from("/tmp/vlab-test"),
        })
    }

    const SCENARIO_1: &str = r#"
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
---
kind: Switch
metadata: { name: leaf-02 }
---
kind: Connection
metadata: { name: conn-1 }
spec:
  unbundled:
    link:
      a: { port: server-01/port1 }
      b: { port: leaf-01/Ethernet1 }
"#;

    #[test]
    fn scenario_one_assigns_ids_in_order() {
        let plan = plan_from(SCENARIO_1).unwrap();
        assert_eq!(plan.get("control-1").unwrap().id, Some(0));
        assert_eq!(plan.get("server-01").unwrap().id, Some(1));
        assert_eq!(plan.get("leaf-01").unwrap().id, Some(2));
        assert_eq!(plan.get("leaf-02").unwrap().id, Some(3));
    }

    #[test]
    fn scenario_one_control_hostfwd() {
        let plan = plan_from(SCENARIO_1).unwrap();
        let control = plan.get("control-1").unwrap();
        let Netdev::HostNat(nat) = control.interfaces[0].netdev.as_ref().unwrap() else {
            panic!("expected host-nat")
        };
        assert_eq!(nat.hostfwd, vec![(22000, 22), (6443, 6443), (31000, 31000)]);
    }

    #[test]
    fn scenario_one_server_udp_pair() {
        let plan = plan_from(SCENARIO_1).unwrap();
        let server = plan.get("server-01").unwrap();
        let leaf = plan.get("leaf-01").unwrap();

        let server_iface = server.interfaces.iter().find(|i| i.slot == 1).unwrap();
        let Netdev::Udp(peer) = server_iface.netdev.as_ref().unwrap() else {
            panic!("expected udp netdev")
        };
        assert_eq!(peer.local_port, 30101);
        assert_eq!(peer.remote_port, Some(30202));

        let leaf_iface = leaf.interfaces.iter().find(|i| i.slot == 2).unwrap();
        let Netdev::Udp(peer) = leaf_iface.netdev.as_ref().unwrap() else {
            panic!("expected udp netdev")
        };
        assert_eq!(peer.local_port, 30202);
        assert_eq!(peer.remote_port, Some(30101));

        assert_eq!(mac_for(leaf.id.unwrap(), 2), "0c:20:12:fe:02:02");
    }

    #[test]
    fn scenario_one_is_deterministic() {
        let a = plan_from(SCENARIO_1).unwrap();
        let b = plan_from(SCENARIO_1).unwrap();
        assert_eq!(a.order, b.order);
        for name in &a.order {
            assert_eq!(a.get(name).unwrap().id, b.get(name).unwrap().id);
        }
    }

    #[test]
    fn no_interface_slot_gaps() {
        let yaml = r#"
kind: Server
metadata: { name: control-1 }
spec: { role: control }
---
kind: Server
metadata: { name: s-01 }
spec: { role: default }
---
kind: Switch
metadata: { name: leaf-01 }
---
kind: Switch
metadata: { name: leaf-02 }
---
kind: Connection
metadata: { name: mclag-1 }
spec:
  mclag:
    links:
      - a: { port: s-01/port1 }
        b: { port: leaf-01/Ethernet1 }
      - a: { port: s-01/port2 }
        b: { port: leaf-02/Ethernet1 }
"#;
        let plan = plan_from(yaml).unwrap();
        let leaf1 = plan.get("leaf-01").unwrap();
        let slots: Vec<u32> = leaf1.interfaces.iter().map(|i| i.slot).collect();
        assert_eq!(slots, vec![0, 2]);
        assert!(leaf1.interfaces[0].netdev.is_none());
        assert!(leaf1.interfaces[0].passthrough.is_none());
    }

    #[test]
    fn hardware_switch_passthrough() {
        let yaml = r#"
kind: Server
metadata: { name: control-1 }
spec: { role: control }
---
kind: Server
metadata: { name: server-01 }
spec: { role: default }
---
switches:
  leaf-hw:
    type: hw
links:
  leaf-hw/Ethernet1:
    pci: "0000:03:00.1"
---
kind: Switch
metadata: { name: leaf-hw }
---
kind: Connection
metadata: { name: conn-1 }
spec:
  unbundled:
    link:
      a: { port: server-01/port1 }
      b: { port: leaf-hw/Ethernet1 }
"#;
        let plan = plan_from(yaml).unwrap();
        let hw = plan.get("leaf-hw").unwrap();
        assert_eq!(hw.vm_type, VmType::SwitchHw);
        assert!(hw.id.is_none());
        assert!(hw.interfaces.is_empty());

        let server = plan.get("server-01").unwrap();
        let iface = server.interfaces.iter().find(|i| i.slot == 1).unwrap();
        assert_eq!(iface.passthrough.as_deref(), Some("0000:03:00.1"));
        assert!(iface.netdev.is_none());
    }

    #[test]
    fn zero_control_servers_is_an_error() {
        let yaml = r#"
kind: Server
metadata: { name: server-01 }
spec: { role: default }
"#;
        let err = plan_from(yaml).unwrap_err();
        assert!(err.to_string().contains("zero control servers"));
        assert!(matches!(
            err.downcast_ref::<SynthesisError>(),
            Some(SynthesisError::NoControlServer)
        ));
    }

    #[test]
    fn two_control_servers_is_an_error() {
        let yaml = r#"
kind: Server
metadata: { name: control-1 }
spec: { role: control }
---
kind: Server
metadata: { name: control-2 }
spec: { role: control }
"#;
        let err = plan_from(yaml).unwrap_err();
        assert!(err.to_string().contains("2 control servers"));
    }

    #[test]
    fn rejects_unknown_port_name() {
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
---
kind: Connection
metadata: { name: conn-bad }
spec:
  unbundled:
    link:
      a: { port: server-01/GigE0-1 }
      b: { port: leaf-01/Ethernet1 }
"#;
        let err = plan_from(yaml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("conn-bad"));
        assert!(msg.contains("GigE0-1"));
    }

    #[test]
    fn uuid_length_and_format() {
        assert_eq!(uuid_for(3).len(), 36);
        assert_eq!(uuid_for(3), "00000000-0000-0000-0000-000000000003");
        assert!(uuid_for(3).starts_with(crate::UUID_RESERVED_PREFIX));
    }
}
