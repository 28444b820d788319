//! The external wiring graph: the declarative description of the fabric
//! under test, as produced by the (out-of-scope) wiring builder + hydrator.
//!
//! This module only parses and indexes the graph. It never mutates it and
//! never stores back-references from a [`Connection`] to the devices it
//! names — endpoints are resolved by name against the device index at plan
//! time (see [`crate::plan`]), then the whole thing is frozen.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// One parsed YAML document from the wiring stream. We only care about
/// three of the kinds the builder can emit; everything else (VLAN/IPv4
/// namespaces, Racks) is read and discarded since it carries no information
/// the synthesizer needs.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum WiringDoc {
    Server(ServerDoc),
    Switch(SwitchDoc),
    Connection(ConnectionDoc),
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct ServerDoc {
    metadata: Metadata,
    spec: ServerSpec,
}

#[derive(Debug, Deserialize)]
struct ServerSpec {
    #[serde(default)]
    role: ServerRole,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ServerRole {
    #[default]
    Default,
    Control,
}

#[derive(Debug, Deserialize)]
struct SwitchDoc {
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct ConnectionDoc {
    metadata: Metadata,
    spec: ConnectionSpec,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
}

/// One endpoint of a connection: `device/port`.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub port: String,
}

impl Endpoint {
    pub fn device(&self) -> &str {
        self.port.split('/').next().unwrap_or(&self.port)
    }

    pub fn port_name(&self) -> &str {
        self.port.rsplit('/').next().unwrap_or(&self.port)
    }
}

const EXTERNAL_DEST_ANNOTATION: &str = "external.hhfab.fabric.githedgehog.com/dest";

#[derive(Debug, Deserialize)]
struct ConnectionSpec {
    #[serde(default)]
    unbundled: Option<UnbundledSpec>,
    #[serde(default)]
    bundled: Option<BundledSpec>,
    #[serde(default)]
    management: Option<UnbundledSpec>,
    #[serde(default)]
    mclag: Option<BundledSpec>,
    #[serde(default)]
    mclag_domain: Option<MclagDomainSpec>,
    #[serde(default)]
    eslag: Option<BundledSpec>,
    #[serde(default)]
    fabric: Option<FabricSpec>,
    #[serde(default)]
    vpc_loopback: Option<BundledSpec>,
    #[serde(default)]
    external: Option<ExternalSpec>,
}

#[derive(Debug, Deserialize)]
struct UnbundledSpec {
    link: LinkPair,
}

#[derive(Debug, Deserialize)]
struct BundledSpec {
    links: Vec<LinkPair>,
}

#[derive(Debug, Deserialize)]
struct MclagDomainSpec {
    peer_links: Vec<LinkPair>,
    session_links: Vec<LinkPair>,
}

#[derive(Debug, Deserialize)]
struct FabricSpec {
    links: Vec<LinkPair>,
}

#[derive(Debug, Deserialize)]
struct ExternalSpec {
    link: ExternalLinkPair,
}

#[derive(Debug, Deserialize)]
struct ExternalLinkPair {
    switch: Endpoint,
    #[serde(default, rename = "annotations")]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct LinkPair {
    pub a: Endpoint,
    pub b: Endpoint,
}

/// One directed endpoint pair produced by expanding a [`ConnectionKind`]:
/// `local` gets an interface bound to `remote` (or to nothing, for a
/// dangling external peer).
#[derive(Debug, Clone)]
pub struct DirectedLink {
    pub connection_name: String,
    pub local: Endpoint,
    pub remote: Option<Endpoint>,
}

#[derive(Debug)]
pub struct Connection {
    pub name: String,
    pub directed: Vec<DirectedLink>,
}

impl ConnectionDoc {
    fn expand(self) -> Result<Connection> {
        let name = self.metadata.name;
        let mut directed = Vec::new();

        let mut push_pair = |pair: LinkPair| {
            directed.push(DirectedLink {
                connection_name: name.clone(),
                local: pair.a.clone(),
                remote: Some(pair.b.clone()),
            });
            directed.push(DirectedLink {
                connection_name: name.clone(),
                local: pair.b,
                remote: Some(pair.a),
            });
        };

        let spec = self.spec;
        if let Some(s) = spec.unbundled {
            push_pair(s.link);
        }
        if let Some(s) = spec.bundled {
            for l in s.links {
                push_pair(l);
            }
        }
        if let Some(s) = spec.management {
            push_pair(s.link);
        }
        if let Some(s) = spec.mclag {
            for l in s.links {
                push_pair(l);
            }
        }
        if let Some(s) = spec.mclag_domain {
            for l in s.peer_links.into_iter().chain(s.session_links) {
                push_pair(l);
            }
        }
        if let Some(s) = spec.eslag {
            for l in s.links {
                push_pair(l);
            }
        }
        if let Some(s) = spec.fabric {
            for l in s.links {
                push_pair(l);
            }
        }
        if let Some(s) = spec.vpc_loopback {
            for l in s.links {
                push_pair(l);
            }
        }
        if let Some(s) = spec.external {
            let dest = s.link.annotations.get(EXTERNAL_DEST_ANNOTATION).cloned();
            directed.push(DirectedLink {
                connection_name: name.clone(),
                local: s.link.switch,
                remote: dest.map(|d| Endpoint { port: d }),
            });
        }

        if directed.is_empty() {
            bail!("connection {name}: no recognized connection kind in spec");
        }

        Ok(Connection { name, directed })
    }
}

/// Per-switch override from the embedded VLAB config block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchKind {
    Vs,
    Hw,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfigEntry {
    #[serde(rename = "type")]
    pub kind: SwitchKind,
    pub serial: Option<String>,
}

/// Per-link override from the embedded VLAB config block, keyed by
/// `device/port`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfigEntry {
    pub pci: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct VlabConfig {
    #[serde(default)]
    pub switches: BTreeMap<String, SwitchConfigEntry>,
    #[serde(default)]
    pub links: BTreeMap<String, LinkConfigEntry>,
    #[serde(default)]
    pub sizing: Option<crate::config::SizingOverrides>,
}

pub struct Wiring {
    pub servers: Vec<(String, ServerRole)>,
    pub switches: Vec<String>,
    pub connections: Vec<Connection>,
    pub vlab_config: VlabConfig,
}

impl Wiring {
    /// Parses a multi-document YAML stream. Unknown document kinds (VLAN
    /// namespaces, IPv4 namespaces, Racks, and anything else the builder
    /// emits) are silently skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading wiring file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut servers = Vec::new();
        let mut switches = Vec::new();
        let mut connections = Vec::new();
        let mut vlab_config = VlabConfig::default();

        for doc in serde_yaml::Deserializer::from_str(raw) {
            let value = serde_yaml::Value::deserialize(doc).context("parsing wiring document")?;
            if value.is_null() {
                continue;
            }

            // the embedded vlab config block is not itself a `kind`-tagged
            // object; it is recognized by a distinguishing top-level key.
            if let Some(mapping) = value.as_mapping() {
                if mapping.contains_key("switches") || mapping.contains_key("links") {
                    vlab_config = serde_yaml::from_value(value)
                        .context("parsing embedded vlab config block")?;
                    continue;
                }
            }

            let doc: WiringDoc =
                serde_yaml::from_value(value).context("parsing wiring document")?;
            match doc {
                WiringDoc::Server(s) => servers.push((s.metadata.name, s.spec.role)),
                WiringDoc::Switch(s) => switches.push(s.metadata.name),
                WiringDoc::Connection(c) => connections.push(c.expand()?),
                WiringDoc::Ignored => {}
            }
        }

        Ok(Wiring {
            servers,
            switches,
            connections,
            vlab_config,
        })
    }
}

/// Decodes a wiring port name into a dense interface slot index (§6).
/// Total function: returns an error naming the offending string for
/// anything it doesn't recognize.
pub fn decode_port_slot(port: &str) -> Result<u32> {
    if port == "Management0" {
        return Ok(0);
    }
    if let Some(rest) = port.strip_prefix("Ethernet") {
        let n: u32 = rest
            .parse()
            .with_context(|| format!("invalid port name {port:?}: bad Ethernet index"))?;
        return Ok(n + 1);
    }
    if let Some(rest) = port.strip_prefix("port") {
        let n: u32 = rest
            .parse()
            .with_context(|| format!("invalid port name {port:?}: bad port index"))?;
        return Ok(n);
    }
    if let Some(rest) = port.strip_prefix("enp2s") {
        let n: u32 = rest
            .parse()
            .with_context(|| format!("invalid port name {port:?}: bad enp2s index"))?;
        return Ok(n);
    }
    bail!("unrecognized port name {port:?}")
}

/// Re-encodes a decoded slot back into one of the canonical port-name forms,
/// used only by the round-trip property test in §8.
#[cfg(test)]
fn encode_port_slot(form: &str, slot: u32) -> String {
    match form {
        "Management0" => "Management0".to_string(),
        "Ethernet" => format!("Ethernet{}", slot.checked_sub(1).expect("slot >= 1")),
        "port" => format!("port{slot}"),
        "enp2s" => format!("enp2s{slot}"),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_forms() {
        assert_eq!(decode_port_slot("Management0").unwrap(), 0);
        assert_eq!(decode_port_slot("Ethernet1").unwrap(), 2);
        assert_eq!(decode_port_slot("Ethernet0").unwrap(), 1);
        assert_eq!(decode_port_slot("port3").unwrap(), 3);
        assert_eq!(decode_port_slot("enp2s5").unwrap(), 5);
    }

    #[test]
    fn rejects_unknown_forms() {
        let err = decode_port_slot("GigE0/1").unwrap_err();
        assert!(err.to_string().contains("GigE0/1"));
    }

    #[test]
    fn port_decoder_round_trips() {
        for (form, slot) in [("Management0", 0), ("Ethernet", 7), ("port", 4), ("enp2s", 9)] {
            let encoded = encode_port_slot(form, slot);
            let decoded = decode_port_slot(&encoded).unwrap();
            let re_encoded = encode_port_slot(form, decoded);
            assert_eq!(decode_port_slot(&re_encoded).unwrap(), decoded);
        }
    }

    #[test]
    fn connection_expands_unbundled_both_directions() {
        let yaml = r#"
kind: Connection
metadata: { name: conn-1 }
spec:
  unbundled:
    link:
      a: { port: server-01/port1 }
      b: { port: leaf-01/Ethernet1 }
"#;
        let doc: WiringDoc = serde_yaml::from_str(yaml).unwrap();
        let WiringDoc::Connection(c) = doc else {
            panic!("expected connection")
        };
        let conn = c.expand().unwrap();
        assert_eq!(conn.directed.len(), 2);
        assert_eq!(conn.directed[0].local.device(), "server-01");
        assert_eq!(conn.directed[1].local.device(), "leaf-01");
    }
}
