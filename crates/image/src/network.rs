//! Static network identity for a node image.
//!
//! Images that ship `/etc/netplan` get a netplan document; older ones get an
//! ifupdown `interfaces` file. Both get `/etc/hostname` and `/etc/hosts`.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use {
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    backend::Backend,
    error::{Error, Result},
    job::is_hostname_label,
    mutation::MutationPlanner,
};

const NETPLAN_DIR: &str = "etc/netplan";
const NETPLAN_DEFAULT: &str = "01-netcfg.yaml";
const INTERFACES: &str = "etc/network/interfaces";
const HOSTNAME: &str = "etc/hostname";
const HOSTS: &str = "etc/hosts";
const INTERFACE: &str = "eth0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub hostname: String,
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFamily {
    /// netplan + systemd-networkd
    Modern,
    /// ifupdown
    Legacy,
}

/// Dotted netmask for the supported prefix lengths.
pub fn netmask_for_prefix(prefix: u8) -> Result<Ipv4Addr> {
    match prefix {
        8 => Ok(Ipv4Addr::new(255, 0, 0, 0)),
        16 => Ok(Ipv4Addr::new(255, 255, 0, 0)),
        24 => Ok(Ipv4Addr::new(255, 255, 255, 0)),
        other => Err(Error::UnsupportedPrefix(other)),
    }
}

#[derive(Serialize)]
struct NetplanDoc {
    network: Netplan,
}

#[derive(Serialize)]
struct Netplan {
    version: u8,
    renderer: &'static str,
    ethernets: BTreeMap<&'static str, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    dhcp4: bool,
    addresses: Vec<String>,
    gateway4: String,
    nameservers: Nameservers,
}

#[derive(Serialize)]
struct Nameservers {
    addresses: Vec<String>,
}

pub fn render_netplan(id: &NetworkIdentity) -> Result<String> {
    let doc = NetplanDoc {
        network: Netplan {
            version: 2,
            renderer: "networkd",
            ethernets: BTreeMap::from([(INTERFACE, Ethernet {
                dhcp4: false,
                addresses: vec![format!("{}/{}", id.address, id.prefix)],
                gateway4: id.gateway.to_string(),
                nameservers: Nameservers {
                    addresses: id.dns.iter().map(ToString::to_string).collect(),
                },
            })]),
        },
    };
    serde_yaml::to_string(&doc).map_err(|e| Error::Message(format!("render netplan: {e}")))
}

pub fn render_interfaces(id: &NetworkIdentity) -> Result<String> {
    let netmask = netmask_for_prefix(id.prefix)?;
    let dns = id
        .dns
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    Ok(format!(
        "auto lo\n\
         iface lo inet loopback\n\
         \n\
         auto {INTERFACE}\n\
         iface {INTERFACE} inet static\n    \
         address {}\n    \
         netmask {netmask}\n    \
         gateway {}\n    \
         dns-nameservers {dns}\n",
        id.address, id.gateway,
    ))
}

#[must_use]
pub fn render_hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1 localhost\n\
         127.0.1.1 {hostname}\n\
         \n\
         ::1 localhost ip6-localhost ip6-loopback\n\
         ff02::1 ip6-allnodes\n\
         ff02::2 ip6-allrouters\n"
    )
}

pub async fn detect_family(
    backend: &dyn Backend,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<NetworkFamily> {
    if backend.dir_exists(root, Path::new(NETPLAN_DIR), cancel).await? {
        Ok(NetworkFamily::Modern)
    } else {
        Ok(NetworkFamily::Legacy)
    }
}

/// Existing netplan document to overwrite, else the default name.
async fn netplan_target(
    backend: &dyn Backend,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let mut entries = backend.list_dir(root, Path::new(NETPLAN_DIR), cancel).await?;
    entries.sort();
    let name = entries
        .into_iter()
        .find(|n| n.ends_with(".yaml") || n.ends_with(".yml"))
        .unwrap_or_else(|| NETPLAN_DEFAULT.to_string());
    Ok(Path::new(NETPLAN_DIR).join(name))
}

/// Write the identity into the image mounted at `root`.
///
/// The prefix is checked before anything is written, whichever family the
/// image turns out to be.
pub async fn apply_network_identity(
    backend: &dyn Backend,
    root: &Path,
    id: &NetworkIdentity,
    verify: bool,
    cancel: &CancellationToken,
) -> Result<NetworkFamily> {
    netmask_for_prefix(id.prefix)?;
    if !is_hostname_label(&id.hostname) {
        return Err(Error::invalid(format!("{:?} is not a valid hostname", id.hostname)));
    }
    if id.dns.is_empty() {
        return Err(Error::invalid("at least one DNS server is required"));
    }

    let family = detect_family(backend, root, cancel).await?;
    debug!(?family, hostname = %id.hostname, "applying network identity");

    let mut plan = MutationPlanner::new();
    match family {
        NetworkFamily::Modern => {
            let target = netplan_target(backend, root, cancel).await?;
            plan.write(target, render_netplan(id)?, 0o600);
        },
        NetworkFamily::Legacy => {
            plan.write(INTERFACES, render_interfaces(id)?, 0o644);
        },
    }
    plan.write(HOSTNAME, format!("{}\n", id.hostname), 0o644)
        .write(HOSTS, render_hosts(&id.hostname), 0o644);

    backend
        .apply_mutations(root, plan.operations(), verify, cancel)
        .await?;
    info!(?family, hostname = %id.hostname, address = %id.address, prefix = id.prefix, "network identity applied");
    Ok(family)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    fn identity(prefix: u8) -> NetworkIdentity {
        NetworkIdentity {
            hostname: "node2".into(),
            address: Ipv4Addr::new(10, 0, 0, 12),
            prefix,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            dns: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
        }
    }

    #[rstest]
    #[case(8, "255.0.0.0")]
    #[case(16, "255.255.0.0")]
    #[case(24, "255.255.255.0")]
    fn supported_netmasks(#[case] prefix: u8, #[case] mask: &str) {
        assert_eq!(netmask_for_prefix(prefix).unwrap().to_string(), mask);
    }

    #[rstest]
    #[case(0)]
    #[case(20)]
    #[case(23)]
    #[case(32)]
    fn other_prefixes_are_rejected(#[case] prefix: u8) {
        assert!(matches!(
            netmask_for_prefix(prefix),
            Err(Error::UnsupportedPrefix(p)) if p == prefix
        ));
    }

    #[test]
    fn netplan_document_shape() {
        let rendered = render_netplan(&identity(24)).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        let net = &value["network"];
        assert_eq!(net["version"].as_u64(), Some(2));
        assert_eq!(net["renderer"].as_str(), Some("networkd"));
        let eth = &net["ethernets"]["eth0"];
        assert_eq!(eth["dhcp4"].as_bool(), Some(false));
        assert_eq!(eth["addresses"][0].as_str(), Some("10.0.0.12/24"));
        assert_eq!(eth["gateway4"].as_str(), Some("10.0.0.1"));
        assert_eq!(eth["nameservers"]["addresses"][1].as_str(), Some("8.8.8.8"));
    }

    #[test]
    fn interfaces_file_has_both_stanzas() {
        let rendered = render_interfaces(&identity(16)).unwrap();
        assert!(rendered.starts_with("auto lo\niface lo inet loopback\n"));
        assert!(rendered.contains("iface eth0 inet static\n"));
        assert!(rendered.contains("    address 10.0.0.12\n"));
        assert!(rendered.contains("    netmask 255.255.0.0\n"));
        assert!(rendered.contains("    gateway 10.0.0.1\n"));
        assert!(rendered.ends_with("    dns-nameservers 1.1.1.1 8.8.8.8\n"));
    }

    #[test]
    fn hosts_file_maps_hostname() {
        let hosts = render_hosts("node2");
        assert!(hosts.starts_with("127.0.0.1 localhost\n127.0.1.1 node2\n"));
        assert!(hosts.contains("::1 localhost"));
    }
}
