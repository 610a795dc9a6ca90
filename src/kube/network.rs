// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Network topology: which network an endpoint lives on, and which gateways reach each network.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use itertools::Itertools;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::model::{ClusterId, Labels, NetworkGateway, NetworkId, Service, label};
use crate::strng::{self, Strng};

/// Port used by network gateways that do not declare one.
pub const DEFAULT_GATEWAY_PORT: u16 = 15443;

/// Mesh-wide network layout.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshNetworks {
    #[serde(default)]
    pub networks: Networks,
}

/// Networks keyed by name, kept in declaration order.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Networks(pub Vec<(NetworkId, Network)>);

impl Networks {
    pub fn iter(&self) -> impl Iterator<Item = &(NetworkId, Network)> {
        self.0.iter()
    }
}

impl Serialize for Networks {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, network) in &self.0 {
            map.serialize_entry(name, network)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Networks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NetworksVisitor;

        impl<'de> Visitor<'de> for NetworksVisitor {
            type Value = Networks;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of network name to network")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(access.size_hint().unwrap_or_default());
                while let Some((name, network)) = access.next_entry::<Strng, Network>()? {
                    out.push((name, network));
                }
                Ok(Networks(out))
            }
        }

        deserializer.deserialize_map(NetworksVisitor)
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default)]
    pub endpoints: Vec<NetworkEndpoints>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
}

/// Selects the endpoints belonging to a network, either by address range or by registry.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_registry: Option<ClusterId>,
}

/// A gateway into a network, given by the hostname of a service in this registry or by a fixed
/// address.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_service_name: Option<Strng>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub port: u16,
}

/// NetworkState is the network portion of the registry state. It lives under the registry lock.
#[derive(Default, Debug)]
pub struct NetworkState {
    /// Network given by the system namespace label.
    pub default_network: NetworkId,
    /// Network the mesh networks config assigns to this registry as a whole.
    pub network_for_registry: NetworkId,
    cidrs: Vec<(IpNet, NetworkId)>,
    /// Gateways named by service hostname, without addresses.
    registry_service_name_gateways: HashMap<Strng, Vec<NetworkGateway>>,
    gateways_by_service: HashMap<Strng, BTreeSet<NetworkGateway>>,
    static_gateways: BTreeSet<NetworkGateway>,
}

impl NetworkState {
    /// Resolves the network of an endpoint. An explicit label wins, then the system namespace
    /// network, then the mesh networks config.
    pub fn network(&self, ip: &str, labels: &Labels) -> NetworkId {
        if let Some(nw) = labels.get(label::TOPOLOGY_NETWORK).filter(|nw| !nw.is_empty()) {
            return strng::new(nw);
        }
        if !self.default_network.is_empty() {
            return self.default_network.clone();
        }
        self.network_from_mesh_networks(ip)
    }

    fn network_from_mesh_networks(&self, ip: &str) -> NetworkId {
        if !self.network_for_registry.is_empty() {
            return self.network_for_registry.clone();
        }
        if self.cidrs.is_empty() {
            return strng::EMPTY;
        }
        let Ok(ip) = ip.parse::<IpAddr>() else {
            return strng::EMPTY;
        };
        let mut matches = self.cidrs.iter().filter(|(net, _)| net.contains(&ip));
        let Some((_, first)) = matches.next() else {
            return strng::EMPTY;
        };
        if matches.next().is_some() {
            warn!(
                %ip,
                "found multiple networks CIDRs matching the endpoint IP, using the first match"
            );
        }
        first.clone()
    }

    /// Rebuilds the lookup tables from the mesh networks config.
    pub fn reload_mesh_networks(&mut self, mesh: &MeshNetworks, cluster: &ClusterId) {
        self.cidrs.clear();
        self.network_for_registry = strng::EMPTY;
        self.registry_service_name_gateways.clear();
        self.static_gateways.clear();

        for (name, network) in mesh.networks.iter() {
            let mut for_registry = false;
            for ep in &network.endpoints {
                if let Some(cidr) = &ep.from_cidr {
                    match cidr.parse::<IpNet>() {
                        Ok(net) => self.cidrs.push((net, name.clone())),
                        Err(e) => warn!(network=%name, cidr, "invalid cidr in mesh networks: {e}"),
                    }
                }
                if ep.from_registry.as_ref() == Some(cluster) {
                    if self.network_for_registry.is_empty() {
                        self.network_for_registry = name.clone();
                    } else if &self.network_for_registry != name {
                        warn!(
                            "multiple networks specified for cluster {cluster}, using {}",
                            self.network_for_registry
                        );
                    }
                    for_registry = true;
                }
            }
            if !for_registry {
                continue;
            }
            for gw in &network.gateways {
                if let Some(svc) = &gw.registry_service_name {
                    self.registry_service_name_gateways
                        .entry(svc.clone())
                        .or_default()
                        .push(NetworkGateway {
                            network: name.clone(),
                            cluster: cluster.clone(),
                            addr: String::new(),
                            port: gw.port,
                        });
                } else if let Some(addr) = &gw.address {
                    self.static_gateways.insert(NetworkGateway {
                        network: name.clone(),
                        cluster: cluster.clone(),
                        addr: addr.clone(),
                        port: gw.port,
                    });
                }
            }
        }
        debug!(
            cidrs = self.cidrs.len(),
            network_for_registry = %self.network_for_registry,
            "reloaded mesh networks"
        );
    }

    /// Computes the gateways a service provides. A service labelled with a network is a gateway on
    /// its gateway port; otherwise the mesh networks config may name it.
    fn gateways_for_service(&self, svc: &Service, cluster: &ClusterId) -> BTreeSet<NetworkGateway> {
        let mut templates = Vec::new();
        if let Some(nw) = svc
            .attributes
            .labels
            .get(label::TOPOLOGY_NETWORK)
            .filter(|nw| !nw.is_empty())
        {
            let port = match svc.attributes.labels.get(label::NETWORKING_GATEWAY_PORT) {
                Some(p) => p.parse::<u16>().unwrap_or_else(|_| {
                    warn!(
                        hostname = %svc.hostname,
                        port = p,
                        "could not parse gateway port, using default"
                    );
                    DEFAULT_GATEWAY_PORT
                }),
                None => DEFAULT_GATEWAY_PORT,
            };
            templates.push(NetworkGateway {
                network: strng::new(nw),
                cluster: cluster.clone(),
                addr: String::new(),
                port,
            });
        } else if let Some(gws) = self.registry_service_name_gateways.get(&svc.hostname) {
            templates.extend(gws.iter().cloned());
        }

        let node_ports = svc.attributes.cluster_external_ports.get(cluster);
        let mut out = BTreeSet::new();
        for addr in svc
            .attributes
            .cluster_external_addresses
            .get_addresses_for(cluster)
        {
            for gw in &templates {
                let port = match node_ports {
                    // NodePort gateways are reached on the node port.
                    Some(ports) => match ports.get(&gw.port) {
                        Some(np) => *np,
                        None => continue,
                    },
                    None => gw.port,
                };
                out.insert(NetworkGateway {
                    network: gw.network.clone(),
                    cluster: cluster.clone(),
                    addr: addr.clone(),
                    port,
                });
            }
        }
        out
    }

    /// Records the gateways of a service, returning whether they changed.
    pub fn extract_gateways_from_service(&mut self, svc: &Service, cluster: &ClusterId) -> bool {
        let gateways = self.gateways_for_service(svc, cluster);
        let previous = self.gateways_by_service.get(&svc.hostname);
        if previous.map(|p| p == &gateways).unwrap_or(gateways.is_empty()) {
            return false;
        }
        if gateways.is_empty() {
            self.gateways_by_service.remove(&svc.hostname);
        } else {
            self.gateways_by_service
                .insert(svc.hostname.clone(), gateways);
        }
        true
    }

    /// Forgets the gateways of a deleted service, returning whether it was a gateway.
    pub fn remove_gateways(&mut self, hostname: &str) -> bool {
        self.gateways_by_service.remove(hostname).is_some()
    }

    pub fn network_gateways(&self) -> Vec<NetworkGateway> {
        self.gateways_by_service
            .values()
            .flatten()
            .chain(self.static_gateways.iter())
            .cloned()
            .sorted()
            .dedup()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressMap, ServiceAttributes};

    fn cluster() -> ClusterId {
        strng::literal!("cluster-1")
    }

    fn labels(kv: &[(&str, &str)]) -> Labels {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn gateway_service(lbls: Labels, addrs: &[&str]) -> Service {
        let mut cluster_external_addresses = AddressMap::default();
        cluster_external_addresses.set_addresses_for(
            cluster(),
            addrs.iter().map(|a| a.to_string()).collect(),
        );
        Service {
            hostname: strng::literal!("gw.istio-system.svc.cluster.local"),
            attributes: ServiceAttributes {
                labels: lbls,
                cluster_external_addresses,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    const MESH_NETWORKS: &str = r#"
networks:
  zeta:
    endpoints:
    - fromCidr: 10.0.0.0/8
  alpha:
    endpoints:
    - fromCidr: 10.1.0.0/16
    - fromCidr: not-a-cidr
  remote:
    endpoints:
    - fromRegistry: other
    gateways:
    - address: 3.3.3.3
      port: 443
"#;

    #[test]
    fn mesh_networks_keep_declaration_order() {
        let mesh: MeshNetworks = serde_yaml::from_str(MESH_NETWORKS).unwrap();
        let names: Vec<_> = mesh.networks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "remote"]);

        let mut state = NetworkState::default();
        state.reload_mesh_networks(&mesh, &cluster());
        // Both ranges contain the address; the first declared wins.
        assert_eq!(state.network("10.1.2.3", &Labels::new()), "zeta");
        assert_eq!(state.network("192.168.0.1", &Labels::new()), "");
        assert_eq!(state.network("not-an-ip", &Labels::new()), "");
        // Gateways of networks not bound to this registry are ignored.
        assert!(state.network_gateways().is_empty());
    }

    #[test]
    fn network_priority() {
        let mesh: MeshNetworks = serde_yaml::from_str(MESH_NETWORKS).unwrap();
        let mut state = NetworkState::default();
        state.reload_mesh_networks(&mesh, &cluster());
        state.default_network = strng::literal!("ns-default");

        let labelled = labels(&[(label::TOPOLOGY_NETWORK, "from-label")]);
        assert_eq!(state.network("10.1.2.3", &labelled), "from-label");
        assert_eq!(state.network("10.1.2.3", &Labels::new()), "ns-default");
        state.default_network = strng::EMPTY;
        assert_eq!(state.network("10.1.2.3", &Labels::new()), "zeta");
    }

    #[test]
    fn from_registry_and_gateways() {
        let mesh: MeshNetworks = serde_yaml::from_str(
            r#"
networks:
  first:
    endpoints:
    - fromRegistry: cluster-1
    - fromCidr: 10.0.0.0/8
    gateways:
    - registryServiceName: gw.istio-system.svc.cluster.local
      port: 15443
    - address: 2.2.2.2
      port: 15443
  second:
    endpoints:
    - fromRegistry: cluster-1
"#,
        )
        .unwrap();
        let mut state = NetworkState::default();
        state.reload_mesh_networks(&mesh, &cluster());
        assert_eq!(state.network_for_registry, "first");
        assert_eq!(state.network("192.168.1.1", &Labels::new()), "first");

        let svc = gateway_service(Labels::new(), &["1.1.1.1"]);
        assert!(state.extract_gateways_from_service(&svc, &cluster()));
        assert!(!state.extract_gateways_from_service(&svc, &cluster()));
        let addrs: Vec<_> = state
            .network_gateways()
            .into_iter()
            .map(|g| (g.addr, g.port))
            .collect();
        assert_eq!(
            addrs,
            vec![
                ("1.1.1.1".to_string(), 15443),
                ("2.2.2.2".to_string(), 15443)
            ]
        );
        assert!(state.remove_gateways(&svc.hostname));
        assert!(!state.remove_gateways(&svc.hostname));
    }

    #[test]
    fn labelled_gateway() {
        let mut state = NetworkState::default();
        let mut svc = gateway_service(
            labels(&[
                (label::TOPOLOGY_NETWORK, "net-1"),
                (label::NETWORKING_GATEWAY_PORT, "15009"),
            ]),
            &["1.1.1.1", "1.1.1.2"],
        );
        assert!(state.extract_gateways_from_service(&svc, &cluster()));
        let gws = state.network_gateways();
        assert_eq!(gws.len(), 2);
        assert!(gws.iter().all(|g| g.network == "net-1" && g.port == 15009));

        // NodePort services translate the gateway port to the node port.
        svc.attributes
            .cluster_external_ports
            .insert(cluster(), [(15009, 31009)].into_iter().collect());
        assert!(state.extract_gateways_from_service(&svc, &cluster()));
        assert!(state.network_gateways().iter().all(|g| g.port == 31009));

        // Losing the addresses removes the gateway.
        svc.attributes.cluster_external_addresses = AddressMap::default();
        assert!(state.extract_gateways_from_service(&svc, &cluster()));
        assert!(state.network_gateways().is_empty());
        assert!(!state.extract_gateways_from_service(&svc, &cluster()));
    }

    #[test]
    fn invalid_gateway_port_uses_default() {
        let mut state = NetworkState::default();
        let svc = gateway_service(
            labels(&[
                (label::TOPOLOGY_NETWORK, "net-1"),
                (label::NETWORKING_GATEWAY_PORT, "abc"),
            ]),
            &["1.1.1.1"],
        );
        state.extract_gateways_from_service(&svc, &cluster());
        assert_eq!(state.network_gateways()[0].port, DEFAULT_GATEWAY_PORT);
    }
}
