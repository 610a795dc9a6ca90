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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::{ClusterId, IstioEndpoint, Labels, Provider};
use crate::strng::Strng;

/// Address used for services without a cluster IP.
pub const UNSPECIFIED_IP: &str = "0.0.0.0";

/// Resolution determines how a proxy picks an instance of a service.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Resolution {
    /// The proxy picks one of the instances returned by the registry.
    #[default]
    ClientSideLB,
    /// The service hostname is resolved through DNS.
    DNS,
    /// Traffic is forwarded to the original destination.
    Passthrough,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Protocol {
    GRPC,
    HTTP,
    HTTP2,
    HTTPS,
    TLS,
    Mongo,
    Redis,
    MySQL,
    TCP,
    UDP,
    #[default]
    Unsupported,
}

impl Protocol {
    /// Parses a protocol name case-insensitively. Unknown names are `Unsupported`.
    pub fn parse(s: &str) -> Protocol {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::TCP,
            "udp" => Protocol::UDP,
            "grpc" | "grpc-web" => Protocol::GRPC,
            "http" => Protocol::HTTP,
            "http2" | "h2c" => Protocol::HTTP2,
            "https" => Protocol::HTTPS,
            "tls" => Protocol::TLS,
            "mongo" => Protocol::Mongo,
            "redis" => Protocol::Redis,
            "mysql" => Protocol::MySQL,
            _ => Protocol::Unsupported,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Port {
    pub name: Strng,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortList(pub Vec<Port>);

impl PortList {
    pub fn get(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|p| p.name == name)
    }

    pub fn get_by_port(&self, num: u16) -> Option<&Port> {
        self.0.iter().find(|p| p.port == num)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Port> for PortList {
    fn from_iter<T: IntoIterator<Item = Port>>(iter: T) -> Self {
        PortList(iter.into_iter().collect())
    }
}

/// AddressMap holds per-cluster address lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressMap {
    pub addresses: BTreeMap<ClusterId, Vec<String>>,
}

impl AddressMap {
    pub fn get_addresses_for(&self, cluster: &ClusterId) -> &[String] {
        self.addresses
            .get(cluster)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn set_addresses_for(&mut self, cluster: ClusterId, addresses: Vec<String>) {
        if addresses.is_empty() {
            self.addresses.remove(&cluster);
        } else {
            self.addresses.insert(cluster, addresses);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.values().all(Vec::is_empty)
    }
}

/// Attributes carried over from the Kubernetes object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAttributes {
    pub service_registry: Provider,
    pub name: Strng,
    pub namespace: Strng,
    pub labels: Labels,
    /// Pod selector of the service. `None` when the service selects nothing, which is distinct from
    /// an empty selector.
    pub label_selectors: Option<Labels>,
    /// Kubernetes service type, e.g. `ClusterIP` or `NodePort`.
    pub type_: Strng,
    /// Hosts external-name services point at.
    pub external_name: Option<Strng>,
    /// Traffic is kept on the originating node.
    pub node_local: bool,
    pub cluster_external_addresses: AddressMap,
    /// Per cluster mapping of service port to node port.
    pub cluster_external_ports: HashMap<ClusterId, HashMap<u16, u16>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub hostname: Strng,
    pub default_address: String,
    pub cluster_vips: AddressMap,
    pub ports: PortList,
    pub resolution: Resolution,
    pub mesh_external: bool,
    pub attributes: ServiceAttributes,
}

impl Service {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName {
            namespace: self.attributes.namespace.clone(),
            name: self.attributes.name.clone(),
        }
    }

    pub fn is_headless(&self) -> bool {
        self.resolution == Resolution::Passthrough && self.default_address == UNSPECIFIED_IP
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NamespacedName {
    pub namespace: Strng,
    pub name: Strng,
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// ServiceInstance binds one endpoint to one port of a service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub service: Arc<Service>,
    pub service_port: Port,
    pub endpoint: IstioEndpoint,
}

/// A gateway through which endpoints on another network are reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NetworkGateway {
    pub network: Strng,
    pub cluster: ClusterId,
    pub addr: String,
    pub port: u16,
}

/// Federation state of a single service, combined from its export and import records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MCSServiceInfo {
    pub cluster: ClusterId,
    pub name: Strng,
    pub namespace: Strng,
    pub exported: bool,
    pub imported: bool,
    pub cluster_set_vip: Vec<String>,
    /// Discoverability policy name per host.
    pub discoverability: BTreeMap<Strng, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strng;

    #[test]
    fn address_map_drops_empty() {
        let mut m = AddressMap::default();
        let c = strng::literal!("c1");
        m.set_addresses_for(c.clone(), vec!["1.1.1.1".to_string()]);
        assert_eq!(m.get_addresses_for(&c), &["1.1.1.1".to_string()]);
        assert!(!m.is_empty());
        m.set_addresses_for(c.clone(), vec![]);
        assert!(m.is_empty());
        assert!(m.get_addresses_for(&c).is_empty());
    }

    #[test]
    fn protocols() {
        assert_eq!(Protocol::parse("HTTP"), Protocol::HTTP);
        assert_eq!(Protocol::parse("grpc-web"), Protocol::GRPC);
        assert_eq!(Protocol::parse("thrift"), Protocol::Unsupported);
    }
}
