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

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ClusterId, Labels, NetworkId};
use crate::strng::Strng;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Healthy,
    UnHealthy,
}

/// DiscoverabilityPolicy decides which clusters may see an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoverabilityPolicy {
    #[default]
    AlwaysDiscoverable,
    DiscoverableFromSameCluster,
}

impl DiscoverabilityPolicy {
    pub fn is_discoverable_from(&self, endpoint_cluster: &ClusterId, from: &ClusterId) -> bool {
        match self {
            DiscoverabilityPolicy::AlwaysDiscoverable => true,
            DiscoverabilityPolicy::DiscoverableFromSameCluster => endpoint_cluster == from,
        }
    }
}

impl fmt::Display for DiscoverabilityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locality {
    /// `region/zone/subzone`, possibly with empty segments.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub cluster_id: ClusterId,
}

/// IstioEndpoint is one routable instance of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IstioEndpoint {
    #[serde(default)]
    pub labels: Labels,
    pub address: String,
    #[serde(default)]
    pub endpoint_port: u32,
    #[serde(default)]
    pub service_port_name: String,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub network: NetworkId,
    #[serde(default)]
    pub locality: Locality,
    #[serde(default)]
    pub tls_mode: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub workload_name: String,
    /// Pod hostname and subdomain, used for headless DNS.
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(skip)]
    pub discoverability_policy: DiscoverabilityPolicy,
}

impl IstioEndpoint {
    /// Key identifying this endpoint within a service.
    pub fn key(&self) -> String {
        format!("{}/{}", self.address, self.service_port_name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Pod,
    WorkloadEntry,
}

/// WorkloadInstance is a workload registered outside of the pod/service machinery, or a pod
/// forwarded to other registries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadInstance {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub kind: WorkloadKind,
    pub endpoint: IstioEndpoint,
    /// Named ports exposed by the workload.
    #[serde(default)]
    pub port_map: BTreeMap<String, u32>,
}

impl WorkloadInstance {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodPort {
    #[serde(default)]
    pub name: String,
    pub container_port: i32,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    #[serde(default)]
    pub cluster_id: Strng,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub network: NetworkId,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub pod_ports: Vec<PodPort>,
    #[serde(default)]
    pub labels: Labels,
    /// The proxy runs on a VM rather than in a pod.
    #[serde(default)]
    pub vm: bool,
}

/// Proxy identifies a connected workload proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    /// `<pod name>.<namespace>`
    pub id: String,
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub config_namespace: String,
    #[serde(default)]
    pub labels: Labels,
    /// `region/zone/subzone` reported by the proxy.
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

impl Proxy {
    pub fn is_vm(&self) -> bool {
        self.metadata.vm
    }
}
