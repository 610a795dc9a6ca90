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

use k8s_openapi::api::core::v1::Pod;

use crate::kube::client::Object;
use crate::model::{
    ClusterId, DiscoverabilityPolicy, HealthStatus, IstioEndpoint, Labels, Locality, NetworkId,
    Proxy, label,
};
use crate::strng;

const TRUST_DOMAIN: &str = "cluster.local";
const TLS_MODE_DISABLED: &str = "disabled";

/// The parts of the controller endpoint construction depends on.
pub trait ControllerView {
    fn cluster(&self) -> &ClusterId;

    fn pod_locality(&self, pod: &Pod) -> String;

    fn network(&self, ip: &str, labels: &Labels) -> NetworkId;
}

/// EndpointBuilder holds the per-workload attributes shared by every endpoint of a pod or proxy.
#[derive(Debug, Clone, Default)]
pub struct EndpointBuilder {
    labels: Labels,
    meta_network: NetworkId,
    service_account: String,
    locality: Locality,
    tls_mode: String,
    workload_name: String,
    namespace: String,
    hostname: String,
    subdomain: String,
    node_name: String,
}

impl EndpointBuilder {
    /// Creates a builder for endpoints backed by `pod`. Without a pod only the cluster is known.
    pub fn new<C: ControllerView + ?Sized>(c: &C, pod: Option<&Pod>) -> Self {
        let Some(pod) = pod else {
            return EndpointBuilder {
                locality: Locality {
                    label: String::new(),
                    cluster_id: c.cluster().clone(),
                },
                ..Default::default()
            };
        };
        let spec = pod.spec.as_ref();
        let locality = c.pod_locality(pod);
        let node_name = spec
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default();
        let subdomain = spec.and_then(|s| s.subdomain.clone()).unwrap_or_default();
        let hostname = if subdomain.is_empty() {
            String::new()
        } else {
            spec.and_then(|s| s.hostname.clone())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| pod.name().to_string())
        };
        let mut out = EndpointBuilder {
            labels: pod.labels().clone(),
            meta_network: strng::EMPTY,
            service_account: secure_naming_san(pod),
            locality: Locality {
                label: locality.clone(),
                cluster_id: c.cluster().clone(),
            },
            tls_mode: tls_mode(pod.labels()),
            workload_name: workload_name(pod),
            namespace: pod.namespace().to_string(),
            hostname,
            subdomain,
            node_name,
        };
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();
        let network = out.endpoint_network(c, pod_ip);
        out.labels = augment_labels(
            &out.labels,
            c.cluster(),
            &locality,
            &out.node_name,
            &network,
        );
        out
    }

    /// Creates a builder from what a proxy reports about itself, for when its pod is not visible
    /// yet.
    pub fn from_metadata<C: ControllerView + ?Sized>(c: &C, proxy: &Proxy) -> Self {
        let mut out = EndpointBuilder {
            labels: proxy.labels.clone(),
            meta_network: proxy.metadata.network.clone(),
            service_account: proxy.metadata.service_account.clone(),
            locality: Locality {
                label: proxy.locality.clone(),
                cluster_id: c.cluster().clone(),
            },
            tls_mode: tls_mode(&proxy.labels),
            node_name: proxy.metadata.node_name.clone(),
            namespace: proxy.config_namespace.clone(),
            ..Default::default()
        };
        let network = match proxy.ip_addresses.first() {
            Some(ip) => out.endpoint_network(c, ip),
            None => strng::EMPTY,
        };
        out.labels = augment_labels(
            &proxy.labels,
            c.cluster(),
            &proxy.locality,
            &out.node_name,
            &network,
        );
        out
    }

    fn endpoint_network<C: ControllerView + ?Sized>(&self, c: &C, ip: &str) -> NetworkId {
        if !self.meta_network.is_empty() {
            return self.meta_network.clone();
        }
        c.network(ip, &self.labels)
    }

    pub fn build<C: ControllerView + ?Sized>(
        &self,
        c: &C,
        address: &str,
        port: u32,
        service_port_name: &str,
        discoverability_policy: DiscoverabilityPolicy,
        health_status: HealthStatus,
    ) -> IstioEndpoint {
        let mut labels = self.labels.clone();
        let network = match labels.get(label::TOPOLOGY_NETWORK).filter(|n| !n.is_empty()) {
            Some(n) => strng::new(n),
            None => {
                let n = self.endpoint_network(c, address);
                if !n.is_empty() {
                    labels.insert(label::TOPOLOGY_NETWORK.to_string(), n.to_string());
                }
                n
            }
        };
        IstioEndpoint {
            labels,
            address: address.to_string(),
            endpoint_port: port,
            service_port_name: service_port_name.to_string(),
            service_account: self.service_account.clone(),
            network,
            locality: self.locality.clone(),
            tls_mode: self.tls_mode.clone(),
            namespace: self.namespace.clone(),
            workload_name: self.workload_name.clone(),
            hostname: self.hostname.clone(),
            subdomain: self.subdomain.clone(),
            node_name: self.node_name.clone(),
            health_status,
            discoverability_policy,
        }
    }
}

fn secure_naming_san(pod: &Pod) -> String {
    let sa = pod
        .spec
        .as_ref()
        .and_then(|s| s.service_account_name.as_deref())
        .unwrap_or_default();
    format!("spiffe://{TRUST_DOMAIN}/ns/{}/sa/{sa}", pod.namespace())
}

fn tls_mode(labels: &Labels) -> String {
    labels
        .get(label::TLS_MODE)
        .cloned()
        .unwrap_or_else(|| TLS_MODE_DISABLED.to_string())
}

/// Name of the workload owning a pod. Pods from a ReplicaSet report their Deployment.
fn workload_name(pod: &Pod) -> String {
    let Some(owner) = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)).or(refs.first()))
    else {
        return pod.name().to_string();
    };
    if owner.kind == "ReplicaSet" {
        if let Some((deployment, _)) = owner.name.rsplit_once('-') {
            return deployment.to_string();
        }
    }
    owner.name.clone()
}

/// Adds topology labels derived from locality, cluster, node and network. An existing network
/// label is kept.
pub fn augment_labels(
    labels: &Labels,
    cluster: &ClusterId,
    locality: &str,
    node_name: &str,
    network: &NetworkId,
) -> Labels {
    let mut out = labels.clone();
    let mut parts = locality.splitn(3, '/');
    for key in [label::NODE_REGION, label::NODE_ZONE, label::TOPOLOGY_SUBZONE] {
        if let Some(v) = parts.next().filter(|v| !v.is_empty()) {
            out.insert(key.to_string(), v.to_string());
        }
    }
    if !cluster.is_empty() {
        out.insert(label::TOPOLOGY_CLUSTER.to_string(), cluster.to_string());
    }
    if !node_name.is_empty() {
        out.insert(label::HOSTNAME.to_string(), node_name.to_string());
    }
    if !network.is_empty() && out.get(label::TOPOLOGY_NETWORK).is_none_or(|n| n.is_empty()) {
        out.insert(label::TOPOLOGY_NETWORK.to_string(), network.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::kube::pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    struct View {
        cluster: ClusterId,
    }

    impl ControllerView for View {
        fn cluster(&self) -> &ClusterId {
            &self.cluster
        }

        fn pod_locality(&self, _: &Pod) -> String {
            "r1/z1/".to_string()
        }

        fn network(&self, ip: &str, labels: &Labels) -> NetworkId {
            if let Some(n) = labels.get(label::TOPOLOGY_NETWORK) {
                return strng::new(n);
            }
            if ip.starts_with("10.") {
                strng::literal!("net-10")
            } else {
                strng::EMPTY
            }
        }
    }

    fn view() -> View {
        View {
            cluster: strng::literal!("cluster-1"),
        }
    }

    #[test]
    fn from_pod() {
        let mut p = pod("reviews-v1-abc", "ns", &[("app", "reviews")], "10.1.1.1", "node-1");
        p.metadata.owner_references = Some(vec![OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: "reviews-v1-5f7d8".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        p.spec.as_mut().unwrap().service_account_name = Some("bookinfo".to_string());
        let b = EndpointBuilder::new(&view(), Some(&p));
        let ep = b.build(
            &view(),
            "10.1.1.1",
            9080,
            "http",
            DiscoverabilityPolicy::AlwaysDiscoverable,
            HealthStatus::Healthy,
        );
        assert_eq!(ep.workload_name, "reviews-v1");
        assert_eq!(ep.service_account, "spiffe://cluster.local/ns/ns/sa/bookinfo");
        assert_eq!(ep.tls_mode, "disabled");
        assert_eq!(ep.network, "net-10");
        assert_eq!(ep.locality.label, "r1/z1/");
        assert_eq!(ep.locality.cluster_id, "cluster-1");
        assert_eq!(ep.node_name, "node-1");
        assert!(ep.hostname.is_empty());
        assert_eq!(ep.labels.get(label::NODE_REGION).map(String::as_str), Some("r1"));
        assert_eq!(ep.labels.get(label::NODE_ZONE).map(String::as_str), Some("z1"));
        assert!(!ep.labels.contains_key(label::TOPOLOGY_SUBZONE));
        assert_eq!(ep.labels.get(label::HOSTNAME).map(String::as_str), Some("node-1"));
        assert_eq!(
            ep.labels.get(label::TOPOLOGY_NETWORK).map(String::as_str),
            Some("net-10")
        );
    }

    #[test]
    fn headless_hostname() {
        let mut p = pod("web-0", "ns", &[], "10.1.1.1", "");
        p.spec.as_mut().unwrap().subdomain = Some("web".to_string());
        let b = EndpointBuilder::new(&view(), Some(&p));
        let ep = b.build(
            &view(),
            "10.1.1.1",
            80,
            "http",
            DiscoverabilityPolicy::AlwaysDiscoverable,
            HealthStatus::Healthy,
        );
        assert_eq!(ep.hostname, "web-0");
        assert_eq!(ep.subdomain, "web");
        assert_eq!(ep.workload_name, "web-0");
    }

    #[test]
    fn without_pod() {
        let b = EndpointBuilder::new(&view(), None);
        let ep = b.build(
            &view(),
            "192.168.0.1",
            80,
            "http",
            DiscoverabilityPolicy::DiscoverableFromSameCluster,
            HealthStatus::UnHealthy,
        );
        assert_eq!(ep.locality.cluster_id, "cluster-1");
        assert_eq!(ep.network, "");
        assert!(ep.labels.is_empty());
        assert_eq!(ep.health_status, HealthStatus::UnHealthy);
    }

    #[test]
    fn from_proxy_metadata() {
        let mut proxy = Proxy {
            ip_addresses: vec!["10.2.2.2".to_string()],
            labels: [(label::TLS_MODE.to_string(), "istio".to_string())]
                .into_iter()
                .collect(),
            locality: "r2/z2/s2".to_string(),
            ..Default::default()
        };
        proxy.metadata.network = strng::literal!("meta-net");
        proxy.metadata.node_name = "node-9".to_string();
        let b = EndpointBuilder::from_metadata(&view(), &proxy);
        let ep = b.build(
            &view(),
            "10.2.2.2",
            80,
            "http",
            DiscoverabilityPolicy::AlwaysDiscoverable,
            HealthStatus::Healthy,
        );
        assert_eq!(ep.network, "meta-net");
        assert_eq!(ep.tls_mode, "istio");
        assert_eq!(
            ep.labels.get(label::TOPOLOGY_SUBZONE).map(String::as_str),
            Some("s2")
        );
    }
}
