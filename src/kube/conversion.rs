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

//! Conversion of Kubernetes objects into registry model types.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Service as KubeService, ServicePort as KubeServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::kube::client::Object;
use crate::model::{
    AddressMap, ClusterId, DiscoverabilityPolicy, IstioEndpoint, Labels, NamespacedName,
    PodPort, Port, Protocol, Resolution, Service, ServiceAttributes, ServiceInstance,
    UNSPECIFIED_IP, label,
};
use crate::strng::{self, Strng};

pub const CLUSTER_IP_NONE: &str = "None";
pub const CLUSTERSET_LOCAL: &str = "clusterset.local";

const TYPE_NODE_PORT: &str = "NodePort";
const TYPE_LOAD_BALANCER: &str = "LoadBalancer";
const TYPE_EXTERNAL_NAME: &str = "ExternalName";
const PROTOCOL_TCP: &str = "TCP";
const PROTOCOL_UDP: &str = "UDP";

/// Server-first protocols, treated as TCP when the port name says nothing.
const WELL_KNOWN_PORTS: [i32; 4] = [22, 25, 3306, 27017];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("no suitable port {0:?} on pod {1}")]
    NoContainerPort(String, String),
    #[error("no matching port {0:?} in proxy metadata")]
    NoMetadataPort(String),
}

/// Returns the hostname of a service, `<name>.<namespace>.svc.<domain suffix>`.
pub fn service_hostname(name: &str, namespace: &str, domain_suffix: &str) -> Strng {
    strng::new(format!("{name}.{namespace}.svc.{domain_suffix}"))
}

/// Returns the multi-cluster hostname of a service, `<name>.<namespace>.svc.clusterset.local`.
pub fn clusterset_hostname(name: &NamespacedName) -> Strng {
    service_hostname(&name.name, &name.namespace, CLUSTERSET_LOCAL)
}

pub fn is_clusterset_host(host: &str) -> bool {
    host.ends_with(&format!(".svc.{CLUSTERSET_LOCAL}"))
}

pub fn namespaced_name<K: Object>(obj: &K) -> NamespacedName {
    NamespacedName {
        namespace: strng::new(obj.namespace()),
        name: strng::new(obj.name()),
    }
}

fn protocol_or_tcp(p: &Option<String>) -> &str {
    p.as_deref().unwrap_or(PROTOCOL_TCP)
}

/// Detects the protocol of a service port from, in order, its transport protocol, its
/// `appProtocol` and the prefix of its name.
pub fn convert_protocol(
    port: i32,
    name: &str,
    proto: &Option<String>,
    app_protocol: &Option<String>,
) -> Protocol {
    if protocol_or_tcp(proto) == PROTOCOL_UDP {
        return Protocol::UDP;
    }
    let mut name = name;
    if let Some(app) = app_protocol.as_deref() {
        match app {
            "kubernetes.io/h2c" => return Protocol::HTTP2,
            "kubernetes.io/ws" => return Protocol::HTTP,
            "kubernetes.io/wss" => return Protocol::HTTPS,
            _ => name = app,
        }
    }
    if name.to_ascii_lowercase().starts_with("grpc-web") {
        return Protocol::GRPC;
    }
    let prefix = name.split('-').next().unwrap_or_default();
    match Protocol::parse(prefix) {
        Protocol::Unsupported if WELL_KNOWN_PORTS.contains(&port) => Protocol::TCP,
        p => p,
    }
}

fn convert_port(p: &KubeServicePort) -> Option<Port> {
    let name = p.name.as_deref().unwrap_or_default();
    let Ok(port) = u16::try_from(p.port) else {
        debug!(port = p.port, "ignoring out of range service port");
        return None;
    };
    Some(Port {
        name: strng::new(name),
        port,
        protocol: convert_protocol(p.port, name, &p.protocol, &p.app_protocol),
    })
}

/// Converts a Kubernetes service into the registry model.
pub fn convert_service(svc: &KubeService, domain_suffix: &str, cluster: &ClusterId) -> Service {
    let spec = svc.spec.clone().unwrap_or_default();
    let svc_type = spec.type_.as_deref().unwrap_or("ClusterIP");

    let mut addrs = vec![UNSPECIFIED_IP.to_string()];
    let mut resolution = Resolution::ClientSideLB;
    let mut external_name = None;
    if svc_type == TYPE_EXTERNAL_NAME {
        if let Some(en) = spec.external_name.as_deref().filter(|s| !s.is_empty()) {
            external_name = Some(strng::new(en));
            resolution = Resolution::DNS;
        }
    }
    let node_local = spec.internal_traffic_policy.as_deref() == Some("Local");
    match spec.cluster_ip.as_deref() {
        Some(CLUSTER_IP_NONE) => resolution = Resolution::Passthrough,
        Some(ip) if !ip.is_empty() => {
            addrs = match &spec.cluster_ips {
                Some(ips) if ips.len() > 1 => ips.clone(),
                _ => vec![ip.to_string()],
            };
        }
        _ => {}
    }

    let kube_ports = spec.ports.clone().unwrap_or_default();
    let ports = kube_ports.iter().filter_map(convert_port).collect();

    let mut cluster_vips = AddressMap::default();
    cluster_vips.set_addresses_for(cluster.clone(), addrs.clone());

    let mut attributes = ServiceAttributes {
        name: strng::new(svc.name()),
        namespace: strng::new(svc.namespace()),
        labels: svc.labels().clone(),
        label_selectors: spec.selector.clone(),
        type_: strng::new(svc_type),
        node_local,
        ..Default::default()
    };
    match svc_type {
        TYPE_NODE_PORT => {
            // Addresses come from the nodes; only the port mapping is known here.
            let port_map: HashMap<u16, u16> = kube_ports
                .iter()
                .filter_map(|p| {
                    let node_port = u16::try_from(p.node_port?).ok()?;
                    Some((u16::try_from(p.port).ok()?, node_port))
                })
                .collect();
            attributes
                .cluster_external_ports
                .insert(cluster.clone(), port_map);
        }
        TYPE_LOAD_BALANCER => {
            let ingress = svc
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref());
            let lb_addrs: Vec<String> = ingress
                .into_iter()
                .flatten()
                .filter_map(|i| {
                    // Hostnames are kept verbatim; they are not resolved here.
                    i.ip
                        .clone()
                        .filter(|ip| !ip.is_empty())
                        .or_else(|| i.hostname.clone().filter(|h| !h.is_empty()))
                })
                .collect();
            attributes
                .cluster_external_addresses
                .set_addresses_for(cluster.clone(), lb_addrs);
        }
        _ => {}
    }
    attributes.external_name = external_name.clone();
    if let Some(external_ips) = spec.external_ips.as_ref().filter(|ips| !ips.is_empty()) {
        let mut all = attributes
            .cluster_external_addresses
            .get_addresses_for(cluster)
            .to_vec();
        all.extend(external_ips.iter().cloned());
        attributes
            .cluster_external_addresses
            .set_addresses_for(cluster.clone(), all);
    }

    Service {
        hostname: service_hostname(svc.name(), svc.namespace(), domain_suffix),
        default_address: addrs[0].clone(),
        cluster_vips,
        ports,
        resolution,
        mesh_external: external_name.is_some(),
        attributes,
    }
}

/// Builds the synthetic instances of an `ExternalName` service: one per port, addressed by the
/// external hostname.
pub fn external_name_instances(
    k8s: &KubeService,
    svc: &Arc<Service>,
    mcs_enabled: bool,
) -> Vec<ServiceInstance> {
    let spec = k8s.spec.as_ref();
    let is_external_name = spec.and_then(|s| s.type_.as_deref()) == Some(TYPE_EXTERNAL_NAME);
    let Some(external_name) = spec
        .and_then(|s| s.external_name.as_deref())
        .filter(|n| is_external_name && !n.is_empty())
    else {
        return Vec::new();
    };
    let discoverability_policy = if mcs_enabled {
        DiscoverabilityPolicy::DiscoverableFromSameCluster
    } else {
        DiscoverabilityPolicy::AlwaysDiscoverable
    };
    svc.ports
        .iter()
        .map(|port| ServiceInstance {
            service: svc.clone(),
            service_port: port.clone(),
            endpoint: IstioEndpoint {
                address: external_name.to_string(),
                endpoint_port: port.port as u32,
                service_port_name: port.name.to_string(),
                labels: k8s.labels().clone(),
                discoverability_policy,
                ..Default::default()
            },
        })
        .collect()
}

pub fn is_node_port(svc: &KubeService) -> bool {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some(TYPE_NODE_PORT)
}

pub fn is_headless(svc: &KubeService) -> bool {
    svc.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()) == Some(CLUSTER_IP_NONE)
}

pub fn is_external_name(svc: &KubeService) -> bool {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some(TYPE_EXTERNAL_NAME)
}

/// Reads the node selector annotation of a service, a JSON encoded label map. An absent or
/// malformed annotation selects every node.
pub fn node_selector_for_service(svc: &KubeService) -> Labels {
    let Some(raw) = svc
        .annotations()
        .get(label::NODE_SELECTOR_ANNOTATION)
        .filter(|s| !s.is_empty())
    else {
        return Labels::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        debug!(
            "failed to unmarshal node selector annotation value for service {}.{}: {e}",
            svc.name(),
            svc.namespace()
        );
        Labels::new()
    })
}

/// Resolved target of a service port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTargetPort {
    /// The target port number, 0 if given by name.
    pub num: u16,
    pub name: String,
    /// Whether `name` came from the `targetPort` field rather than the service port's name.
    pub explicit_name: bool,
}

pub fn find_service_target_port(service_port: &Port, k8s: &KubeService) -> ServiceTargetPort {
    let ports = k8s.spec.as_ref().and_then(|s| s.ports.as_ref());
    for p in ports.into_iter().flatten() {
        if p.name.as_deref().unwrap_or_default() == service_port.name
            || p.port == i32::from(service_port.port)
        {
            return match &p.target_port {
                Some(IntOrString::Int(n)) if *n > 0 => ServiceTargetPort {
                    num: u16::try_from(*n).unwrap_or_default(),
                    name: p.name.clone().unwrap_or_default(),
                    explicit_name: false,
                },
                Some(IntOrString::String(name)) => ServiceTargetPort {
                    num: 0,
                    name: name.clone(),
                    explicit_name: true,
                },
                _ => ServiceTargetPort {
                    num: 0,
                    name: String::new(),
                    explicit_name: true,
                },
            };
        }
    }
    ServiceTargetPort {
        num: service_port.port,
        name: service_port.name.to_string(),
        explicit_name: false,
    }
}

/// Locates the container port a service port targets on a pod.
pub fn find_port(pod: &Pod, svc_port: &KubeServicePort) -> Result<u16, PortError> {
    match &svc_port.target_port {
        Some(IntOrString::String(name)) => {
            let want_proto = protocol_or_tcp(&svc_port.protocol);
            pod.spec
                .iter()
                .flat_map(|s| s.containers.iter())
                .flat_map(|c| c.ports.iter().flatten())
                .find(|p| {
                    p.name.as_deref() == Some(name) && protocol_or_tcp(&p.protocol) == want_proto
                })
                .and_then(|p| u16::try_from(p.container_port).ok())
                .ok_or_else(|| PortError::NoContainerPort(name.clone(), pod.name().to_string()))
        }
        Some(IntOrString::Int(n)) => Ok(u16::try_from(*n).unwrap_or_default()),
        // An unset target port defaults to the service port.
        None => Ok(u16::try_from(svc_port.port).unwrap_or_default()),
    }
}

/// Like [find_port], using ports advertised in proxy metadata.
pub fn find_port_from_metadata(
    svc_port: &KubeServicePort,
    pod_ports: &[PodPort],
) -> Result<u16, PortError> {
    match &svc_port.target_port {
        Some(IntOrString::String(name)) => {
            let want_proto = protocol_or_tcp(&svc_port.protocol);
            pod_ports
                .iter()
                .find(|p| {
                    &p.name == name
                        && (if p.protocol.is_empty() { PROTOCOL_TCP } else { &p.protocol })
                            == want_proto
                })
                .and_then(|p| u16::try_from(p.container_port).ok())
                .ok_or_else(|| PortError::NoMetadataPort(name.clone()))
        }
        Some(IntOrString::Int(n)) => Ok(u16::try_from(*n).unwrap_or_default()),
        None => Ok(u16::try_from(svc_port.port).unwrap_or_default()),
    }
}

/// Returns the services whose selector matches the given labels. A service without a selector
/// matches nothing; an empty selector matches everything.
pub fn services_selecting<'a>(
    services: &'a [Arc<KubeService>],
    labels: &Labels,
) -> Vec<&'a Arc<KubeService>> {
    services
        .iter()
        .filter(|svc| {
            svc.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|sel| crate::model::selector_matches(sel, labels))
        })
        .collect()
}

/// Named container ports of a pod.
pub fn pod_port_map(pod: &Pod) -> std::collections::BTreeMap<String, u32> {
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            let name = p.name.clone().filter(|n| !n.is_empty())?;
            Some((name, u32::try_from(p.container_port).ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::kube::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, LoadBalancerIngress, LoadBalancerStatus, PodSpec, ServiceSpec,
        ServiceStatus,
    };
    use test_case::test_case;

    fn cluster() -> ClusterId {
        strng::literal!("cluster-1")
    }

    #[test]
    fn cluster_ip_service() {
        let mut svc = service("reviews", "ns", &[("app", "reviews")]);
        svc.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.5".to_string());
        let conv = convert_service(&svc, "cluster.local", &cluster());
        assert_eq!(conv.hostname, "reviews.ns.svc.cluster.local");
        assert_eq!(conv.default_address, "10.0.0.5");
        assert_eq!(conv.resolution, Resolution::ClientSideLB);
        assert!(!conv.mesh_external);
        assert_eq!(conv.ports.get("http").map(|p| p.protocol), Some(Protocol::HTTP));
        assert_eq!(
            conv.cluster_vips.get_addresses_for(&cluster()),
            &["10.0.0.5".to_string()]
        );
    }

    #[test]
    fn headless_and_external_name() {
        let mut svc = service("db", "ns", &[("app", "db")]);
        svc.spec.as_mut().unwrap().cluster_ip = Some(CLUSTER_IP_NONE.to_string());
        let conv = convert_service(&svc, "cluster.local", &cluster());
        assert_eq!(conv.resolution, Resolution::Passthrough);
        assert_eq!(conv.default_address, UNSPECIFIED_IP);
        assert!(conv.is_headless());

        let mut ext = service("ext", "ns", &[]);
        {
            let spec = ext.spec.as_mut().unwrap();
            spec.type_ = Some(TYPE_EXTERNAL_NAME.to_string());
            spec.external_name = Some("example.com".to_string());
        }
        let conv = Arc::new(convert_service(&ext, "cluster.local", &cluster()));
        assert_eq!(conv.resolution, Resolution::DNS);
        assert!(conv.mesh_external);
        let instances = external_name_instances(&ext, &conv, false);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint.address, "example.com");
        assert_eq!(instances[0].endpoint.endpoint_port, 80);
    }

    #[test]
    fn load_balancer_and_external_ips() {
        let mut svc = service("gw", "istio-system", &[("app", "gw")]);
        svc.spec = Some(ServiceSpec {
            type_: Some(TYPE_LOAD_BALANCER.to_string()),
            cluster_ip: Some("10.0.0.9".to_string()),
            external_ips: Some(vec!["5.5.5.5".to_string()]),
            ..svc.spec.unwrap()
        });
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![
                    LoadBalancerIngress {
                        ip: Some("1.2.3.4".to_string()),
                        ..Default::default()
                    },
                    LoadBalancerIngress {
                        hostname: Some("lb.example.com".to_string()),
                        ..Default::default()
                    },
                ]),
            }),
            ..Default::default()
        });
        let conv = convert_service(&svc, "cluster.local", &cluster());
        assert_eq!(
            conv.attributes
                .cluster_external_addresses
                .get_addresses_for(&cluster()),
            &[
                "1.2.3.4".to_string(),
                "lb.example.com".to_string(),
                "5.5.5.5".to_string()
            ]
        );
    }

    #[test]
    fn node_port_mapping() {
        let mut svc = service("gw", "ns", &[]);
        {
            let spec = svc.spec.as_mut().unwrap();
            spec.type_ = Some(TYPE_NODE_PORT.to_string());
            spec.ports.as_mut().unwrap()[0].node_port = Some(30080);
        }
        let conv = convert_service(&svc, "cluster.local", &cluster());
        assert_eq!(
            conv.attributes.cluster_external_ports[&cluster()].get(&80),
            Some(&30080)
        );
        assert!(conv.attributes.cluster_external_addresses.is_empty());
    }

    #[test_case(80, "http-web", None, None, Protocol::HTTP; "name prefix")]
    #[test_case(80, "web", Some("UDP"), None, Protocol::UDP; "udp wins")]
    #[test_case(80, "web", None, Some("kubernetes.io/h2c"), Protocol::HTTP2; "h2c app protocol")]
    #[test_case(80, "tcp", None, Some("grpc"), Protocol::GRPC; "app protocol over name")]
    #[test_case(80, "grpc-web-x", None, None, Protocol::GRPC; "grpc web")]
    #[test_case(3306, "db", None, None, Protocol::TCP; "well known port")]
    #[test_case(9000, "db", None, None, Protocol::Unsupported; "unknown")]
    fn protocols(port: i32, name: &str, proto: Option<&str>, app: Option<&str>, want: Protocol) {
        assert_eq!(
            convert_protocol(
                port,
                name,
                &proto.map(String::from),
                &app.map(String::from)
            ),
            want
        );
    }

    #[test]
    fn node_selector_annotation() {
        let mut svc = service("gw", "ns", &[]);
        assert!(node_selector_for_service(&svc).is_empty());
        svc.metadata.annotations = Some(
            [(
                label::NODE_SELECTOR_ANNOTATION.to_string(),
                r#"{"pool":"edge"}"#.to_string(),
            )]
            .into_iter()
            .collect(),
        );
        assert_eq!(
            node_selector_for_service(&svc).get("pool").map(String::as_str),
            Some("edge")
        );
    }

    #[test]
    fn target_ports() {
        let mut svc = service("svc", "ns", &[("app", "a")]);
        let port = Port {
            name: strng::literal!("http"),
            port: 80,
            protocol: Protocol::HTTP,
        };
        svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].target_port =
            Some(IntOrString::Int(8080));
        assert_eq!(
            find_service_target_port(&port, &svc),
            ServiceTargetPort {
                num: 8080,
                name: "http".to_string(),
                explicit_name: false
            }
        );
        svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].target_port =
            Some(IntOrString::String("web".to_string()));
        assert_eq!(
            find_service_target_port(&port, &svc),
            ServiceTargetPort {
                num: 0,
                name: "web".to_string(),
                explicit_name: true
            }
        );
        let other = Port {
            name: strng::literal!("grpc"),
            port: 9090,
            protocol: Protocol::GRPC,
        };
        assert_eq!(find_service_target_port(&other, &svc).num, 9090);
    }

    #[test]
    fn container_ports() {
        let mut p = pod("p", "ns", &[], "10.1.1.1", "node-1");
        p.spec = Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some("web".to_string()),
                    container_port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..p.spec.unwrap()
        });
        let named = KubeServicePort {
            port: 80,
            target_port: Some(IntOrString::String("web".to_string())),
            ..Default::default()
        };
        assert_eq!(find_port(&p, &named), Ok(8080));
        let udp = KubeServicePort {
            protocol: Some("UDP".to_string()),
            ..named.clone()
        };
        assert!(find_port(&p, &udp).is_err());
        assert_eq!(pod_port_map(&p).get("web"), Some(&8080));

        let md = vec![PodPort {
            name: "web".to_string(),
            container_port: 9080,
            protocol: "TCP".to_string(),
        }];
        assert_eq!(find_port_from_metadata(&named, &md), Ok(9080));
        assert!(find_port_from_metadata(&udp, &md).is_err());
    }

    #[test]
    fn selecting_services() {
        let all = vec![
            Arc::new(service("a", "ns", &[("app", "a")])),
            Arc::new(service("empty", "ns", &[])),
            Arc::new(without_selector(service("none", "ns", &[]))),
        ];
        let labels: Labels = [("app".to_string(), "a".to_string())].into_iter().collect();
        let names: Vec<_> = services_selecting(&all, &labels)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "empty"]);
    }
}
