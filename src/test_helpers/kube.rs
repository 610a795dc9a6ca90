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

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
    Namespace, Node, NodeAddress, NodeStatus, ObjectReference, Pod, PodCondition, PodIP, PodSpec,
    PodStatus, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::discovery::v1::{
    Endpoint, EndpointConditions, EndpointPort as SlicePort, EndpointSlice,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

use crate::kube::client::MemoryClient;
use crate::kube::{Controller, Options};
use crate::metrics::Metrics;
use crate::model::{Labels, label};
use crate::test_helpers::initialize_telemetry;
use crate::test_helpers::xds::FakeXdsUpdater;

fn labels(kv: &[(&str, &str)]) -> Labels {
    kv.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn meta(name: &str, ns: &str, kv: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: (!ns.is_empty()).then(|| ns.to_string()),
        labels: (!kv.is_empty()).then(|| labels(kv)),
        ..Default::default()
    }
}

/// A ClusterIP service exposing port 80 ("http") with target port 8080.
pub fn service(name: &str, ns: &str, selector: &[(&str, &str)]) -> Service {
    Service {
        metadata: meta(name, ns, &[]),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("10.96.0.1".to_string()),
            selector: Some(labels(selector)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(8080)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn without_selector(mut svc: Service) -> Service {
    if let Some(spec) = svc.spec.as_mut() {
        spec.selector = None;
    }
    svc
}

pub fn node_port(mut svc: Service, port: i32) -> Service {
    if let Some(spec) = svc.spec.as_mut() {
        spec.type_ = Some("NodePort".to_string());
        if let Some(p) = spec.ports.as_mut().and_then(|p| p.first_mut()) {
            p.node_port = Some(port);
        }
    }
    svc
}

/// A ready, running pod with a single container exposing "http" on 8080.
pub fn pod(name: &str, ns: &str, kv: &[(&str, &str)], ip: &str, node: &str) -> Pod {
    Pod {
        metadata: meta(name, ns, kv),
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "app".to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some("http".to_string()),
                    container_port: 8080,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            pod_ips: Some(vec![PodIP {
                ip: ip.to_string(),
            }]),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn set_ready(pod: &mut Pod, ready: bool) {
    let status = if ready { "True" } else { "False" };
    let conditions = pod
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Default::default);
    match conditions.iter_mut().find(|c| c.type_ == "Ready") {
        Some(c) => c.status = status.to_string(),
        None => conditions.push(PodCondition {
            type_: "Ready".to_string(),
            status: status.to_string(),
            ..Default::default()
        }),
    }
}

pub fn node(name: &str, external_ip: Option<&str>, kv: &[(&str, &str)]) -> Node {
    let mut addresses = vec![NodeAddress {
        type_: "InternalIP".to_string(),
        address: "192.168.0.1".to_string(),
    }];
    if let Some(ip) = external_ip {
        addresses.push(NodeAddress {
            type_: "ExternalIP".to_string(),
            address: ip.to_string(),
        });
    }
    Node {
        metadata: meta(name, "", kv),
        spec: None,
        status: Some(NodeStatus {
            addresses: Some(addresses),
            ..Default::default()
        }),
    }
}

pub fn namespace(name: &str, kv: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: meta(name, "", kv),
        ..Default::default()
    }
}

pub fn crd(name: &str) -> CustomResourceDefinition {
    CustomResourceDefinition {
        metadata: meta(name, "", &[]),
        ..Default::default()
    }
}

fn pod_ref(name: &str, ns: &str) -> ObjectReference {
    ObjectReference {
        kind: Some("Pod".to_string()),
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        ..Default::default()
    }
}

/// An Endpoints object with one subset. Each address optionally references its pod.
pub fn endpoints(
    name: &str,
    ns: &str,
    addrs: &[(&str, Option<&str>)],
    ports: &[(&str, i32)],
) -> Endpoints {
    Endpoints {
        metadata: meta(name, ns, &[]),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                addrs
                    .iter()
                    .map(|(ip, pod)| EndpointAddress {
                        ip: ip.to_string(),
                        target_ref: pod.map(|p| pod_ref(p, ns)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            not_ready_addresses: None,
            ports: Some(
                ports
                    .iter()
                    .map(|(n, p)| EndpointPort {
                        name: Some(n.to_string()),
                        port: *p,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }]),
    }
}

/// An IPv4 EndpointSlice owned by service `svc`, with all endpoints ready.
pub fn endpoint_slice(
    name: &str,
    ns: &str,
    svc: &str,
    addrs: &[(&str, Option<&str>)],
    ports: &[(&str, i32)],
) -> EndpointSlice {
    EndpointSlice {
        metadata: meta(name, ns, &[(label::SERVICE_NAME, svc)]),
        address_type: "IPv4".to_string(),
        endpoints: addrs
            .iter()
            .map(|(ip, pod)| Endpoint {
                addresses: vec![ip.to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(true),
                    ..Default::default()
                }),
                target_ref: pod.map(|p| pod_ref(p, ns)),
                ..Default::default()
            })
            .collect(),
        ports: Some(
            ports
                .iter()
                .map(|(n, p)| SlicePort {
                    name: Some(n.to_string()),
                    port: Some(*p),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

/// FakeController runs a [Controller] over a [MemoryClient], recording downstream calls.
pub struct FakeController {
    pub controller: Arc<Controller>,
    pub client: Arc<MemoryClient>,
    pub xds: Arc<FakeXdsUpdater>,
    pub metrics: Arc<Metrics>,
    pub stop: CancellationToken,
}

impl FakeController {
    /// Builds a controller without starting it. Informers are not synced.
    pub fn unstarted(opts: Options) -> FakeController {
        initialize_telemetry();
        let client = Arc::new(MemoryClient::new());
        let xds = Arc::new(FakeXdsUpdater::new());
        let mut registry = Registry::default();
        let metrics = Arc::new(Metrics::from(&mut registry));
        let controller = Controller::new(client.clients(), opts, xds.clone(), metrics.clone());
        FakeController {
            controller,
            client,
            xds,
            metrics,
            stop: CancellationToken::new(),
        }
    }

    /// Builds a controller and waits for its initial sync.
    pub async fn new(opts: Options) -> FakeController {
        FakeController::unstarted(opts).start().await
    }

    pub async fn start(self) -> FakeController {
        self.client.mark_synced();
        self.spawn();
        self.controller.wait_until_synced().await;
        self
    }

    pub fn spawn(&self) {
        tokio::spawn(self.controller.clone().run(self.stop.clone()));
    }

    /// Waits until all queued work, including work queued by that work, has run.
    pub async fn flush(&self) {
        self.controller.queue().flush().await;
        self.controller.imports().queue().flush().await;
        self.controller.exports().queue().flush().await;
        self.controller.queue().flush().await;
    }
}

impl Drop for FakeController {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
