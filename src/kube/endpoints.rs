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

//! Endpoint assembly. [EndpointsController] is implemented once per endpoint source; the source is
//! picked when the controller is built and never changes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, Endpoints, ObjectReference, Pod};
use tracing::debug;

use crate::kube::SyncErrors;
use crate::kube::client::{Informer, Object};
use crate::kube::controller::{Controller, ObjectHandler};
use crate::kube::conversion::{self, namespaced_name};
use crate::kube::endpoint_builder::EndpointBuilder;
use crate::kube::namespace::Filtered;
use crate::metrics::{EndpointWithoutPod, IncrementRecorder};
use crate::model::{
    DiscoverabilityPolicy, Event, HealthStatus, IstioEndpoint, NamespacedName, Proxy, Service,
    ServiceInstance,
};
use crate::strng::Strng;
use crate::xds::{ConfigKey, PushRequest, TriggerReason};

pub trait EndpointsController: Send + Sync {
    fn has_synced(&self) -> bool;

    /// Replays endpoint objects as `event`. An empty `name` replays every object in `namespace`
    /// (all namespaces if empty); `filtered` restricts that to discovered namespaces.
    fn sync(
        &self,
        c: &Controller,
        name: &str,
        namespace: &str,
        event: Event,
        filtered: bool,
    ) -> anyhow::Result<()>;

    fn instances_by_port(&self, c: &Controller, svc: &Arc<Service>, port: u16)
    -> Vec<ServiceInstance>;

    /// Builds the endpoints of a service, optionally rebuilding any cached state first.
    fn build_istio_endpoints_with_service(
        &self,
        c: &Controller,
        name: &str,
        namespace: &str,
        host: &Strng,
        update_cache: bool,
    ) -> Vec<IstioEndpoint>;

    /// Instances whose endpoint addresses belong to the proxy.
    fn get_proxy_service_instances(&self, c: &Controller, proxy: &Proxy) -> Vec<ServiceInstance>;
}

/// Per-kind operations shared by the endpoint event pipeline.
pub(crate) trait EndpointSource<K: Object> {
    /// The service the object belongs to.
    fn service_name(&self, obj: &K) -> Option<NamespacedName>;

    /// Drops any state held for a deleted object, returning what remains per host.
    fn forget(&self, c: &Controller, obj: &K) -> HashMap<Strng, Vec<IstioEndpoint>>;

    /// Endpoints of one object for one host.
    fn build(&self, c: &Controller, obj: &K, host: &Strng) -> Vec<IstioEndpoint>;
}

/// Recomputes and pushes the endpoints of every host of the object's service, and triggers a full
/// push if that service is headless.
pub(crate) fn process_endpoint_event<K: Object, S: EndpointSource<K>>(
    c: &Controller,
    src: &S,
    obj: &K,
    event: Event,
) -> anyhow::Result<()> {
    let Some(svc_name) = src.service_name(obj) else {
        return Ok(());
    };
    debug!(
        name = %svc_name.name,
        namespace = %svc_name.namespace,
        %event,
        "handle EDS endpoint"
    );
    let forgotten = (event == Event::Delete).then(|| src.forget(c, obj));
    for host in c.hostnames_for_namespaced_name(&svc_name) {
        let mut endpoints = match &forgotten {
            Some(remaining) => remaining.get(&host).cloned().unwrap_or_default(),
            None => src.build(c, obj, &host),
        };
        push_eds(c, &host, &svc_name.namespace, &mut endpoints);
    }
    trigger_headless_push(c, &svc_name);
    Ok(())
}

/// Sends the endpoints of `host` downstream, adding matching workload instances.
pub(crate) fn push_eds(
    c: &Controller,
    host: &Strng,
    namespace: &str,
    endpoints: &mut Vec<IstioEndpoint>,
) {
    if c.options().enable_service_select_workload_entries {
        match c.get_service(host) {
            Some(svc) => endpoints.extend(c.collect_workload_instance_endpoints(&svc)),
            None => debug!(
                %host,
                "skip collecting workload entry endpoints, service not populated"
            ),
        }
    }
    c.xds()
        .eds_update(c.shard(), host, namespace, std::mem::take(endpoints));
}

/// DNS records of headless services are built from endpoints, so their changes need a full push.
pub(crate) fn trigger_headless_push(c: &Controller, svc_name: &NamespacedName) {
    let Some(k8s) = c.k8s_services().get(&svc_name.name, &svc_name.namespace) else {
        return;
    };
    if !conversion::is_headless(&k8s) || conversion::is_external_name(&k8s) {
        return;
    }
    let configs_updated: BTreeSet<ConfigKey> = c
        .services_for_namespaced_name(svc_name)
        .iter()
        .map(|svc| ConfigKey {
            kind: "ServiceEntry",
            name: svc.hostname.clone(),
            namespace: svc_name.namespace.clone(),
        })
        .collect();
    if configs_updated.is_empty() {
        return;
    }
    c.xds().config_update(PushRequest {
        full: true,
        configs_updated,
        reason: vec![TriggerReason::HeadlessEndpointUpdate],
    });
}

/// Finds the pod behind an endpoint address. Returns the pod and whether one was expected; an
/// expected but unknown pod registers the endpoint object for a resync once the pod arrives.
pub(crate) fn get_pod(
    c: &Controller,
    ip: &str,
    ep_key: &NamespacedName,
    target_ref: Option<&ObjectReference>,
) -> (Option<Arc<Pod>>, bool) {
    match target_ref {
        Some(r) if r.kind.as_deref() == Some("Pod") => {
            let key = NamespacedName {
                namespace: crate::strng::new(r.namespace.as_deref().unwrap_or(&ep_key.namespace)),
                name: crate::strng::new(r.name.as_deref().unwrap_or_default()),
            };
            let pod = c.pods().get_pod_by_key(&key);
            if pod.is_none() {
                debug!(ip, endpoint = %ep_key, "endpoint without pod");
                c.metrics().increment(&EndpointWithoutPod);
                c.pods()
                    .queue_endpoint_event_on_pod_arrival(c, ep_key.clone(), ip);
            }
            (pod, true)
        }
        // Manually managed endpoints; guess the pod by address.
        _ => (
            c.pods()
                .get_pods_by_ip(ip)
                .into_iter()
                .find(|p| p.namespace() == ep_key.namespace.as_str()),
            false,
        ),
    }
}

/// The legacy strategy, reading one `Endpoints` object per service.
pub struct EndpointsStrategy {
    endpoints: Arc<Filtered<Endpoints>>,
}

impl EndpointsStrategy {
    pub fn new(endpoints: Arc<Filtered<Endpoints>>) -> Self {
        EndpointsStrategy { endpoints }
    }

    pub fn informer(&self) -> &Arc<Filtered<Endpoints>> {
        &self.endpoints
    }

    fn build_from_addresses(
        &self,
        c: &Controller,
        ep: &Endpoints,
        subset: &EndpointSubset,
        addresses: &[EndpointAddress],
        host: &Strng,
        policy: DiscoverabilityPolicy,
        health: HealthStatus,
    ) -> Vec<IstioEndpoint> {
        let key = namespaced_name(ep);
        let mut out = Vec::new();
        for addr in addresses {
            let (pod, expected) = get_pod(c, &addr.ip, &key, addr.target_ref.as_ref());
            if pod.is_none() && expected {
                continue;
            }
            let builder = EndpointBuilder::new(c, pod.as_deref());
            for port in subset.ports.iter().flatten() {
                out.push(builder.build(
                    c,
                    &addr.ip,
                    u32::try_from(port.port).unwrap_or_default(),
                    port.name.as_deref().unwrap_or_default(),
                    policy,
                    health,
                ));
            }
        }
        debug!(%host, endpoints = out.len(), "built endpoints");
        out
    }

    fn build_endpoints(&self, c: &Controller, ep: &Endpoints, host: &Strng) -> Vec<IstioEndpoint> {
        let policy = c
            .exports()
            .discoverability_policy(c.get_service(host).as_deref());
        let mut out = Vec::new();
        for ss in ep.subsets.iter().flatten() {
            if let Some(addrs) = &ss.addresses {
                out.extend(self.build_from_addresses(
                    c,
                    ep,
                    ss,
                    addrs,
                    host,
                    policy,
                    HealthStatus::Healthy,
                ));
            }
            if c.options().send_unhealthy_endpoints {
                if let Some(addrs) = &ss.not_ready_addresses {
                    out.extend(self.build_from_addresses(
                        c,
                        ep,
                        ss,
                        addrs,
                        host,
                        policy,
                        HealthStatus::UnHealthy,
                    ));
                }
            }
        }
        out
    }

    fn service_instances(
        &self,
        c: &Controller,
        ep: &Endpoints,
        subset: &EndpointSubset,
        addresses: &[EndpointAddress],
        svc: &Arc<Service>,
        port: &crate::model::Port,
        health: HealthStatus,
    ) -> Vec<ServiceInstance> {
        let key = namespaced_name(ep);
        let policy = c.exports().discoverability_policy(Some(svc));
        let mut out = Vec::new();
        for addr in addresses {
            let (pod, expected) = get_pod(c, &addr.ip, &key, addr.target_ref.as_ref());
            if pod.is_none() && expected {
                continue;
            }
            let builder = EndpointBuilder::new(c, pod.as_deref());
            // Endpoint ports carry the service port name; a single unnamed port matches any.
            for ep_port in subset.ports.iter().flatten() {
                let name = ep_port.name.as_deref().unwrap_or_default();
                if !name.is_empty() && name != port.name {
                    continue;
                }
                out.push(ServiceInstance {
                    service: svc.clone(),
                    service_port: port.clone(),
                    endpoint: builder.build(
                        c,
                        &addr.ip,
                        u32::try_from(ep_port.port).unwrap_or_default(),
                        &port.name,
                        policy,
                        health,
                    ),
                });
            }
        }
        out
    }
}

impl EndpointSource<Endpoints> for EndpointsStrategy {
    fn service_name(&self, obj: &Endpoints) -> Option<NamespacedName> {
        Some(namespaced_name(obj))
    }

    fn forget(&self, c: &Controller, obj: &Endpoints) -> HashMap<Strng, Vec<IstioEndpoint>> {
        let key = namespaced_name(obj);
        for ss in obj.subsets.iter().flatten() {
            for addr in ss.addresses.iter().flatten() {
                c.pods().endpoint_deleted(c, &key, &addr.ip);
            }
        }
        HashMap::new()
    }

    fn build(&self, c: &Controller, obj: &Endpoints, host: &Strng) -> Vec<IstioEndpoint> {
        self.build_endpoints(c, obj, host)
    }
}

impl ObjectHandler<Endpoints> for EndpointsStrategy {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<Endpoints>>,
        cur: Arc<Endpoints>,
        event: Event,
    ) -> anyhow::Result<()> {
        process_endpoint_event(c, self, &cur, event)
    }

    fn skip_update(&self, _c: &Controller, old: &Endpoints, cur: &Endpoints) -> bool {
        old.subsets == cur.subsets
    }
}

impl EndpointsController for EndpointsStrategy {
    fn has_synced(&self) -> bool {
        self.endpoints.has_synced()
    }

    fn sync(
        &self,
        c: &Controller,
        name: &str,
        namespace: &str,
        event: Event,
        filtered: bool,
    ) -> anyhow::Result<()> {
        if !name.is_empty() {
            return match self.endpoints.get(name, namespace) {
                Some(ep) => process_endpoint_event(c, self, &ep, event),
                None => Ok(()),
            };
        }
        let all = if filtered {
            self.endpoints.list(namespace, None)
        } else {
            self.endpoints.unfiltered().list(namespace, None)
        };
        debug!("initializing {} endpoints", all.len());
        let mut errs = SyncErrors::new();
        for ep in all {
            errs.push(process_endpoint_event(c, self, &ep, event));
        }
        errs.into_result()
    }

    fn instances_by_port(
        &self,
        c: &Controller,
        svc: &Arc<Service>,
        port: u16,
    ) -> Vec<ServiceInstance> {
        let Some(ep) = self
            .endpoints
            .get(&svc.attributes.name, &svc.attributes.namespace)
        else {
            return Vec::new();
        };
        let Some(svc_port) = svc.ports.get_by_port(port) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for ss in ep.subsets.iter().flatten() {
            if let Some(addrs) = &ss.addresses {
                out.extend(self.service_instances(
                    c,
                    &ep,
                    ss,
                    addrs,
                    svc,
                    svc_port,
                    HealthStatus::Healthy,
                ));
            }
            if c.options().send_unhealthy_endpoints {
                if let Some(addrs) = &ss.not_ready_addresses {
                    out.extend(self.service_instances(
                        c,
                        &ep,
                        ss,
                        addrs,
                        svc,
                        svc_port,
                        HealthStatus::UnHealthy,
                    ));
                }
            }
        }
        out
    }

    fn build_istio_endpoints_with_service(
        &self,
        c: &Controller,
        name: &str,
        namespace: &str,
        host: &Strng,
        _update_cache: bool,
    ) -> Vec<IstioEndpoint> {
        match self.endpoints.get(name, namespace) {
            Some(ep) => self.build_endpoints(c, &ep, host),
            None => {
                debug!(name, namespace, "endpoints not found");
                Vec::new()
            }
        }
    }

    fn get_proxy_service_instances(&self, c: &Controller, proxy: &Proxy) -> Vec<ServiceInstance> {
        let mut out = Vec::new();
        for ep in self.endpoints.list(&proxy.config_namespace, None) {
            let key = namespaced_name(&*ep);
            for svc in c.services_for_namespaced_name(&key) {
                let pod = c.pods().get_pod_by_proxy(proxy);
                let builder = EndpointBuilder::new(c, pod.as_deref());
                let policy = c.exports().discoverability_policy(Some(&svc));
                for ss in ep.subsets.iter().flatten() {
                    for ep_port in ss.ports.iter().flatten() {
                        let Some(svc_port) = svc
                            .ports
                            .get(ep_port.name.as_deref().unwrap_or_default())
                        else {
                            continue;
                        };
                        for ip in &proxy.ip_addresses {
                            let has_ip = |addrs: &Option<Vec<EndpointAddress>>| {
                                addrs.iter().flatten().any(|a| &a.ip == ip)
                            };
                            if has_ip(&ss.addresses) || has_ip(&ss.not_ready_addresses) {
                                out.push(ServiceInstance {
                                    service: svc.clone(),
                                    service_port: svc_port.clone(),
                                    endpoint: builder.build(
                                        c,
                                        ip,
                                        u32::try_from(ep_port.port).unwrap_or_default(),
                                        &svc_port.name,
                                        policy,
                                        HealthStatus::Healthy,
                                    ),
                                });
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{EndpointMode, Options};
    use crate::test_helpers::kube::*;
    use crate::test_helpers::xds::XdsEvent;

    fn opts() -> Options {
        Options {
            endpoint_mode: EndpointMode::Endpoints,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn endpoints_build_from_pods() {
        let f = FakeController::new(opts()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .pods
            .apply(pod("p1", "ns", &[("app", "a")], "10.0.0.1", "node-1"));
        f.flush().await;
        f.client
            .endpoints
            .apply(endpoints("svc", "ns", &[("10.0.0.1", Some("p1"))], &[("http", 8080)]));
        f.flush().await;

        let eds = f.xds.last_eds("svc.ns.svc.cluster.local").unwrap();
        assert_eq!(eds.len(), 1);
        assert_eq!(eds[0].address, "10.0.0.1");
        assert_eq!(eds[0].endpoint_port, 8080);
        assert_eq!(eds[0].service_port_name, "http");
        assert_eq!(eds[0].workload_name, "p1");

        let svc = f.controller.get_service("svc.ns.svc.cluster.local").unwrap();
        let instances = f.controller.instances_by_port(&svc, 80);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint.endpoint_port, 8080);
    }

    #[tokio::test]
    async fn endpoint_waits_for_pod() {
        let f = FakeController::new(opts()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .endpoints
            .apply(endpoints("svc", "ns", &[("10.0.0.1", Some("p1"))], &[("http", 8080)]));
        f.flush().await;
        assert!(f.xds.last_eds("svc.ns.svc.cluster.local").unwrap().is_empty());
        assert_eq!(f.metrics.pending_pods(), 1);

        // The pod arriving resyncs the endpoints object.
        f.client
            .pods
            .apply(pod("p1", "ns", &[("app", "a")], "10.0.0.1", "node-1"));
        f.flush().await;
        f.flush().await;
        assert_eq!(f.xds.last_eds("svc.ns.svc.cluster.local").unwrap().len(), 1);
        assert_eq!(f.metrics.pending_pods(), 0);
    }

    #[tokio::test]
    async fn unhealthy_addresses() {
        let f = FakeController::new(Options {
            send_unhealthy_endpoints: true,
            ..opts()
        })
        .await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        let mut ep = endpoints("svc", "ns", &[], &[("http", 8080)]);
        ep.subsets.as_mut().unwrap()[0].not_ready_addresses = Some(vec![EndpointAddress {
            ip: "10.0.0.9".to_string(),
            ..Default::default()
        }]);
        f.client.endpoints.apply(ep);
        f.flush().await;
        let eds = f.xds.last_eds("svc.ns.svc.cluster.local").unwrap();
        assert_eq!(eds.len(), 1);
        assert_eq!(eds[0].health_status, HealthStatus::UnHealthy);
    }

    #[tokio::test]
    async fn headless_triggers_full_push() {
        let f = FakeController::new(opts()).await;
        let mut svc = service("db", "ns", &[("app", "db")]);
        svc.spec.as_mut().unwrap().cluster_ip = Some("None".to_string());
        f.client.services.apply(svc);
        f.flush().await;
        f.xds.clear();
        f.client.endpoints.apply(endpoints(
            "db",
            "ns",
            &[("10.0.0.1", None)],
            &[("tcp", 5432)],
        ));
        f.flush().await;
        let headless = vec![TriggerReason::HeadlessEndpointUpdate];
        assert!(f.xds.events().iter().any(|e| matches!(
            e,
            XdsEvent::Config(req) if req.full && req.reason == headless
        )));
    }

    #[tokio::test]
    async fn identical_update_is_skipped() {
        let f = FakeController::new(opts()).await;
        let ep = endpoints("svc", "ns", &[("10.0.0.1", None)], &[("http", 80)]);
        f.client.endpoints.apply(ep.clone());
        f.client.endpoints.apply(ep);
        f.flush().await;
        assert_eq!(
            f.metrics
                .events("Endpoints", crate::metrics::EventType::updatesame),
            1
        );
    }
}
