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
use std::sync::{Arc, Mutex};

use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use tracing::debug;

use crate::kube::SyncErrors;
use crate::kube::client::{Informer, Object};
use crate::kube::controller::{Controller, ObjectHandler};
use crate::kube::conversion::namespaced_name;
use crate::kube::endpoint_builder::EndpointBuilder;
use crate::kube::endpoints::{EndpointSource, EndpointsController, get_pod, process_endpoint_event};
use crate::kube::namespace::Filtered;
use crate::model::{
    Event, HealthStatus, IstioEndpoint, Labels, NamespacedName, Proxy, Service, ServiceInstance,
    label,
};
use crate::strng::{self, Strng};

/// Endpoints cached per host and slice. A service spreads its endpoints over several slices, and
/// an endpoint may briefly appear in two of them while moving.
#[derive(Default)]
struct SliceCache {
    by_host: HashMap<Strng, HashMap<String, Vec<IstioEndpoint>>>,
}

impl SliceCache {
    fn update(&mut self, host: &Strng, slice: &str, endpoints: Vec<IstioEndpoint>) {
        if endpoints.is_empty() {
            self.delete(host, slice);
            return;
        }
        // Always overwrite: the latest update wins over stale slices.
        self.by_host
            .entry(host.clone())
            .or_default()
            .insert(slice.to_string(), endpoints);
    }

    fn delete(&mut self, host: &Strng, slice: &str) {
        if let Some(slices) = self.by_host.get_mut(host) {
            slices.remove(slice);
            if slices.is_empty() {
                self.by_host.remove(host);
            }
        }
    }

    /// Endpoints of every slice of `host`, deduplicated by address and port name.
    fn get(&self, host: &str) -> Vec<IstioEndpoint> {
        let mut found = BTreeMap::new();
        for eps in self.by_host.get(host).into_iter().flat_map(|s| s.values()) {
            for ep in eps {
                found
                    .entry((ep.address.clone(), ep.service_port_name.clone()))
                    .or_insert_with(|| ep.clone());
            }
        }
        found.into_values().collect()
    }

    fn has(&self, host: &str) -> bool {
        self.by_host.contains_key(host)
    }
}

fn service_name_label(slice: &EndpointSlice) -> Option<&str> {
    slice
        .labels()
        .get(label::SERVICE_NAME)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

fn service_selector(name: &str) -> Labels {
    [(label::SERVICE_NAME.to_string(), name.to_string())]
        .into_iter()
        .collect()
}

fn is_ready(ep: &Endpoint) -> bool {
    ep.conditions
        .as_ref()
        .and_then(|c| c.ready)
        .unwrap_or(true)
}

/// The `EndpointSlice` strategy. Unlike the legacy one it keeps a cache, since a service's
/// endpoints are spread over several objects.
pub struct EndpointSliceStrategy {
    slices: Arc<Filtered<EndpointSlice>>,
    // Only written from the controller queue.
    cache: Mutex<SliceCache>,
}

impl EndpointSliceStrategy {
    pub fn new(slices: Arc<Filtered<EndpointSlice>>) -> Self {
        EndpointSliceStrategy {
            slices,
            cache: Mutex::new(SliceCache::default()),
        }
    }

    pub fn informer(&self) -> &Arc<Filtered<EndpointSlice>> {
        &self.slices
    }

    fn build_for_slice(
        &self,
        c: &Controller,
        host: &Strng,
        slice: &EndpointSlice,
    ) -> Vec<IstioEndpoint> {
        if slice.address_type == "FQDN" {
            return Vec::new();
        }
        let key = namespaced_name(slice);
        let policy = c
            .exports()
            .discoverability_policy(c.get_service(host).as_deref());
        let mut out = Vec::new();
        for ep in &slice.endpoints {
            let ready = is_ready(ep);
            if !ready && !c.options().send_unhealthy_endpoints {
                continue;
            }
            let health = if ready {
                HealthStatus::Healthy
            } else {
                HealthStatus::UnHealthy
            };
            for addr in &ep.addresses {
                let (pod, expected) = get_pod(c, addr, &key, ep.target_ref.as_ref());
                if pod.is_none() && expected {
                    continue;
                }
                let builder = EndpointBuilder::new(c, pod.as_deref());
                for port in slice.ports.iter().flatten() {
                    out.push(builder.build(
                        c,
                        addr,
                        port.port.and_then(|p| u32::try_from(p).ok()).unwrap_or_default(),
                        port.name.as_deref().unwrap_or_default(),
                        policy,
                        health,
                    ));
                }
            }
        }
        out
    }

    fn update_cache_for_slice(&self, c: &Controller, host: &Strng, slice: &EndpointSlice) {
        let endpoints = self.build_for_slice(c, host, slice);
        self.cache
            .lock()
            .unwrap()
            .update(host, slice.name(), endpoints);
    }
}

impl EndpointSource<EndpointSlice> for EndpointSliceStrategy {
    fn service_name(&self, obj: &EndpointSlice) -> Option<NamespacedName> {
        let name = service_name_label(obj)?;
        Some(NamespacedName {
            namespace: strng::new(obj.namespace()),
            name: strng::new(name),
        })
    }

    fn forget(&self, c: &Controller, obj: &EndpointSlice) -> HashMap<Strng, Vec<IstioEndpoint>> {
        let key = namespaced_name(obj);
        for ep in &obj.endpoints {
            for addr in &ep.addresses {
                c.pods().endpoint_deleted(c, &key, addr);
            }
        }
        let Some(svc) = self.service_name(obj) else {
            return HashMap::new();
        };
        let mut cache = self.cache.lock().unwrap();
        c.hostnames_for_namespaced_name(&svc)
            .into_iter()
            .map(|host| {
                if cache.has(&host) {
                    cache.delete(&host, obj.name());
                }
                let remaining = cache.get(&host);
                (host, remaining)
            })
            .collect()
    }

    fn build(&self, c: &Controller, obj: &EndpointSlice, host: &Strng) -> Vec<IstioEndpoint> {
        self.update_cache_for_slice(c, host, obj);
        self.cache.lock().unwrap().get(host)
    }
}

impl EndpointSliceStrategy {
    fn on_event(&self, c: &Controller, slice: &EndpointSlice, event: Event) -> anyhow::Result<()> {
        process_endpoint_event(c, self, slice, event)
    }
}

impl ObjectHandler<EndpointSlice> for EndpointSliceStrategy {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<EndpointSlice>>,
        cur: Arc<EndpointSlice>,
        event: Event,
    ) -> anyhow::Result<()> {
        self.on_event(c, &cur, event)
    }

    fn skip_update(&self, _c: &Controller, old: &EndpointSlice, cur: &EndpointSlice) -> bool {
        old.endpoints == cur.endpoints && old.ports == cur.ports && old.labels() == cur.labels()
    }
}

impl EndpointsController for EndpointSliceStrategy {
    fn has_synced(&self) -> bool {
        self.slices.has_synced()
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
            return match self.slices.get(name, namespace) {
                Some(slice) => self.on_event(c, &slice, event),
                None => Ok(()),
            };
        }
        let all = if filtered {
            self.slices.list(namespace, None)
        } else {
            self.slices.unfiltered().list(namespace, None)
        };
        debug!("received {} endpointslices", all.len());
        let mut errs = SyncErrors::new();
        for slice in all {
            errs.push(self.on_event(c, &slice, event));
        }
        errs.into_result()
    }

    fn instances_by_port(
        &self,
        c: &Controller,
        svc: &Arc<Service>,
        port: u16,
    ) -> Vec<ServiceInstance> {
        let Some(svc_port) = svc.ports.get_by_port(port) else {
            return Vec::new();
        };
        let policy = c.exports().discoverability_policy(Some(svc));
        let selector = service_selector(&svc.attributes.name);
        let mut out = Vec::new();
        for slice in self.slices.list(&svc.attributes.namespace, Some(&selector)) {
            let key = namespaced_name(&*slice);
            for ep in &slice.endpoints {
                let ready = is_ready(ep);
                if !ready && !c.options().send_unhealthy_endpoints {
                    continue;
                }
                let health = if ready {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::UnHealthy
                };
                for addr in &ep.addresses {
                    let (pod, expected) = get_pod(c, addr, &key, ep.target_ref.as_ref());
                    if pod.is_none() && expected {
                        continue;
                    }
                    let builder = EndpointBuilder::new(c, pod.as_deref());
                    for p in slice.ports.iter().flatten() {
                        if p.name.as_deref().is_some_and(|n| n != svc_port.name) {
                            continue;
                        }
                        out.push(ServiceInstance {
                            service: svc.clone(),
                            service_port: svc_port.clone(),
                            endpoint: builder.build(
                                c,
                                addr,
                                p.port.and_then(|p| u32::try_from(p).ok()).unwrap_or_default(),
                                &svc_port.name,
                                policy,
                                health,
                            ),
                        });
                    }
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
        update_cache: bool,
    ) -> Vec<IstioEndpoint> {
        let slices = self.slices.list(namespace, Some(&service_selector(name)));
        if slices.is_empty() {
            debug!(name, namespace, "endpoint slices not found");
            return Vec::new();
        }
        if update_cache {
            for slice in &slices {
                self.update_cache_for_slice(c, host, slice);
            }
        }
        self.cache.lock().unwrap().get(host)
    }

    fn get_proxy_service_instances(&self, c: &Controller, proxy: &Proxy) -> Vec<ServiceInstance> {
        let mut out = Vec::new();
        for slice in self.slices.list(&proxy.config_namespace, None) {
            let Some(svc_name) = self.service_name(&slice) else {
                continue;
            };
            for svc in c.services_for_namespaced_name(&svc_name) {
                let pod = c.pods().get_pod_by_proxy(proxy);
                let builder = EndpointBuilder::new(c, pod.as_deref());
                let policy = c.exports().discoverability_policy(Some(&svc));
                for port in slice.ports.iter().flatten() {
                    let (Some(name), Some(num)) = (&port.name, port.port) else {
                        continue;
                    };
                    let Some(svc_port) = svc.ports.get(name) else {
                        continue;
                    };
                    for ip in &proxy.ip_addresses {
                        for ep in &slice.endpoints {
                            if !ep.addresses.contains(ip) {
                                continue;
                            }
                            out.push(ServiceInstance {
                                service: svc.clone(),
                                service_port: svc_port.clone(),
                                endpoint: builder.build(
                                    c,
                                    ip,
                                    u32::try_from(num).unwrap_or_default(),
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
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::Options;
    use crate::test_helpers::kube::*;

    fn ep(address: &str, port_name: &str) -> IstioEndpoint {
        IstioEndpoint {
            address: address.to_string(),
            service_port_name: port_name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn cache_dedupes_and_drops_empty() {
        let host = strng::literal!("svc.ns.svc.cluster.local");
        let mut cache = SliceCache::default();
        cache.update(&host, "a", vec![ep("10.0.0.1", "http"), ep("10.0.0.2", "http")]);
        cache.update(&host, "b", vec![ep("10.0.0.2", "http"), ep("10.0.0.2", "grpc")]);
        assert_eq!(cache.get(&host).len(), 3);

        cache.update(&host, "a", vec![]);
        assert_eq!(cache.get(&host).len(), 2);
        cache.delete(&host, "b");
        assert!(!cache.has(&host));
        assert!(cache.get(&host).is_empty());
    }

    #[tokio::test]
    async fn slices_merge_per_service() {
        let f = FakeController::new(Options::default()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .pods
            .apply(pod("p1", "ns", &[("app", "a")], "10.0.0.1", "node-1"));
        f.client
            .pods
            .apply(pod("p2", "ns", &[("app", "a")], "10.0.0.2", "node-1"));
        f.flush().await;
        f.client.endpoint_slices.apply(endpoint_slice(
            "svc-abc",
            "ns",
            "svc",
            &[("10.0.0.1", Some("p1"))],
            &[("http", 8080)],
        ));
        f.client.endpoint_slices.apply(endpoint_slice(
            "svc-def",
            "ns",
            "svc",
            &[("10.0.0.2", Some("p2"))],
            &[("http", 8080)],
        ));
        f.flush().await;
        assert_eq!(f.xds.last_eds("svc.ns.svc.cluster.local").unwrap().len(), 2);

        f.client.endpoint_slices.delete("svc-abc", "ns");
        f.flush().await;
        let eds = f.xds.last_eds("svc.ns.svc.cluster.local").unwrap();
        assert_eq!(eds.len(), 1);
        assert_eq!(eds[0].address, "10.0.0.2");

        f.client.endpoint_slices.delete("svc-def", "ns");
        f.flush().await;
        assert_eq!(f.xds.last_eds("svc.ns.svc.cluster.local"), Some(vec![]));
        let svc = f.controller.get_service("svc.ns.svc.cluster.local").unwrap();
        assert!(f.controller.instances_by_port(&svc, 80).is_empty());
    }

    #[tokio::test]
    async fn unlabelled_and_fqdn_slices_are_ignored() {
        let f = FakeController::new(Options::default()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.flush().await;
        f.xds.clear();

        let mut unlabelled =
            endpoint_slice("x", "ns", "svc", &[("10.0.0.1", None)], &[("http", 80)]);
        unlabelled.metadata.labels = None;
        f.client.endpoint_slices.apply(unlabelled);
        let mut fqdn = endpoint_slice(
            "y",
            "ns",
            "svc",
            &[("a.example.com", None)],
            &[("http", 80)],
        );
        fqdn.address_type = "FQDN".to_string();
        f.client.endpoint_slices.apply(fqdn);
        f.flush().await;
        assert!(
            f.xds
                .last_eds("svc.ns.svc.cluster.local")
                .unwrap_or_default()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn not_ready_endpoints() {
        let f = FakeController::new(Options::default()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        let mut slice = endpoint_slice("s", "ns", "svc", &[("10.0.0.1", None)], &[("http", 80)]);
        slice.endpoints[0].conditions = Some(Default::default());
        slice.endpoints[0].conditions.as_mut().unwrap().ready = Some(false);
        f.client.endpoint_slices.apply(slice);
        f.flush().await;
        assert!(f.xds.last_eds("svc.ns.svc.cluster.local").unwrap().is_empty());

        let f = FakeController::new(Options {
            send_unhealthy_endpoints: true,
            ..Default::default()
        })
        .await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        let mut slice = endpoint_slice("s", "ns", "svc", &[("10.0.0.1", None)], &[("http", 80)]);
        slice.endpoints[0].conditions = Some(Default::default());
        slice.endpoints[0].conditions.as_mut().unwrap().ready = Some(false);
        f.client.endpoint_slices.apply(slice);
        f.flush().await;
        let eds = f.xds.last_eds("svc.ns.svc.cluster.local").unwrap();
        assert_eq!(eds[0].health_status, HealthStatus::UnHealthy);
    }

    #[tokio::test]
    async fn proxy_instances_from_slices() {
        let f = FakeController::new(Options::default()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client.endpoint_slices.apply(endpoint_slice(
            "s",
            "ns",
            "svc",
            &[("10.0.0.1", None)],
            &[("http", 8080)],
        ));
        f.flush().await;
        let proxy = Proxy {
            id: "vm.ns".to_string(),
            ip_addresses: vec!["10.0.0.1".to_string()],
            config_namespace: "ns".to_string(),
            ..Default::default()
        };
        let got = f.controller.endpoints().get_proxy_service_instances(&f.controller, &proxy);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].endpoint.endpoint_port, 8080);
        assert_eq!(got[0].service_port.port, 80);
    }
}
