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

//! Multi-cluster services: `ServiceExport` controls endpoint discoverability, `ServiceImport`
//! creates the `clusterset.local` host of a service.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use ::kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kube::client::{Informer, Object};
use crate::kube::controller::{Controller, ObjectHandler};
use crate::kube::conversion::{clusterset_hostname, is_clusterset_host, namespaced_name};
use crate::kube::queue::Queue;
use crate::model::{
    ClusterId, DiscoverabilityPolicy, Event, MCSServiceInfo, NamespacedName, Service,
};
use crate::strng;
use crate::xds::{ConfigKey, PushRequest, TriggerReason};

pub const SERVICE_EXPORT_CRD: &str = "serviceexports.multicluster.x-k8s.io";
pub const SERVICE_IMPORT_CRD: &str = "serviceimports.multicluster.x-k8s.io";

/// ServiceExport marks a service as exported to the cluster set. It carries no configuration.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ServiceExport",
    plural = "serviceexports",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
pub struct ServiceExportSpec {}

/// ServiceImport carries the cluster set VIPs of a service imported into this cluster.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ServiceImport",
    plural = "serviceimports",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default, rename = "type")]
    pub type_: String,
}

impl ServiceImport {
    /// The valid cluster set VIPs, sorted.
    pub fn ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .spec
            .ips
            .iter()
            .filter(|ip| ip.parse::<IpAddr>().is_ok())
            .cloned()
            .collect();
        ips.sort();
        ips
    }
}

/// ExportCache tracks `ServiceExport`s. When discovery is disabled every endpoint is discoverable
/// from everywhere.
pub struct ExportCache {
    exports: Option<Arc<dyn Informer<ServiceExport>>>,
    cluster_local: bool,
    domain_suffix: strng::Strng,
    queue: Arc<Queue>,
}

impl ExportCache {
    pub fn new(
        exports: Arc<dyn Informer<ServiceExport>>,
        cluster_local: bool,
        domain_suffix: strng::Strng,
        cluster: &ClusterId,
    ) -> Self {
        ExportCache {
            exports: Some(exports),
            cluster_local,
            domain_suffix,
            queue: Arc::new(Queue::new(strng::new(format!("exports-{cluster}")))),
        }
    }

    pub fn disabled(cluster: &ClusterId) -> Self {
        ExportCache {
            exports: None,
            cluster_local: false,
            domain_suffix: strng::EMPTY,
            queue: Arc::new(Queue::new(strng::new(format!("exports-{cluster}")))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.exports.is_some()
    }

    pub fn informer(&self) -> Option<&Arc<dyn Informer<ServiceExport>>> {
        self.exports.as_ref()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn has_synced(&self) -> bool {
        self.exports.as_ref().is_none_or(|e| e.has_synced())
    }

    pub fn is_exported(&self, name: &NamespacedName) -> bool {
        self.exports
            .as_ref()
            .is_some_and(|e| e.get(&name.name, &name.namespace).is_some())
    }

    pub fn discoverability_policy(&self, svc: Option<&Service>) -> DiscoverabilityPolicy {
        let Some(svc) = svc else {
            return DiscoverabilityPolicy::AlwaysDiscoverable;
        };
        if !self.enabled() {
            return DiscoverabilityPolicy::AlwaysDiscoverable;
        }
        if !is_clusterset_host(&svc.hostname) {
            // With cluster-local mode, the cluster.local host only reaches its own cluster.
            return if self.cluster_local {
                DiscoverabilityPolicy::DiscoverableFromSameCluster
            } else {
                DiscoverabilityPolicy::AlwaysDiscoverable
            };
        }
        if self.is_exported(&svc.namespaced_name()) {
            DiscoverabilityPolicy::AlwaysDiscoverable
        } else {
            DiscoverabilityPolicy::DiscoverableFromSameCluster
        }
    }

    /// Every exported service with the policy of each of its hosts known to `c`.
    pub fn exported_services(&self, c: &Controller) -> Vec<MCSServiceInfo> {
        let Some(exports) = &self.exports else {
            return Vec::new();
        };
        exports
            .list("", None)
            .iter()
            .map(|export| {
                let name = namespaced_name(&**export);
                let hosts = [
                    crate::kube::conversion::service_hostname(
                        &name.name,
                        &name.namespace,
                        &self.domain_suffix,
                    ),
                    clusterset_hostname(&name),
                ];
                let discoverability: BTreeMap<_, _> = hosts
                    .into_iter()
                    .filter_map(|host| {
                        let svc = c.get_service(&host)?;
                        Some((host, self.discoverability_policy(Some(&svc)).to_string()))
                    })
                    .collect();
                MCSServiceInfo {
                    cluster: c.cluster().clone(),
                    name: name.name,
                    namespace: name.namespace,
                    exported: true,
                    discoverability,
                    ..Default::default()
                }
            })
            .collect()
    }

    /// Rebuilds the endpoints of every host of the exported service under its new policy.
    fn update_xds(&self, c: &Controller, export: &ServiceExport) {
        let name = namespaced_name(export);
        for svc in c.services_for_namespaced_name(&name) {
            let endpoints = c.build_endpoints_for_service(&svc, true);
            c.xds()
                .eds_update(c.shard(), &svc.hostname, &name.namespace, endpoints);
        }
    }
}

impl ObjectHandler<ServiceExport> for ExportCache {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<ServiceExport>>,
        cur: Arc<ServiceExport>,
        event: Event,
    ) -> anyhow::Result<()> {
        match event {
            Event::Add | Event::Delete => self.update_xds(c, &cur),
            // Exports carry no spec; updates change nothing.
            Event::Update => {}
        }
        Ok(())
    }
}

/// ImportCache maintains the synthetic `clusterset.local` service for each imported service.
pub struct ImportCache {
    imports: Option<Arc<dyn Informer<ServiceImport>>>,
    domain_suffix: strng::Strng,
    queue: Arc<Queue>,
}

impl ImportCache {
    pub fn new(
        imports: Arc<dyn Informer<ServiceImport>>,
        domain_suffix: strng::Strng,
        cluster: &ClusterId,
    ) -> Self {
        ImportCache {
            imports: Some(imports),
            domain_suffix,
            queue: Arc::new(Queue::new(strng::new(format!("imports-{cluster}")))),
        }
    }

    pub fn disabled(cluster: &ClusterId) -> Self {
        ImportCache {
            imports: None,
            domain_suffix: strng::EMPTY,
            queue: Arc::new(Queue::new(strng::new(format!("imports-{cluster}")))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.imports.is_some()
    }

    pub fn informer(&self) -> Option<&Arc<dyn Informer<ServiceImport>>> {
        self.imports.as_ref()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn has_synced(&self) -> bool {
        self.imports.as_ref().is_none_or(|i| i.has_synced())
    }

    fn cluster_set_ips(&self, name: &NamespacedName) -> Vec<String> {
        self.imports
            .as_ref()
            .and_then(|i| i.get(&name.name, &name.namespace))
            .map(|si| si.ips())
            .unwrap_or_default()
    }

    fn cluster_local_host(&self, name: &NamespacedName) -> strng::Strng {
        crate::kube::conversion::service_hostname(&name.name, &name.namespace, &self.domain_suffix)
    }

    /// Keeps the clusterset host in step with changes to its cluster.local service. The work is
    /// done on the import queue so it is ordered with import events.
    pub fn on_service_event(&self, c: &Controller, svc: Arc<Service>, event: Event) {
        if !self.enabled() || is_clusterset_host(&svc.hostname) {
            return;
        }
        let weak: Weak<Controller> = c.weak();
        self.queue.push(move || {
            let Some(c) = weak.upgrade() else {
                return Ok(());
            };
            c.imports().process_service_event(&c, &svc, event)
        });
    }

    fn process_service_event(
        &self,
        c: &Controller,
        svc: &Service,
        event: Event,
    ) -> anyhow::Result<()> {
        let name = svc.namespaced_name();
        let mcs_host = clusterset_hostname(&name);
        let prev = c.get_service(&mcs_host);
        let vips = self.cluster_set_ips(&name);
        let local_gone =
            event == Event::Delete && c.get_service(&self.cluster_local_host(&name)).is_none();
        if vips.is_empty() || local_gone {
            if let Some(prev) = prev {
                c.delete_service(&prev);
            }
            return Ok(());
        }
        let event = if prev.is_some() {
            Event::Update
        } else {
            Event::Add
        };
        let mcs = Arc::new(gen_mcs_service(svc, mcs_host, vips, c.cluster()));
        c.add_or_update_service(None, mcs, event, false);
        Ok(())
    }

    /// Every imported service, with the first cluster set VIP when the clusterset host exists.
    pub fn imported_services(&self, c: &Controller) -> Vec<MCSServiceInfo> {
        let Some(imports) = &self.imports else {
            return Vec::new();
        };
        imports
            .list("", None)
            .iter()
            .map(|si| {
                let name = namespaced_name(&**si);
                let cluster_set_vip = c
                    .get_service(&clusterset_hostname(&name))
                    .map(|svc| svc.cluster_vips.get_addresses_for(c.cluster()).to_vec())
                    .unwrap_or_default();
                MCSServiceInfo {
                    cluster: c.cluster().clone(),
                    name: name.name,
                    namespace: name.namespace,
                    imported: true,
                    cluster_set_vip,
                    ..Default::default()
                }
            })
            .collect()
    }
}

fn gen_mcs_service(
    real: &Service,
    host: strng::Strng,
    vips: Vec<String>,
    cluster: &ClusterId,
) -> Service {
    let mut mcs = real.clone();
    mcs.hostname = host;
    mcs.default_address = vips[0].clone();
    mcs.cluster_vips = Default::default();
    mcs.cluster_vips.set_addresses_for(cluster.clone(), vips);
    mcs
}

impl ObjectHandler<ServiceImport> for ImportCache {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<ServiceImport>>,
        cur: Arc<ServiceImport>,
        event: Event,
    ) -> anyhow::Result<()> {
        let name = namespaced_name(&*cur);
        let mcs_host = clusterset_hostname(&name);
        let ips = cur.ips();
        let mut full_push = false;
        let (mcs, event) = match c.get_service(&mcs_host) {
            None => {
                if event == Event::Delete || ips.is_empty() {
                    return Ok(());
                }
                let Some(real) = c.get_service(&self.cluster_local_host(&name)) else {
                    warn!(
                        import = %name,
                        cluster = %c.cluster(),
                        "no matching service found for ServiceImport"
                    );
                    return Ok(());
                };
                (gen_mcs_service(&real, mcs_host.clone(), ips, c.cluster()), Event::Add)
            }
            Some(prev) => {
                if event == Event::Delete || ips.is_empty() {
                    c.delete_service(&prev);
                    return Ok(());
                }
                let mut mcs = (*prev).clone();
                if mcs.cluster_vips.get_addresses_for(c.cluster()) != ips.as_slice() {
                    mcs.default_address = ips[0].clone();
                    mcs.cluster_vips.set_addresses_for(c.cluster().clone(), ips);
                    full_push = true;
                }
                (mcs, Event::Update)
            }
        };
        // The import may have changed discoverability, so the endpoint cache is always rebuilt.
        c.add_or_update_service(None, Arc::new(mcs), event, true);
        if full_push {
            debug!(host = %mcs_host, "cluster set VIPs changed");
            c.xds().config_update(PushRequest {
                full: true,
                configs_updated: [ConfigKey {
                    kind: "ServiceEntry",
                    name: mcs_host,
                    namespace: name.namespace,
                }]
                .into_iter()
                .collect(),
                reason: vec![TriggerReason::ServiceUpdate],
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::Options;
    use crate::test_helpers::kube::*;
    use crate::test_helpers::xds::XdsEvent;

    fn opts() -> Options {
        Options {
            enable_mcs_service_discovery: true,
            enable_mcs_host: true,
            ..Default::default()
        }
    }

    fn import(name: &str, ns: &str, ips: &[&str]) -> ServiceImport {
        let mut si = ServiceImport::new(
            name,
            ServiceImportSpec {
                ips: ips.iter().map(|s| s.to_string()).collect(),
                type_: "ClusterSetIP".to_string(),
            },
        );
        si.metadata.namespace = Some(ns.to_string());
        si
    }

    fn export(name: &str, ns: &str) -> ServiceExport {
        let mut se = ServiceExport::new(name, ServiceExportSpec {});
        se.metadata.namespace = Some(ns.to_string());
        se
    }

    #[test]
    fn import_ips_are_validated_and_sorted() {
        let si = import("a", "ns", &["10.0.0.2", "bogus", "10.0.0.1"]);
        assert_eq!(si.ips(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn crd_objects_decode() {
        use ::kube::{CustomResourceExt, Resource};

        let si: ServiceImport = serde_yaml::from_str(
            r#"
apiVersion: multicluster.x-k8s.io/v1alpha1
kind: ServiceImport
metadata:
  name: svc
  namespace: ns
spec:
  type: ClusterSetIP
  ips: [10.0.0.9]
"#,
        )
        .unwrap();
        assert_eq!(si.spec.type_, "ClusterSetIP");
        assert_eq!(si.ips(), vec!["10.0.0.9"]);
        assert_eq!(::kube::ResourceExt::namespace(&si).as_deref(), Some("ns"));
        assert_eq!(ServiceImport::crd_name(), SERVICE_IMPORT_CRD);
        assert_eq!(ServiceExport::crd_name(), SERVICE_EXPORT_CRD);
        assert_eq!(ServiceExport::kind(&()), "ServiceExport");
    }

    #[test]
    fn disabled_caches() {
        let cluster = strng::literal!("c1");
        let exports = ExportCache::disabled(&cluster);
        assert!(exports.has_synced());
        assert_eq!(
            exports.discoverability_policy(Some(&Service::default())),
            DiscoverabilityPolicy::AlwaysDiscoverable
        );
        assert!(!ImportCache::disabled(&cluster).enabled());
    }

    #[tokio::test]
    async fn export_controls_clusterset_discoverability() {
        let f = FakeController::new(opts()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .service_imports
            .apply(import("svc", "ns", &["240.0.0.1"]));
        f.flush().await;

        let local = f.controller.get_service("svc.ns.svc.cluster.local").unwrap();
        let set = f.controller.get_service("svc.ns.svc.clusterset.local").unwrap();
        assert_eq!(set.default_address, "240.0.0.1");
        let exports = f.controller.exports();
        assert_eq!(
            exports.discoverability_policy(Some(&local)),
            DiscoverabilityPolicy::AlwaysDiscoverable
        );
        assert_eq!(
            exports.discoverability_policy(Some(&set)),
            DiscoverabilityPolicy::DiscoverableFromSameCluster
        );

        f.client.service_exports.apply(export("svc", "ns"));
        f.flush().await;
        assert_eq!(
            f.controller.exports().discoverability_policy(Some(&set)),
            DiscoverabilityPolicy::AlwaysDiscoverable
        );
        let mcs = f.controller.mcs_services();
        assert_eq!(mcs.len(), 1);
        assert!(mcs[0].exported && mcs[0].imported);
        assert_eq!(mcs[0].cluster_set_vip, vec!["240.0.0.1"]);
    }

    #[tokio::test]
    async fn import_vip_change_is_full_push() {
        let f = FakeController::new(opts()).await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .service_imports
            .apply(import("svc", "ns", &["240.0.0.1"]));
        f.flush().await;
        f.xds.clear();

        f.client
            .service_imports
            .apply(import("svc", "ns", &["240.0.0.2"]));
        f.flush().await;
        assert!(f.xds.events().iter().any(|e| matches!(
            e,
            XdsEvent::Config(req) if req.full && req.reason == vec![TriggerReason::ServiceUpdate]
        )));

        f.client.service_imports.delete("svc", "ns");
        f.flush().await;
        assert!(f.controller.get_service("svc.ns.svc.clusterset.local").is_none());
    }

    fn hostnames(f: &FakeController) -> Vec<String> {
        f.controller
            .services()
            .iter()
            .map(|s| s.hostname.to_string())
            .collect()
    }

    #[tokio::test]
    async fn imports_ignored_without_mcs_host() {
        let f = FakeController::new(Options {
            enable_mcs_service_discovery: true,
            ..Default::default()
        })
        .await;
        assert!(f.controller.exports().enabled());
        assert!(!f.controller.imports().enabled());
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .service_imports
            .apply(import("svc", "ns", &["240.0.0.1"]));
        f.flush().await;
        assert_eq!(hostnames(&f), vec!["svc.ns.svc.cluster.local"]);
    }

    #[tokio::test]
    async fn mcs_host_without_discovery() {
        let f = FakeController::new(Options {
            enable_mcs_host: true,
            ..Default::default()
        })
        .await;
        assert!(!f.controller.exports().enabled());
        assert!(f.controller.imports().enabled());
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.client
            .pods
            .apply(pod("p1", "ns", &[("app", "a")], "10.1.0.1", "n1"));
        f.client
            .service_imports
            .apply(import("svc", "ns", &["240.0.0.1"]));
        f.flush().await;
        assert_eq!(
            hostnames(&f),
            vec!["svc.ns.svc.cluster.local", "svc.ns.svc.clusterset.local"]
        );

        f.client.endpoint_slices.apply(endpoint_slice(
            "svc-1",
            "ns",
            "svc",
            &[("10.1.0.1", Some("p1"))],
            &[("http", 8080)],
        ));
        f.flush().await;
        let eds = f.xds.last_eds("svc.ns.svc.clusterset.local").unwrap();
        assert_eq!(eds.len(), 1);
        assert_eq!(eds[0].address, "10.1.0.1");

        // Without discovery every host is visible everywhere.
        let set = f
            .controller
            .get_service("svc.ns.svc.clusterset.local")
            .unwrap();
        assert_eq!(
            f.controller.exports().discoverability_policy(Some(&set)),
            DiscoverabilityPolicy::AlwaysDiscoverable
        );
    }

    #[tokio::test]
    async fn cluster_local_mode() {
        let f = FakeController::new(Options {
            enable_mcs_cluster_local: true,
            ..opts()
        })
        .await;
        f.client.services.apply(service("svc", "ns", &[("app", "a")]));
        f.flush().await;
        let local = f.controller.get_service("svc.ns.svc.cluster.local").unwrap();
        assert_eq!(
            f.controller.exports().discoverability_policy(Some(&local)),
            DiscoverabilityPolicy::DiscoverableFromSameCluster
        );
    }
}
