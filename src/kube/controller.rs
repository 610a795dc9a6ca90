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

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service as KubeService, ServicePort};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::kube::client::{Clients, EventHandler, Informer, Object};
use crate::kube::conversion::{
    self, ServiceTargetPort, clusterset_hostname, find_port, find_port_from_metadata,
    namespaced_name, service_hostname, services_selecting,
};
use crate::kube::endpoint_builder::{ControllerView, EndpointBuilder, augment_labels};
use crate::kube::endpoints::{EndpointsController, EndpointsStrategy};
use crate::kube::endpointslice::EndpointSliceStrategy;
use crate::kube::mcs::{
    ExportCache, ImportCache, SERVICE_EXPORT_CRD, SERVICE_IMPORT_CRD, ServiceExport,
    ServiceImport,
};
use crate::kube::namespace::{DiscoveryNamespacesFilter, Filtered};
use crate::kube::network::{MeshNetworks, NetworkState};
use crate::kube::pod::{PodCache, pod_ip};
use crate::kube::queue::Queue;
use crate::kube::workloadinstances::{self, Index as WorkloadInstanceIndex};
use crate::kube::{EndpointMode, Error, Options, SyncErrors};
use crate::metrics::{EventType, IncrementRecorder, Metrics, RegistryEvent};
use crate::model::{
    ClusterId, Event, HealthStatus, IstioEndpoint, Labels, MCSServiceInfo, NamespacedName,
    NetworkGateway, NetworkId, Port, Protocol, Provider, Proxy, Resolution, Service,
    ServiceInstance, ShardKey, WorkloadInstance, label, selector_matches,
};
use crate::strng::{self, Strng};
use crate::xds::{PushRequest, TriggerReason, XdsUpdater};

pub type ServiceHandler = Arc<dyn Fn(Option<&Service>, &Service, Event) + Send + Sync>;
pub type WorkloadHandler = Arc<dyn Fn(&WorkloadInstance, Event) + Send + Sync>;
pub type NamespaceHandler = Arc<dyn Fn(&str, Event) + Send + Sync>;
pub type CrdHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type GatewayHandler = Arc<dyn Fn() + Send + Sync>;

/// Progress of the initial synchronization. Transitions are one way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SyncPhase {
    /// Watch events only update metrics.
    NotStarted = 0,
    /// The ordered full listing is running; new events are queued.
    FullListing = 1,
    SteadyState = 2,
}

impl SyncPhase {
    fn from_u8(v: u8) -> SyncPhase {
        match v {
            0 => SyncPhase::NotStarted,
            1 => SyncPhase::FullListing,
            _ => SyncPhase::SteadyState,
        }
    }
}

/// Handles queued events of one kind.
pub(crate) trait ObjectHandler<K>: Send + Sync + 'static {
    fn handle(
        &self,
        c: &Controller,
        old: Option<Arc<K>>,
        cur: Arc<K>,
        event: Event,
    ) -> anyhow::Result<()>;

    /// Whether an update carries nothing this handler cares about.
    fn skip_update(&self, _c: &Controller, _old: &K, _cur: &K) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeRecord {
    address: String,
    labels: Labels,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<Strng, Arc<Service>>,
    /// Node selectors of NodePort services, by hostname.
    node_selectors: HashMap<Strng, Labels>,
    /// Nodes with an external IP.
    nodes: BTreeMap<String, NodeRecord>,
    external_name_instances: HashMap<Strng, Vec<ServiceInstance>>,
    network: NetworkState,
}

fn node_addresses(nodes: &BTreeMap<String, NodeRecord>, selector: &Labels) -> Vec<String> {
    nodes
        .values()
        .filter(|n| selector_matches(selector, &n.labels))
        .map(|n| n.address.clone())
        .collect()
}

#[derive(Default)]
struct Handlers {
    service: Vec<ServiceHandler>,
    workload: Vec<WorkloadHandler>,
    namespace_discovery: Vec<NamespaceHandler>,
    crd: Vec<CrdHandler>,
    gateway: Vec<GatewayHandler>,
}

/// Controller reconciles the objects of a single Kubernetes cluster into the registry model and
/// pushes the results to the [XdsUpdater].
///
/// Watch events are funneled onto a single queue, so every mutation of the registry happens on
/// one task. Queries may come from anywhere and only take the read lock.
pub struct Controller {
    opts: Options,
    shard: ShardKey,
    self_ref: Weak<Controller>,
    xds: Arc<dyn XdsUpdater>,
    metrics: Arc<Metrics>,
    queue: Arc<Queue>,

    namespaces: Arc<dyn Informer<Namespace>>,
    services: Arc<Filtered<KubeService>>,
    pod_informer: Arc<Filtered<Pod>>,
    nodes: Arc<dyn Informer<Node>>,
    crds: Arc<dyn Informer<CustomResourceDefinition>>,
    discovery: Arc<DiscoveryNamespacesFilter>,

    endpoints: Arc<dyn EndpointsController>,
    pods: Arc<PodCache>,
    exports: Arc<ExportCache>,
    imports: Arc<ImportCache>,
    workload_instances: WorkloadInstanceIndex,

    state: RwLock<RegistryState>,
    handlers: RwLock<Handlers>,
    phase: AtomicU8,
    synced: watch::Sender<bool>,
}

impl Controller {
    pub fn new(
        clients: Clients,
        opts: Options,
        xds: Arc<dyn XdsUpdater>,
        metrics: Arc<Metrics>,
    ) -> Arc<Controller> {
        let cluster = opts.cluster_id.clone();
        let discovery = Arc::new(DiscoveryNamespacesFilter::new(
            clients.namespaces.clone(),
            opts.discovery_selectors.clone(),
        ));
        let services = Arc::new(Filtered::new(clients.services.clone(), discovery.clone()));
        let pod_informer = Arc::new(Filtered::new(clients.pods.clone(), discovery.clone()));
        let pods = Arc::new(PodCache::new(pod_informer.clone()));
        // Discovery (exports) and the clusterset host (imports) are independent switches.
        let exports = if opts.enable_mcs_service_discovery {
            ExportCache::new(
                clients.service_exports.clone(),
                opts.enable_mcs_cluster_local,
                opts.domain_suffix.clone(),
                &cluster,
            )
        } else {
            ExportCache::disabled(&cluster)
        };
        let imports = if opts.enable_mcs_host {
            ImportCache::new(
                clients.service_imports.clone(),
                opts.domain_suffix.clone(),
                &cluster,
            )
        } else {
            ImportCache::disabled(&cluster)
        };
        let (exports, imports) = (Arc::new(exports), Arc::new(imports));
        let queue = Arc::new(Queue::new(strng::new(format!("kube-controller-{cluster}"))));
        let (synced, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<Controller>| {
            let reg = Registrar {
                controller: weak.clone(),
                metrics: metrics.clone(),
            };
            let endpoints: Arc<dyn EndpointsController> = match opts.endpoint_mode {
                EndpointMode::Endpoints => {
                    let strategy = Arc::new(EndpointsStrategy::new(Arc::new(Filtered::new(
                        clients.endpoints.clone(),
                        discovery.clone(),
                    ))));
                    reg.register::<k8s_openapi::api::core::v1::Endpoints, _>(
                        strategy.informer().clone(),
                        &queue,
                        "Endpoints",
                        strategy.clone(),
                        true,
                    );
                    strategy
                }
                EndpointMode::EndpointSlice => {
                    let strategy = Arc::new(EndpointSliceStrategy::new(Arc::new(Filtered::new(
                        clients.endpoint_slices.clone(),
                        discovery.clone(),
                    ))));
                    reg.register::<k8s_openapi::api::discovery::v1::EndpointSlice, _>(
                        strategy.informer().clone(),
                        &queue,
                        "EndpointSlice",
                        strategy.clone(),
                        true,
                    );
                    strategy
                }
            };
            reg.register::<KubeService, _>(
                services.clone(),
                &queue,
                "Services",
                Arc::new(ServiceEvents),
                true,
            );
            reg.register::<Pod, _>(pod_informer.clone(), &queue, "Pods", pods.clone(), true);
            reg.register::<Node, _>(
                clients.nodes.clone(),
                &queue,
                "Nodes",
                Arc::new(NodeEvents),
                true,
            );
            if !opts.system_namespace.is_empty() {
                reg.register::<Namespace, _>(
                    clients.namespaces.clone(),
                    &queue,
                    "Namespaces",
                    Arc::new(SystemNamespaceEvents),
                    true,
                );
            }
            clients
                .namespaces
                .add_event_handler(Arc::new(DiscoveryNamespaceEvents {
                    controller: weak.clone(),
                }));
            clients.crds.add_event_handler(Arc::new(CrdEvents {
                controller: weak.clone(),
            }));
            // Federation caches run on their own queues, independent of the initial sync.
            if let Some(informer) = exports.informer() {
                reg.register::<ServiceExport, _>(
                    informer.clone(),
                    exports.queue(),
                    "ServiceExports",
                    exports.clone(),
                    false,
                );
            }
            if let Some(informer) = imports.informer() {
                reg.register::<ServiceImport, _>(
                    informer.clone(),
                    imports.queue(),
                    "ServiceImports",
                    imports.clone(),
                    false,
                );
            }

            Controller {
                shard: ShardKey::kubernetes(cluster.clone()),
                self_ref: weak.clone(),
                xds,
                metrics,
                queue,
                namespaces: clients.namespaces,
                services,
                pod_informer,
                nodes: clients.nodes,
                crds: clients.crds,
                discovery,
                endpoints,
                pods,
                exports,
                imports,
                workload_instances: WorkloadInstanceIndex::new(),
                state: RwLock::new(RegistryState::default()),
                handlers: RwLock::new(Handlers::default()),
                phase: AtomicU8::new(SyncPhase::NotStarted as u8),
                synced,
                opts,
            }
        })
    }

    pub fn weak(&self) -> Weak<Controller> {
        self.self_ref.clone()
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.opts.cluster_id
    }

    pub fn shard(&self) -> &ShardKey {
        &self.shard
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn xds(&self) -> &Arc<dyn XdsUpdater> {
        &self.xds
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn pods(&self) -> &Arc<PodCache> {
        &self.pods
    }

    pub fn exports(&self) -> &Arc<ExportCache> {
        &self.exports
    }

    pub fn imports(&self) -> &Arc<ImportCache> {
        &self.imports
    }

    pub fn endpoints(&self) -> &Arc<dyn EndpointsController> {
        &self.endpoints
    }

    pub fn k8s_services(&self) -> &Arc<Filtered<KubeService>> {
        &self.services
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn advance(&self, phase: SyncPhase) {
        self.phase.fetch_max(phase as u8, Ordering::SeqCst);
    }

    /// Events are dropped until the full listing starts; that listing covers anything missed.
    fn should_enqueue(&self) -> bool {
        self.phase() != SyncPhase::NotStarted
    }

    /// Whether the initial sync finished, or its timeout elapsed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Waits until [Controller::has_synced] is true.
    pub async fn wait_until_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    pub fn append_service_handler(
        &self,
        f: impl Fn(Option<&Service>, &Service, Event) + Send + Sync + 'static,
    ) {
        self.handlers.write().unwrap().service.push(Arc::new(f));
    }

    pub fn append_workload_handler(
        &self,
        f: impl Fn(&WorkloadInstance, Event) + Send + Sync + 'static,
    ) {
        self.handlers.write().unwrap().workload.push(Arc::new(f));
    }

    pub fn append_namespace_discovery_handler(
        &self,
        f: impl Fn(&str, Event) + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .unwrap()
            .namespace_discovery
            .push(Arc::new(f));
    }

    pub fn append_crd_handler(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.write().unwrap().crd.push(Arc::new(f));
    }

    pub fn append_gateway_handler(&self, f: impl Fn() + Send + Sync + 'static) {
        self.handlers.write().unwrap().gateway.push(Arc::new(f));
    }

    pub(crate) fn has_workload_handlers(&self) -> bool {
        !self.handlers.read().unwrap().workload.is_empty()
    }

    pub(crate) fn notify_workload_handlers(&self, wi: &WorkloadInstance, event: Event) {
        let handlers = self.handlers.read().unwrap().workload.clone();
        for h in handlers {
            h(wi, event);
        }
    }

    fn notify_service_handlers(&self, prev: Option<&Service>, cur: &Service, event: Event) {
        let handlers = self.handlers.read().unwrap().service.clone();
        for h in handlers {
            h(prev, cur, event);
        }
    }

    fn notify_namespace_handlers(&self, ns: &str, event: Event) {
        let handlers = self.handlers.read().unwrap().namespace_discovery.clone();
        for h in handlers {
            h(ns, event);
        }
    }

    fn notify_crd_handlers(&self, name: &str) {
        let handlers = self.handlers.read().unwrap().crd.clone();
        for h in handlers {
            h(name);
        }
    }

    fn notify_gateway_handlers(&self) {
        let handlers = self.handlers.read().unwrap().gateway.clone();
        for h in handlers {
            h();
        }
    }

    /// All services, sorted by hostname.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut out: Vec<_> = self.state.read().unwrap().services.values().cloned().collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        out
    }

    pub fn get_service(&self, hostname: &str) -> Option<Arc<Service>> {
        self.state.read().unwrap().services.get(hostname).cloned()
    }

    /// Hostnames a Kubernetes service may be published under.
    pub(crate) fn hostnames_for_namespaced_name(&self, name: &NamespacedName) -> Vec<Strng> {
        let mut hosts = vec![service_hostname(
            &name.name,
            &name.namespace,
            &self.opts.domain_suffix,
        )];
        if self.opts.enable_mcs_host {
            hosts.push(clusterset_hostname(name));
        }
        hosts
    }

    pub(crate) fn services_for_namespaced_name(&self, name: &NamespacedName) -> Vec<Arc<Service>> {
        let st = self.state.read().unwrap();
        self.hostnames_for_namespaced_name(name)
            .iter()
            .filter_map(|host| st.services.get(host).cloned())
            .collect()
    }

    pub fn network_gateways(&self) -> Vec<NetworkGateway> {
        self.state.read().unwrap().network.network_gateways()
    }

    /// Network of an endpoint. See [NetworkState::network].
    pub fn network(&self, ip: &str, labels: &Labels) -> NetworkId {
        self.state.read().unwrap().network.network(ip, labels)
    }

    fn default_network(&self) -> NetworkId {
        self.state.read().unwrap().network.default_network.clone()
    }

    /// Federation state of every exported or imported service, sorted by namespaced name.
    pub fn mcs_services(&self) -> Vec<MCSServiceInfo> {
        let mut merged: BTreeMap<NamespacedName, MCSServiceInfo> = BTreeMap::new();
        for info in self.exports.exported_services(self) {
            let key = NamespacedName {
                namespace: info.namespace.clone(),
                name: info.name.clone(),
            };
            merged.insert(key, info);
        }
        for info in self.imports.imported_services(self) {
            let key = NamespacedName {
                namespace: info.namespace.clone(),
                name: info.name.clone(),
            };
            match merged.entry(key) {
                Entry::Occupied(e) => {
                    let existing = e.into_mut();
                    existing.imported = true;
                    existing.cluster_set_vip = info.cluster_set_vip;
                }
                Entry::Vacant(e) => {
                    e.insert(info);
                }
            }
        }
        merged.into_values().collect()
    }

    #[instrument(skip_all, fields(service = %namespaced_name(k8s), %event))]
    fn on_service_event(&self, k8s: &KubeService, event: Event) -> anyhow::Result<()> {
        debug!("handle service event");
        let svc = conversion::convert_service(k8s, &self.opts.domain_suffix, self.cluster());
        match event {
            Event::Delete => self.delete_service(&svc),
            _ => self.add_or_update_service(Some(k8s), Arc::new(svc), event, false),
        }
        Ok(())
    }

    /// Removes a service from every service keyed index at once.
    pub(crate) fn delete_service(&self, svc: &Service) {
        let was_gateway = {
            let mut st = self.state.write().unwrap();
            st.services.remove(&svc.hostname);
            st.node_selectors.remove(&svc.hostname);
            st.external_name_instances.remove(&svc.hostname);
            st.network.remove_gateways(&svc.hostname)
        };
        if was_gateway {
            self.notify_gateway_handlers();
            self.xds
                .config_update(PushRequest::full(TriggerReason::NetworksTrigger));
        }
        let ns = &svc.attributes.namespace;
        self.xds
            .svc_update(&self.shard, &svc.hostname, ns, Event::Delete);
        self.notify_service_handlers(None, svc, Event::Delete);
        self.imports
            .on_service_event(self, Arc::new(svc.clone()), Event::Delete);
    }

    /// Stores a converted service. `k8s` is the source object; services derived from other
    /// services, such as clusterset hosts, have none.
    pub(crate) fn add_or_update_service(
        &self,
        k8s: Option<&KubeService>,
        mut svc: Arc<Service>,
        event: Event,
        update_eds_cache: bool,
    ) {
        let cluster = self.cluster().clone();
        let (prev, needs_full_push, gateways_changed) = {
            let mut guard = self.state.write().unwrap();
            let st = &mut *guard;
            let mut needs_full_push = false;
            let mut gateways_changed = false;
            if let Some(k8s) = k8s {
                if conversion::is_node_port(k8s)
                    && svc.attributes.cluster_external_addresses.is_empty()
                {
                    let selector = conversion::node_selector_for_service(k8s);
                    let addrs = node_addresses(&st.nodes, &selector);
                    let before = st
                        .services
                        .get(&svc.hostname)
                        .map(|s| {
                            s.attributes
                                .cluster_external_addresses
                                .get_addresses_for(&cluster)
                                .to_vec()
                        })
                        .unwrap_or_default();
                    needs_full_push = before != addrs;
                    if !addrs.is_empty() {
                        Arc::make_mut(&mut svc)
                            .attributes
                            .cluster_external_addresses
                            .set_addresses_for(cluster.clone(), addrs);
                    }
                    st.node_selectors.insert(svc.hostname.clone(), selector);
                } else {
                    st.node_selectors.remove(&svc.hostname);
                }
                gateways_changed = st.network.extract_gateways_from_service(&svc, &cluster);
                let instances = conversion::external_name_instances(
                    k8s,
                    &svc,
                    self.opts.enable_mcs_service_discovery,
                );
                if instances.is_empty() {
                    st.external_name_instances.remove(&svc.hostname);
                } else {
                    st.external_name_instances
                        .insert(svc.hostname.clone(), instances);
                }
            }
            let prev = st.services.insert(svc.hostname.clone(), svc.clone());
            (prev, needs_full_push || gateways_changed, gateways_changed)
        };

        if gateways_changed {
            self.notify_gateway_handlers();
        }
        if needs_full_push {
            let reason = if gateways_changed {
                TriggerReason::NetworksTrigger
            } else {
                TriggerReason::ServiceUpdate
            };
            self.xds.config_update(PushRequest::full(reason));
        }

        let ns = &svc.attributes.namespace;
        if update_eds_cache || self.opts.enable_service_select_workload_entries {
            let endpoints = self.build_endpoints_for_service(&svc, update_eds_cache);
            if !endpoints.is_empty() {
                self.xds
                    .eds_cache_update(&self.shard, &svc.hostname, ns, endpoints);
            }
        }
        self.xds.svc_update(&self.shard, &svc.hostname, ns, event);
        self.notify_service_handlers(prev.as_deref(), &svc, event);
        if k8s.is_some() {
            self.imports.on_service_event(self, svc, event);
        }
    }

    /// Endpoints of a service from its endpoint objects plus any selected workload instances.
    pub(crate) fn build_endpoints_for_service(
        &self,
        svc: &Service,
        update_cache: bool,
    ) -> Vec<IstioEndpoint> {
        let mut endpoints = self.endpoints.build_istio_endpoints_with_service(
            self,
            &svc.attributes.name,
            &svc.attributes.namespace,
            &svc.hostname,
            update_cache,
        );
        if self.opts.enable_service_select_workload_entries {
            endpoints.extend(self.collect_workload_instance_endpoints(svc));
        }
        endpoints
    }

    #[instrument(skip_all, fields(node = %node.name(), %event))]
    fn on_node_event(&self, node: &Node, event: Event) -> anyhow::Result<()> {
        let name = node.name();
        let update_needed = {
            let mut st = self.state.write().unwrap();
            if event == Event::Delete {
                st.nodes.remove(name);
                true
            } else {
                let address = node
                    .status
                    .as_ref()
                    .and_then(|s| s.addresses.as_ref())
                    .into_iter()
                    .flatten()
                    .find(|a| a.type_ == "ExternalIP" && !a.address.is_empty())
                    .map(|a| a.address.clone());
                match address {
                    // Only nodes with an external IP are tracked.
                    None => st.nodes.remove(name).is_some(),
                    Some(address) => {
                        let record = NodeRecord {
                            address,
                            labels: node.labels().clone(),
                        };
                        if st.nodes.get(name) == Some(&record) {
                            false
                        } else {
                            st.nodes.insert(name.to_string(), record);
                            true
                        }
                    }
                }
            }
        };
        if update_needed && self.update_service_node_port_addresses() {
            debug!("node port addresses changed");
            self.xds
                .config_update(PushRequest::full(TriggerReason::ServiceUpdate));
        }
        Ok(())
    }

    /// Recomputes the node addresses of every NodePort service. Returns whether any changed.
    fn update_service_node_port_addresses(&self) -> bool {
        let cluster = self.cluster().clone();
        let mut changed = false;
        let mut gateways_changed = false;
        {
            let mut guard = self.state.write().unwrap();
            let st = &mut *guard;
            for (host, selector) in &st.node_selectors {
                let Some(svc) = st.services.get_mut(host) else {
                    continue;
                };
                let addrs = node_addresses(&st.nodes, selector);
                if svc
                    .attributes
                    .cluster_external_addresses
                    .get_addresses_for(&cluster)
                    == addrs.as_slice()
                {
                    continue;
                }
                Arc::make_mut(svc)
                    .attributes
                    .cluster_external_addresses
                    .set_addresses_for(cluster.clone(), addrs);
                gateways_changed |= st.network.extract_gateways_from_service(svc, &cluster);
                changed = true;
            }
        }
        if gateways_changed {
            self.notify_gateway_handlers();
        }
        changed
    }

    /// Test access to the stored node address.
    #[cfg(any(test, feature = "testing"))]
    pub fn node_address(&self, name: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .nodes
            .get(name)
            .map(|n| n.address.clone())
    }

    fn on_system_namespace_event(&self, ns: &Namespace, event: Event) -> anyhow::Result<()> {
        if event == Event::Delete {
            return Ok(());
        }
        let nw = ns
            .labels()
            .get(label::TOPOLOGY_NETWORK)
            .map(strng::new)
            .unwrap_or_default();
        let changed = {
            let mut st = self.state.write().unwrap();
            let old = std::mem::replace(&mut st.network.default_network, nw.clone());
            old != nw
        };
        if changed {
            info!(network = %nw, "default network changed");
            self.on_default_network_change();
        }
        Ok(())
    }

    /// Rebuilds everything derived from endpoint networks. Returns whether gateways changed.
    fn on_default_network_change(&self) -> bool {
        if let Err(e) = self.sync_pods() {
            warn!("failed to resync pods after network change: {e}");
        }
        if let Err(e) = self.endpoints.sync(self, "", "", Event::Add, true) {
            warn!("failed to resync endpoints after network change: {e}");
        }
        self.reload_network_gateways()
    }

    fn reload_mesh_networks(&self, mesh: &MeshNetworks) {
        let cluster = self.cluster().clone();
        self.state
            .write()
            .unwrap()
            .network
            .reload_mesh_networks(mesh, &cluster);
    }

    /// Recomputes the gateways of every service, pushing if they changed.
    fn reload_network_gateways(&self) -> bool {
        let cluster = self.cluster().clone();
        let changed = {
            let mut guard = self.state.write().unwrap();
            let st = &mut *guard;
            let mut changed = false;
            for svc in st.services.values() {
                changed |= st.network.extract_gateways_from_service(svc, &cluster);
            }
            changed
        };
        if changed {
            self.notify_gateway_handlers();
            self.xds
                .config_update(PushRequest::full(TriggerReason::NetworksTrigger));
        }
        changed
    }

    /// Applies a new mesh networks config.
    pub fn reload_network_lookup(&self, mesh: &MeshNetworks) {
        self.reload_mesh_networks(mesh);
        if !self.on_default_network_change() {
            self.xds
                .config_update(PushRequest::full(TriggerReason::NetworksTrigger));
        }
    }

    /// Changes the discovery selectors, replaying the objects of namespaces whose visibility
    /// changed.
    pub fn set_discovery_selectors(&self, selectors: Vec<LabelSelector>) {
        let (selected, deselected) = self.discovery.set_selectors(selectors);
        for ns in selected {
            self.queue_namespace_change(ns, Event::Add);
        }
        for ns in deselected {
            self.queue_namespace_change(ns, Event::Delete);
        }
    }

    fn queue_namespace_change(&self, ns: String, event: Event) {
        let weak = self.weak();
        self.queue.push(move || {
            let Some(c) = weak.upgrade() else {
                return Ok(());
            };
            match event {
                Event::Delete => c.handle_deselected_namespace(&ns),
                _ => c.handle_selected_namespace(&ns),
            }
        });
    }

    fn handle_selected_namespace(&self, ns: &str) -> anyhow::Result<()> {
        debug!(namespace = ns, "namespace selected for discovery");
        let mut errs = SyncErrors::new();
        for svc in self.services.unfiltered().list(ns, None) {
            errs.push(self.on_service_event(&svc, Event::Add));
        }
        for pod in self.pod_informer.unfiltered().list(ns, None) {
            errs.push(self.pods.on_event(self, &pod, Event::Add));
        }
        errs.push(self.endpoints.sync(self, "", ns, Event::Add, false));
        self.notify_namespace_handlers(ns, Event::Add);
        errs.into_result()
    }

    fn handle_deselected_namespace(&self, ns: &str) -> anyhow::Result<()> {
        debug!(namespace = ns, "namespace deselected for discovery");
        let mut errs = SyncErrors::new();
        for svc in self.services.unfiltered().list(ns, None) {
            errs.push(self.on_service_event(&svc, Event::Delete));
        }
        for pod in self.pod_informer.unfiltered().list(ns, None) {
            errs.push(self.pods.on_event(self, &pod, Event::Delete));
        }
        errs.push(self.endpoints.sync(self, "", ns, Event::Delete, false));
        self.notify_namespace_handlers(ns, Event::Delete);
        errs.into_result()
    }

    /// Resyncs the endpoints object `key` once the pod it waited for shows up.
    pub(crate) fn queue_endpoint_resync(&self, key: NamespacedName) {
        let weak = self.weak();
        self.queue.push(move || {
            let Some(c) = weak.upgrade() else {
                return Ok(());
            };
            c.endpoints
                .sync(&c, &key.name, &key.namespace, Event::Add, true)
        });
    }

    fn crd_installed(&self, name: &str) -> bool {
        self.crds.get(name, "").is_some()
    }

    fn informers_synced(&self) -> bool {
        let exports_synced = !self.exports.enabled()
            || !self.crd_installed(SERVICE_EXPORT_CRD)
            || self.exports.has_synced();
        let imports_synced = !self.imports.enabled()
            || !self.crd_installed(SERVICE_IMPORT_CRD)
            || self.imports.has_synced();
        self.namespaces.has_synced()
            && self.services.has_synced()
            && self.pods.has_synced()
            && self.nodes.has_synced()
            && self.crds.has_synced()
            && self.endpoints.has_synced()
            && exports_synced
            && imports_synced
    }

    /// Replays every object in dependency order: namespaces, nodes, services, pods and finally
    /// endpoints. Failures are collected and returned together.
    fn sync_all(&self) -> anyhow::Result<()> {
        self.advance(SyncPhase::FullListing);
        let mut errs = SyncErrors::new();
        errs.push(self.discovery.sync_namespaces());
        errs.push(self.sync_system_namespace());
        errs.push(self.sync_nodes());
        errs.push(self.sync_services());
        errs.push(self.sync_pods());
        errs.push(self.endpoints.sync(self, "", "", Event::Add, true));
        errs.into_result()
    }

    fn sync_system_namespace(&self) -> anyhow::Result<()> {
        match self.namespaces.get(&self.opts.system_namespace, "") {
            Some(ns) => self.on_system_namespace_event(&ns, Event::Add),
            None => Ok(()),
        }
    }

    fn sync_nodes(&self) -> anyhow::Result<()> {
        let mut errs = SyncErrors::new();
        for node in self.nodes.list("", None) {
            errs.push(self.on_node_event(&node, Event::Add));
        }
        errs.into_result()
    }

    fn sync_services(&self) -> anyhow::Result<()> {
        let mut errs = SyncErrors::new();
        for svc in self.services.list("", None) {
            errs.push(self.on_service_event(&svc, Event::Add));
        }
        errs.into_result()
    }

    fn sync_pods(&self) -> anyhow::Result<()> {
        let mut errs = SyncErrors::new();
        for pod in self.pod_informer.list("", None) {
            errs.push(self.pods.on_event(self, &pod, Event::Add));
        }
        errs.into_result()
    }

    /// Runs the controller until `stop` is cancelled: waits for the informers, performs the
    /// initial sync and then processes queued events.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let start = Instant::now();
        info!(cluster = %self.cluster(), "starting kube registry controller");
        if let Some(timeout) = self.opts.sync_timeout {
            let weak = self.weak();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = stop.cancelled() => return,
                }
                if let Some(c) = weak.upgrade() {
                    if !c.has_synced() {
                        warn!(cluster = %c.cluster(), "initial sync timed out after {timeout:?}");
                        c.mark_synced();
                    }
                }
            });
        }

        self.reload_mesh_networks(&self.opts.mesh_networks);
        self.reload_network_gateways();

        for queue in [self.imports.queue().clone(), self.exports.queue().clone()] {
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.run(stop).await {
                    warn!("federation queue failed: {e}");
                }
            });
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        while !self.informers_synced() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.cancelled() => {
                    info!("controller stopped before informers synced");
                    return;
                }
            }
        }

        if let Err(e) = self.sync_all() {
            error!(cluster = %self.cluster(), "one or more errors force-syncing resources: {e}");
        }
        self.advance(SyncPhase::SteadyState);
        self.mark_synced();
        info!(cluster = %self.cluster(), "kube controller synced after {:?}", start.elapsed());

        if let Err(e) = self.queue.run(stop).await {
            warn!("controller queue failed: {e}");
        }
        info!(cluster = %self.cluster(), "controller terminated");
    }

    /// Waits for the queue to drain, up to the termination grace period, and drops this
    /// registry's state downstream.
    pub async fn cleanup(&self) {
        if let Err(e) = self
            .queue
            .wait_for_close(self.opts.termination_grace_period)
            .await
        {
            warn!("cleanup: {e}");
        }
        self.xds.remove_shard(&self.shard);
    }

    /// Locality of a pod: its locality label, or `region/zone/subzone` of its node.
    pub fn get_pod_locality(&self, pod: &Pod) -> String {
        if let Some(l) = pod
            .labels()
            .get(label::ISTIO_LOCALITY)
            .filter(|l| !l.is_empty())
        {
            return l.clone();
        }
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or_default();
        if node_name.is_empty() {
            return String::new();
        }
        let Some(node) = self.nodes.get(node_name, "") else {
            warn!(
                pod = %namespaced_name(pod),
                node = node_name,
                "unable to get node for pod"
            );
            return String::new();
        };
        let labels = node.labels();
        let get = |ga: &str, beta: Option<&str>| {
            labels
                .get(ga)
                .or_else(|| beta.and_then(|b| labels.get(b)))
                .cloned()
                .unwrap_or_default()
        };
        let region = get(label::NODE_REGION, Some(label::NODE_REGION_BETA));
        let zone = get(label::NODE_ZONE, Some(label::NODE_ZONE_BETA));
        let subzone = get(label::TOPOLOGY_SUBZONE, None);
        if region.is_empty() && zone.is_empty() && subzone.is_empty() {
            return String::new();
        }
        format!("{region}/{zone}/{subzone}")
    }

    /// Instances of a service on one port, from endpoint objects and workload instances. An
    /// ExternalName service falls back to its synthetic instances.
    pub fn instances_by_port(&self, svc: &Arc<Service>, port: u16) -> Vec<ServiceInstance> {
        let mut out = self.endpoints.instances_by_port(self, svc, port);
        out.extend(self.service_instances_from_workload_instances(svc, port));
        if !out.is_empty() {
            return out;
        }
        let st = self.state.read().unwrap();
        st.external_name_instances
            .get(&svc.hostname)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|i| {
                        i.service.attributes.namespace == svc.attributes.namespace
                            && i.service_port.port == port
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn service_instances_from_workload_instances(
        &self,
        svc: &Arc<Service>,
        port: u16,
    ) -> Vec<ServiceInstance> {
        if self.workload_instances.is_empty()
            || svc.attributes.service_registry != Provider::Kubernetes
            || svc.mesh_external
            || svc.resolution != Resolution::ClientSideLB
        {
            return Vec::new();
        }
        let Some(selector) = &svc.attributes.label_selectors else {
            return Vec::new();
        };
        if !self
            .state
            .read()
            .unwrap()
            .services
            .contains_key(&svc.hostname)
        {
            return Vec::new();
        }
        let Some(k8s) = self
            .services
            .get(&svc.attributes.name, &svc.attributes.namespace)
        else {
            return Vec::new();
        };
        let Some(svc_port) = svc.ports.get_by_port(port) else {
            return Vec::new();
        };
        let target = service_target_port(svc_port, &k8s);
        let mut out = Vec::new();
        self.workload_instances.for_each(|wi| {
            if wi.namespace != svc.attributes.namespace.as_str()
                || !selector_matches(selector, &wi.endpoint.labels)
            {
                return;
            }
            if let Some(instance) =
                service_instance_from_workload_instance(svc, svc_port, &target, wi)
            {
                out.push(instance);
            }
        });
        out
    }

    /// Endpoints of the workload instances a service selects, across all its ports.
    pub(crate) fn collect_workload_instance_endpoints(&self, svc: &Service) -> Vec<IstioEndpoint> {
        if svc.attributes.label_selectors.is_none() {
            return Vec::new();
        }
        let Some(svc) = self.get_service(&svc.hostname) else {
            return Vec::new();
        };
        svc.ports
            .iter()
            .flat_map(|p| self.service_instances_from_workload_instances(&svc, p.port))
            .map(|i| i.endpoint)
            .collect()
    }

    /// Registers a workload instance from another registry. Processed on the controller queue.
    pub fn workload_instance_handler(&self, wi: WorkloadInstance, event: Event) {
        let weak = self.weak();
        self.queue.push(move || {
            if let Some(c) = weak.upgrade() {
                c.on_workload_instance(Arc::new(wi), event);
            }
            Ok(())
        });
    }

    fn on_workload_instance(&self, wi: Arc<WorkloadInstance>, event: Event) {
        // Without labels nothing can select the instance.
        if wi.namespace.is_empty() || wi.endpoint.labels.is_empty() {
            return;
        }
        match event {
            Event::Delete => {
                self.workload_instances.delete(&wi);
            }
            _ => {
                self.workload_instances.insert(wi.clone());
            }
        }
        for svc in self.client_side_lb_services_selecting(&wi.namespace, &wi.endpoint.labels) {
            let endpoints: Vec<IstioEndpoint> = svc
                .ports
                .iter()
                .filter(|p| p.protocol != Protocol::UDP)
                .flat_map(|p| self.instances_by_port(&svc, p.port))
                .map(|i| i.endpoint)
                .collect();
            self.xds.eds_update(
                &self.shard,
                &svc.hostname,
                &svc.attributes.namespace,
                endpoints,
            );
        }
    }

    fn client_side_lb_services_selecting(&self, ns: &str, labels: &Labels) -> Vec<Arc<Service>> {
        let k8s_services = self.services.list(ns, None);
        services_selecting(&k8s_services, labels)
            .into_iter()
            .filter_map(|k8s| {
                let host = service_hostname(k8s.name(), k8s.namespace(), &self.opts.domain_suffix);
                self.get_service(&host)
            })
            .filter(|svc| svc.resolution == Resolution::ClientSideLB)
            .collect()
    }

    fn service_instances_from_workload_instance(
        &self,
        wi: &WorkloadInstance,
    ) -> Vec<ServiceInstance> {
        let mut out = Vec::new();
        for svc in self.client_side_lb_services_selecting(&wi.namespace, &wi.endpoint.labels) {
            let Some(k8s) = self
                .services
                .get(&svc.attributes.name, &svc.attributes.namespace)
            else {
                continue;
            };
            for port in svc.ports.iter().filter(|p| p.protocol != Protocol::UDP) {
                let target = service_target_port(port, &k8s);
                out.extend(service_instance_from_workload_instance(&svc, port, &target, wi));
            }
        }
        out
    }

    fn check_cluster(&self, proxy: &Proxy) -> Result<(), Error> {
        let cluster = &proxy.metadata.cluster_id;
        if cluster.is_empty() || cluster == self.cluster() {
            Ok(())
        } else {
            Err(Error::ClusterMismatch {
                proxy: cluster.clone(),
                controller: self.cluster().clone(),
            })
        }
    }

    /// Service instances co-located with a proxy.
    pub fn get_proxy_service_instances(
        &self,
        proxy: &Proxy,
    ) -> Result<Vec<ServiceInstance>, Error> {
        let Some(ip) = proxy.ip_addresses.first() else {
            return Ok(Vec::new());
        };
        if let Some(wi) =
            workloadinstances::get_instance_for_proxy(&self.workload_instances, proxy, ip)
        {
            return Ok(self.service_instances_from_workload_instance(&wi));
        }
        if let Some(pod) = self.pods.get_pod_by_proxy(proxy).filter(|_| !proxy.is_vm()) {
            self.check_cluster(proxy)?;
            let k8s_services = self.services.list(pod.namespace(), None);
            let selecting = services_selecting(&k8s_services, pod.labels());
            if !selecting.is_empty() {
                return Ok(selecting
                    .into_iter()
                    .flat_map(|k8s| self.get_proxy_service_instances_by_pod(&pod, k8s))
                    .collect());
            }
            // Headless services without a selector only have endpoint objects.
            return Ok(self.endpoints.get_proxy_service_instances(self, proxy));
        }
        // The pod may not be visible yet.
        self.get_proxy_service_instances_from_metadata(proxy)
    }

    fn get_proxy_service_instances_by_pod(
        &self,
        pod: &Pod,
        k8s: &KubeService,
    ) -> Vec<ServiceInstance> {
        let name = namespaced_name(k8s);
        let ip = pod_ip(pod);
        let mut out = Vec::new();
        for svc in self.services_for_namespaced_name(&name) {
            let policy = self.exports.discoverability_policy(Some(&svc));
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for kp in kube_ports(k8s) {
                let Some(svc_port) = svc.ports.get(kp.name.as_deref().unwrap_or_default()) else {
                    continue;
                };
                let port = match find_port(pod, kp) {
                    Ok(port) => port,
                    Err(e) => {
                        warn!(service = %name, "failed to find target port: {e}");
                        continue;
                    }
                };
                // Several service ports may share a target port.
                if seen.insert((port, svc_port.protocol)) {
                    targets.push((port, svc_port.clone()));
                }
            }
            let builder = EndpointBuilder::new(self, Some(pod));
            for (port, svc_port) in targets {
                out.push(ServiceInstance {
                    endpoint: builder.build(
                        self,
                        ip,
                        u32::from(port),
                        &svc_port.name,
                        policy,
                        HealthStatus::Healthy,
                    ),
                    service: svc.clone(),
                    service_port: svc_port,
                });
            }
        }
        out
    }

    fn get_proxy_service_instances_from_metadata(
        &self,
        proxy: &Proxy,
    ) -> Result<Vec<ServiceInstance>, Error> {
        if proxy.labels.is_empty() {
            return Ok(Vec::new());
        }
        self.check_cluster(proxy)?;
        let k8s_services = self.services.list(&proxy.config_namespace, None);
        let selecting = services_selecting(&k8s_services, &proxy.labels);
        if selecting.is_empty() {
            return Err(Error::NoInstances(proxy.id.clone()));
        }
        let mut out = Vec::new();
        for k8s in selecting {
            let host = service_hostname(k8s.name(), k8s.namespace(), &self.opts.domain_suffix);
            let svc = self
                .get_service(&host)
                .ok_or_else(|| Error::ServiceNotFound(host.clone()))?;
            let policy = self.exports.discoverability_policy(Some(&svc));
            let mut targets: Vec<(u16, Port)> = Vec::new();
            for kp in kube_ports(k8s) {
                let port_name = kp.name.as_deref().unwrap_or_default();
                let svc_port = svc
                    .ports
                    .get(port_name)
                    .ok_or_else(|| Error::PortNotFound(port_name.to_string()))?;
                let port = if proxy.metadata.pod_ports.is_empty() {
                    // Most likely a VM; its ports are assumed not to be remapped.
                    match &kp.target_port {
                        Some(IntOrString::Int(n)) => u16::try_from(*n).unwrap_or_default(),
                        Some(IntOrString::String(s)) => s.parse().unwrap_or_default(),
                        None => 0,
                    }
                } else {
                    find_port_from_metadata(kp, &proxy.metadata.pod_ports)
                        .map_err(|e| Error::TargetPort(proxy.id.clone(), e))?
                };
                if !targets
                    .iter()
                    .any(|(p, sp)| *p == port && sp.protocol == svc_port.protocol)
                {
                    targets.push((port, svc_port.clone()));
                }
            }
            let builder = EndpointBuilder::from_metadata(self, proxy);
            for (port, svc_port) in targets {
                for ip in &proxy.ip_addresses {
                    out.push(ServiceInstance {
                        endpoint: builder.build(
                            self,
                            ip,
                            u32::from(port),
                            &svc_port.name,
                            policy,
                            HealthStatus::Healthy,
                        ),
                        service: svc.clone(),
                        service_port: svc_port.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Labels of the proxy's pod, with its locality and node added.
    pub fn get_proxy_workload_labels(&self, proxy: &Proxy) -> Option<Labels> {
        let pod = self.pods.get_pod_by_proxy(proxy)?;
        let locality = self.get_pod_locality(&pod);
        // Older proxies do not report their node.
        let node_name = if proxy.metadata.node_name.is_empty() {
            pod.spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default()
        } else {
            String::new()
        };
        Some(augment_labels(
            pod.labels(),
            self.cluster(),
            &locality,
            &node_name,
            &self.default_network(),
        ))
    }
}

fn kube_ports(k8s: &KubeService) -> impl Iterator<Item = &ServicePort> {
    k8s.spec.iter().flat_map(|s| s.ports.iter().flatten())
}

/// Target port of a service port, defaulting to the service port itself.
fn service_target_port(port: &Port, k8s: &KubeService) -> ServiceTargetPort {
    let mut target = conversion::find_service_target_port(port, k8s);
    if target.num == 0 {
        target.num = port.port;
    }
    target
}

fn service_instance_from_workload_instance(
    svc: &Arc<Service>,
    svc_port: &Port,
    target: &ServiceTargetPort,
    wi: &WorkloadInstance,
) -> Option<ServiceInstance> {
    let mut endpoint = wi.endpoint.clone();
    endpoint.endpoint_port = u32::from(target.num);
    if !target.name.is_empty() {
        match wi.port_map.get(&target.name).copied().filter(|p| *p != 0) {
            Some(p) => endpoint.endpoint_port = p,
            None if target.explicit_name => {
                debug!(
                    instance = %wi.key(),
                    port = %target.name,
                    service = %svc.hostname,
                    "workload instance does not expose named target port, excluding it"
                );
                return None;
            }
            None => {}
        }
    }
    endpoint.service_port_name = svc_port.name.to_string();
    Some(ServiceInstance {
        service: svc.clone(),
        service_port: svc_port.clone(),
        endpoint,
    })
}

impl ControllerView for Controller {
    fn cluster(&self) -> &ClusterId {
        &self.opts.cluster_id
    }

    fn pod_locality(&self, pod: &Pod) -> String {
        self.get_pod_locality(pod)
    }

    fn network(&self, ip: &str, labels: &Labels) -> NetworkId {
        Controller::network(self, ip, labels)
    }
}

struct Registrar {
    controller: Weak<Controller>,
    metrics: Arc<Metrics>,
}

impl Registrar {
    fn register<K: Object, H: ObjectHandler<K>>(
        &self,
        informer: Arc<dyn Informer<K>>,
        queue: &Arc<Queue>,
        kind: &'static str,
        handler: Arc<H>,
        gated: bool,
    ) {
        informer.add_event_handler(Arc::new(Registration {
            controller: self.controller.clone(),
            metrics: self.metrics.clone(),
            informer: informer.clone(),
            queue: queue.clone(),
            kind,
            handler,
            gated,
        }));
    }
}

/// Registration moves watch events of one kind onto a queue.
struct Registration<K: Object, H> {
    controller: Weak<Controller>,
    metrics: Arc<Metrics>,
    informer: Arc<dyn Informer<K>>,
    queue: Arc<Queue>,
    kind: &'static str,
    handler: Arc<H>,
    /// Whether events are dropped until the initial sync starts.
    gated: bool,
}

impl<K: Object, H: ObjectHandler<K>> Registration<K, H> {
    fn record(&self, event: EventType) {
        self.metrics.increment(&RegistryEvent {
            kind: self.kind,
            event,
        });
    }

    fn accepting(&self, c: &Controller) -> bool {
        !self.gated || c.should_enqueue()
    }

    fn enqueue(&self, old: Option<Arc<K>>, cur: Arc<K>, event: Event) {
        let weak = self.controller.clone();
        let informer = self.informer.clone();
        let handler = self.handler.clone();
        self.queue.push(move || {
            let Some(c) = weak.upgrade() else {
                return Ok(());
            };
            let cur = if event == Event::Delete {
                cur
            } else {
                // Handle the latest version; if it is gone a delete event is queued behind us.
                match informer.get(cur.name(), cur.namespace()) {
                    Some(latest) => latest,
                    None => return Ok(()),
                }
            };
            handler.handle(&c, old, cur, event)
        });
    }
}

impl<K: Object, H: ObjectHandler<K>> EventHandler<K> for Registration<K, H> {
    fn on_add(&self, obj: Arc<K>) {
        self.record(EventType::add);
        let Some(c) = self.controller.upgrade() else {
            return;
        };
        if self.accepting(&c) {
            self.enqueue(None, obj, Event::Add);
        }
    }

    fn on_update(&self, old: Arc<K>, cur: Arc<K>) {
        let Some(c) = self.controller.upgrade() else {
            self.record(EventType::update);
            return;
        };
        if self.handler.skip_update(&c, &old, &cur) {
            self.record(EventType::updatesame);
            return;
        }
        self.record(EventType::update);
        if self.accepting(&c) {
            self.enqueue(Some(old), cur, Event::Update);
        }
    }

    fn on_delete(&self, obj: Arc<K>) {
        self.record(EventType::delete);
        let Some(c) = self.controller.upgrade() else {
            return;
        };
        if self.accepting(&c) {
            self.enqueue(None, obj, Event::Delete);
        }
    }
}

struct ServiceEvents;

impl ObjectHandler<KubeService> for ServiceEvents {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<KubeService>>,
        cur: Arc<KubeService>,
        event: Event,
    ) -> anyhow::Result<()> {
        c.on_service_event(&cur, event)
    }
}

struct NodeEvents;

impl ObjectHandler<Node> for NodeEvents {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<Node>>,
        cur: Arc<Node>,
        event: Event,
    ) -> anyhow::Result<()> {
        c.on_node_event(&cur, event)
    }
}

struct SystemNamespaceEvents;

impl ObjectHandler<Namespace> for SystemNamespaceEvents {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<Namespace>>,
        cur: Arc<Namespace>,
        event: Event,
    ) -> anyhow::Result<()> {
        if cur.name() != c.opts.system_namespace.as_str() {
            return Ok(());
        }
        c.on_system_namespace_event(&cur, event)
    }

    fn skip_update(&self, _c: &Controller, old: &Namespace, cur: &Namespace) -> bool {
        old.labels().get(label::TOPOLOGY_NETWORK) == cur.labels().get(label::TOPOLOGY_NETWORK)
    }
}

/// Keeps the discovery filter current. Membership changes are applied immediately; the replay
/// of a namespace's objects goes through the queue.
struct DiscoveryNamespaceEvents {
    controller: Weak<Controller>,
}

impl EventHandler<Namespace> for DiscoveryNamespaceEvents {
    fn on_add(&self, ns: Arc<Namespace>) {
        let Some(c) = self.controller.upgrade() else {
            return;
        };
        if c.discovery.namespace_created(&ns) && c.should_enqueue() {
            c.queue_namespace_change(ns.name().to_string(), Event::Add);
        }
    }

    fn on_update(&self, old: Arc<Namespace>, cur: Arc<Namespace>) {
        let Some(c) = self.controller.upgrade() else {
            return;
        };
        let event = match c.discovery.namespace_updated(&old, &cur) {
            Some(true) => Event::Add,
            Some(false) => Event::Delete,
            None => return,
        };
        if c.should_enqueue() {
            c.queue_namespace_change(cur.name().to_string(), event);
        }
    }

    fn on_delete(&self, ns: Arc<Namespace>) {
        if let Some(c) = self.controller.upgrade() {
            c.discovery.namespace_deleted(&ns);
        }
    }
}

struct CrdEvents {
    controller: Weak<Controller>,
}

impl EventHandler<CustomResourceDefinition> for CrdEvents {
    fn on_add(&self, crd: Arc<CustomResourceDefinition>) {
        if let Some(c) = self.controller.upgrade() {
            c.notify_crd_handlers(crd.name());
        }
    }

    fn on_update(&self, _old: Arc<CustomResourceDefinition>, _cur: Arc<CustomResourceDefinition>) {
    }

    fn on_delete(&self, _crd: Arc<CustomResourceDefinition>) {}
}
