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

//! The watch transport seen by the registry: per-kind object caches with event notification.
//!
//! [Store] is an in-memory implementation, fed either from a local snapshot or directly by tests.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use ::kube::Resource;
use tracing::trace;

use crate::kube::mcs::{ServiceExport, ServiceImport};
use crate::model::{Labels, selector_matches};

static EMPTY_LABELS: Labels = Labels::new();

/// Object is any namespaced or cluster scoped Kubernetes resource the registry can watch.
pub trait Object: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn labels(&self) -> &Labels {
        self.meta().labels.as_ref().unwrap_or(&EMPTY_LABELS)
    }

    fn annotations(&self) -> &Labels {
        self.meta().annotations.as_ref().unwrap_or(&EMPTY_LABELS)
    }

    fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

impl<K> Object for K where K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {}

/// EventHandler receives notifications for a single kind.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: Arc<K>);
    fn on_update(&self, old: Arc<K>, cur: Arc<K>);
    fn on_delete(&self, obj: Arc<K>);
}

/// Informer is a read-through cache of one kind, kept up to date by the watch transport.
pub trait Informer<K: Object>: Send + Sync {
    fn get(&self, name: &str, namespace: &str) -> Option<Arc<K>>;

    /// Lists objects in `namespace` (all namespaces if empty) whose labels match `selector`.
    fn list(&self, namespace: &str, selector: Option<&Labels>) -> Vec<Arc<K>>;

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>);

    /// Whether the initial listing has been delivered.
    fn has_synced(&self) -> bool;
}

/// An in-memory [Informer].
pub struct Store<K> {
    objects: RwLock<BTreeMap<(String, String), Arc<K>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: AtomicBool,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Store {
            objects: Default::default(),
            handlers: Default::default(),
            synced: AtomicBool::new(false),
        }
    }
}

impl<K: Object> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(obj: &K) -> (String, String) {
        (obj.namespace().to_string(), obj.name().to_string())
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers.read().unwrap().clone()
    }

    /// Inserts or replaces an object, notifying handlers of an add or update.
    pub fn apply(&self, obj: K) {
        let obj = Arc::new(obj);
        let prev = self
            .objects
            .write()
            .unwrap()
            .insert(Self::key(&obj), obj.clone());
        trace!(kind = %K::kind(&()), name = obj.name(), namespace = obj.namespace(), "apply");
        for h in self.handlers() {
            match &prev {
                Some(old) => h.on_update(old.clone(), obj.clone()),
                None => h.on_add(obj.clone()),
            }
        }
    }

    pub fn delete(&self, name: &str, namespace: &str) -> Option<Arc<K>> {
        let removed = self
            .objects
            .write()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        if let Some(obj) = &removed {
            trace!(kind = %K::kind(&()), name, namespace, "delete");
            for h in self.handlers() {
                h.on_delete(obj.clone());
            }
        }
        removed
    }

    /// Redelivers every object as an update with identical old and new state.
    pub fn resync(&self) {
        let all: Vec<Arc<K>> = self.objects.read().unwrap().values().cloned().collect();
        let handlers = self.handlers();
        for obj in all {
            for h in &handlers {
                h.on_update(obj.clone(), obj.clone());
            }
        }
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }
}

impl<K: Object> Informer<K> for Store<K> {
    fn get(&self, name: &str, namespace: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self, namespace: &str, selector: Option<&Labels>) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap()
            .values()
            .filter(|o| namespace.is_empty() || o.namespace() == namespace)
            .filter(|o| selector.is_none_or(|s| selector_matches(s, o.labels())))
            .cloned()
            .collect()
    }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.write().unwrap().push(handler);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Clients is the set of informers the registry consumes.
#[derive(Clone)]
pub struct Clients {
    pub namespaces: Arc<dyn Informer<Namespace>>,
    pub services: Arc<dyn Informer<Service>>,
    pub pods: Arc<dyn Informer<Pod>>,
    pub nodes: Arc<dyn Informer<Node>>,
    pub endpoints: Arc<dyn Informer<Endpoints>>,
    pub endpoint_slices: Arc<dyn Informer<EndpointSlice>>,
    pub crds: Arc<dyn Informer<CustomResourceDefinition>>,
    pub service_exports: Arc<dyn Informer<ServiceExport>>,
    pub service_imports: Arc<dyn Informer<ServiceImport>>,
}

/// MemoryClient owns one [Store] per kind.
#[derive(Default)]
pub struct MemoryClient {
    pub namespaces: Arc<Store<Namespace>>,
    pub services: Arc<Store<Service>>,
    pub pods: Arc<Store<Pod>>,
    pub nodes: Arc<Store<Node>>,
    pub endpoints: Arc<Store<Endpoints>>,
    pub endpoint_slices: Arc<Store<EndpointSlice>>,
    pub crds: Arc<Store<CustomResourceDefinition>>,
    pub service_exports: Arc<Store<ServiceExport>>,
    pub service_imports: Arc<Store<ServiceImport>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clients(&self) -> Clients {
        Clients {
            namespaces: self.namespaces.clone(),
            services: self.services.clone(),
            pods: self.pods.clone(),
            nodes: self.nodes.clone(),
            endpoints: self.endpoints.clone(),
            endpoint_slices: self.endpoint_slices.clone(),
            crds: self.crds.clone(),
            service_exports: self.service_exports.clone(),
            service_imports: self.service_imports.clone(),
        }
    }

    /// Marks every store as having completed its initial listing.
    pub fn mark_synced(&self) {
        self.namespaces.mark_synced();
        self.services.mark_synced();
        self.pods.mark_synced();
        self.nodes.mark_synced();
        self.endpoints.mark_synced();
        self.endpoint_slices.mark_synced();
        self.crds.mark_synced();
        self.service_exports.mark_synced();
        self.service_imports.mark_synced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventHandler<Namespace> for Recorder {
        fn on_add(&self, obj: Arc<Namespace>) {
            self.0.lock().unwrap().push(format!("add {}", obj.name()));
        }
        fn on_update(&self, _: Arc<Namespace>, cur: Arc<Namespace>) {
            self.0.lock().unwrap().push(format!("update {}", cur.name()));
        }
        fn on_delete(&self, obj: Arc<Namespace>) {
            self.0.lock().unwrap().push(format!("delete {}", obj.name()));
        }
    }

    fn ns(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn store_notifies() {
        let store = Store::<Namespace>::new();
        let rec = Arc::new(Recorder::default());
        store.add_event_handler(rec.clone());
        store.apply(ns("a", &[]));
        store.apply(ns("a", &[("k", "v")]));
        store.resync();
        assert!(store.delete("a", "").is_some());
        assert!(store.delete("a", "").is_none());
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec!["add a", "update a", "update a", "delete a"]
        );
    }

    #[test]
    fn store_lists_by_selector() {
        let store = Store::<Namespace>::new();
        store.apply(ns("a", &[("team", "x")]));
        store.apply(ns("b", &[("team", "y")]));
        let sel: Labels = [("team".to_string(), "x".to_string())].into_iter().collect();
        let got: Vec<_> = store
            .list("", Some(&sel))
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(got, vec!["a"]);
        assert_eq!(store.list("", None).len(), 2);
        assert!(!store.has_synced());
        store.mark_synced();
        assert!(store.has_synced());
    }
}
