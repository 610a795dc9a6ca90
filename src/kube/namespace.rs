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

//! Discovery namespaces: restricts the registry to namespaces matching the mesh
//! `discoverySelectors`.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use tracing::{debug, warn};

use crate::kube::client::{EventHandler, Informer, Object};
use crate::model::{Labels, selector_matches};

/// Reports whether `labels` satisfy a Kubernetes label selector. Unknown operators never match.
pub fn label_selector_matches(selector: &LabelSelector, labels: &Labels) -> bool {
    if let Some(ml) = &selector.match_labels {
        if !selector_matches(ml, labels) {
            return false;
        }
    }
    selector.match_expressions.iter().flatten().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        let value = labels.get(&req.key);
        match req.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.is_none_or(|v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            op => {
                warn!(operator = op, key = %req.key, "unknown label selector operator");
                false
            }
        }
    })
}

#[derive(Default)]
struct FilterState {
    selectors: Vec<LabelSelector>,
    /// Selected namespaces. Only meaningful when `selectors` is not empty.
    selected: HashSet<String>,
}

impl FilterState {
    fn matches(&self, ns: &Namespace) -> bool {
        self.selectors
            .iter()
            .any(|s| label_selector_matches(s, ns.labels()))
    }
}

/// DiscoveryNamespacesFilter tracks which namespaces are selected for discovery.
pub struct DiscoveryNamespacesFilter {
    namespaces: Arc<dyn Informer<Namespace>>,
    state: RwLock<FilterState>,
}

impl DiscoveryNamespacesFilter {
    pub fn new(namespaces: Arc<dyn Informer<Namespace>>, selectors: Vec<LabelSelector>) -> Self {
        let f = DiscoveryNamespacesFilter {
            namespaces,
            state: RwLock::new(FilterState {
                selectors,
                selected: HashSet::new(),
            }),
        };
        f.recompute();
        f
    }

    /// Whether objects in `namespace` are visible. Cluster scoped objects always are.
    pub fn filter(&self, namespace: &str) -> bool {
        if namespace.is_empty() {
            return true;
        }
        let state = self.state.read().unwrap();
        state.selectors.is_empty() || state.selected.contains(namespace)
    }

    fn recompute(&self) -> (Vec<String>, Vec<String>) {
        let namespaces = self.namespaces.list("", None);
        let mut state = self.state.write().unwrap();
        let now: HashSet<String> = namespaces
            .iter()
            .filter(|ns| state.matches(ns))
            .map(|ns| ns.name().to_string())
            .collect();
        let selected = now.difference(&state.selected).cloned().collect();
        let deselected = state.selected.difference(&now).cloned().collect();
        state.selected = now;
        (selected, deselected)
    }

    /// Recomputes the selected set from the namespace cache.
    pub fn sync_namespaces(&self) -> anyhow::Result<()> {
        let (selected, deselected) = self.recompute();
        debug!(
            selected = selected.len(),
            deselected = deselected.len(),
            "synced discovery namespaces"
        );
        Ok(())
    }

    /// Replaces the selectors, returning the namespaces that became selected and deselected.
    /// With no selectors every namespace is visible, so the returned sets describe visibility
    /// rather than membership.
    pub fn set_selectors(&self, selectors: Vec<LabelSelector>) -> (Vec<String>, Vec<String>) {
        let all: HashSet<String> = self
            .namespaces
            .list("", None)
            .iter()
            .map(|ns| ns.name().to_string())
            .collect();
        let visible_before: HashSet<String> = all
            .iter()
            .filter(|ns| self.filter(ns))
            .cloned()
            .collect();
        self.state.write().unwrap().selectors = selectors;
        self.recompute();
        let visible_after: HashSet<String> = all
            .iter()
            .filter(|ns| self.filter(ns))
            .cloned()
            .collect();
        let mut selected: Vec<String> = visible_after
            .difference(&visible_before)
            .cloned()
            .collect();
        let mut deselected: Vec<String> = visible_before
            .difference(&visible_after)
            .cloned()
            .collect();
        selected.sort();
        deselected.sort();
        (selected, deselected)
    }

    /// Records a new namespace, returning whether it is selected.
    pub fn namespace_created(&self, ns: &Namespace) -> bool {
        let mut state = self.state.write().unwrap();
        if state.selectors.is_empty() || !state.matches(ns) {
            return false;
        }
        state.selected.insert(ns.name().to_string())
    }

    /// Records a namespace update. Returns `Some(true)` if it became selected, `Some(false)` if
    /// it was deselected and `None` if membership did not change.
    pub fn namespace_updated(&self, old: &Namespace, cur: &Namespace) -> Option<bool> {
        let mut state = self.state.write().unwrap();
        if state.selectors.is_empty() {
            return None;
        }
        match (state.matches(old), state.matches(cur)) {
            (false, true) => {
                state.selected.insert(cur.name().to_string());
                Some(true)
            }
            (true, false) => {
                state.selected.remove(cur.name());
                Some(false)
            }
            _ => None,
        }
    }

    pub fn namespace_deleted(&self, ns: &Namespace) {
        self.state.write().unwrap().selected.remove(ns.name());
    }
}

/// Filtered restricts an informer to objects in discovered namespaces.
pub struct Filtered<K: Object> {
    inner: Arc<dyn Informer<K>>,
    filter: Arc<DiscoveryNamespacesFilter>,
}

impl<K: Object> Filtered<K> {
    pub fn new(inner: Arc<dyn Informer<K>>, filter: Arc<DiscoveryNamespacesFilter>) -> Self {
        Filtered { inner, filter }
    }

    /// The underlying informer, which sees every namespace.
    pub fn unfiltered(&self) -> &Arc<dyn Informer<K>> {
        &self.inner
    }
}

impl<K: Object> Informer<K> for Filtered<K> {
    fn get(&self, name: &str, namespace: &str) -> Option<Arc<K>> {
        if !self.filter.filter(namespace) {
            return None;
        }
        self.inner.get(name, namespace)
    }

    fn list(&self, namespace: &str, selector: Option<&Labels>) -> Vec<Arc<K>> {
        if !self.filter.filter(namespace) {
            return Vec::new();
        }
        let mut items = self.inner.list(namespace, selector);
        items.retain(|o| self.filter.filter(o.namespace()));
        items
    }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.inner.add_event_handler(Arc::new(FilteredHandler {
            handler,
            filter: self.filter.clone(),
        }));
    }

    fn has_synced(&self) -> bool {
        self.inner.has_synced()
    }
}

struct FilteredHandler<K> {
    handler: Arc<dyn EventHandler<K>>,
    filter: Arc<DiscoveryNamespacesFilter>,
}

impl<K: Object> EventHandler<K> for FilteredHandler<K> {
    fn on_add(&self, obj: Arc<K>) {
        if self.filter.filter(obj.namespace()) {
            self.handler.on_add(obj);
        }
    }

    fn on_update(&self, old: Arc<K>, cur: Arc<K>) {
        match (
            self.filter.filter(old.namespace()),
            self.filter.filter(cur.namespace()),
        ) {
            (true, true) => self.handler.on_update(old, cur),
            (false, true) => self.handler.on_add(cur),
            (true, false) => self.handler.on_delete(old),
            (false, false) => {}
        }
    }

    fn on_delete(&self, obj: Arc<K>) {
        if self.filter.filter(obj.namespace()) {
            self.handler.on_delete(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::client::Store;
    use crate::test_helpers::kube::{namespace, service};
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use std::sync::Mutex;
    use test_case::test_case;

    fn labels(kv: &[(&str, &str)]) -> Labels {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn select(kv: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(labels(kv)),
            match_expressions: None,
        }
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelector {
        LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: op.to_string(),
                values: Some(values.iter().map(|v| v.to_string()).collect()),
            }]),
        }
    }

    #[test_case(select(&[("env", "prod")]), &[("env", "prod")], true; "match labels")]
    #[test_case(select(&[("env", "prod")]), &[("env", "dev")], false; "match labels mismatch")]
    #[test_case(expr("env", "In", &["prod", "stage"]), &[("env", "stage")], true; "in")]
    #[test_case(expr("env", "NotIn", &["prod"]), &[], true; "not in absent")]
    #[test_case(expr("env", "Exists", &[]), &[("env", "x")], true; "exists")]
    #[test_case(expr("env", "DoesNotExist", &[]), &[("env", "x")], false; "does not exist")]
    #[test_case(expr("env", "Gt", &["1"]), &[("env", "2")], false; "unknown operator")]
    fn selectors(selector: LabelSelector, target: &[(&str, &str)], want: bool) {
        assert_eq!(label_selector_matches(&selector, &labels(target)), want);
    }

    #[test]
    fn membership() {
        let store = Arc::new(Store::<Namespace>::new());
        store.apply(namespace("a", &[("mesh", "on")]));
        store.apply(namespace("b", &[]));
        let filter = DiscoveryNamespacesFilter::new(store.clone(), vec![select(&[("mesh", "on")])]);
        assert!(filter.filter("a"));
        assert!(!filter.filter("b"));
        assert!(filter.filter(""));

        let old = namespace("b", &[]);
        let cur = namespace("b", &[("mesh", "on")]);
        assert_eq!(filter.namespace_updated(&old, &cur), Some(true));
        assert!(filter.filter("b"));
        assert_eq!(filter.namespace_updated(&cur, &cur), None);
        filter.namespace_deleted(&cur);
        assert!(!filter.filter("b"));
        assert!(filter.namespace_created(&namespace("c", &[("mesh", "on")])));
        assert!(!filter.namespace_created(&namespace("d", &[])));

        // Dropping the selectors makes everything visible.
        store.apply(namespace("c", &[("mesh", "on")]));
        let (selected, deselected) = filter.set_selectors(Vec::new());
        assert_eq!(selected, vec!["b"]);
        assert!(deselected.is_empty());
        assert!(filter.filter("anything"));
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventHandler<Service> for Recorder {
        fn on_add(&self, obj: Arc<Service>) {
            self.0.lock().unwrap().push(format!("add {}", obj.name()));
        }
        fn on_update(&self, _: Arc<Service>, cur: Arc<Service>) {
            self.0.lock().unwrap().push(format!("update {}", cur.name()));
        }
        fn on_delete(&self, obj: Arc<Service>) {
            self.0.lock().unwrap().push(format!("delete {}", obj.name()));
        }
    }

    #[test]
    fn filtered_informer() {
        let namespaces = Arc::new(Store::<Namespace>::new());
        namespaces.apply(namespace("a", &[("mesh", "on")]));
        namespaces.apply(namespace("b", &[]));
        let filter = Arc::new(DiscoveryNamespacesFilter::new(
            namespaces,
            vec![select(&[("mesh", "on")])],
        ));
        let services = Arc::new(Store::<Service>::new());
        let filtered = Filtered::new(services.clone(), filter);
        let rec = Arc::new(Recorder::default());
        filtered.add_event_handler(rec.clone());

        services.apply(service("x", "a", &[]));
        services.apply(service("y", "b", &[]));
        services.delete("y", "b");
        assert_eq!(*rec.0.lock().unwrap(), vec!["add x"]);
        assert!(filtered.get("y", "b").is_none());
        services.apply(service("y", "b", &[]));
        assert_eq!(filtered.list("", None).len(), 1);
        assert_eq!(filtered.unfiltered().list("", None).len(), 2);
    }
}
