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

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::model::{Proxy, WorkloadInstance};

#[derive(Default)]
struct IndexInner {
    by_key: HashMap<String, Arc<WorkloadInstance>>,
    by_ip: HashMap<String, BTreeSet<String>>,
}

/// Index of workload instances registered by other registries, keyed by `namespace/name` with a
/// secondary index by address.
#[derive(Default)]
pub struct Index {
    inner: RwLock<IndexInner>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an instance, returning the previous one.
    pub fn insert(&self, wi: Arc<WorkloadInstance>) -> Option<Arc<WorkloadInstance>> {
        let key = wi.key();
        let mut inner = self.inner.write().unwrap();
        let prev = inner.by_key.insert(key.clone(), wi.clone());
        if let Some(prev) = &prev {
            if prev.endpoint.address != wi.endpoint.address {
                remove_ip(&mut inner.by_ip, &prev.endpoint.address, &key);
            }
        }
        inner
            .by_ip
            .entry(wi.endpoint.address.clone())
            .or_default()
            .insert(key);
        prev
    }

    /// Removes an instance, returning what was stored.
    pub fn delete(&self, wi: &WorkloadInstance) -> Option<Arc<WorkloadInstance>> {
        let key = wi.key();
        let mut inner = self.inner.write().unwrap();
        let prev = inner.by_key.remove(&key)?;
        remove_ip(&mut inner.by_ip, &prev.endpoint.address, &key);
        Some(prev)
    }

    pub fn get_by_ip(&self, ip: &str) -> Vec<Arc<WorkloadInstance>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_ip
            .get(ip)
            .into_iter()
            .flatten()
            .filter_map(|k| inner.by_key.get(k).cloned())
            .collect()
    }

    /// Visits every instance in no particular order.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<WorkloadInstance>)) {
        let inner = self.inner.read().unwrap();
        for wi in inner.by_key.values() {
            f(wi);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().by_key.is_empty()
    }
}

fn remove_ip(by_ip: &mut HashMap<String, BTreeSet<String>>, ip: &str, key: &str) {
    if let Some(keys) = by_ip.get_mut(ip) {
        keys.remove(key);
        if keys.is_empty() {
            by_ip.remove(ip);
        }
    }
}

/// Picks the instance a proxy at `ip` belongs to. Several instances may share an address; prefer
/// the one named by the proxy ID, then one in the proxy's namespace, then the first by key.
pub fn get_instance_for_proxy(
    index: &Index,
    proxy: &Proxy,
    ip: &str,
) -> Option<Arc<WorkloadInstance>> {
    let instances = index.get_by_ip(ip);
    if let Some((name, ns)) = proxy.id.split_once('.') {
        if let Some(wi) = instances
            .iter()
            .find(|wi| wi.name == name && wi.namespace == ns)
        {
            return Some(wi.clone());
        }
    }
    instances
        .iter()
        .find(|wi| wi.namespace == proxy.config_namespace)
        .or_else(|| instances.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IstioEndpoint;

    fn wi(name: &str, ns: &str, ip: &str) -> Arc<WorkloadInstance> {
        Arc::new(WorkloadInstance {
            name: name.to_string(),
            namespace: ns.to_string(),
            endpoint: IstioEndpoint {
                address: ip.to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn insert_replace_delete() {
        let index = Index::new();
        assert!(index.is_empty());
        assert!(index.insert(wi("a", "ns", "10.0.0.1")).is_none());
        // Moving to a new address drops the old address entry.
        assert!(index.insert(wi("a", "ns", "10.0.0.2")).is_some());
        assert!(index.get_by_ip("10.0.0.1").is_empty());
        assert_eq!(index.get_by_ip("10.0.0.2").len(), 1);

        assert!(index.delete(&wi("a", "ns", "ignored")).is_some());
        assert!(index.delete(&wi("a", "ns", "ignored")).is_none());
        assert!(index.is_empty());
        assert!(index.get_by_ip("10.0.0.2").is_empty());
    }

    #[test]
    fn instance_for_proxy() {
        let index = Index::new();
        index.insert(wi("a", "ns1", "10.0.0.1"));
        index.insert(wi("b", "ns2", "10.0.0.1"));
        index.insert(wi("c", "ns2", "10.0.0.1"));

        let mut proxy = Proxy {
            id: "c.ns2".to_string(),
            config_namespace: "ns1".to_string(),
            ..Default::default()
        };
        let pick =
            |p: &Proxy| get_instance_for_proxy(&index, p, "10.0.0.1").map(|w| w.name.clone());
        assert_eq!(pick(&proxy).as_deref(), Some("c"));
        proxy.id = "unknown.ns".to_string();
        assert_eq!(pick(&proxy).as_deref(), Some("a"));
        proxy.config_namespace = "other".to_string();
        assert!(pick(&proxy).is_some());
        assert!(get_instance_for_proxy(&index, &proxy, "10.9.9.9").is_none());
    }
}
