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

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, instrument};

use crate::kube::client::{Informer, Object};
use crate::kube::controller::{Controller, ObjectHandler};
use crate::kube::conversion::{namespaced_name, pod_port_map};
use crate::kube::endpoint_builder::EndpointBuilder;
use crate::metrics::{PendingPods, Recorder};
use crate::model::{
    DiscoverabilityPolicy, Event, HealthStatus, NamespacedName, Proxy, WorkloadInstance,
    WorkloadKind,
};
use crate::strng;

#[derive(Default)]
struct PodIndex {
    pods_by_ip: HashMap<String, BTreeSet<NamespacedName>>,
    ip_by_pods: HashMap<NamespacedName, String>,
    /// Endpoint objects that referenced an IP before its pod was known, keyed by that IP.
    need_resync: HashMap<String, BTreeSet<NamespacedName>>,
}

/// PodCache indexes ready pods by IP.
pub struct PodCache {
    pods: Arc<dyn Informer<Pod>>,
    index: RwLock<PodIndex>,
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Pods that ran to completion are not endpoints, even if they still hold an IP.
fn should_be_in_endpoints(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    match pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref()) {
        Some("Never") => phase != Some("Failed") && phase != Some("Succeeded"),
        Some("OnFailure") => phase != Some("Succeeded"),
        _ => true,
    }
}

pub(crate) fn pod_ip(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .unwrap_or_default()
}

impl PodCache {
    pub fn new(pods: Arc<dyn Informer<Pod>>) -> Self {
        PodCache {
            pods,
            index: Default::default(),
        }
    }

    pub fn has_synced(&self) -> bool {
        self.pods.has_synced()
    }

    /// Applies a pod event to the index and notifies workload handlers of any change.
    #[instrument(skip_all, fields(pod = %namespaced_name(pod), event = %ev))]
    pub fn on_event(&self, c: &Controller, pod: &Pod, mut ev: Event) -> anyhow::Result<()> {
        let key = namespaced_name(pod);
        let mut ip = pod_ip(pod).to_string();
        if ip.is_empty() {
            // An evicted pod may lose its IP in the same update that marks it failed.
            match self.ip_by_pod(&key) {
                Some(old) => ip = old,
                None => return Ok(()),
            }
        }
        let include = !pod.is_terminating() && should_be_in_endpoints(pod) && is_pod_ready(pod);
        match ev {
            Event::Add => {
                if !include {
                    return Ok(());
                }
                self.update(c, &ip, key);
            }
            Event::Update => {
                if !include {
                    if !self.delete_ip(&ip, &key) {
                        return Ok(());
                    }
                    ev = Event::Delete;
                } else {
                    self.update(c, &ip, key);
                }
            }
            Event::Delete => {
                if !self.delete_ip(&ip, &key) {
                    return Ok(());
                }
            }
        }
        self.notify_workload_handlers(c, pod, ev, &ip);
        Ok(())
    }

    fn notify_workload_handlers(&self, c: &Controller, pod: &Pod, ev: Event, ip: &str) {
        if !c.has_workload_handlers() {
            return;
        }
        let endpoint = EndpointBuilder::new(c, Some(pod)).build(
            c,
            ip,
            0,
            "",
            DiscoverabilityPolicy::AlwaysDiscoverable,
            HealthStatus::Healthy,
        );
        let wi = WorkloadInstance {
            name: pod.name().to_string(),
            namespace: pod.namespace().to_string(),
            kind: WorkloadKind::Pod,
            endpoint,
            port_map: pod_port_map(pod),
        };
        c.notify_workload_handlers(&wi, ev);
    }

    fn ip_by_pod(&self, key: &NamespacedName) -> Option<String> {
        self.index.read().unwrap().ip_by_pods.get(key).cloned()
    }

    fn delete_ip(&self, ip: &str, key: &NamespacedName) -> bool {
        let mut index = self.index.write().unwrap();
        let present = index
            .pods_by_ip
            .get(ip)
            .is_some_and(|keys| keys.contains(key));
        if present {
            remove_key(&mut index.pods_by_ip, ip, key);
            index.ip_by_pods.remove(key);
        }
        present
    }

    fn update(&self, c: &Controller, ip: &str, key: NamespacedName) {
        {
            let mut index = self.index.write().unwrap();
            if index.pods_by_ip.get(ip).is_some_and(|keys| keys.contains(&key)) {
                return;
            }
            if let Some(current) = index.ip_by_pods.get(&key).cloned() {
                remove_key(&mut index.pods_by_ip, &current, &key);
            }
            index
                .pods_by_ip
                .entry(ip.to_string())
                .or_default()
                .insert(key.clone());
            index.ip_by_pods.insert(key, ip.to_string());

            if let Some(endpoints) = index.need_resync.remove(ip) {
                for ep in endpoints {
                    c.queue_endpoint_resync(ep);
                }
                c.metrics()
                    .record(&PendingPods(index.need_resync.len()), ());
            }
        }
        self.proxy_update(c, ip);
    }

    fn proxy_update(&self, c: &Controller, ip: &str) {
        c.xds().proxy_update(c.cluster(), ip);
    }

    /// Remembers that the endpoint object `key` references `ip`, whose pod is not known yet. The
    /// endpoint object is resynced once the pod arrives.
    pub fn queue_endpoint_event_on_pod_arrival(
        &self,
        c: &Controller,
        key: NamespacedName,
        ip: &str,
    ) {
        let mut index = self.index.write().unwrap();
        index
            .need_resync
            .entry(ip.to_string())
            .or_default()
            .insert(key);
        c.metrics()
            .record(&PendingPods(index.need_resync.len()), ());
    }

    /// Forgets a pending pod wait for a deleted endpoint object.
    pub fn endpoint_deleted(&self, c: &Controller, key: &NamespacedName, ip: &str) {
        let mut index = self.index.write().unwrap();
        remove_key(&mut index.need_resync, ip, key);
        c.metrics()
            .record(&PendingPods(index.need_resync.len()), ());
    }

    pub fn get_pod_keys(&self, ip: &str) -> Vec<NamespacedName> {
        self.index
            .read()
            .unwrap()
            .pods_by_ip
            .get(ip)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_pods_by_ip(&self, ip: &str) -> Vec<Arc<Pod>> {
        self.get_pod_keys(ip)
            .iter()
            .filter_map(|k| self.get_pod_by_key(k))
            .collect()
    }

    pub fn get_pod_by_key(&self, key: &NamespacedName) -> Option<Arc<Pod>> {
        self.pods.get(&key.name, &key.namespace)
    }

    /// Finds the pod of a proxy, first by its `<name>.<namespace>` ID, then by its first IP.
    pub fn get_pod_by_proxy(&self, proxy: &Proxy) -> Option<Arc<Pod>> {
        if let Some((name, ns)) = proxy.id.split_once('.') {
            if !name.is_empty() && ns == proxy.config_namespace {
                let key = NamespacedName {
                    namespace: strng::new(ns),
                    name: strng::new(name),
                };
                if let Some(pod) = self.get_pod_by_key(&key) {
                    return Some(pod);
                }
            }
        }
        let ip = proxy.ip_addresses.first()?;
        let mut pods = self.get_pods_by_ip(ip);
        if pods.len() != 1 {
            debug!(ip, matches = pods.len(), "no unique pod for proxy ip");
            return None;
        }
        pods.pop()
    }
}

fn remove_key(m: &mut HashMap<String, BTreeSet<NamespacedName>>, ip: &str, key: &NamespacedName) {
    if let Some(keys) = m.get_mut(ip) {
        keys.remove(key);
        if keys.is_empty() {
            m.remove(ip);
        }
    }
}

impl ObjectHandler<Pod> for PodCache {
    fn handle(
        &self,
        c: &Controller,
        _old: Option<Arc<Pod>>,
        cur: Arc<Pod>,
        event: Event,
    ) -> anyhow::Result<()> {
        self.on_event(c, &cur, event)
    }

    /// Label or annotation changes alter the proxy's own config; push it but keep processing.
    fn skip_update(&self, c: &Controller, old: &Pod, cur: &Pod) -> bool {
        let ip = pod_ip(cur);
        if !ip.is_empty()
            && (old.labels() != cur.labels() || old.annotations() != cur.annotations())
        {
            self.proxy_update(c, ip);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::Options;
    use crate::test_helpers::kube::*;
    use crate::test_helpers::xds::XdsEvent;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn readiness_and_phase() {
        let mut p = pod("p", "ns", &[], "10.0.0.1", "n");
        assert!(is_pod_ready(&p));
        assert!(should_be_in_endpoints(&p));
        set_ready(&mut p, false);
        assert!(!is_pod_ready(&p));

        p.spec.as_mut().unwrap().restart_policy = Some("Never".to_string());
        p.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        assert!(!should_be_in_endpoints(&p));
        p.spec.as_mut().unwrap().restart_policy = Some("Always".to_string());
        assert!(should_be_in_endpoints(&p));
    }

    #[tokio::test]
    async fn index_follows_pod_lifecycle() {
        let f = FakeController::new(Options::default()).await;
        let p = pod("p", "ns", &[("app", "a")], "10.0.0.1", "n");
        f.client.pods.apply(p.clone());
        f.flush().await;
        assert_eq!(f.controller.pods().get_pods_by_ip("10.0.0.1").len(), 1);
        assert!(f.xds.events().contains(&XdsEvent::Proxy("10.0.0.1".to_string())));

        // Becoming unready removes the pod.
        let mut unready = p.clone();
        set_ready(&mut unready, false);
        f.client.pods.apply(unready);
        f.flush().await;
        assert!(f.controller.pods().get_pods_by_ip("10.0.0.1").is_empty());

        // A new IP replaces the old one.
        f.client.pods.apply(p.clone());
        let mut moved = p.clone();
        moved.status.as_mut().unwrap().pod_ip = Some("10.0.0.2".to_string());
        f.client.pods.apply(moved);
        f.flush().await;
        assert!(f.controller.pods().get_pod_keys("10.0.0.1").is_empty());
        assert_eq!(f.controller.pods().get_pod_keys("10.0.0.2").len(), 1);

        // Terminating pods are removed.
        let mut terminating = p.clone();
        terminating.status.as_mut().unwrap().pod_ip = Some("10.0.0.2".to_string());
        terminating.metadata.deletion_timestamp = Some(Time(Default::default()));
        f.client.pods.apply(terminating);
        f.flush().await;
        assert!(f.controller.pods().get_pod_keys("10.0.0.2").is_empty());
    }

    #[tokio::test]
    async fn pod_by_proxy() {
        let f = FakeController::new(Options::default()).await;
        f.client.pods.apply(pod("p", "ns", &[], "10.0.0.1", "n"));
        f.flush().await;
        let by_id = Proxy {
            id: "p.ns".to_string(),
            config_namespace: "ns".to_string(),
            ..Default::default()
        };
        assert!(f.controller.pods().get_pod_by_proxy(&by_id).is_some());
        let by_ip = Proxy {
            id: "unknown.other".to_string(),
            ip_addresses: vec!["10.0.0.1".to_string()],
            ..Default::default()
        };
        assert_eq!(
            f.controller.pods().get_pod_by_proxy(&by_ip).map(|p| p.name().to_string()),
            Some("p".to_string())
        );
        let missing = Proxy {
            ip_addresses: vec!["10.9.9.9".to_string()],
            ..Default::default()
        };
        assert!(f.controller.pods().get_pod_by_proxy(&missing).is_none());
    }

    #[tokio::test]
    async fn label_change_pushes_proxy() {
        let f = FakeController::new(Options::default()).await;
        let p = pod("p", "ns", &[("v", "1")], "10.0.0.1", "n");
        f.client.pods.apply(p.clone());
        f.flush().await;
        f.xds.clear();
        f.client.pods.apply(pod("p", "ns", &[("v", "2")], "10.0.0.1", "n"));
        f.flush().await;
        assert!(f.xds.events().contains(&XdsEvent::Proxy("10.0.0.1".to_string())));
    }
}
