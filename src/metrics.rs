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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Registry metrics derived from watch events.
pub struct Metrics {
    events: Family<RegistryEvent, Counter>,
    endpoints_with_no_pods: Counter,
    endpoints_pending_pod: Gauge,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RegistryEvent {
    pub kind: &'static str,
    pub event: EventType,
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum EventType {
    add,
    update,
    updatesame,
    delete,
}

/// An endpoint address referenced a pod that is not in the pod index yet.
pub struct EndpointWithoutPod;

/// Current number of IPs awaiting their pod.
pub struct PendingPods(pub usize);

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let events = Family::default();
        registry.register(
            "k8s_reg_events",
            "Events from k8s registry",
            events.clone(),
        );
        let endpoints_with_no_pods = Counter::default();
        registry.register(
            "k8s_endpoints_with_no_pods",
            "Endpoints that does not have any corresponding pods",
            endpoints_with_no_pods.clone(),
        );
        let endpoints_pending_pod = Gauge::default();
        registry.register(
            "k8s_endpoints_pending_pod",
            "Number of endpoints that do not currently have any corresponding pods",
            endpoints_pending_pod.clone(),
        );
        Self {
            events,
            endpoints_with_no_pods,
            endpoints_pending_pod,
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn events(&self, kind: &'static str, event: EventType) -> u64 {
        self.events
            .get_or_create(&RegistryEvent { kind, event })
            .get()
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn pending_pods(&self) -> i64 {
        self.endpoints_pending_pod.get()
    }
}

impl From<&mut Registry> for Metrics {
    fn from(registry: &mut Registry) -> Self {
        Metrics::new(registry.sub_registry_with_prefix("pilot"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::from(&mut registry)
    }
}

pub trait Recorder<E, T> {
    /// Record the given event
    fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
    /// Record the given event by incrementing the counter by count
    fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
    R: Recorder<E, u64>,
{
    fn increment(&self, event: &E) {
        self.record(event, 1);
    }
}

impl Recorder<RegistryEvent, u64> for Metrics {
    fn record(&self, event: &RegistryEvent, count: u64) {
        self.events.get_or_create(event).inc_by(count);
    }
}

impl Recorder<EndpointWithoutPod, u64> for Metrics {
    fn record(&self, _: &EndpointWithoutPod, count: u64) {
        self.endpoints_with_no_pods.inc_by(count);
    }
}

impl Recorder<PendingPods, ()> for Metrics {
    fn record(&self, event: &PendingPods, _: ()) {
        self.endpoints_pending_pod.set(event.0 as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_registry_events() {
        let mut registry = Registry::default();
        let metrics = Metrics::from(&mut registry);
        let ev = RegistryEvent {
            kind: "Services",
            event: EventType::add,
        };
        metrics.increment(&ev);
        metrics.increment(&ev);
        metrics.record(&PendingPods(3), ());

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(r#"pilot_k8s_reg_events_total{kind="Services",event="add"} 2"#));
        assert!(out.contains("pilot_k8s_endpoints_pending_pod 3"));
        assert_eq!(metrics.events("Services", EventType::add), 2);
        assert_eq!(metrics.events("Services", EventType::delete), 0);
    }
}
