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

//! The registry model: what the controller computes from cluster objects and
//! hands to the downstream distributor.

use std::collections::BTreeMap;
use std::fmt;

use crate::strng::Strng;

mod service;
mod workload;

pub use service::*;
pub use workload::*;

pub type ClusterId = Strng;
pub type NetworkId = Strng;
pub type Labels = BTreeMap<String, String>;

/// Well-known label and annotation keys read or written by the registry.
pub mod label {
    pub const TOPOLOGY_NETWORK: &str = "topology.istio.io/network";
    pub const TOPOLOGY_CLUSTER: &str = "topology.istio.io/cluster";
    pub const TOPOLOGY_SUBZONE: &str = "topology.istio.io/subzone";
    pub const ISTIO_LOCALITY: &str = "istio-locality";
    pub const NODE_REGION: &str = "topology.kubernetes.io/region";
    pub const NODE_ZONE: &str = "topology.kubernetes.io/zone";
    pub const NODE_REGION_BETA: &str = "failure-domain.beta.kubernetes.io/region";
    pub const NODE_ZONE_BETA: &str = "failure-domain.beta.kubernetes.io/zone";
    pub const HOSTNAME: &str = "kubernetes.io/hostname";
    pub const TLS_MODE: &str = "security.istio.io/tlsMode";
    pub const NETWORKING_GATEWAY_PORT: &str = "networking.istio.io/gatewayPort";
    pub const SERVICE_NAME: &str = "kubernetes.io/service-name";
    pub const NODE_SELECTOR_ANNOTATION: &str = "traffic.istio.io/nodeSelector";
}

/// Event describes the kind of change observed for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Add,
    Update,
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::Add => "add",
            Event::Update => "update",
            Event::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Provider identifies which kind of registry produced a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Provider {
    #[default]
    Kubernetes,
    External,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Kubernetes => f.write_str("Kubernetes"),
            Provider::External => f.write_str("External"),
        }
    }
}

/// ShardKey scopes downstream updates to a single registry instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub cluster: ClusterId,
    pub provider: Provider,
}

impl ShardKey {
    pub fn kubernetes(cluster: ClusterId) -> Self {
        ShardKey {
            cluster,
            provider: Provider::Kubernetes,
        }
    }
}

impl PartialOrd for Provider {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Provider {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.cluster)
    }
}

/// selector_matches reports whether every key/value in `selector` is present in `labels`.
/// An empty selector matches everything.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|lv| lv == v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn labels(kv: &[(&str, &str)]) -> Labels {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test_case(&[], &[("app", "a")], true; "empty selector")]
    #[test_case(&[("app", "a")], &[("app", "a"), ("tier", "b")], true; "subset")]
    #[test_case(&[("app", "a"), ("tier", "c")], &[("app", "a"), ("tier", "b")], false; "value mismatch")]
    #[test_case(&[("app", "a")], &[], false; "missing key")]
    fn selector(selector: &[(&str, &str)], target: &[(&str, &str)], expected: bool) {
        assert_eq!(
            selector_matches(&labels(selector), &labels(target)),
            expected
        );
    }

    #[test]
    fn shard_display() {
        let shard = ShardKey::kubernetes(crate::strng::literal!("cluster-1"));
        assert_eq!(shard.to_string(), "Kubernetes/cluster-1");
        assert_eq!(Event::Delete.to_string(), "delete");
    }
}
