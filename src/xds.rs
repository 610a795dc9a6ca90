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

//! The interface towards the downstream distribution layer. The registry computes endpoint sets and
//! push triggers; pushing them to proxies is done elsewhere.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info};

use crate::model::{ClusterId, Event, IstioEndpoint, ShardKey};
use crate::strng::Strng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TriggerReason {
    /// Network topology, including gateways, changed.
    NetworksTrigger,
    ServiceUpdate,
    /// Endpoints of a headless service changed; DNS records need a full push.
    HeadlessEndpointUpdate,
    /// A namespace entered or left discovery.
    NamespaceUpdate,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerReason::NetworksTrigger => "networks",
            TriggerReason::ServiceUpdate => "service",
            TriggerReason::HeadlessEndpointUpdate => "headlessendpoint",
            TriggerReason::NamespaceUpdate => "namespace",
        };
        f.write_str(s)
    }
}

/// Identifies a single config object touched by a push.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    pub kind: &'static str,
    pub name: Strng,
    pub namespace: Strng,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushRequest {
    pub full: bool,
    pub configs_updated: BTreeSet<ConfigKey>,
    pub reason: Vec<TriggerReason>,
}

impl PushRequest {
    pub fn full(reason: TriggerReason) -> Self {
        PushRequest {
            full: true,
            configs_updated: BTreeSet::new(),
            reason: vec![reason],
        }
    }
}

/// XdsUpdater receives everything the registry computes.
///
/// Implementations must not call back into the registry synchronously; calls are made from the
/// registry's single event consumer.
pub trait XdsUpdater: Send + Sync + 'static {
    /// Endpoints of a service changed and should be pushed.
    fn eds_update(
        &self,
        shard: &ShardKey,
        hostname: &str,
        namespace: &str,
        eps: Vec<IstioEndpoint>,
    );

    /// Like [XdsUpdater::eds_update], but only refreshes the cache without pushing.
    fn eds_cache_update(
        &self,
        shard: &ShardKey,
        hostname: &str,
        namespace: &str,
        eps: Vec<IstioEndpoint>,
    );

    fn svc_update(&self, shard: &ShardKey, hostname: &str, namespace: &str, event: Event);

    fn config_update(&self, req: PushRequest);

    /// The proxy at the given IP should have its configuration recomputed.
    fn proxy_update(&self, cluster: &ClusterId, ip: &str);

    /// All state from the given registry should be dropped.
    fn remove_shard(&self, shard: &ShardKey);
}

/// LoggingUpdater records every downstream call to the log. Used when running without a
/// distribution layer.
#[derive(Default, Debug, Clone, Copy)]
pub struct LoggingUpdater;

impl XdsUpdater for LoggingUpdater {
    fn eds_update(
        &self,
        shard: &ShardKey,
        hostname: &str,
        namespace: &str,
        eps: Vec<IstioEndpoint>,
    ) {
        info!(
            %shard,
            hostname,
            namespace,
            endpoints = eps.len(),
            "eds update"
        );
        for ep in &eps {
            debug!(
                hostname,
                address = %ep.address,
                port = ep.endpoint_port,
                network = %ep.network,
                locality = %ep.locality.label,
                health = ?ep.health_status,
                "endpoint"
            );
        }
    }

    fn eds_cache_update(
        &self,
        shard: &ShardKey,
        hostname: &str,
        namespace: &str,
        eps: Vec<IstioEndpoint>,
    ) {
        debug!(%shard, hostname, namespace, endpoints = eps.len(), "eds cache update");
    }

    fn svc_update(&self, shard: &ShardKey, hostname: &str, namespace: &str, event: Event) {
        info!(%shard, hostname, namespace, %event, "service update");
    }

    fn config_update(&self, req: PushRequest) {
        info!(
            full = req.full,
            reason = ?req.reason,
            configs = req.configs_updated.len(),
            "config update"
        );
    }

    fn proxy_update(&self, cluster: &ClusterId, ip: &str) {
        debug!(%cluster, ip, "proxy update");
    }

    fn remove_shard(&self, shard: &ShardKey) {
        info!(%shard, "remove shard");
    }
}
