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

use std::sync::Mutex;

use crate::model::{ClusterId, Event, IstioEndpoint, ShardKey};
use crate::xds::{PushRequest, XdsUpdater};

/// A single call made to the [FakeXdsUpdater].
#[derive(Debug, Clone, PartialEq)]
pub enum XdsEvent {
    Eds(String, Vec<IstioEndpoint>),
    EdsCache(String, Vec<IstioEndpoint>),
    /// hostname, namespace, event
    Svc(String, String, Event),
    Config(PushRequest),
    Proxy(String),
    RemoveShard,
}

/// FakeXdsUpdater records every call in order.
#[derive(Debug, Default)]
pub struct FakeXdsUpdater {
    events: Mutex<Vec<XdsEvent>>,
}

impl FakeXdsUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, ev: XdsEvent) {
        self.events.lock().unwrap().push(ev);
    }

    pub fn events(&self) -> Vec<XdsEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// The endpoints most recently pushed or cached for `host`.
    pub fn last_eds(&self, host: &str) -> Option<Vec<IstioEndpoint>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|e| match e {
                XdsEvent::Eds(h, eps) | XdsEvent::EdsCache(h, eps) if h == host => {
                    Some(eps.clone())
                }
                _ => None,
            })
    }
}

impl XdsUpdater for FakeXdsUpdater {
    fn eds_update(&self, _: &ShardKey, hostname: &str, _: &str, eps: Vec<IstioEndpoint>) {
        self.push(XdsEvent::Eds(hostname.to_string(), eps));
    }

    fn eds_cache_update(&self, _: &ShardKey, hostname: &str, _: &str, eps: Vec<IstioEndpoint>) {
        self.push(XdsEvent::EdsCache(hostname.to_string(), eps));
    }

    fn svc_update(&self, _: &ShardKey, hostname: &str, namespace: &str, event: Event) {
        self.push(XdsEvent::Svc(
            hostname.to_string(),
            namespace.to_string(),
            event,
        ));
    }

    fn config_update(&self, req: PushRequest) {
        self.push(XdsEvent::Config(req));
    }

    fn proxy_update(&self, _: &ClusterId, ip: &str) {
        self.push(XdsEvent::Proxy(ip.to_string()));
    }

    fn remove_shard(&self, _: &ShardKey) {
        self.push(XdsEvent::RemoveShard);
    }
}
