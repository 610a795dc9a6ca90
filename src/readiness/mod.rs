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

use crate::telemetry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

/// Ready gates the registry on the tasks that must finish before it serves a complete view,
/// such as the initial informer sync.
#[derive(Clone, Debug)]
pub struct Ready(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    // Task name to the time it was registered.
    pending: Mutex<HashMap<String, Instant>>,
    ready: watch::Sender<bool>,
}

impl Default for Ready {
    fn default() -> Self {
        Self::new()
    }
}

impl Ready {
    pub fn new() -> Ready {
        Ready(Arc::new(Inner {
            pending: Default::default(),
            ready: watch::Sender::new(true),
        }))
    }

    /// Registers a task that blocks readiness until the returned guard is dropped.
    pub fn register_task(&self, name: &str) -> BlockReady {
        self.0
            .pending
            .lock()
            .unwrap()
            .insert(name.to_string(), Instant::now());
        self.0.ready.send_replace(false);
        BlockReady {
            parent: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn pending(&self) -> Vec<String> {
        let mut names: Vec<_> = self.0.pending.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_ready(&self) -> bool {
        *self.0.ready.borrow()
    }

    /// Resolves once every registered task has completed.
    pub async fn wait_ready(&self) {
        let mut rx = self.0.ready.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
    parent: Ready,
    name: String,
}

impl Drop for BlockReady {
    fn drop(&mut self) {
        let mut pending = self.parent.0.pending.lock().unwrap();
        let registered = pending.remove(&self.name);
        debug_assert!(registered.is_some(), "task {} completed twice", self.name);
        let waited = registered.map(|t| t.elapsed()).unwrap_or_default();
        let since_start = telemetry::APPLICATION_START_TIME.elapsed();
        if pending.is_empty() {
            self.parent.0.ready.send_replace(true);
            info!(
                task = %self.name,
                ?waited,
                ?since_start,
                "registry ready"
            );
        } else {
            info!(
                task = %self.name,
                ?waited,
                remaining = pending.len(),
                "readiness task complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ready_without_tasks() {
        assert!(Ready::new().is_ready());
    }

    #[tokio::test]
    async fn waits_for_every_task() {
        let ready = Ready::new();
        let sync = ready.register_task("kube registry sync");
        let mcs = ready.register_task("mcs sync");
        assert!(!ready.is_ready());
        assert_eq!(ready.pending(), ["kube registry sync", "mcs sync"]);

        let waiter = tokio::spawn({
            let ready = ready.clone();
            async move { ready.wait_ready().await }
        });
        drop(sync);
        assert_eq!(ready.pending(), ["mcs sync"]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(mcs);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("ready after last task")
            .unwrap();
        assert!(ready.is_ready());
    }
}
