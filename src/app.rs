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

use std::sync::Arc;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tracing::{Instrument, info};

use crate::kube::client::MemoryClient;
use crate::kube::{Controller, Options};
use crate::local::LocalClient;
use crate::metrics::Metrics;
use crate::model::Event;
use crate::xds::{LoggingUpdater, XdsUpdater};
use crate::{config, readiness, signal};

pub async fn build_with_updater(
    config: Arc<config::Config>,
    xds: Arc<dyn XdsUpdater>,
) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::from(&mut registry));
    let shutdown = signal::Shutdown::new();
    let ready = readiness::Ready::new();
    let sync_task = ready.register_task("kube registry sync");

    // The API server transport is provided by the embedding process; standalone, only the
    // local snapshot is available.
    let source = config
        .local_registry
        .clone()
        .context("no registry source configured, set LOCAL_REGISTRY_PATH")?;
    let client = Arc::new(MemoryClient::new());
    let controller = Controller::new(
        client.clients(),
        Options::from(config.as_ref()),
        xds,
        metrics,
    );
    let workload_instances = LocalClient {
        cfg: source,
        client: client.clone(),
    }
    .run()
    .await
    .context("load local registry")?;

    tokio::spawn(
        controller
            .clone()
            .run(shutdown.token())
            .in_current_span(),
    );
    for wi in workload_instances {
        controller.workload_instance_handler(wi, Event::Add);
    }
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller.wait_until_synced().await;
            drop(sync_task);
        });
    }

    Ok(Bound {
        shutdown,
        ready,
        controller,
        _client: client,
        _registry: registry,
    })
}

pub async fn build(config: Arc<config::Config>) -> anyhow::Result<Bound> {
    build_with_updater(config, Arc::new(LoggingUpdater)).await
}

pub struct Bound {
    pub shutdown: signal::Shutdown,
    pub ready: readiness::Ready,
    pub controller: Arc<Controller>,
    _client: Arc<MemoryClient>,
    _registry: Registry,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        // Wait for a signal to shutdown from explicit trigger or signal
        self.shutdown.wait().await;

        // The queue stops on the shutdown token; give in-flight work the grace period.
        self.controller.cleanup().await;
        info!("Shutdown completed");
        Ok(())
    }
}
