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

use k8s_openapi::api::core::v1::{Endpoints, Namespace, Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use tracing::{debug, info, instrument};

use crate::config::ConfigSource;
use crate::kube::client::MemoryClient;
use crate::kube::mcs::{ServiceExport, ServiceImport};
use crate::model::WorkloadInstance;

/// A snapshot of cluster objects, standing in for an API server.
#[derive(Default, Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub endpoints: Vec<Endpoints>,
    #[serde(default)]
    pub endpoint_slices: Vec<EndpointSlice>,
    #[serde(default)]
    pub service_exports: Vec<ServiceExport>,
    #[serde(default)]
    pub service_imports: Vec<ServiceImport>,
    /// Workloads registered by other registries.
    #[serde(default)]
    pub workload_instances: Vec<WorkloadInstance>,
}

/// LocalClient serves as a local file reader alternative to a Kubernetes watch. This is intended
/// for testing.
pub struct LocalClient {
    pub cfg: ConfigSource,
    pub client: Arc<MemoryClient>,
}

impl LocalClient {
    /// Loads the snapshot into the stores and marks them synced. Workload instances are returned
    /// for the caller to hand to the controller.
    #[instrument(skip_all, name = "local_client")]
    pub async fn run(self) -> anyhow::Result<Vec<WorkloadInstance>> {
        let r: LocalConfig = serde_yaml::from_str(&self.cfg.read_to_string().await?)?;
        Ok(self.load_config(r))
    }

    fn load_config(&self, r: LocalConfig) -> Vec<WorkloadInstance> {
        info!(
            namespaces = r.namespaces.len(),
            nodes = r.nodes.len(),
            services = r.services.len(),
            pods = r.pods.len(),
            workload_instances = r.workload_instances.len(),
            "loading local registry"
        );
        let c = &self.client;
        r.namespaces.into_iter().for_each(|o| c.namespaces.apply(o));
        r.nodes.into_iter().for_each(|o| c.nodes.apply(o));
        r.services.into_iter().for_each(|o| c.services.apply(o));
        r.pods.into_iter().for_each(|o| c.pods.apply(o));
        r.endpoints.into_iter().for_each(|o| c.endpoints.apply(o));
        r.endpoint_slices
            .into_iter()
            .for_each(|o| c.endpoint_slices.apply(o));
        r.service_exports
            .into_iter()
            .for_each(|o| c.service_exports.apply(o));
        r.service_imports
            .into_iter()
            .for_each(|o| c.service_imports.apply(o));
        c.mark_synced();
        for wi in &r.workload_instances {
            debug!("loaded local workload instance {}", wi.key());
        }
        r.workload_instances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::client::Informer;

    const SNAPSHOT: &str = r#"
namespaces:
- metadata:
    name: ns
nodes:
- metadata:
    name: node-1
    labels:
      topology.kubernetes.io/zone: z1
  status:
    addresses:
    - type: ExternalIP
      address: 10.0.0.1
services:
- metadata:
    name: svc
    namespace: ns
  spec:
    clusterIP: 10.96.0.10
    selector:
      app: x
    ports:
    - name: http
      port: 80
      targetPort: 8080
workloadInstances:
- name: vm-1
  namespace: ns
  endpoint:
    address: 10.1.0.5
    labels:
      app: x
"#;

    #[tokio::test]
    async fn load_snapshot() {
        let client = Arc::new(MemoryClient::new());
        let local = LocalClient {
            cfg: ConfigSource::Static(SNAPSHOT.to_string()),
            client: client.clone(),
        };
        let wis = local.run().await.unwrap();
        assert_eq!(wis.len(), 1);
        assert_eq!(wis[0].key(), "ns/vm-1");
        assert!(client.services.has_synced());
        assert!(client.nodes.get("node-1", "").is_some());
        assert_eq!(client.services.list("ns", None).len(), 1);
    }

    #[tokio::test]
    async fn unknown_fields_rejected() {
        let local = LocalClient {
            cfg: ConfigSource::Static("routes: []".to_string()),
            client: Arc::new(MemoryClient::new()),
        };
        assert!(local.run().await.is_err());
    }
}
