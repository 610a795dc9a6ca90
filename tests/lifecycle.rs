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
use std::time::Duration;

use matches::assert_matches;
use tokio::time;

use kube_registry::config::{self, ConfigSource, MeshConfig};
use kube_registry::kube::network::MeshNetworks;
use kube_registry::test_helpers::initialize_telemetry;
use kube_registry::test_helpers::xds::{FakeXdsUpdater, XdsEvent};
use kube_registry::{app, strng};

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
    type: NodePort
    clusterIP: 10.96.0.10
    selector:
      app: x
    ports:
    - name: http
      port: 80
      targetPort: 8080
      nodePort: 30080
workloadInstances:
- name: vm-1
  namespace: ns
  endpoint:
    address: 10.1.0.5
    labels:
      app: x
"#;

fn test_config(source: Option<ConfigSource>) -> Arc<config::Config> {
    let mut cfg = config::construct_config(MeshConfig::default(), MeshNetworks::default())
        .expect("default config");
    cfg.termination_grace_period = Duration::from_secs(1);
    cfg.local_registry = source;
    Arc::new(cfg)
}

#[tokio::test]
async fn test_shutdown_lifecycle() {
    initialize_telemetry();
    let xds = Arc::new(FakeXdsUpdater::new());
    let app = app::build_with_updater(
        test_config(Some(ConfigSource::Static(SNAPSHOT.to_string()))),
        xds.clone(),
    )
    .await
    .unwrap();

    time::timeout(Duration::from_secs(5), app.controller.wait_until_synced())
        .await
        .expect("registry syncs");
    time::timeout(Duration::from_secs(5), app.ready.wait_ready())
        .await
        .expect("registry becomes ready");
    assert!(app.ready.pending().is_empty());

    let svc = app
        .controller
        .get_service("svc.ns.svc.cluster.local")
        .expect("service loaded");
    assert_eq!(
        svc.attributes
            .cluster_external_addresses
            .get_addresses_for(&strng::new("Kubernetes")),
        ["10.0.0.1".to_string()]
    );

    app.shutdown.trigger();
    time::timeout(Duration::from_secs(5), app.wait_termination())
        .await
        .expect("app shuts down")
        .expect("app exits without error");
    assert_matches!(xds.events().last(), Some(XdsEvent::RemoveShard));
}

#[tokio::test]
async fn test_missing_registry_source() {
    initialize_telemetry();
    assert!(app::build(test_config(None)).await.is_err());
}

#[tokio::test]
async fn test_invalid_registry_source() {
    initialize_telemetry();
    let res = app::build(test_config(Some(ConfigSource::Static(
        "services: [".to_string(),
    ))))
    .await;
    assert!(res.is_err());
}
