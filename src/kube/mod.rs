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

//! Kubernetes service registry: reconciles namespaces, services, pods, nodes and endpoints into
//! the registry model.

use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::config::Config;
use crate::model::ClusterId;
use crate::strng::{self, Strng};

pub mod client;
pub mod controller;
pub mod conversion;
pub mod endpoint_builder;
pub mod endpoints;
pub mod endpointslice;
pub mod mcs;
pub mod namespace;
pub mod network;
pub mod pod;
pub mod queue;
pub mod workloadinstances;

pub use controller::Controller;

/// Which endpoint objects are watched to build endpoints. Fixed for the lifetime of a controller.
#[derive(serde::Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointMode {
    Endpoints,
    #[default]
    EndpointSlice,
}

impl fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointMode::Endpoints => f.write_str("EndpointsOnly"),
            EndpointMode::EndpointSlice => f.write_str("EndpointSliceOnly"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub cluster_id: ClusterId,
    pub system_namespace: Strng,
    pub domain_suffix: Strng,
    pub endpoint_mode: EndpointMode,
    pub sync_timeout: Option<Duration>,
    pub termination_grace_period: Duration,
    pub enable_mcs_service_discovery: bool,
    pub enable_mcs_host: bool,
    pub enable_mcs_cluster_local: bool,
    pub enable_service_select_workload_entries: bool,
    pub send_unhealthy_endpoints: bool,
    pub discovery_selectors: Vec<LabelSelector>,
    pub mesh_networks: network::MeshNetworks,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cluster_id: strng::literal!("Kubernetes"),
            system_namespace: strng::literal!("istio-system"),
            domain_suffix: strng::literal!("cluster.local"),
            endpoint_mode: EndpointMode::default(),
            sync_timeout: None,
            termination_grace_period: Duration::from_secs(30),
            enable_mcs_service_discovery: false,
            enable_mcs_host: false,
            enable_mcs_cluster_local: false,
            enable_service_select_workload_entries: true,
            send_unhealthy_endpoints: false,
            discovery_selectors: Vec::new(),
            mesh_networks: Default::default(),
        }
    }
}

impl From<&Config> for Options {
    fn from(cfg: &Config) -> Self {
        Options {
            cluster_id: cfg.cluster_id.clone(),
            system_namespace: cfg.system_namespace.clone(),
            domain_suffix: cfg.domain_suffix.clone(),
            endpoint_mode: cfg.endpoint_mode,
            sync_timeout: cfg.sync_timeout,
            termination_grace_period: cfg.termination_grace_period,
            enable_mcs_service_discovery: cfg.enable_mcs_service_discovery,
            enable_mcs_host: cfg.enable_mcs_host,
            enable_mcs_cluster_local: cfg.enable_mcs_cluster_local,
            enable_service_select_workload_entries: cfg.enable_service_select_workload_entries,
            send_unhealthy_endpoints: cfg.send_unhealthy_endpoints,
            discovery_selectors: cfg.mesh.discovery_selectors.clone(),
            mesh_networks: cfg.mesh_networks.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("proxy is in cluster {proxy}, but controller is for cluster {controller}")]
    ClusterMismatch {
        proxy: ClusterId,
        controller: ClusterId,
    },
    #[error("no instances found for {0}")]
    NoInstances(String),
    #[error("failed to find model service for {0}")]
    ServiceNotFound(Strng),
    #[error("failed to get svc port for {0}")]
    PortNotFound(String),
    #[error("failed to find target port for {0}: {1}")]
    TargetPort(String, conversion::PortError),
}

/// SyncErrors aggregates every failure seen during a multi-object pass. Nested aggregates are
/// flattened.
#[derive(Debug, Default)]
pub struct SyncErrors(Vec<anyhow::Error>);

impl SyncErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, res: anyhow::Result<()>) {
        if let Err(e) = res {
            match e.downcast::<SyncErrors>() {
                Ok(nested) => self.0.extend(nested.0),
                Err(e) => self.0.push(e),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self.into())
        }
    }
}

impl fmt::Display for SyncErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "1 error occurred: {}", self.0[0]);
        }
        write!(f, "{} errors occurred:", self.0.len())?;
        for e in &self.0 {
            write!(f, "\n\t* {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncErrors {}
