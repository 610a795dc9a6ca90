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

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::kube::EndpointMode;
use crate::kube::network::MeshNetworks;
use crate::strng::{self, Strng};

const CLUSTER_ID: &str = "CLUSTER_ID";
const SYSTEM_NAMESPACE: &str = "SYSTEM_NAMESPACE";
const DOMAIN_SUFFIX: &str = "DOMAIN_SUFFIX";
const PILOT_USE_ENDPOINT_SLICE: &str = "PILOT_USE_ENDPOINT_SLICE";
const PILOT_SYNC_TIMEOUT: &str = "PILOT_SYNC_TIMEOUT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const ENABLE_MCS_SERVICE_DISCOVERY: &str = "ENABLE_MCS_SERVICE_DISCOVERY";
const ENABLE_MCS_HOST: &str = "ENABLE_MCS_HOST";
const ENABLE_MCS_CLUSTER_LOCAL: &str = "ENABLE_MCS_CLUSTER_LOCAL";
const ENABLE_K8S_SERVICE_SELECT_WORKLOAD_ENTRIES: &str =
    "ENABLE_K8S_SERVICE_SELECT_WORKLOAD_ENTRIES";
const SEND_UNHEALTHY_ENDPOINTS: &str = "SEND_UNHEALTHY_ENDPOINTS";
const LOCAL_REGISTRY_PATH: &str = "LOCAL_REGISTRY_PATH";
const MESH_CONFIG_PATH: &str = "MESH_CONFIG_PATH";
const MESH_NETWORKS_PATH: &str = "MESH_NETWORKS_PATH";

const DEFAULT_CLUSTER_ID: &str = "Kubernetes";
const DEFAULT_SYSTEM_NAMESPACE: &str = "istio-system";
const DEFAULT_DOMAIN_SUFFIX: &str = "cluster.local";
const DEFAULT_MESH_CONFIG_PATH: &str = "./etc/istio/config/mesh";
const DEFAULT_MESH_NETWORKS_PATH: &str = "./etc/istio/config/meshNetworks";
const DEFAULT_TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(String),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => data.clone(),
        })
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The cluster this registry serves. Used as the shard key for downstream updates.
    pub cluster_id: Strng,
    /// Namespace whose `topology.istio.io/network` label sets the default network.
    pub system_namespace: Strng,
    pub domain_suffix: Strng,

    pub endpoint_mode: EndpointMode,
    /// If set, the registry reports synced after this long even if the initial listing is
    /// still in progress.
    pub sync_timeout: Option<Duration>,
    pub termination_grace_period: Duration,

    pub enable_mcs_service_discovery: bool,
    pub enable_mcs_host: bool,
    pub enable_mcs_cluster_local: bool,
    pub enable_service_select_workload_entries: bool,
    pub send_unhealthy_endpoints: bool,

    /// YAML snapshot of cluster objects served by the in-memory transport.
    #[serde(skip_serializing)]
    pub local_registry: Option<ConfigSource>,

    pub mesh: MeshConfig,
    pub mesh_networks: MeshNetworks,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("error parsing mesh config: {0}")]
    MeshConfig(anyhow::Error),
    #[error("error parsing mesh networks: {0}")]
    MeshNetworks(anyhow::Error),
}

/// Subset of the mesh-wide configuration read by the registry.
#[derive(serde::Serialize, serde::Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    /// Namespaces matching any of these selectors are discovered. Empty selects every namespace.
    #[serde(default)]
    pub discovery_selectors: Vec<LabelSelector>,
}

/// HumanDuration parses values like `30s` or `1m30s`.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(HumanDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &str) -> Result<Option<Duration>, Error> {
    Ok(empty_to_none(parse::<String>(env)?)
        .map(|v| v.parse::<HumanDuration>())
        .transpose()
        .map_err(|_| Error::EnvVar(env.to_string(), std::env::var(env).unwrap_or_default()))?
        .map(|d| d.0))
}

pub fn parse_config() -> Result<Config, Error> {
    let mesh_path = parse_default(MESH_CONFIG_PATH, DEFAULT_MESH_CONFIG_PATH.to_string())?;
    let networks_path =
        parse_default(MESH_NETWORKS_PATH, DEFAULT_MESH_NETWORKS_PATH.to_string())?;
    let mesh = read_yaml_file::<MeshConfig>(Path::new(&mesh_path)).map_err(Error::MeshConfig)?;
    let mesh_networks =
        read_yaml_file::<MeshNetworks>(Path::new(&networks_path)).map_err(Error::MeshNetworks)?;
    construct_config(mesh.unwrap_or_default(), mesh_networks.unwrap_or_default())
}

pub fn construct_config(mesh: MeshConfig, mesh_networks: MeshNetworks) -> Result<Config, Error> {
    let endpoint_mode = if parse_default(PILOT_USE_ENDPOINT_SLICE, true)? {
        EndpointMode::EndpointSlice
    } else {
        EndpointMode::Endpoints
    };
    Ok(Config {
        cluster_id: strng::new(parse_default(CLUSTER_ID, DEFAULT_CLUSTER_ID.to_string())?),
        system_namespace: strng::new(
            empty_to_none(parse(SYSTEM_NAMESPACE)?)
                .unwrap_or(DEFAULT_SYSTEM_NAMESPACE.to_string()),
        ),
        domain_suffix: strng::new(
            empty_to_none(parse(DOMAIN_SUFFIX)?).unwrap_or(DEFAULT_DOMAIN_SUFFIX.to_string()),
        ),
        endpoint_mode,
        sync_timeout: parse_duration(PILOT_SYNC_TIMEOUT)?,
        termination_grace_period: parse_duration(TERMINATION_GRACE_PERIOD)?
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD),
        enable_mcs_service_discovery: parse_default(ENABLE_MCS_SERVICE_DISCOVERY, false)?,
        enable_mcs_host: parse_default(ENABLE_MCS_HOST, false)?,
        enable_mcs_cluster_local: parse_default(ENABLE_MCS_CLUSTER_LOCAL, false)?,
        enable_service_select_workload_entries: parse_default(
            ENABLE_K8S_SERVICE_SELECT_WORKLOAD_ENTRIES,
            true,
        )?,
        send_unhealthy_endpoints: parse_default(SEND_UNHEALTHY_ENDPOINTS, false)?,
        local_registry: empty_to_none(parse::<String>(LOCAL_REGISTRY_PATH)?)
            .map(|p| ConfigSource::File(PathBuf::from(p))),
        mesh,
        mesh_networks,
    })
}

/// Reads a YAML file, treating a missing file as unset.
fn read_yaml_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::File::open(path) {
        Ok(f) => serde_yaml::from_reader(f)
            .map(Some)
            .map_err(|e| anyhow!("failed parsing {}: {}", path.display(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow!("failed reading {}: {}", path.display(), e)),
    }
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = construct_config(MeshConfig::default(), MeshNetworks::default()).unwrap();
        assert_eq!(cfg.cluster_id, "Kubernetes");
        assert_eq!(cfg.system_namespace, "istio-system");
        assert_eq!(cfg.domain_suffix, "cluster.local");
        assert_eq!(cfg.endpoint_mode, EndpointMode::EndpointSlice);
        assert_eq!(cfg.sync_timeout, None);
        assert_eq!(cfg.termination_grace_period, Duration::from_secs(30));
        assert!(cfg.enable_service_select_workload_entries);
        assert!(!cfg.enable_mcs_host);
    }

    #[test]
    fn human_durations() {
        assert_eq!(
            "1m30s".parse::<HumanDuration>().unwrap().0,
            Duration::from_secs(90)
        );
        assert!("soon".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn missing_file_is_unset() {
        let res = read_yaml_file::<MeshConfig>(Path::new("/definitely/not/here")).unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn mesh_config_from_file() {
        let dir = std::env::temp_dir().join(format!("kube-registry-mesh-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mesh");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(
            br#"
discoverySelectors:
- matchLabels:
    istio-discovery: enabled
"#,
        )
        .unwrap();
        let mc = read_yaml_file::<MeshConfig>(&path).unwrap().unwrap();
        assert_eq!(mc.discovery_selectors.len(), 1);
        assert_eq!(
            mc.discovery_selectors[0]
                .match_labels
                .as_ref()
                .unwrap()
                .get("istio-discovery")
                .map(String::as_str),
            Some("enabled")
        );
        fs::remove_dir_all(&dir).unwrap();
    }
}
