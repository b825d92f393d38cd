//! Azure Container Instances provider
//!
//! Drives one-container groups through the ARM management REST API with
//! ambient bearer credentials. Each worker maps to one container group
//! whose inner container shares the group name.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use stampede_core::traits::{
    ContainerProvider, ContainerSpec, ContainerState, ContainerStatus, ProviderError,
};

const MANAGEMENT_HOST: &str = "https://management.azure.com";
const API_VERSION: &str = "2023-05-01";

/// Connection settings for the Azure Container Instances provider
#[derive(Debug, Clone)]
pub struct AzureSettings {
    /// Azure subscription the groups are created in
    pub subscription_id: String,
    /// Resource group the groups are created in
    pub resource_group: String,
    /// Azure region
    pub location: String,
    /// Ambient bearer token for the management plane
    pub management_token: String,
}

impl AzureSettings {
    /// Read settings from the environment (ambient identity)
    pub fn from_env() -> Result<Self, ProviderError> {
        let require = |key: &str| {
            std::env::var(key).map_err(|_| ProviderError::Fatal(format!("{key} is not set")))
        };
        Ok(Self {
            subscription_id: require("AZURE_SUBSCRIPTION_ID")?,
            resource_group: require("AZURE_RESOURCE_GROUP")?,
            location: std::env::var("AZURE_LOCATION").unwrap_or_else(|_| "eastus".to_string()),
            management_token: require("AZURE_MANAGEMENT_TOKEN")?,
        })
    }
}

/// Container provider backed by Azure Container Instances
pub struct AzureContainerProvider {
    settings: AzureSettings,
    client: Client,
}

impl AzureContainerProvider {
    /// Create a provider with a pooled HTTP client
    pub fn new(settings: AzureSettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .pool_max_idle_per_host(32)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("stampede/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { settings, client })
    }

    fn group_url(&self, group_name: &str) -> String {
        format!(
            "{MANAGEMENT_HOST}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{group_name}?api-version={API_VERSION}",
            self.settings.subscription_id, self.settings.resource_group
        )
    }

    fn logs_url(&self, group_name: &str) -> String {
        format!(
            "{MANAGEMENT_HOST}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{group_name}/containers/{group_name}/logs?api-version={API_VERSION}",
            self.settings.subscription_id, self.settings.resource_group
        )
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.settings.management_token)
    }
}

#[async_trait]
impl ContainerProvider for AzureContainerProvider {
    fn name(&self) -> &str {
        "azure-container-instances"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ProviderError> {
        let body = GroupBody::from_spec(spec, &self.settings.location);
        let response = self
            .client
            .put(self.group_url(&spec.group_name))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        ensure_success(response).await?;
        tracing::info!(group = %spec.group_name, image = %spec.image, "container group created");
        Ok(spec.group_name.clone())
    }

    async fn status(&self, provider_id: &str) -> Result<ContainerStatus, ProviderError> {
        let response = self
            .client
            .get(self.group_url(provider_id))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ContainerStatus::unknown());
        }
        let response = ensure_success(response).await?;
        let group: GroupResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed status payload: {e}")))?;
        Ok(group.container_status())
    }

    async fn delete(&self, provider_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.group_url(provider_id))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        tracing::info!(group = %provider_id, "container group deleted");
        Ok(())
    }

    async fn logs(&self, provider_id: &str) -> Result<Vec<u8>, ProviderError> {
        let response = self
            .client
            .get(self.logs_url(provider_id))
            .header(reqwest::header::AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(transport)?;
        let response = ensure_success(response).await?;
        let logs: LogsResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("malformed logs payload: {e}")))?;
        Ok(logs.content.into_bytes())
    }
}

/// Map a transport-level failure onto the provider error taxonomy
fn transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(Duration::from_secs(30))
    } else {
        ProviderError::Unavailable(e.to_string())
    }
}

/// Classify a non-2xx management response
async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Throttled { retry_after },
        s if s.is_server_error() => ProviderError::Unavailable(format!("{s}: {body}")),
        s => ProviderError::Fatal(format!("{s}: {body}")),
    })
}

// ============================================================================
// ARM payloads (request/response subsets)
// ============================================================================

#[derive(Debug, Serialize)]
struct GroupBody {
    location: String,
    properties: GroupProperties,
}

impl GroupBody {
    fn from_spec(spec: &ContainerSpec, location: &str) -> Self {
        // Sorted env keeps request bodies deterministic across retries.
        let mut env: Vec<(&String, &String)> = spec.env.iter().collect();
        env.sort_by_key(|(name, _)| name.as_str());
        let environment_variables = env
            .into_iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        Self {
            location: location.to_string(),
            properties: GroupProperties {
                containers: vec![ContainerEntry {
                    name: spec.group_name.clone(),
                    properties: ContainerProperties {
                        image: spec.image.clone(),
                        environment_variables,
                        resources: Resources {
                            requests: ResourceRequests {
                                cpu: spec.cpu_cores,
                                memory_in_gb: spec.memory_gib,
                            },
                        },
                    },
                }],
                os_type: "Linux",
                restart_policy: "Never",
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupProperties {
    containers: Vec<ContainerEntry>,
    os_type: &'static str,
    restart_policy: &'static str,
}

#[derive(Debug, Serialize)]
struct ContainerEntry {
    name: String,
    properties: ContainerProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerProperties {
    image: String,
    environment_variables: Vec<EnvVar>,
    resources: Resources,
}

#[derive(Debug, Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct Resources {
    requests: ResourceRequests,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceRequests {
    cpu: f64,
    memory_in_gb: f64,
}

#[derive(Debug, Deserialize)]
struct GroupResponse {
    #[serde(default)]
    properties: Option<GroupStatusProperties>,
}

impl GroupResponse {
    fn container_status(&self) -> ContainerStatus {
        let state = self
            .properties
            .as_ref()
            .and_then(|p| p.containers.first())
            .and_then(|c| c.properties.as_ref())
            .and_then(|p| p.instance_view.as_ref())
            .and_then(|v| v.current_state.as_ref());
        match state {
            Some(current) => ContainerStatus {
                state: map_state(current.state.as_deref()),
                exit_code: current.exit_code,
            },
            None => ContainerStatus::unknown(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GroupStatusProperties {
    #[serde(default)]
    containers: Vec<ContainerStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatusEntry {
    #[serde(default)]
    properties: Option<ContainerStatusProps>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatusProps {
    #[serde(default)]
    instance_view: Option<InstanceView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    #[serde(default)]
    current_state: Option<CurrentState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentState {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    content: String,
}

/// Map the ACI state string onto the provider-agnostic state
fn map_state(state: Option<&str>) -> ContainerState {
    match state {
        Some("Running") => ContainerState::Running,
        Some("Terminated") | Some("Succeeded") | Some("Stopped") => ContainerState::Terminated,
        _ => ContainerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn spec() -> ContainerSpec {
        let mut env = HashMap::new();
        env.insert("WORKER_INDEX".to_string(), "0".to_string());
        env.insert("DURATION".to_string(), "1m".to_string());
        ContainerSpec {
            group_name: "run-x-worker-0".to_string(),
            image: "registry.example.com/k6-worker:latest".to_string(),
            env,
            cpu_cores: 1.0,
            memory_gib: 2.0,
        }
    }

    #[test]
    fn test_group_body_shape() {
        let body = GroupBody::from_spec(&spec(), "eastus");
        let json = serde_json::to_value(&body).expect("serialize");

        assert_eq!(json["location"], "eastus");
        assert_eq!(json["properties"]["osType"], "Linux");
        assert_eq!(json["properties"]["restartPolicy"], "Never");
        let container = &json["properties"]["containers"][0];
        assert_eq!(container["name"], "run-x-worker-0");
        assert_eq!(
            container["properties"]["resources"]["requests"]["memoryInGB"],
            2.0
        );
        // Environment is sorted by name.
        let env = container["properties"]["environmentVariables"]
            .as_array()
            .expect("env array");
        assert_eq!(env[0]["name"], "DURATION");
        assert_eq!(env[1]["name"], "WORKER_INDEX");
    }

    #[test]
    fn test_map_state() {
        assert_eq!(map_state(Some("Running")), ContainerState::Running);
        assert_eq!(map_state(Some("Terminated")), ContainerState::Terminated);
        assert_eq!(map_state(Some("Succeeded")), ContainerState::Terminated);
        assert_eq!(map_state(Some("Waiting")), ContainerState::Unknown);
        assert_eq!(map_state(None), ContainerState::Unknown);
    }

    #[test]
    fn test_status_payload_parsing() {
        let payload = r#"{
            "properties": {
                "containers": [{
                    "properties": {
                        "instanceView": {
                            "currentState": {"state": "Terminated", "exitCode": 0}
                        }
                    }
                }]
            }
        }"#;
        let group: GroupResponse = serde_json::from_str(payload).expect("parse");
        let status = group.container_status();
        assert_eq!(status.state, ContainerState::Terminated);
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn test_status_payload_without_instance_view() {
        let payload = r#"{"properties": {"containers": [{"properties": {}}]}}"#;
        let group: GroupResponse = serde_json::from_str(payload).expect("parse");
        assert_eq!(group.container_status().state, ContainerState::Unknown);
    }

    #[test]
    fn test_group_url_shape() {
        let provider = AzureContainerProvider::new(AzureSettings {
            subscription_id: "sub-1".to_string(),
            resource_group: "rg-1".to_string(),
            location: "eastus".to_string(),
            management_token: "token".to_string(),
        })
        .expect("provider");
        let url = provider.group_url("run-x-worker-0");
        assert!(url.starts_with(
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-1/providers/Microsoft.ContainerInstance/containerGroups/run-x-worker-0"
        ));
        assert!(url.ends_with(API_VERSION));
    }
}
