//! Docker Engine HTTP API client.
//!
//! Talks to the Engine over TCP (`DOCKER_HOST=tcp://...` or a socket proxy).
//! Every call except `wait` carries the configured request timeout; `wait`
//! blocks for as long as the training run lasts.

use super::platform::{ContainerInfo, ContainerPlatform, ContainerSpec, WaitOutcome};
use crate::config::TrainerConfig;
use crate::error::SkyError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    state: InspectState,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    host_config: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct EngineError {
    #[serde(default)]
    message: String,
}

/// Container platform backed by the Docker Engine API.
pub struct DockerEngine {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl DockerEngine {
    pub fn new(host: &str, api_version: &str, timeout: Duration) -> Result<Self, SkyError> {
        let base_url = format!("{}/{}", normalize_host(host)?, api_version.trim_matches('/'));
        let client = Client::builder()
            .user_agent(concat!("skyclf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn from_config(config: &TrainerConfig) -> Result<Self, SkyError> {
        Self::new(
            &config.docker_host,
            &config.api_version,
            config.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, op: &str, request: RequestBuilder) -> Result<Response, SkyError> {
        let response = request
            .send()
            .await
            .map_err(|e| SkyError::remote(format!("{op}: {e}")))?;
        check(op, response).await
    }
}

/// Turn `tcp://host:port` into `http://host:port`; reject unix sockets.
pub fn normalize_host(host: &str) -> Result<String, SkyError> {
    let host = host.trim().trim_end_matches('/');
    if let Some(rest) = host.strip_prefix("tcp://") {
        return Ok(format!("http://{rest}"));
    }
    if host.starts_with("unix://") || host.starts_with("npipe://") {
        return Err(SkyError::Config(format!(
            "docker_host {host} is a local socket; expose the Engine API over TCP or a socket proxy"
        )));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return Ok(host.to_string());
    }
    Err(SkyError::Config(format!(
        "docker_host must start with http://, https:// or tcp:// (got {host:?})"
    )))
}

async fn check(op: &str, response: Response) -> Result<Response, SkyError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<EngineError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    if status == StatusCode::NOT_FOUND {
        return Err(SkyError::NotFound(format!("{op}: {message}")));
    }
    Err(SkyError::remote(format!("{op}: {status}: {message}")))
}

#[async_trait]
impl ContainerPlatform for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, SkyError> {
        let request = self
            .client
            .get(self.url(&format!("/containers/{name}/json")))
            .timeout(self.timeout);
        let info: InspectResponse = self.send("inspect", request).await?.json().await?;
        Ok(ContainerInfo {
            id: info.id,
            running: info.state.running,
            spec: ContainerSpec::new(info.config, info.host_config),
        })
    }

    async fn remove(&self, name: &str) -> Result<(), SkyError> {
        let request = self
            .client
            .delete(self.url(&format!("/containers/{name}")))
            .query(&[("force", "true")])
            .timeout(self.timeout);
        self.send("remove", request).await?;
        Ok(())
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String, SkyError> {
        let mut body = match &spec.config {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.insert("HostConfig".to_string(), spec.host_config.clone());

        let request = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", name)])
            .json(&body)
            .timeout(self.timeout);
        let created: CreateResponse = self.send("create", request).await?.json().await?;
        for warning in created.warnings.unwrap_or_default() {
            warn!(container = name, warning = %warning, "Docker create warning");
        }
        debug!(container = name, id = %created.id, "Container created");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), SkyError> {
        let request = self
            .client
            .post(self.url(&format!("/containers/{id}/start")))
            .timeout(self.timeout);
        self.send("start", request).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), SkyError> {
        let request = self
            .client
            .post(self.url(&format!("/containers/{id}/stop")))
            .query(&[("t", grace.as_secs().to_string())])
            .timeout(self.timeout + grace);
        self.send("stop", request).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<WaitOutcome, SkyError> {
        let request = self
            .client
            .post(self.url(&format!("/containers/{id}/wait")))
            .query(&[("condition", "not-running")]);
        let waited: WaitResponse = self.send("wait", request).await?.json().await?;
        Ok(WaitOutcome {
            status_code: waited.status_code,
            error: waited
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty()),
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<u8>, SkyError> {
        let request = self
            .client
            .get(self.url(&format!("/containers/{id}/logs")))
            .query(&[
                ("stdout", "true".to_string()),
                ("stderr", "true".to_string()),
                ("tail", tail.to_string()),
            ])
            .timeout(self.timeout);
        let bytes = self.send("logs", request).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(
            normalize_host("tcp://10.0.0.5:2375").unwrap(),
            "http://10.0.0.5:2375"
        );
        assert_eq!(
            normalize_host("http://docker-proxy:2375/").unwrap(),
            "http://docker-proxy:2375"
        );
        assert!(matches!(
            normalize_host("unix:///var/run/docker.sock"),
            Err(SkyError::Config(_))
        ));
        assert!(normalize_host("docker:2375").is_err());
    }

    #[test]
    fn test_base_url_includes_api_version() {
        let engine = DockerEngine::new("tcp://127.0.0.1:2375", "/v1.43/", Duration::from_secs(5))
            .unwrap();
        assert_eq!(engine.base_url(), "http://127.0.0.1:2375/v1.43");
    }

    #[test]
    fn test_inspect_response_parsing() {
        let raw = r#"{
            "Id": "abc123",
            "Name": "/skyclf-trainer",
            "State": {"Status": "running", "Running": true},
            "Config": {"Image": "trainer", "Cmd": ["sleep", "infinity"]},
            "HostConfig": {"Binds": ["/data:/data"]}
        }"#;
        let parsed: InspectResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.id, "abc123");
        assert!(parsed.state.running);
        assert_eq!(
            ContainerSpec::new(parsed.config, parsed.host_config).command(),
            vec!["sleep", "infinity"]
        );
    }

    #[test]
    fn test_wait_response_parsing() {
        let parsed: WaitResponse =
            serde_json::from_str(r#"{"StatusCode": 137, "Error": null}"#).unwrap();
        assert_eq!(parsed.status_code, 137);
        assert!(parsed.error.is_none());
    }
}
