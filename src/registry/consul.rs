use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Instance, Registration, Registry, RegistryError};

/// Timeout for agent register/deregister calls.
const AGENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Slack added on top of the blocking wait before a health query times out.
const QUERY_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

const INDEX_HEADER: &str = "X-Consul-Index";

/// Registry backed by a Consul agent's HTTP API.
pub struct ConsulRegistry {
    base_url: String,
    wait: Duration,
    client: RwLock<reqwest::Client>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    node: Option<NodeEntry>,
    service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    address: String,
    port: u16,
}

impl ServiceEntry {
    fn into_instance(self) -> Instance {
        // Services registered without an address inherit the node's.
        let address = if self.service.address.is_empty() {
            self.node.map(|n| n.address).unwrap_or_default()
        } else {
            self.service.address
        };
        Instance::new(self.service.id, address, self.service.port)
    }
}

impl ConsulRegistry {
    /// `address` is the agent's `host:port`, with or without a scheme.
    /// `wait` bounds each blocking health query.
    pub fn new(address: &str, wait: Duration) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        Self {
            base_url,
            wait,
            client: RwLock::new(reqwest::Client::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        let response = self
            .client()
            .put(format!("{}/v1/agent/service/register", self.base_url))
            .timeout(AGENT_REQUEST_TIMEOUT)
            .json(registration)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status {
                operation: "register",
                status: response.status().as_u16(),
            });
        }
        debug!(id = %registration.id, name = %registration.name, "registered with consul");
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let response = self
            .client()
            .put(format!("{}/v1/agent/service/deregister/{}", self.base_url, id))
            .timeout(AGENT_REQUEST_TIMEOUT)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status {
                operation: "deregister",
                status: response.status().as_u16(),
            });
        }
        debug!(id, "deregistered from consul");
        Ok(())
    }

    async fn find_instances(
        &self,
        name: &str,
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Instance>, u64), RegistryError> {
        // Consul blocks until its index moves past the one given, i.e. the
        // last index already seen.
        let seen = wait_index.saturating_sub(1);
        let request = self
            .client()
            .get(format!("{}/v1/health/service/{}", self.base_url, name))
            .query(&[
                ("passing", "true".to_string()),
                ("index", seen.to_string()),
                ("wait", format!("{}s", self.wait.as_secs())),
            ])
            .timeout(self.wait + QUERY_TIMEOUT_SLACK);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            response = request.send() => response?,
        };
        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status {
                operation: "health query",
                status: response.status().as_u16(),
            });
        }

        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<ServiceEntry> = tokio::select! {
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            entries = response.json() => entries?,
        };

        let instances = entries.into_iter().map(ServiceEntry::into_instance).collect();
        Ok((instances, index))
    }

    fn close_idle_connections(&self) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = reqwest::Client::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_normalization() {
        let wait = Duration::from_secs(1);
        assert_eq!(ConsulRegistry::new("127.0.0.1:8500", wait).base_url(), "http://127.0.0.1:8500");
        assert_eq!(
            ConsulRegistry::new("https://consul.local/", wait).base_url(),
            "https://consul.local"
        );
    }

    #[test]
    fn test_entry_falls_back_to_node_address() {
        let entry: ServiceEntry = serde_json::from_value(json!({
            "Node": {"Address": "10.0.0.9"},
            "Service": {"ID": "hello-1", "Address": "", "Port": 8888}
        }))
        .unwrap();
        assert_eq!(entry.into_instance(), Instance::new("hello-1", "10.0.0.9", 8888));

        let entry: ServiceEntry = serde_json::from_value(json!({
            "Service": {"ID": "hello-2", "Address": "10.0.0.2", "Port": 9000}
        }))
        .unwrap();
        assert_eq!(entry.into_instance(), Instance::new("hello-2", "10.0.0.2", 9000));
    }
}
