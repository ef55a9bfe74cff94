//! Service registry clients.
//!
//! Providers register themselves here and consumers long-poll it for the
//! live instances of a provider name. [`ConsulRegistry`] talks to a Consul
//! agent over HTTP; [`SimulatedRegistry`] keeps everything in process.

mod consul;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use consul::ConsulRegistry;
pub use simulated::SimulatedRegistry;

/// One running copy of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub address: String,
    pub port: u16,
}

impl Instance {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }

    /// `address:port`
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// A service registration, serialized the way the Consul agent API expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Registration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckDefinition>,
}

impl Registration {
    pub fn instance(&self) -> Instance {
        Instance::new(&self.id, &self.address, self.port)
    }
}

/// TCP health check attached to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckDefinition {
    #[serde(rename = "TCP")]
    pub tcp: String,
    pub timeout: String,
    pub interval: String,
    pub deregister_critical_service_after: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned status {status} for {operation}")]
    Status { operation: &'static str, status: u16 },

    #[error("registry query cancelled")]
    Cancelled,

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<(), RegistryError>;

    async fn deregister(&self, id: &str) -> Result<(), RegistryError>;

    /// Blocking query for the healthy instances of `name`.
    ///
    /// `wait_index` is the first registry index the caller has not seen. A
    /// query with `wait_index == 0` answers right away; otherwise it blocks
    /// until the registry index reaches `wait_index` or the registry's wait
    /// time elapses, whichever comes first. Returns the instances and the
    /// registry index they were read at.
    async fn find_instances(
        &self,
        name: &str,
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Instance>, u64), RegistryError>;

    /// Drop pooled connections to the registry.
    fn close_idle_connections(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_wire_shape() {
        let registration = Registration {
            id: "hello-10.0.0.1:8888".into(),
            name: "hello".into(),
            address: "10.0.0.1".into(),
            port: 8888,
            check: Some(CheckDefinition {
                tcp: "10.0.0.1:8889".into(),
                timeout: "5s".into(),
                interval: "5s".into(),
                deregister_critical_service_after: "30s".into(),
            }),
        };

        assert_eq!(
            serde_json::to_value(&registration).unwrap(),
            json!({
                "ID": "hello-10.0.0.1:8888",
                "Name": "hello",
                "Address": "10.0.0.1",
                "Port": 8888,
                "Check": {
                    "TCP": "10.0.0.1:8889",
                    "Timeout": "5s",
                    "Interval": "5s",
                    "DeregisterCriticalServiceAfter": "30s"
                }
            })
        );
        assert_eq!(registration.instance().target(), "10.0.0.1:8888");
    }
}
