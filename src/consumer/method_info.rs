use std::time::Duration;

use crate::config::{CallConfig, ReferenceConfig};
use crate::loadbalance;

pub const DEFAULT_LOAD_BALANCE: &str = loadbalance::RANDOM;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Call settings for one remote method, resolved once when a contract is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub provider_name: String,
    pub method_name: String,
    pub load_balance: String,
    pub timeout: Duration,
    pub retries: u32,
}

impl MethodInfo {
    /// Overlay method settings onto provider settings onto the global ones.
    /// At each level an empty name or a zero value defers to the level below.
    pub fn resolve(provider_name: &str, method_name: &str, reference: &ReferenceConfig) -> Self {
        let mut call = reference.call.clone();
        if let Some(provider) = reference.providers.get(provider_name) {
            overlay(&mut call, &provider.call);
            if let Some(method) = provider.methods.get(&method_name.to_lowercase()) {
                overlay(&mut call, method);
            }
        }

        if call.load_balance.is_empty() {
            call.load_balance = DEFAULT_LOAD_BALANCE.to_string();
        }
        let timeout = if call.timeout == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_millis(call.timeout)
        };

        Self {
            provider_name: provider_name.to_string(),
            method_name: method_name.to_string(),
            load_balance: call.load_balance,
            timeout,
            retries: call.retries,
        }
    }

    /// The `"Provider.Method"` name sent on the wire.
    pub fn service_method(&self) -> String {
        format!("{}.{}", self.provider_name, self.method_name)
    }
}

fn overlay(base: &mut CallConfig, over: &CallConfig) {
    if !over.load_balance.is_empty() {
        base.load_balance = over.load_balance.clone();
    }
    if over.timeout != 0 {
        base.timeout = over.timeout;
    }
    if over.retries != 0 {
        base.retries = over.retries;
    }
}
