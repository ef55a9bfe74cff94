//! Provider-side method table.
//!
//! A [`MethodSet`] holds the methods of one provider as typed async closures.
//! Each closure decodes its single argument from the request params, runs,
//! and encodes its result back to JSON. The [`MethodRegistry`] maps
//! `"Provider.Method"` names onto those closures.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::codec::decode_params;
use crate::provider::ProviderError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<Result<Value, String>> + Send + Sync>;

/// The methods exposed under one provider name.
#[derive(Default, Clone)]
pub struct MethodSet {
    methods: HashMap<String, Handler>,
}

impl MethodSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method taking one `Req` and returning `Resp` or an error message.
    pub fn method<Req, Resp, E, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |params| {
            let f = f.clone();
            Box::pin(async move {
                let req: Req = decode_params(params).map_err(|e| e.to_string())?;
                let resp = f(req).await.map_err(|e| e.to_string())?;
                serde_json::to_value(resp).map_err(|e| e.to_string())
            })
        });
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Dispatches `"Provider.Method"` calls to registered method sets.
#[derive(Default)]
pub struct MethodRegistry {
    services: RwLock<HashMap<String, MethodSet>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, methods: MethodSet) -> Result<(), ProviderError> {
        if name.is_empty() {
            return Err(ProviderError::EmptyName);
        }
        if methods.is_empty() {
            return Err(ProviderError::NoMethods(name.to_string()));
        }

        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(name) {
            return Err(ProviderError::Duplicate(name.to_string()));
        }
        services.insert(name.to_string(), methods);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Run the method named by `service_method`. Lookup failures and method
    /// errors both come back as the error message sent to the caller.
    pub async fn dispatch(&self, service_method: &str, params: Option<Value>) -> Result<Value, String> {
        let handler = self.lookup(service_method)?;
        handler(params).await
    }

    fn lookup(&self, service_method: &str) -> Result<Handler, String> {
        let Some((service, method)) = service_method.rsplit_once('.') else {
            return Err(format!("rpc: service/method request ill-formed: {service_method}"));
        };

        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let methods = services
            .get(service)
            .ok_or_else(|| format!("rpc: can't find service {service_method}"))?;
        methods
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| format!("rpc: can't find method {service_method}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct Sum {
        sum: i64,
    }

    fn calc() -> MethodSet {
        MethodSet::new()
            .method("Add", |req: Add| async move { Ok::<_, String>(Sum { sum: req.a + req.b }) })
            .method("Fail", |_: Add| async move { Err::<Sum, _>("always fails") })
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_service_and_method() {
        let registry = MethodRegistry::new();
        registry.register("calc", calc()).unwrap();

        let result = registry.dispatch("calc.Add", Some(json!([{"a": 2, "b": 3}]))).await;
        assert_eq!(result, Ok(json!({"sum": 5})));

        let result = registry.dispatch("calc.Fail", Some(json!([{"a": 0, "b": 0}]))).await;
        assert_eq!(result, Err("always fails".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_lookup_errors() {
        let registry = MethodRegistry::new();
        registry.register("calc", calc()).unwrap();

        let err = registry.dispatch("calc", None).await.unwrap_err();
        assert_eq!(err, "rpc: service/method request ill-formed: calc");

        let err = registry.dispatch("other.Add", None).await.unwrap_err();
        assert_eq!(err, "rpc: can't find service other.Add");

        let err = registry.dispatch("calc.Mul", None).await.unwrap_err();
        assert_eq!(err, "rpc: can't find method calc.Mul");

        let err = registry.dispatch("calc.Add", None).await.unwrap_err();
        assert_eq!(err, "jsonrpc: request body missing params");
    }

    #[test]
    fn test_dotted_provider_names_split_at_last_dot() {
        let registry = MethodRegistry::new();
        registry.register("org.calc", calc()).unwrap();
        assert!(registry.lookup("org.calc.Add").is_ok());
    }

    #[test]
    fn test_register_rejects_bad_sets() {
        let registry = MethodRegistry::new();
        assert!(matches!(registry.register("", calc()), Err(ProviderError::EmptyName)));
        assert!(matches!(
            registry.register("empty", MethodSet::new()),
            Err(ProviderError::NoMethods(_))
        ));

        registry.register("calc", calc()).unwrap();
        assert!(matches!(registry.register("calc", calc()), Err(ProviderError::Duplicate(_))));
        assert_eq!(calc().names(), vec!["Add".to_string(), "Fail".to_string()]);
    }
}
