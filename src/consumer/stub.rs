use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ConsumerInner;
use super::contract::ContractError;
use super::error::{CallError, RpcError};
use super::method_info::MethodInfo;

/// A callable handle for one remote method.
///
/// Each call runs attempts in their own task, races every attempt against
/// the method's timeout and retries failed or timed-out attempts up to the
/// configured retry count.
pub struct Stub<Req, Resp> {
    state: StubState,
    _marker: PhantomData<fn(Req) -> Resp>,
}

enum StubState {
    Bound(Arc<BoundMethod>),
    Unbound(ContractError),
}

struct BoundMethod {
    consumer: Arc<ConsumerInner>,
    info: MethodInfo,
    service_method: String,
}

impl<Req, Resp> Clone for Stub<Req, Resp> {
    fn clone(&self) -> Self {
        let state = match &self.state {
            StubState::Bound(method) => StubState::Bound(method.clone()),
            StubState::Unbound(e) => StubState::Unbound(e.clone()),
        };
        Self {
            state,
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp> Stub<Req, Resp> {
    pub(super) fn bound(consumer: Arc<ConsumerInner>, info: MethodInfo) -> Self {
        let service_method = info.service_method();
        Self {
            state: StubState::Bound(Arc::new(BoundMethod {
                consumer,
                info,
                service_method,
            })),
            _marker: PhantomData,
        }
    }

    pub(super) fn unbound(error: ContractError) -> Self {
        Self {
            state: StubState::Unbound(error),
            _marker: PhantomData,
        }
    }

    /// Resolved call settings, or `None` if the slot failed validation.
    pub fn info(&self) -> Option<&MethodInfo> {
        match &self.state {
            StubState::Bound(method) => Some(&method.info),
            StubState::Unbound(_) => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, StubState::Bound(_))
    }
}

impl<Req, Resp> Stub<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned + Send + 'static,
{
    pub async fn call(&self, req: &Req) -> Result<Resp, RpcError> {
        let method = match &self.state {
            StubState::Bound(method) => method,
            StubState::Unbound(e) => return Err(RpcError::Contract(e.clone())),
        };
        if method.consumer.is_shutting_down() {
            return Err(RpcError::ShuttingDown);
        }

        let param = serde_json::to_value(req).map_err(RpcError::Encode)?;
        let mut attempts = 0;

        loop {
            let cancel = method.consumer.root.child_token();
            let mut attempt = tokio::spawn(run_attempt::<Resp>(
                method.clone(),
                param.clone(),
                cancel.clone(),
            ));

            let outcome = tokio::select! {
                joined = &mut attempt => match joined {
                    Ok(result) => result.map_err(RpcError::Call),
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        error!(method = %method.service_method, panic = %message, "rpc attempt panicked");
                        Err(RpcError::Call(CallError::Panicked(message)))
                    }
                    Err(_) => Err(RpcError::Call(CallError::Cancelled)),
                },
                _ = tokio::time::sleep(method.info.timeout) => Err(RpcError::Timeout),
            };
            // Whatever the outcome, the attempt is finished with.
            cancel.cancel();

            let failure = match outcome {
                Ok(resp) => return Ok(resp),
                Err(failure) => failure,
            };
            // An attempt cut short by shutdown reports the shutdown, not
            // the cancellation it caused.
            if method.consumer.is_shutting_down() {
                debug!(method = %method.service_method, error = %failure, "rpc call interrupted by shutdown");
                return Err(RpcError::ShuttingDown);
            }
            if attempts >= method.info.retries {
                return Err(failure);
            }
            attempts += 1;

            warn!(
                method = %method.service_method,
                attempt = attempts,
                retries = method.info.retries,
                error = %failure,
                "rpc call failed, retrying"
            );
        }
    }
}

async fn run_attempt<Resp: DeserializeOwned>(
    method: Arc<BoundMethod>,
    param: Value,
    cancel: CancellationToken,
) -> Result<Resp, CallError> {
    let invoke = method
        .consumer
        .invoke(&method.info, &method.service_method, param);

    tokio::select! {
        _ = cancel.cancelled() => Err(CallError::Cancelled),
        result = invoke => {
            let value = result?;
            serde_json::from_value(value).map_err(CallError::Decode)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
