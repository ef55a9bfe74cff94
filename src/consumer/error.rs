use crate::loadbalance::BalanceError;
use crate::rpc::ClientError;

use super::contract::ContractError;

/// Why a single call attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("no instance of provider: {0}")]
    UnknownProvider(String),

    #[error("provider: {0} zero instance")]
    ZeroInstances(String),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("cannot decode result: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("consumer is shutting down")]
    ShuttingDown,

    #[error("rpc attempt cancelled")]
    Cancelled,

    #[error("rpc attempt panicked: {0}")]
    Panicked(String),
}

/// What a stub call returns on failure.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("consumer is shutting down")]
    ShuttingDown,

    #[error("rpc call time out")]
    Timeout,

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("cannot encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

impl RpcError {
    /// The provider's error message, if the call reached a provider and it
    /// answered with an error.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            RpcError::Call(CallError::Client(ClientError::Rpc(message))) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("provider name must not be empty")]
    EmptyProviderName,

    #[error("consumer is shutting down")]
    ShuttingDown,
}
