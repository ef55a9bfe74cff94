pub mod config;
pub mod consumer;
pub mod context;
pub mod health;
pub mod lifecycle;
pub mod loadbalance;
pub mod logging;
pub mod net;
pub mod provider;
pub mod registry;
pub mod rpc;
pub mod service;
