#[macro_use]
extern crate tracing;

pub mod agent;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod executor;
pub mod jobs;
pub mod k8s;
pub mod logger;
pub mod messages;
pub mod metrics;
pub mod models;
pub mod node_rules;
pub mod object_storage;
pub mod operator_worker;
pub mod progress;
pub mod runtime;
