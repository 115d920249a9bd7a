//! Shared types and configuration for the coredog core-dump pipeline.
//!
//! This crate holds what the agent binary and the admission webhook both
//! need: the domain types that travel through the pipeline (`CoreEvent`,
//! `PodIdentity`) and the YAML configuration model.

pub mod config;
pub mod types;

pub use config::{
    host_ip, kube_lookup_enabled, node_name, Config, CoreSightConfig, CustomHandlerConfig, GcType,
    NoticeChannel, StorageConfig, StorageProtocol,
};
pub use types::{CoreEvent, PodIdentity};
