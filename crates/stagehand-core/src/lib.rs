//! Core types and configuration for stagehand.
//!
//! This crate defines the `stagehand.toml` schema ([`StagehandConfig`]),
//! the per-application metadata handed to staging drivers ([`ContextData`]),
//! the CloudFoundry-style source manifest reader ([`CfManifest`]), and
//! shared error types.

pub mod config;
pub mod error;
pub mod git;
pub mod manifest;
pub mod metadata;
pub mod units;

pub use config::{
    AppDefaults, CfConfig, DeploymentConfig, DockerConfig, ManifestConfig, ManifestPolicy,
    RestartPolicy, StagehandConfig, StagingConfig,
};
pub use error::{Error, Result};
pub use manifest::{CfApplication, CfManifest};
pub use metadata::{AppData, AppRequest, CfData, ContextData, ResourceData};
