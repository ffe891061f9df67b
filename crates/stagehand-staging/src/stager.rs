//! Container staging driver.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use stagehand_core::{ContextData, DockerConfig, RestartPolicy, StagehandConfig};
use tracing::{debug, error, info};

use crate::docker::DockerEngine;
use crate::driver::{AppPackage, ImageState, StagingDriver};
use crate::engine::ContainerEngine;
use crate::error::StagingError;
use crate::output::OutputSink;
use crate::package::{AppImage, SessionData};

/// Registry name of the container driver.
pub const DRIVER_NAME: &str = "docker";

/// In-image directory the application bits are copied to.
pub const CONTEXT_DIR: &str = "/app";
/// In-image directory buildpacks are copied to.
pub const BUILDPACKS_DIR: &str = "/buildpacks";

/// Options the container driver reads from `stagehand.toml`.
#[derive(Debug, Clone)]
pub struct DockerStagingConfig {
    pub docker: DockerConfig,
    pub base_image: String,
    pub buildpack_cache_dir: Option<PathBuf>,
    pub remove_before_build: bool,
    pub restart_policy: RestartPolicy,
    pub dynamic_ports: bool,
}

impl From<&StagehandConfig> for DockerStagingConfig {
    fn from(config: &StagehandConfig) -> Self {
        let staging = &config.staging;
        Self {
            docker: config.docker.clone(),
            base_image: staging.base_image.clone(),
            buildpack_cache_dir: staging.buildpack_cache_dir.clone(),
            remove_before_build: staging.remove_before_build,
            restart_policy: staging.restart_policy,
            dynamic_ports: staging.dynamic_ports,
        }
    }
}

/// Staging driver that builds buildpack images with a container engine.
pub struct DockerStaging<E: ContainerEngine = DockerEngine> {
    engine: Arc<E>,
    config: Arc<DockerStagingConfig>,
}

impl DockerStaging<DockerEngine> {
    /// Connect to the local Docker engine.
    pub fn connect(config: &StagehandConfig) -> Result<Self, StagingError> {
        let engine =
            DockerEngine::connect().map_err(|source| StagingError::EngineConnection { source })?;
        debug!("connected to docker engine");
        Ok(Self::with_engine(engine, DockerStagingConfig::from(config)))
    }
}

impl<E: ContainerEngine> DockerStaging<E> {
    pub fn with_engine(engine: E, config: DockerStagingConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
        }
    }
}

#[async_trait(?Send)]
impl<E: ContainerEngine + 'static> StagingDriver for DockerStaging<E> {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn stager(
        &self,
        context: &ContextData,
        output: OutputSink,
    ) -> Result<Vec<Box<dyn AppPackage>>, StagingError> {
        if let Some(manifest) = &context.cf.manifest {
            let missing: Vec<String> = context
                .apps
                .iter()
                .filter(|app| manifest.application(&app.name).is_err())
                .map(|app| app.name.clone())
                .collect();
            if !missing.is_empty() {
                return Err(StagingError::UnknownApplications { names: missing });
            }
        }

        let session = Arc::new(SessionData::from(context));
        let packages = context
            .apps
            .iter()
            .map(|app| {
                Box::new(AppImage::new(
                    Arc::clone(&self.engine),
                    Arc::clone(&self.config),
                    Arc::clone(&session),
                    app.clone(),
                    output.clone(),
                )) as Box<dyn AppPackage>
            })
            .collect();
        Ok(packages)
    }

    async fn finish(&self, packages: &mut [Box<dyn AppPackage>]) -> Result<(), StagingError> {
        info!(count = packages.len(), "cleaning up staging resources");
        let mut failures = Vec::new();
        for package in packages.iter_mut() {
            if *package.image_state() == ImageState::Destroyed {
                continue;
            }
            match package.destroy(true).await {
                Ok(()) => {}
                Err(StagingError::Cleanup { failures: inner }) => failures.extend(inner),
                Err(err) => {
                    error!(app = %package.name(), error = %err, "cleanup failed");
                    failures.push(format!("{}: {err}", package.name()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StagingError::Cleanup { failures })
        }
    }
}
