//! Staging driver abstraction and the name-keyed driver registry.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use stagehand_core::{ContextData, StagehandConfig};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::ImageDetails;
use crate::error::StagingError;
use crate::output::OutputSink;
use crate::stager::{DRIVER_NAME, DockerStaging};

/// A staging backend: turns application metadata into build handles.
#[async_trait(?Send)]
pub trait StagingDriver {
    fn name(&self) -> &str;

    /// One handle per application in `context`, in declaration order.
    fn stager(
        &self,
        context: &ContextData,
        output: OutputSink,
    ) -> Result<Vec<Box<dyn AppPackage>>, StagingError>;

    /// Destroy every handle, attempting all of them before reporting failures.
    async fn finish(&self, packages: &mut [Box<dyn AppPackage>]) -> Result<(), StagingError>;
}

/// Image lifecycle of a build handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    Unbuilt,
    Built { id: String },
    Pushed { id: String },
    Destroyed,
}

impl ImageState {
    /// Image id, once built.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Built { id } | Self::Pushed { id } => Some(id),
            Self::Unbuilt | Self::Destroyed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    NotRunning,
    Running,
    Stopped,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The container exited on its own with this status
    Exited(i64),
    /// Cancellation arrived first and the container was stopped
    Cancelled,
}

/// Per-application build handle.
#[async_trait(?Send)]
pub trait AppPackage {
    fn name(&self) -> &str;

    /// Declared external image reference.
    fn image(&self) -> &str;

    fn image_state(&self) -> &ImageState;

    fn run_state(&self) -> RunState;

    /// Tags this handle has created, used for cleanup.
    fn tags(&self) -> &[String];

    /// Build the image; returns its content-addressed id.
    async fn build(&mut self, cancel: &CancellationToken) -> Result<String, StagingError>;

    /// Tag the local build with the declared reference and push it.
    async fn push(&mut self, cancel: &CancellationToken) -> Result<(), StagingError>;

    async fn run(
        &mut self,
        cancel: &CancellationToken,
        data_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
        follow_output: bool,
    ) -> Result<RunOutcome, StagingError>;

    /// Remove the container and the built image; `all` also prunes parent layers.
    async fn destroy(&mut self, all: bool) -> Result<(), StagingError>;

    async fn info(&self) -> Result<ImageDetails, StagingError>;
}

/// Builds a driver from configuration.
pub trait DriverFactory: Send + Sync {
    fn create(&self, config: &StagehandConfig) -> Result<Box<dyn StagingDriver>, StagingError>;
}

impl<F> DriverFactory for F
where
    F: Fn(&StagehandConfig) -> Result<Box<dyn StagingDriver>, StagingError> + Send + Sync,
{
    fn create(&self, config: &StagehandConfig) -> Result<Box<dyn StagingDriver>, StagingError> {
        self(config)
    }
}

/// Name-keyed table of staging drivers.
///
/// Populated at startup; lookups take a shared lock so concurrent loads do not block.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn DriverFactory>>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.list())
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the container driver registered.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(
            DRIVER_NAME,
            |config: &StagehandConfig| -> Result<Box<dyn StagingDriver>, StagingError> {
                Ok(Box::new(DockerStaging::connect(config)?))
            },
        );
        registry
    }

    /// Register a driver factory.
    ///
    /// # Panics
    ///
    /// If `name` is already registered.
    pub fn register(&self, name: &str, factory: impl DriverFactory + 'static) {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        if drivers.contains_key(name) {
            panic!("staging driver '{name}' registered twice");
        }
        drivers.insert(name.to_owned(), Arc::new(factory));
        debug!(driver = name, "staging driver registered");
    }

    /// Construct the driver registered as `name`.
    pub fn load(
        &self,
        name: &str,
        config: &StagehandConfig,
    ) -> Result<Box<dyn StagingDriver>, StagingError> {
        let factory = {
            let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
            drivers.get(name).cloned()
        };
        let Some(factory) = factory else {
            return Err(StagingError::UnknownDriver {
                name: name.to_owned(),
                available: self.list(),
            });
        };
        factory
            .create(config)
            .map_err(|source| StagingError::DriverInit {
                driver: name.to_owned(),
                source: Box::new(source),
            })
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = drivers.keys().cloned().collect();
        names.sort();
        names
    }
}
