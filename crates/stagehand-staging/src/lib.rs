//! Staging drivers and the container build/run pipeline for stagehand.
//!
//! # Pipeline
//!
//! ```text
//! DriverRegistry::load(name)      -> Box<dyn StagingDriver>
//!   StagingDriver::stager(ctx)    -> one AppPackage per application
//!     AppPackage::build           pull base, package context, build, decode, inspect
//!     AppPackage::push            tag, push, decode
//!     AppPackage::run             derive RunSpec, create (retry on conflict), start,
//!                                 follow logs, wait or cancel
//!   StagingDriver::finish         destroy every package, aggregate failures
//! ```
//!
//! The container engine sits behind [`ContainerEngine`]; production code uses
//! [`DockerEngine`] and tests substitute mocks.

pub mod docker;
pub mod driver;
pub mod engine;
pub mod error;
pub mod output;
pub mod package;
pub mod progress;
pub mod reference;
pub mod run_spec;
pub mod stager;

mod context;

pub use docker::DockerEngine;
pub use driver::{
    AppPackage, DriverFactory, DriverRegistry, ImageState, RunOutcome, RunState, StagingDriver,
};
pub use engine::{
    BuildRequest, ContainerEngine, ContainerSpec, CreatedContainer, ImageDetails, JsonMessage,
    PortMapping, RegistryAuth,
};
pub use error::{EngineError, ErrorClass, StagingError};
pub use output::{MemoryBuffer, OutputSink};
pub use package::AppImage;
pub use progress::{DecodeSummary, ProgressMessage, decode_stream};
pub use run_spec::{ResourceLimits, RunInputs, RunSpec};
pub use stager::{DRIVER_NAME, DockerStaging, DockerStagingConfig};
