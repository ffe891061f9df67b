use std::path::PathBuf;

use stagehand_build::ArchiveError;

/// Failures reported by a [`ContainerEngine`](crate::ContainerEngine).
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("cannot reach the container engine: {message}")]
    Connection { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("engine stream failed: {message}")]
    Stream { message: String },

    #[error("malformed engine response: {message}")]
    Decode { message: String },

    #[error("engine API error: {message}")]
    Api { message: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Coarse classification used for process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Configuration or usage mistake; retrying will not help
    Configuration,
    /// The container engine could not be reached
    Engine,
    Failure,
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    // ── Driver selection ──
    #[error("unknown staging driver '{name}'; available: {}", format_names(available))]
    UnknownDriver { name: String, available: Vec<String> },

    #[error("failed to initialise staging driver '{driver}'")]
    DriverInit {
        driver: String,
        source: Box<StagingError>,
    },

    #[error("applications not declared in the source manifest: {}", names.join(", "))]
    UnknownApplications { names: Vec<String> },

    // ── Handle usage ──
    #[error("application '{app}': source path {path} does not exist")]
    SourceNotFound { app: String, path: PathBuf },

    #[error("application '{app}' has not been built")]
    NotBuilt { app: String },

    #[error("application '{app}' has already been destroyed")]
    Destroyed { app: String },

    // ── Engine ──
    #[error("cannot reach the container engine")]
    EngineConnection { source: EngineError },

    #[error("registry rejected the credentials for {image}: {message}")]
    RegistryAuth { image: String, message: String },

    #[error("{context}")]
    Engine {
        context: String,
        source: EngineError,
    },

    #[error("{subject}: {message}")]
    EngineStream {
        subject: String,
        message: String,
        code: Option<i64>,
    },

    #[error("malformed progress message for {subject}")]
    StreamDecode {
        subject: String,
        source: EngineError,
    },

    #[error("build of '{app}' finished but image {image} is missing")]
    BuildIncomplete {
        app: String,
        image: String,
        source: EngineError,
    },

    #[error("image {image} not found")]
    ImageNotFound { image: String, source: EngineError },

    #[error("container name '{name}' is still in use after removing the stale container")]
    ContainerConflict { name: String, source: EngineError },

    #[error("image exposes invalid port '{port}'")]
    InvalidExposedPort { port: String },

    // ── Local ──
    #[error("failed to package the build context for '{app}'")]
    Archive { app: String, source: ArchiveError },

    #[error("build context packaging task failed")]
    PackagingTask { source: tokio::task::JoinError },

    #[error("failed to write build output")]
    Output { source: std::io::Error },

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to clean up {} resource(s):\n  {}", failures.len(), failures.join("\n  "))]
    Cleanup { failures: Vec<String> },
}

impl StagingError {
    /// Wrap an engine failure, promoting connection problems to [`EngineConnection`](Self::EngineConnection).
    pub fn engine(context: impl Into<String>, source: EngineError) -> Self {
        match source {
            EngineError::Connection { .. } => Self::EngineConnection { source },
            source => Self::Engine {
                context: context.into(),
                source,
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownDriver { .. }
            | Self::UnknownApplications { .. }
            | Self::SourceNotFound { .. }
            | Self::NotBuilt { .. }
            | Self::Destroyed { .. }
            | Self::RegistryAuth { .. }
            | Self::InvalidExposedPort { .. } => ErrorClass::Configuration,
            Self::DriverInit { source, .. } => source.class(),
            Self::EngineConnection { .. } => ErrorClass::Engine,
            _ => ErrorClass::Failure,
        }
    }
}

fn format_names(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_owned()
    } else {
        names.join(", ")
    }
}
