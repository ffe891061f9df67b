use std::collections::BTreeMap;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::run_spec::RunSpec;

/// Progress messages from a pull, build, or push.
pub type MessageStream = BoxStream<'static, Result<JsonMessage, EngineError>>;

/// Raw container output.
pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// One object of the engine's JSON progress stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonMessage {
    pub stream: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
    pub id: Option<String>,
    pub aux: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    pub code: Option<i64>,
    pub message: Option<String>,
}

/// Registry credentials, built fresh for every pull or push.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"********")
            .field("server_address", &self.server_address)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Local tag applied to the result
    pub tag: String,
    pub dockerfile: String,
    pub build_args: BTreeMap<String, String>,
    /// Remove intermediate containers after a successful build
    pub remove_intermediate: bool,
    pub pull_parent: bool,
}

/// Image inspection result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageDetails {
    pub id: String,
    pub tags: Vec<String>,
    pub parent: String,
    pub comment: String,
    pub created: String,
    pub author: String,
    pub size: i64,
    pub architecture: String,
    pub os: String,
    /// Exposed ports as recorded on the image, e.g. `8080/tcp`
    pub exposed_ports: Vec<String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub hostname: String,
    pub tty: bool,
    pub attach_output: bool,
    /// `os/architecture` of the image, when known
    pub platform: Option<String>,
    pub run: RunSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// A published container port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortMapping {
    pub container_port: String,
    pub host_ip: String,
    pub host_port: String,
}

/// Abstraction over the container engine for testability.
///
/// Production code uses [`DockerEngine`](crate::DockerEngine), tests use mockall-generated mocks.
#[allow(async_fn_in_trait)]
pub trait ContainerEngine: Send + Sync {
    fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> MessageStream;

    /// Submit a build; `context` is the tar-encoded build context.
    fn build_image(&self, request: BuildRequest, context: Bytes) -> MessageStream;

    fn push_image(&self, image: &str, auth: Option<RegistryAuth>) -> MessageStream;

    async fn tag_image(&self, source: &str, target: &str) -> Result<(), EngineError>;

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails, EngineError>;

    /// Force-remove an image; `prune` also removes untagged parents.
    async fn remove_image(&self, image: &str, prune: bool) -> Result<(), EngineError>;

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Force-remove a container, running or not.
    async fn remove_container(&self, name: &str, remove_volumes: bool)
    -> Result<(), EngineError>;

    async fn container_ports(&self, id: &str) -> Result<Vec<PortMapping>, EngineError>;

    /// Follow combined stdout/stderr until the container exits.
    fn container_logs(&self, id: &str) -> ByteStream;

    /// Wait until the container is no longer running; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;
}
