//! [`ContainerEngine`] backed by the Docker Engine API.

use std::collections::HashMap;

use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{
    BuildImageOptions, CreateImageOptions, PushImageOptions, RemoveImageOptions, TagImageOptions,
};
use bollard::models::{BuildInfo, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use stagehand_core::RestartPolicy as Restart;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{
    BuildRequest, ByteStream, ContainerEngine, ContainerSpec, CreatedContainer, ErrorDetail,
    ImageDetails, JsonMessage, MessageStream, PortMapping, RegistryAuth,
};
use crate::error::EngineError;
use crate::reference::{self, DEFAULT_TAG};

const STREAM_BUFFER: usize = 64;
const STOP_TIMEOUT_SECS: i64 = 10;

/// Docker Engine client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

impl ContainerEngine for DockerEngine {
    fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> MessageStream {
        let docker = self.docker.clone();
        let (from_image, tag) = match reference::split(image) {
            (repo, _) if repo.contains('@') => (repo.to_owned(), String::new()),
            (repo, tag) => (repo.to_owned(), tag.unwrap_or(DEFAULT_TAG).to_owned()),
        };
        forward(move |tx| async move {
            let options = CreateImageOptions {
                from_image,
                tag,
                ..Default::default()
            };
            let stream = docker.create_image(Some(options), None, auth.map(credentials));
            pump(stream, tx, to_message).await;
        })
    }

    fn build_image(&self, request: BuildRequest, context: Bytes) -> MessageStream {
        let docker = self.docker.clone();
        forward(move |tx| async move {
            let options = BuildImageOptions {
                dockerfile: request.dockerfile,
                t: request.tag,
                rm: request.remove_intermediate,
                forcerm: true,
                pull: request.pull_parent,
                buildargs: request.build_args.into_iter().collect::<HashMap<_, _>>(),
                ..Default::default()
            };
            let stream = docker.build_image(options, None, Some(context));
            pump(stream, tx, |info: BuildInfo| Ok(build_message(info))).await;
        })
    }

    fn push_image(&self, image: &str, auth: Option<RegistryAuth>) -> MessageStream {
        let docker = self.docker.clone();
        let (repo, tag) = reference::split(image);
        let repo = repo.to_owned();
        let tag = tag.unwrap_or(DEFAULT_TAG).to_owned();
        forward(move |tx| async move {
            let options = PushImageOptions { tag };
            let stream = docker.push_image(&repo, Some(options), auth.map(credentials));
            pump(stream, tx, to_message).await;
        })
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<(), EngineError> {
        let (repo, tag) = reference::split(target);
        let options = TagImageOptions {
            repo: repo.to_owned(),
            tag: tag.unwrap_or(DEFAULT_TAG).to_owned(),
        };
        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(classify)
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails, EngineError> {
        let inspect = self.docker.inspect_image(image).await.map_err(classify)?;
        let value = to_value(&inspect)?;
        Ok(image_details(&value))
    }

    async fn remove_image(&self, image: &str, prune: bool) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: true,
            noprune: !prune,
        };
        let removed = self
            .docker
            .remove_image(image, Some(options), None)
            .await
            .map_err(classify)?;
        debug!(image, layers = removed.len(), "image removed");
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, EngineError> {
        let run = &spec.run;
        let exposed_ports = run
            .port_bindings
            .keys()
            .map(|port| (port.clone(), HashMap::new()))
            .collect::<HashMap<_, _>>();
        let port_bindings = run
            .port_bindings
            .iter()
            .map(|(port, host)| {
                let binding = PortBinding {
                    host_ip: None,
                    host_port: host.map(|p| p.to_string()),
                };
                (port.clone(), Some(vec![binding]))
            })
            .collect::<HashMap<_, _>>();

        let host_config = HostConfig {
            binds: (!run.binds.is_empty()).then(|| run.binds.clone()),
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy_name(run.restart_policy)),
                maximum_retry_count: None,
            }),
            memory: run.limits.map(|l| l.memory),
            nano_cpus: run.limits.map(|l| l.nano_cpus),
            ..Default::default()
        };

        let config = Config {
            hostname: Some(spec.hostname.clone()),
            image: Some(spec.image.clone()),
            env: Some(run.env.clone()),
            tty: Some(spec.tty),
            attach_stdout: Some(spec.attach_output),
            attach_stderr: Some(spec.attach_output),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.to_owned(),
            platform: spec.platform.clone(),
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;
        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn remove_container(
        &self,
        name: &str,
        remove_volumes: bool,
    ) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            v: remove_volumes,
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(classify)
    }

    async fn container_ports(&self, id: &str) -> Result<Vec<PortMapping>, EngineError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        let value = to_value(&inspect)?;
        Ok(port_mappings(&value))
    }

    fn container_logs(&self, id: &str) -> ByteStream {
        let docker = self.docker.clone();
        let id = id.to_owned();
        forward(move |tx| async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let stream = docker.logs(&id, Some(options));
            pump(stream, tx, |output| Ok(output.into_bytes())).await;
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as errors from the client
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(classify(err)),
            None => Err(EngineError::Api {
                message: format!("wait for container {id} ended without a status"),
            }),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(classify)
    }
}

/// Drive an engine stream on its own task and expose it as a `'static` stream.
fn forward<T, F, Fut>(produce: F) -> futures::stream::BoxStream<'static, Result<T, EngineError>>
where
    T: Send + 'static,
    F: FnOnce(mpsc::Sender<Result<T, EngineError>>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(produce(tx));
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

async fn pump<S, I, T, C>(stream: S, tx: mpsc::Sender<Result<T, EngineError>>, convert: C)
where
    S: Stream<Item = Result<I, BollardError>>,
    C: Fn(I) -> Result<T, EngineError>,
{
    let mut stream = Box::pin(stream);
    while let Some(item) = stream.next().await {
        let item = item.map_err(classify).and_then(&convert);
        let stop = item.is_err();
        // Receiver dropped: caller stopped listening
        if tx.send(item).await.is_err() || stop {
            break;
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|err| EngineError::Decode {
        message: err.to_string(),
    })
}

fn to_message<T: Serialize>(info: T) -> Result<JsonMessage, EngineError> {
    serde_json::from_value(to_value(&info)?).map_err(|err| EngineError::Decode {
        message: err.to_string(),
    })
}

/// Build output is not serializable, so it is mapped field by field.
fn build_message(info: BuildInfo) -> JsonMessage {
    JsonMessage {
        stream: info.stream,
        status: info.status,
        progress: info.progress,
        id: info.id,
        aux: info
            .aux
            .and_then(|aux| aux.id)
            .map(|id| serde_json::json!({ "ID": id })),
        error: info.error,
        error_detail: info.error_detail.map(|detail| ErrorDetail {
            code: detail.code,
            message: detail.message,
        }),
    }
}

fn credentials(auth: RegistryAuth) -> DockerCredentials {
    DockerCredentials {
        username: Some(auth.username),
        password: Some(auth.password),
        serveraddress: Some(auth.server_address),
        ..Default::default()
    }
}

fn restart_policy_name(policy: Restart) -> RestartPolicyNameEnum {
    match policy {
        Restart::No => RestartPolicyNameEnum::NO,
        Restart::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        Restart::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    }
}

fn image_details(value: &Value) -> ImageDetails {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    let tags = value
        .get("RepoTags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let mut exposed_ports: Vec<String> = value
        .pointer("/Config/ExposedPorts")
        .and_then(Value::as_object)
        .map(|ports| ports.keys().cloned().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    ImageDetails {
        id: text("Id"),
        tags,
        parent: text("Parent"),
        comment: text("Comment"),
        created: text("Created"),
        author: text("Author"),
        size: value.get("Size").and_then(Value::as_i64).unwrap_or_default(),
        architecture: text("Architecture"),
        os: text("Os"),
        exposed_ports,
    }
}

fn port_mappings(value: &Value) -> Vec<PortMapping> {
    let Some(ports) = value.pointer("/NetworkSettings/Ports").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut mappings = Vec::new();
    for (container_port, bindings) in ports {
        for binding in bindings.as_array().into_iter().flatten() {
            let field = |key: &str| {
                binding
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            };
            mappings.push(PortMapping {
                container_port: container_port.clone(),
                host_ip: field("HostIp"),
                host_port: field("HostPort"),
            });
        }
    }
    mappings
}

fn classify(err: BollardError) -> EngineError {
    let message = err.to_string();
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => match status_code {
            404 => EngineError::NotFound { message },
            409 => EngineError::Conflict { message },
            401 => EngineError::Unauthorized { message },
            _ => EngineError::Api { message },
        },
        BollardError::DockerStreamError { error } => {
            if looks_like_auth_failure(&error) {
                EngineError::Unauthorized { message: error }
            } else {
                EngineError::Stream { message: error }
            }
        }
        BollardError::JsonDataError { .. } | BollardError::JsonSerdeError { .. } => {
            EngineError::Decode { message }
        }
        BollardError::IOError { .. } | BollardError::RequestTimeoutError { .. } => {
            EngineError::Connection { message }
        }
        _ if looks_like_connection_failure(&message) => EngineError::Connection { message },
        _ => EngineError::Api { message },
    }
}

fn looks_like_auth_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("unauthorized") || message.contains("authentication required")
}

fn looks_like_connection_failure(message: &str) -> bool {
    ["connect", "socket", "No such file"]
        .iter()
        .any(|needle| message.contains(needle))
}
