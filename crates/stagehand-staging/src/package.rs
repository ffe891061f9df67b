//! Per-application build handle of the container driver.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use stagehand_build::{ArchiveError, DOCKERFILE};
use stagehand_core::{AppData, ContextData};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{self, ContextSources};
use crate::driver::{AppPackage, ImageState, RunOutcome, RunState};
use crate::engine::{BuildRequest, ContainerEngine, ContainerSpec, ImageDetails, MessageStream};
use crate::error::{EngineError, StagingError};
use crate::output::OutputSink;
use crate::progress::{self, DecodeSummary};
use crate::reference::credentials_for;
use crate::run_spec::{RunInputs, RunSpec};
use crate::stager::{BUILDPACKS_DIR, CONTEXT_DIR, DockerStagingConfig};

/// How long a finished run waits for buffered log output.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Values shared by every handle of one staging session.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionData {
    pub created: String,
    pub args: BTreeMap<String, String>,
    pub cf_api: String,
    pub cf_org: String,
    pub cf_space: String,
    /// Source manifest file name, empty when none was read
    pub manifest_file: String,
    pub manifest_path: Option<PathBuf>,
}

impl From<&ContextData> for SessionData {
    fn from(context: &ContextData) -> Self {
        Self {
            created: context.created_human(),
            args: context.args.clone(),
            cf_api: context.cf.api.clone(),
            cf_org: context.cf.org.clone(),
            cf_space: context.cf.space.clone(),
            manifest_file: context
                .cf
                .manifest
                .as_ref()
                .map(|m| m.filename.clone())
                .unwrap_or_default(),
            manifest_path: context.manifest_path(),
        }
    }
}

/// Build handle for one application: local image tag, declared reference, and
/// the container named after the application.
pub struct AppImage<E: ContainerEngine> {
    engine: Arc<E>,
    config: Arc<DockerStagingConfig>,
    session: Arc<SessionData>,
    app: AppData,
    output: OutputSink,
    local_tag: String,
    tags: Vec<String>,
    image_state: ImageState,
    run_state: RunState,
}

impl<E: ContainerEngine> AppImage<E> {
    pub(crate) fn new(
        engine: Arc<E>,
        config: Arc<DockerStagingConfig>,
        session: Arc<SessionData>,
        app: AppData,
        output: OutputSink,
    ) -> Self {
        let local_tag = app.name.to_lowercase();
        Self {
            engine,
            config,
            session,
            tags: vec![local_tag.clone()],
            local_tag,
            app,
            output,
            image_state: ImageState::Unbuilt,
            run_state: RunState::NotRunning,
        }
    }

    fn ensure_live(&self) -> Result<(), StagingError> {
        if self.image_state == ImageState::Destroyed {
            return Err(StagingError::Destroyed {
                app: self.app.name.clone(),
            });
        }
        Ok(())
    }

    fn built_id(&self) -> Result<String, StagingError> {
        self.ensure_live()?;
        self.image_state
            .id()
            .map(str::to_owned)
            .ok_or_else(|| StagingError::NotBuilt {
                app: self.app.name.clone(),
            })
    }

    async fn decode(
        &self,
        cancel: &CancellationToken,
        stream: MessageStream,
        subject: &str,
    ) -> Result<DecodeSummary, StagingError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StagingError::Cancelled),
            result = progress::decode_stream(stream, &self.output, subject) => result,
        }
    }

    async fn package_context(
        &self,
        cancel: &CancellationToken,
    ) -> Result<context::PackagedContext, StagingError> {
        let sources = ContextSources {
            app_dir: self.app.dir.clone(),
            manifest: self.session.manifest_path.clone(),
            buildpack_cache_dir: self.config.buildpack_cache_dir.clone(),
        };
        let cancel = cancel.clone();
        let packaged = tokio::task::spawn_blocking(move || context::package(&cancel, &sources))
            .await
            .map_err(|source| StagingError::PackagingTask { source })?;
        packaged.map_err(|source| match source {
            ArchiveError::Cancelled => StagingError::Cancelled,
            source => StagingError::Archive {
                app: self.app.name.clone(),
                source,
            },
        })
    }

    fn build_args(&self, app_bits: String) -> BTreeMap<String, String> {
        let session = &self.session;
        // Fixed keys are assigned last so user args cannot override them
        let mut args = session.args.clone();
        let fixed = [
            ("BASE", self.config.base_image.clone()),
            ("CONTEXT_DIR", CONTEXT_DIR.to_owned()),
            ("BUILDPACKS_DIR", BUILDPACKS_DIR.to_owned()),
            ("APP_BITS", app_bits),
            ("APP_NAME", self.app.name.clone()),
            ("APP_CREATED", session.created.clone()),
            ("APP_VERSION", self.app.version.clone()),
            ("APP_PORT", self.app.port.to_string()),
            ("CF_MANIFEST", session.manifest_file.clone()),
            ("CF_API", session.cf_api.clone()),
            ("CF_ORG", session.cf_org.clone()),
            ("CF_SPACE", session.cf_space.clone()),
        ];
        for (key, value) in fixed {
            args.insert(key.to_owned(), value);
        }
        args
    }

    fn run_env(&self) -> Vec<(&'static str, String)> {
        let session = &self.session;
        vec![
            ("APP_NAME", self.app.name.clone()),
            ("APP_CREATED", session.created.clone()),
            ("APP_VERSION", self.app.version.clone()),
            ("APP_PORT", self.app.port.to_string()),
            ("CF_MANIFEST", session.manifest_file.clone()),
            ("CF_API", session.cf_api.clone()),
            ("CF_ORG", session.cf_org.clone()),
            ("CF_SPACE", session.cf_space.clone()),
        ]
    }

    async fn inspect_built(&self) -> Result<ImageDetails, StagingError> {
        self.engine
            .inspect_image(&self.local_tag)
            .await
            .map_err(|source| match source {
                EngineError::NotFound { .. } => StagingError::ImageNotFound {
                    image: self.local_tag.clone(),
                    source,
                },
                source => StagingError::engine(format!("inspect image {}", self.local_tag), source),
            })
    }

    /// Create the container, replacing a stale one of the same name once.
    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<crate::engine::CreatedContainer, StagingError> {
        let name = &self.app.name;
        match self.engine.create_container(name, spec).await {
            Ok(created) => Ok(created),
            Err(EngineError::Conflict { message }) => {
                warn!(app = %name, %message, "container name in use, removing stale container");
                self.engine
                    .remove_container(name, false)
                    .await
                    .map_err(|source| {
                        StagingError::engine(format!("remove stale container {name}"), source)
                    })?;
                self.engine
                    .create_container(name, spec)
                    .await
                    .map_err(|source| match source {
                        EngineError::Conflict { .. } => StagingError::ContainerConflict {
                            name: name.clone(),
                            source,
                        },
                        source => {
                            StagingError::engine(format!("create container {name}"), source)
                        }
                    })
            }
            Err(source) => Err(StagingError::engine(
                format!("create container {name}"),
                source,
            )),
        }
    }

    fn follow_logs(&self, id: &str) -> JoinHandle<()> {
        let mut logs = self.engine.container_logs(id);
        let sink = self.output.clone();
        let app = self.app.name.clone();
        tokio::spawn(async move {
            while let Some(chunk) = logs.next().await {
                let written = match chunk {
                    Ok(bytes) => sink.write_all(&bytes).map_err(|e| e.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                if let Err(error) = written {
                    warn!(app = %app, %error, "container log follow stopped");
                    break;
                }
            }
            debug!(app = %app, "container log stream ended");
        })
    }

    async fn log_ports(&self, id: &str) {
        match self.engine.container_ports(id).await {
            Ok(ports) if ports.is_empty() => info!(app = %self.app.name, "no published ports"),
            Ok(ports) => {
                for port in ports {
                    let host_ip = if port.host_ip.is_empty() {
                        "0.0.0.0"
                    } else {
                        port.host_ip.as_str()
                    };
                    info!(
                        app = %self.app.name,
                        container_port = %port.container_port,
                        host = %format!("{host_ip}:{}", port.host_port),
                        "port published"
                    );
                }
            }
            Err(err) => warn!(app = %self.app.name, error = %err, "cannot read port mapping"),
        }
    }
}

enum Waited {
    Exited(Result<i64, EngineError>),
    Cancelled,
}

#[async_trait(?Send)]
impl<E: ContainerEngine + 'static> AppPackage for AppImage<E> {
    fn name(&self) -> &str {
        &self.app.name
    }

    fn image(&self) -> &str {
        &self.app.image
    }

    fn image_state(&self) -> &ImageState {
        &self.image_state
    }

    fn run_state(&self) -> RunState {
        self.run_state
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn build(&mut self, cancel: &CancellationToken) -> Result<String, StagingError> {
        self.ensure_live()?;
        let name = self.app.name.clone();
        if !self.app.dir.exists() {
            return Err(StagingError::SourceNotFound {
                app: name,
                path: self.app.dir.clone(),
            });
        }

        let base = self.config.base_image.clone();
        info!(app = %name, image = %base, "pulling base image");
        let auth = credentials_for(&base, &self.config.docker);
        let stream = self.engine.pull_image(&base, auth);
        self.decode(cancel, stream, &base).await?;

        info!(app = %name, path = %self.app.dir.display(), "packaging build context");
        let packaged = self.package_context(cancel).await?;
        debug!(app = %name, records = packaged.records, "build context ready");

        info!(
            app = %name,
            image = %self.local_tag,
            version = %self.app.version,
            "building image"
        );
        let request = BuildRequest {
            tag: self.local_tag.clone(),
            dockerfile: DOCKERFILE.to_owned(),
            build_args: self.build_args(packaged.app_bits),
            remove_intermediate: self.config.remove_before_build,
            pull_parent: false,
        };
        let stream = self
            .engine
            .build_image(request, Bytes::from(packaged.archive));
        let summary = self.decode(cancel, stream, &self.local_tag).await?;

        let details = self
            .engine
            .inspect_image(&self.local_tag)
            .await
            .map_err(|source| match source {
                EngineError::NotFound { .. } => StagingError::BuildIncomplete {
                    app: name.clone(),
                    image: self.local_tag.clone(),
                    source,
                },
                source => StagingError::engine(format!("inspect image {}", self.local_tag), source),
            })?;
        if let Some(digest) = summary.digest.filter(|d| *d != details.id) {
            debug!(app = %name, %digest, id = %details.id, "engine reported a different digest");
        }

        info!(app = %name, id = %details.id, "image built");
        self.image_state = ImageState::Built {
            id: details.id.clone(),
        };
        Ok(details.id)
    }

    async fn push(&mut self, cancel: &CancellationToken) -> Result<(), StagingError> {
        let id = self.built_id()?;
        let target = self.app.image.clone();

        self.engine
            .tag_image(&self.local_tag, &target)
            .await
            .map_err(|source| {
                StagingError::engine(format!("tag {} as {target}", self.local_tag), source)
            })?;

        info!(app = %self.app.name, image = %target, "pushing image");
        let auth = credentials_for(&target, &self.config.docker);
        let stream = self.engine.push_image(&target, auth);
        self.decode(cancel, stream, &target).await?;

        if !self.tags.contains(&target) {
            self.tags.push(target.clone());
        }
        self.image_state = ImageState::Pushed { id };
        info!(app = %self.app.name, image = %target, "image pushed");
        Ok(())
    }

    async fn run(
        &mut self,
        cancel: &CancellationToken,
        data_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
        follow_output: bool,
    ) -> Result<RunOutcome, StagingError> {
        self.built_id()?;
        let name = self.app.name.clone();
        let details = self.inspect_built().await?;

        let fixed_env = self.run_env();
        let (run, warnings) = RunSpec::derive(
            &details,
            &self.app.resources,
            RunInputs {
                dynamic_ports: self.config.dynamic_ports,
                restart_policy: self.config.restart_policy,
                data_dir,
                caller_env: env,
                fixed_env: &fixed_env,
            },
        )?;
        for warning in &warnings {
            warn!(app = %name, "{warning}; running without resource limits");
        }

        let platform = (!details.os.is_empty() && !details.architecture.is_empty())
            .then(|| format!("{}/{}", details.os, details.architecture));
        let spec = ContainerSpec {
            image: self.local_tag.clone(),
            hostname: name.clone(),
            tty: self.output.is_interactive(),
            attach_output: follow_output,
            platform,
            run,
        };

        let created = self.create_container(&spec).await?;
        for warning in &created.warnings {
            warn!(app = %name, "engine: {warning}");
        }

        self.engine
            .start_container(&created.id)
            .await
            .map_err(|source| StagingError::engine(format!("start container {name}"), source))?;
        self.run_state = RunState::Running;
        info!(app = %name, container = %created.id, "container started");

        let log_task = follow_output.then(|| self.follow_logs(&created.id));
        self.log_ports(&created.id).await;

        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => Waited::Cancelled,
            result = self.engine.wait_container(&created.id) => Waited::Exited(result),
        };

        match waited {
            Waited::Cancelled => {
                info!(app = %name, "run cancelled, stopping container");
                if let Some(task) = log_task {
                    task.abort();
                }
                self.engine
                    .stop_container(&created.id)
                    .await
                    .map_err(|source| {
                        StagingError::engine(format!("stop container {name}"), source)
                    })?;
                self.run_state = RunState::Stopped;
                Ok(RunOutcome::Cancelled)
            }
            Waited::Exited(Err(source)) => {
                if let Some(task) = log_task {
                    task.abort();
                }
                warn!(app = %name, error = %source, "wait failed, stopping container");
                if let Err(err) = self.engine.stop_container(&created.id).await {
                    error!(app = %name, error = %err, "failed to stop container");
                }
                self.run_state = RunState::Stopped;
                Err(StagingError::engine(
                    format!("wait for container {name}"),
                    source,
                ))
            }
            Waited::Exited(Ok(code)) => {
                self.run_state = RunState::Stopped;
                if let Some(mut task) = log_task {
                    if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut task).await.is_err() {
                        task.abort();
                    }
                }
                info!(app = %name, exit_code = code, "container exited");
                Ok(RunOutcome::Exited(code))
            }
        }
    }

    async fn destroy(&mut self, all: bool) -> Result<(), StagingError> {
        self.ensure_live()?;
        let name = self.app.name.clone();
        info!(app = %name, all, "removing container and image");
        let mut failures = Vec::new();

        match self.engine.remove_container(&name, all).await {
            Ok(()) => debug!(app = %name, "container removed"),
            Err(err) if err.is_not_found() => debug!(app = %name, "no container to remove"),
            Err(err) => failures.push(format!("{name}: remove container: {err}")),
        }

        match self.engine.inspect_image(&self.local_tag).await {
            Ok(details) => {
                if let Err(err) = self.engine.remove_image(&details.id, all).await {
                    failures.push(format!("{name}: remove image {}: {err}", self.local_tag));
                }
            }
            Err(err) if err.is_not_found() => {
                debug!(app = %name, image = %self.local_tag, "no image to remove");
            }
            Err(err) => failures.push(format!("{name}: inspect image {}: {err}", self.local_tag)),
        }

        self.image_state = ImageState::Destroyed;
        self.run_state = RunState::NotRunning;

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                error!(app = %name, "{failure}");
            }
            Err(StagingError::Cleanup { failures })
        }
    }

    async fn info(&self) -> Result<ImageDetails, StagingError> {
        self.ensure_live()?;
        self.inspect_built().await
    }
}
