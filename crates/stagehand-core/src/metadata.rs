//! Application metadata handed to staging drivers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::{AppDefaults, ManifestPolicy, StagehandConfig};
use crate::manifest::CfManifest;
use crate::{Error, git};

/// Version tag used when neither the caller nor git provides one.
pub const DEFAULT_VERSION: &str = "latest";

/// Declared resource hints, kept as human strings until a driver needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceData {
    pub domain: String,
    pub port: u16,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
}

impl From<&AppDefaults> for ResourceData {
    fn from(defaults: &AppDefaults) -> Self {
        Self {
            domain: defaults.domain.clone(),
            port: defaults.port,
            cpu: defaults.cpu.clone(),
            memory: defaults.memory.clone(),
            disk: defaults.disk.clone(),
        }
    }
}

impl Default for ResourceData {
    fn default() -> Self {
        Self::from(&AppDefaults::default())
    }
}

/// One application to stage.
#[derive(Debug, Clone)]
pub struct AppData {
    pub name: String,
    pub dir: PathBuf,
    /// Declared (external) image reference
    pub image: String,
    pub version: String,
    /// Route hosts keyed by `<port>-<index>`
    pub routes: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub instances: u32,
    pub port: u16,
    pub resources: ResourceData,
    pub buildpacks: Vec<String>,
}

/// Caller selection of which applications to collect and how.
#[derive(Debug, Clone, Default)]
pub struct AppRequest {
    /// Source directory; defaults to the context directory
    pub dir: Option<PathBuf>,
    /// Restrict to one application
    pub name: Option<String>,
    pub version: Option<String>,
    /// Explicit routes; when non-empty they replace manifest and default routes
    pub routes: BTreeMap<String, String>,
    pub resources: ResourceData,
    pub policy: ManifestPolicy,
    pub manifest_file: Option<String>,
}

impl AppRequest {
    pub fn from_config(config: &StagehandConfig) -> Self {
        let deployment = &config.deployment;
        Self {
            dir: deployment.path.clone(),
            name: deployment.app_name.clone(),
            version: deployment.app_version.clone(),
            routes: BTreeMap::new(),
            resources: ResourceData::from(&deployment.defaults),
            policy: deployment.manifest.parse,
            manifest_file: deployment.manifest.filename.clone(),
        }
    }
}

/// Platform identifiers plus the source manifest, when one was read.
#[derive(Debug, Clone, Default)]
pub struct CfData {
    pub api: String,
    pub org: String,
    pub space: String,
    pub manifest: Option<CfManifest>,
}

/// Everything known about one staging session.
#[derive(Debug, Clone)]
pub struct ContextData {
    pub dir: PathBuf,
    /// `origin` remote URL when the directory is a git work tree
    pub git: Option<String>,
    /// Base name of the context directory
    pub name: String,
    pub created: DateTime<Utc>,
    /// Git HEAD short reference, or [`DEFAULT_VERSION`]
    pub reference: String,
    pub registry: Option<String>,
    pub team: String,
    /// User build arguments
    pub args: BTreeMap<String, String>,
    pub apps: Vec<AppData>,
    pub cf: CfData,
}

impl ContextData {
    /// Empty session for `dir`; no applications are collected yet.
    pub fn new(dir: &Path, config: &StagehandConfig) -> Self {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_owned());
        let reference = git::head_reference(dir).unwrap_or_else(|| DEFAULT_VERSION.to_owned());
        Self {
            dir: dir.to_path_buf(),
            git: git::origin_url(dir),
            name,
            created: Utc::now(),
            reference,
            registry: config.deployment.registry_prefix.clone(),
            team: config.team.clone(),
            args: config.deployment.args.clone(),
            apps: Vec::new(),
            cf: CfData {
                api: config.cf.api.clone(),
                org: config.cf.org.clone(),
                space: config.cf.space.clone(),
                manifest: None,
            },
        }
    }

    /// Build the session for `dir` and collect the applications selected by `config`.
    pub fn collect(dir: &Path, config: &StagehandConfig) -> crate::Result<Self> {
        let mut context = Self::new(dir, config);
        context.add_apps(&AppRequest::from_config(config))?;
        Ok(context)
    }

    pub fn created_human(&self) -> String {
        self.created.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }

    /// Path of the source manifest, when one was read.
    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.cf.manifest.as_ref().map(CfManifest::path)
    }

    pub fn app(&self, name: &str) -> Option<&AppData> {
        self.apps.iter().find(|a| a.name == name)
    }

    /// Collect applications, reading the source manifest according to `request.policy`.
    pub fn add_apps(&mut self, request: &AppRequest) -> crate::Result<()> {
        let dir = request.dir.clone().unwrap_or_else(|| self.dir.clone());
        let manifest_file = request.manifest_file.as_deref();

        let manifest = match request.policy {
            ManifestPolicy::No => None,
            ManifestPolicy::Yes => Some(CfManifest::discover(&dir, manifest_file)?),
            ManifestPolicy::Try => match CfManifest::discover(&dir, manifest_file) {
                Ok(manifest) => Some(manifest),
                Err(Error::ManifestNotFound { .. }) => {
                    tracing::debug!(dir = %dir.display(), "no source manifest, using defaults");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable source manifest");
                    None
                }
            },
        };

        let apps = match &manifest {
            Some(manifest) => self.manifest_apps(manifest, request)?,
            None => vec![self.default_app(dir, request)],
        };
        if manifest.is_some() {
            self.cf.manifest = manifest;
        }
        self.apps.extend(apps);
        Ok(())
    }

    fn default_app(&self, dir: PathBuf, request: &AppRequest) -> AppData {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-webapp-{}", self.name, self.apps.len()));
        let version = self.version(request);
        let resources = request.resources.clone();
        let routes = if request.routes.is_empty() {
            self.default_routes(&name, &version, &resources)
        } else {
            request.routes.clone()
        };
        AppData {
            image: self.image_reference(&name, &version),
            name,
            dir,
            version,
            routes,
            env: BTreeMap::new(),
            instances: 1,
            port: resources.port,
            resources,
            buildpacks: Vec::new(),
        }
    }

    fn manifest_apps(
        &self,
        manifest: &CfManifest,
        request: &AppRequest,
    ) -> crate::Result<Vec<AppData>> {
        let selected = match &request.name {
            Some(name) => vec![manifest.application(name)?],
            None => manifest.applications.iter().collect(),
        };
        let version = self.version(request);

        let apps = selected
            .into_iter()
            .map(|app| {
                let mut resources = request.resources.clone();
                match app.memory_bytes() {
                    Ok(bytes) => resources.memory = bytes.to_string(),
                    Err(e) => tracing::warn!(app = %app.name, error = %e, "keeping default memory"),
                }

                let routes = if !request.routes.is_empty() {
                    request.routes.clone()
                } else if resources.domain.is_empty() {
                    BTreeMap::new()
                } else {
                    match app.routes(&resources.domain) {
                        Some(hosts) => hosts
                            .into_iter()
                            .enumerate()
                            .map(|(i, host)| (route_key(resources.port, i), host))
                            .collect(),
                        None => self.default_routes(&app.name, &version, &resources),
                    }
                };

                AppData {
                    name: app.name.clone(),
                    dir: match &app.path {
                        Some(path) => manifest.dir.join(path),
                        None => request.dir.clone().unwrap_or_else(|| self.dir.clone()),
                    },
                    image: self.image_reference(&app.name, &version),
                    version: version.clone(),
                    routes,
                    env: app.env_strings(),
                    instances: app.instances.filter(|n| *n > 0).unwrap_or(1),
                    port: resources.port,
                    resources,
                    buildpacks: app.buildpacks(),
                }
            })
            .collect();
        Ok(apps)
    }

    fn version(&self, request: &AppRequest) -> String {
        request
            .version
            .clone()
            .unwrap_or_else(|| self.reference.clone())
    }

    /// `<registry>/<team>/<name>:<version>`, or `<name>:<version>` without a registry.
    pub fn image_reference(&self, name: &str, version: &str) -> String {
        let image = format!("{name}:{version}");
        match self.registry.as_deref() {
            Some(registry) if !registry.is_empty() => {
                let registry = registry.trim_end_matches('/');
                if self.team.is_empty() {
                    format!("{registry}/{image}")
                } else {
                    format!("{registry}/{}/{image}", self.team)
                }
            }
            _ => image,
        }
    }

    fn default_routes(
        &self,
        name: &str,
        version: &str,
        resources: &ResourceData,
    ) -> BTreeMap<String, String> {
        let mut routes = BTreeMap::new();
        if !resources.domain.is_empty() {
            let host = format!("{name}-{version}.{}", resources.domain).to_lowercase();
            routes.insert(route_key(resources.port, 0), host);
        }
        routes
    }
}

fn route_key(port: u16, index: usize) -> String {
    format!("{port}-{index}")
}
