use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the project-level configuration file.
pub const CONFIG_FILE: &str = "stagehand.toml";

/// stagehand.toml configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagehandConfig {
    /// Team (or namespace) used as the middle segment of image references
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub cf: CfConfig,
}

/// Registry credentials for pulling base images and pushing results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Registry host, e.g. `registry.example.com` or `https://registry.example.com/v2/`
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Application directory (defaults to the current directory)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Select a single application by name
    #[serde(default)]
    pub app_name: Option<String>,
    /// Version tag (defaults to the git HEAD reference, or `latest`)
    #[serde(default)]
    pub app_version: Option<String>,
    /// Registered staging driver to load
    #[serde(default = "default_staging_driver")]
    pub staging_driver: String,
    /// User build arguments; the fixed staging arguments always take precedence
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Registry prefix for computed image references
    #[serde(default)]
    pub registry_prefix: Option<String>,
    #[serde(default)]
    pub defaults: AppDefaults,
    #[serde(default)]
    pub manifest: ManifestConfig,
}

/// Resource hints applied when neither flags nor the manifest provide them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDefaults {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_disk")]
    pub disk: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    #[serde(default)]
    pub parse: ManifestPolicy,
    /// Explicit manifest file name inside the application directory
    #[serde(default)]
    pub filename: Option<String>,
}

/// Whether application metadata is read from the source manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestPolicy {
    /// Read the manifest; fall back to flag-derived metadata on failure
    #[default]
    Try,
    /// Read the manifest; failure is fatal
    Yes,
    /// Never read the manifest
    No,
}

/// Options for the container staging driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Remove intermediate containers after a successful build
    #[serde(default = "default_true")]
    pub remove_before_build: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Let the engine choose host ports instead of mirroring container ports
    #[serde(default)]
    pub dynamic_ports: bool,
    /// Base image the staging Dockerfile builds on
    #[serde(default = "default_base_image")]
    pub base_image: String,
    /// Directory of pre-fetched buildpacks copied into the build context
    #[serde(default)]
    pub buildpack_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
        }
    }
}

/// Platform identifiers passed to the build and exported to the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CfConfig {
    #[serde(default)]
    pub api: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub space: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            path: None,
            app_name: None,
            app_version: None,
            staging_driver: default_staging_driver(),
            args: BTreeMap::new(),
            registry_prefix: None,
            defaults: AppDefaults::default(),
            manifest: ManifestConfig::default(),
        }
    }
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            port: default_port(),
            memory: default_memory(),
            cpu: default_cpu(),
            disk: default_disk(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            remove_before_build: true,
            restart_policy: RestartPolicy::default(),
            dynamic_ports: false,
            base_image: default_base_image(),
            buildpack_cache_dir: None,
        }
    }
}

impl StagehandConfig {
    /// Load from stagehand.toml in the given directory, or return defaults if not found.
    pub fn load(project_dir: &Path) -> crate::Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from an explicit file; a missing file is an error.
    pub fn load_file(config_path: &Path) -> crate::Result<Self> {
        let content =
            std::fs::read_to_string(config_path).map_err(|e| crate::Error::ConfigLoad {
                path: config_path.to_path_buf(),
                source: e,
            })?;
        toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
            path: config_path.to_path_buf(),
            source: e,
        })
    }

    /// Render the effective configuration as TOML with the registry password masked.
    pub fn render_masked(&self) -> crate::Result<String> {
        let mut shown = self.clone();
        if shown.docker.password.is_some() {
            shown.docker.password = Some("********".to_owned());
        }
        toml::to_string_pretty(&shown).map_err(|e| crate::Error::ConfigRender { source: e })
    }
}

fn default_staging_driver() -> String {
    "docker".to_owned()
}

fn default_domain() -> String {
    "local".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_memory() -> String {
    "1024M".to_owned()
}

fn default_cpu() -> String {
    "1".to_owned()
}

fn default_disk() -> String {
    "4G".to_owned()
}

fn default_base_image() -> String {
    "cloudfoundry/cflinuxfs3:latest".to_owned()
}

fn default_true() -> bool {
    true
}
