use std::path::PathBuf;

use stagehand_core::{ContextData, StagehandConfig};
use stagehand_staging::{AppPackage, DriverRegistry, OutputSink, StagingDriver};
use tracing::{info, warn};

/// Mistakes in the command line itself.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("application path {path} does not exist")]
    MissingPath { path: PathBuf },
}

/// Options shared by every command that works on a project.
#[derive(Debug, Clone, clap::Args)]
pub struct Target {
    /// Application directory or file (defaults to the current directory)
    #[arg(long, short = 'p', global = true)]
    pub path: Option<PathBuf>,
    /// Configuration file (defaults to stagehand.toml in the application directory)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,
    /// Only stage the named application
    #[arg(long, short = 'a', global = true)]
    pub app: Option<String>,
    /// Version tag for the built images
    #[arg(long, global = true)]
    pub app_version: Option<String>,
}

impl Target {
    /// Load the configuration and apply command-line overrides.
    pub fn load_config(&self) -> anyhow::Result<StagehandConfig> {
        let mut config = match &self.config {
            Some(file) => StagehandConfig::load_file(file)?,
            None => StagehandConfig::load(&self.base_dir())?,
        };
        if let Some(app) = &self.app {
            config.deployment.app_name = Some(app.clone());
        }
        if let Some(version) = &self.app_version {
            config.deployment.app_version = Some(version.clone());
        }
        Ok(config)
    }

    fn base_dir(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Application directory: `--path`, else the configured path relative to the project.
    fn app_dir(&self, config: &StagehandConfig) -> Result<PathBuf, UsageError> {
        let dir = match (&self.path, &config.deployment.path) {
            (None, Some(configured)) => self.base_dir().join(configured),
            _ => self.base_dir(),
        };
        dir.canonicalize()
            .map_err(|_| UsageError::MissingPath { path: dir })
    }
}

/// A loaded driver and one package per selected application.
pub struct Session {
    pub driver: Box<dyn StagingDriver>,
    pub packages: Vec<Box<dyn AppPackage>>,
}

impl Session {
    pub fn open(target: &Target) -> anyhow::Result<Self> {
        let config = target.load_config()?;
        let dir = target.app_dir(&config)?;

        let registry = DriverRegistry::with_builtin();
        let driver = registry.load(&config.deployment.staging_driver, &config)?;

        let context = ContextData::collect(&dir, &config)?;
        info!(
            dir = %context.dir.display(),
            driver = driver.name(),
            apps = context.apps.len(),
            "staging session opened"
        );
        let packages = driver.stager(&context, OutputSink::stdout())?;
        Ok(Self { driver, packages })
    }

    /// Run the driver's sweep when asked, keeping the command's own error first.
    pub async fn conclude(
        mut self,
        cleanup: bool,
        result: anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        if !cleanup {
            return result;
        }
        let swept = self.driver.finish(&mut self.packages).await;
        match (result, swept) {
            (Err(err), Err(sweep)) => {
                warn!(error = %sweep, "cleanup after a failed command also failed");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), swept) => swept.map_err(Into::into),
        }
    }
}
