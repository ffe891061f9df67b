//! CloudFoundry-style application manifest (`manifest.yml`).
//!
//! Only the keys that influence staging are read; everything else in the
//! document is ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::Deserialize;

use crate::Error;

/// File names probed, in order, when no explicit manifest name is configured.
pub const MANIFEST_FILES: &[&str] = &["manifest.yml", "manifest.yaml"];

/// Memory assumed for applications that do not declare any.
pub const DEFAULT_APP_MEMORY: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct CfManifest {
    /// Directory containing the manifest
    #[serde(skip)]
    pub dir: PathBuf,
    #[serde(skip)]
    pub filename: String,
    #[serde(default)]
    pub applications: Vec<CfApplication>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CfApplication {
    pub name: String,
    #[serde(default)]
    pub buildpack: Option<String>,
    #[serde(default)]
    pub buildpacks: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, serde_yml::Value>,
    #[serde(default)]
    pub no_route: bool,
    #[serde(default)]
    pub random_route: bool,
    #[serde(default)]
    pub routes: Vec<CfRoute>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub instances: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CfRoute {
    pub route: String,
}

impl CfManifest {
    /// Locate and parse the manifest in `dir`.
    ///
    /// With `filename` set only that file is read; otherwise [`MANIFEST_FILES`]
    /// are probed in order.
    pub fn discover(dir: &Path, filename: Option<&str>) -> crate::Result<Self> {
        let candidates: Vec<&str> = match filename {
            Some(name) => vec![name],
            None => MANIFEST_FILES.to_vec(),
        };
        let found = candidates
            .into_iter()
            .find(|name| dir.join(name).is_file())
            .ok_or_else(|| Error::ManifestNotFound {
                dir: dir.to_path_buf(),
            })?;
        Self::load(&dir.join(found))
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ManifestRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut manifest: CfManifest =
            serde_yml::from_str(&content).map_err(|e| Error::ManifestParse {
                path: path.to_path_buf(),
                source: e,
            })?;
        if manifest.applications.is_empty() {
            return Err(Error::ManifestEmpty {
                path: path.to_path_buf(),
            });
        }
        manifest.dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        manifest.filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(manifest)
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    pub fn application_names(&self) -> Vec<String> {
        self.applications.iter().map(|a| a.name.clone()).collect()
    }

    pub fn application(&self, name: &str) -> crate::Result<&CfApplication> {
        self.applications
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::UnknownApplication {
                name: name.to_owned(),
                declared: self.application_names(),
            })
    }
}

impl CfApplication {
    /// `buildpack` wins over `buildpacks` when both are present.
    pub fn buildpacks(&self) -> Vec<String> {
        match &self.buildpack {
            Some(bp) => vec![bp.clone()],
            None => self.buildpacks.clone(),
        }
    }

    /// Declared memory in bytes, [`DEFAULT_APP_MEMORY`] when absent.
    pub fn memory_bytes(&self) -> crate::Result<u64> {
        match &self.memory {
            Some(memory) => crate::units::parse_size(memory),
            None => Ok(DEFAULT_APP_MEMORY),
        }
    }

    /// Environment with scalar values rendered as strings.
    pub fn env_strings(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), yaml_scalar(v)))
            .collect()
    }

    /// Routes declared for this application, `None` when the manifest is silent.
    ///
    /// `random-route` yields one host derived from the application name and
    /// `domain`; `no-route` yields an empty list.
    pub fn routes(&self, domain: &str) -> Option<Vec<String>> {
        if self.no_route {
            Some(Vec::new())
        } else if self.random_route {
            Some(vec![format!("{}.{domain}", self.route_uuid(domain))])
        } else if !self.routes.is_empty() {
            Some(self.routes.iter().map(|r| r.route.clone()).collect())
        } else {
            None
        }
    }

    /// Name-based (version 3) UUID over the application name and `data`.
    pub fn route_uuid(&self, data: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.name.as_bytes());
        hasher.update(data.as_bytes());
        let mut u: [u8; 16] = hasher.finalize().into();
        u[6] = (u[6] & 0x0f) | 0x30;
        u[8] = (u[8] & 0x3f) | 0x80;
        let hex = |bytes: &[u8]| bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
        format!(
            "{}-{}-{}-{}-{}",
            hex(&u[0..4]),
            hex(&u[4..6]),
            hex(&u[6..8]),
            hex(&u[8..10]),
            hex(&u[10..16])
        )
    }
}

fn yaml_scalar(value: &serde_yml::Value) -> String {
    match value {
        serde_yml::Value::String(s) => s.clone(),
        serde_yml::Value::Bool(b) => b.to_string(),
        serde_yml::Value::Number(n) => n.to_string(),
        serde_yml::Value::Null => String::new(),
        other => serde_yml::to_string(other)
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_default(),
    }
}
