use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config")]
    ConfigRender { source: toml::ser::Error },

    // ── Source manifest ──
    #[error("no manifest.yml or manifest.yaml found in {dir}")]
    ManifestNotFound { dir: PathBuf },

    #[error("failed to read manifest {path}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}")]
    ManifestParse {
        path: PathBuf,
        source: serde_yml::Error,
    },

    #[error("manifest {path} declares no applications")]
    ManifestEmpty { path: PathBuf },

    #[error("application '{name}' not found in manifest; declared: {}", format_names(declared))]
    UnknownApplication { name: String, declared: Vec<String> },

    // ── Resource strings ──
    #[error("invalid size {value:?}: {reason}")]
    InvalidSize { value: String, reason: &'static str },

    #[error("invalid cpu {value:?}: {reason}")]
    InvalidCpu { value: String, reason: &'static str },
}

fn format_names(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_owned()
    } else {
        names.join(", ")
    }
}
