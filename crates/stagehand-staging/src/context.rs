//! Build-context assembly for one application.

use std::path::{Path, PathBuf};

use stagehand_build::{ArchiveBuilder, ArchiveError, Filters, add_assets};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const APP_DEST: &str = "app";
const BUILDPACKS_DEST: &str = "buildpacks";
const PLACEHOLDER_MODE: u32 = 0o644;

/// Inputs for one build context.
#[derive(Debug, Clone)]
pub(crate) struct ContextSources {
    pub app_dir: PathBuf,
    /// Source manifest, added next to single-file sources
    pub manifest: Option<PathBuf>,
    pub buildpack_cache_dir: Option<PathBuf>,
}

/// A packaged build context.
#[derive(Debug)]
pub(crate) struct PackagedContext {
    pub archive: Vec<u8>,
    /// `.` for a directory source, the file name for a single-file source
    pub app_bits: String,
    pub records: usize,
}

/// Assemble the context tar. Blocking; run it off the async runtime.
pub(crate) fn package(
    cancel: &CancellationToken,
    sources: &ContextSources,
) -> Result<PackagedContext, ArchiveError> {
    let mut builder = ArchiveBuilder::new(Vec::new());
    let dest = Path::new(APP_DEST);
    let filters = Filters::new().exclude_dirs(".git")?;

    let mut records = builder.add(cancel, &sources.app_dir, dest, &filters)?;
    let app_bits = if sources.app_dir.is_dir() {
        ".".to_owned()
    } else {
        if let Some(manifest) = &sources.manifest {
            records += builder.add(cancel, manifest, dest, &Filters::new())?;
        }
        sources
            .app_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_owned())
    };

    let mut cached = false;
    if let Some(cache) = &sources.buildpack_cache_dir {
        if cache.is_dir() {
            records += builder.add(cancel, cache, Path::new(BUILDPACKS_DEST), &Filters::new())?;
            cached = true;
        } else {
            warn!(path = %cache.display(), "buildpack cache directory not found, skipping");
        }
    }
    if !cached {
        // The Dockerfile always copies the buildpacks directory
        builder.add_file(b"", &format!("{BUILDPACKS_DEST}/.keep"), PLACEHOLDER_MODE)?;
        records += 1;
    }

    add_assets(&mut builder)?;
    records += stagehand_build::ASSETS.len();

    let archive = builder.close()?;
    debug!(records, bytes = archive.len(), "build context packaged");
    Ok(PackagedContext {
        archive,
        app_bits,
        records,
    })
}
