//! Filtered, cancellable tar assembly.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use globset::{Glob, GlobMatcher};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Glob rules applied to source-relative paths during [`ArchiveBuilder::add`].
///
/// Directory rules prune whole subtrees; file rules apply to regular files and
/// symlinks. Unset include rules match everything.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    include_files: Option<GlobMatcher>,
    include_dirs: Option<GlobMatcher>,
    exclude_files: Option<GlobMatcher>,
    exclude_dirs: Option<GlobMatcher>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_files(mut self, pattern: &str) -> Result<Self, ArchiveError> {
        self.include_files = compile(pattern)?;
        Ok(self)
    }

    pub fn include_dirs(mut self, pattern: &str) -> Result<Self, ArchiveError> {
        self.include_dirs = compile(pattern)?;
        Ok(self)
    }

    pub fn exclude_files(mut self, pattern: &str) -> Result<Self, ArchiveError> {
        self.exclude_files = compile(pattern)?;
        Ok(self)
    }

    pub fn exclude_dirs(mut self, pattern: &str) -> Result<Self, ArchiveError> {
        self.exclude_dirs = compile(pattern)?;
        Ok(self)
    }

    fn keeps_dir(&self, relative: &Path) -> bool {
        keeps(&self.include_dirs, &self.exclude_dirs, relative)
    }

    fn keeps_file(&self, relative: &Path) -> bool {
        keeps(&self.include_files, &self.exclude_files, relative)
    }
}

fn keeps(include: &Option<GlobMatcher>, exclude: &Option<GlobMatcher>, path: &Path) -> bool {
    if exclude.as_ref().is_some_and(|m| m.is_match(path)) {
        return false;
    }
    include.as_ref().is_none_or(|m| m.is_match(path))
}

fn compile(pattern: &str) -> Result<Option<GlobMatcher>, ArchiveError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let glob = Glob::new(pattern).map_err(|e| ArchiveError::InvalidGlob {
        pattern: pattern.to_owned(),
        source: e,
    })?;
    Ok(Some(glob.compile_matcher()))
}

/// Tar stream assembled from directory walks and in-memory files.
///
/// Every record is named `base / dest / relative`, with root and `.`
/// components dropped. The builder is consumed by [`close`](Self::close).
pub struct ArchiveBuilder<W: Write> {
    base: PathBuf,
    inner: tar::Builder<W>,
}

impl ArchiveBuilder<File> {
    /// File-backed builder; the file is released on [`close`](Self::close).
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|e| ArchiveError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::new(file))
    }
}

impl<W: Write> ArchiveBuilder<W> {
    pub fn new(writer: W) -> Self {
        let mut inner = tar::Builder::new(writer);
        inner.follow_symlinks(false);
        Self {
            base: PathBuf::new(),
            inner,
        }
    }

    /// Prefix applied to every record name.
    pub fn with_base(mut self, base: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let base = base.into();
        check_destination(&base)?;
        self.base = base;
        Ok(self)
    }

    /// Record `src` under `dest`.
    ///
    /// A single file is recorded as `dest/<basename>`. A directory is walked in
    /// file-name order with its root recorded as `dest` itself, not under the
    /// directory's own basename. Cancellation is checked before each entry and aborts the
    /// walk; records already written stay in the stream, so the caller must
    /// discard the output on any error. Returns the number of records written.
    pub fn add(
        &mut self,
        cancel: &CancellationToken,
        src: &Path,
        dest: &Path,
        filters: &Filters,
    ) -> Result<usize, ArchiveError> {
        check_destination(dest)?;
        let metadata = std::fs::symlink_metadata(src).map_err(|e| ArchiveError::Io {
            path: src.to_path_buf(),
            source: e,
        })?;

        if !metadata.is_dir() {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let basename = src.file_name().map(Path::new).unwrap_or(src);
            let name = self.record_name(dest, basename);
            self.append(src, &name)?;
            return Ok(1);
        }

        let mut written = 0;
        let mut walker = WalkDir::new(src)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            if cancel.is_cancelled() {
                tracing::debug!(src = %src.display(), written, "archive walk cancelled");
                return Err(ArchiveError::Cancelled);
            }
            let entry = entry.map_err(|e| ArchiveError::Walk {
                path: src.to_path_buf(),
                source: e,
            })?;
            let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let file_type = entry.file_type();

            if file_type.is_dir() {
                if entry.depth() > 0 && !filters.keeps_dir(relative) {
                    tracing::trace!(path = %relative.display(), "pruning directory");
                    walker.skip_current_dir();
                    continue;
                }
            } else if file_type.is_file() || file_type.is_symlink() {
                if !filters.keeps_file(relative) {
                    tracing::trace!(path = %relative.display(), "skipping file");
                    continue;
                }
            } else {
                tracing::debug!(path = %entry.path().display(), "skipping special file");
                continue;
            }

            let name = self.record_name(dest, relative);
            if name.as_os_str().is_empty() {
                // Root of a walk recorded at the archive root
                continue;
            }
            self.append(entry.path(), &name)?;
            written += 1;
        }

        tracing::debug!(src = %src.display(), dest = %dest.display(), written, "added to archive");
        Ok(written)
    }

    /// Record an in-memory file.
    pub fn add_file(&mut self, data: &[u8], name: &str, mode: u32) -> Result<(), ArchiveError> {
        let path = Path::new(name);
        check_destination(path)?;
        let record = self.record_name(Path::new(""), path);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        );
        header.set_cksum();

        self.inner
            .append_data(&mut header, &record, data)
            .map_err(|e| ArchiveError::Io {
                path: record.clone(),
                source: e,
            })?;
        tracing::debug!(name = %record.display(), bytes = data.len(), "added file to archive");
        Ok(())
    }

    /// Write the archive trailer and hand back the underlying writer.
    pub fn close(self) -> Result<W, ArchiveError> {
        let base = self.base;
        self.inner
            .into_inner()
            .map_err(|e| ArchiveError::Io { path: base, source: e })
    }

    fn record_name(&self, dest: &Path, relative: &Path) -> PathBuf {
        self.base
            .components()
            .chain(dest.components())
            .chain(relative.components())
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }

    fn append(&mut self, path: &Path, name: &Path) -> Result<(), ArchiveError> {
        self.inner
            .append_path_with_name(path, name)
            .map_err(|e| ArchiveError::Io {
                path: path.to_path_buf(),
                source: e,
            })
    }
}

fn check_destination(dest: &Path) -> Result<(), ArchiveError> {
    if dest.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ArchiveError::InvalidDestination {
            path: dest.to_path_buf(),
        });
    }
    Ok(())
}

/// Extract a tar stream below `dest`.
///
/// Parent directories are created with the permission bits of the entry being
/// extracted (plus search bits where read is granted). Entries never land
/// outside `dest`: names with `..` or a root are rejected, link targets must
/// resolve inside `dest`, and nothing is written through an existing symlink.
/// Cancellation is checked between entries. Returns the number of entries
/// extracted.
pub fn unpack<R: Read>(
    cancel: &CancellationToken,
    reader: R,
    dest: &Path,
) -> Result<usize, ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| ArchiveError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;

    let mut extracted = 0;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry.map_err(|e| ArchiveError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?;
        let name = entry
            .path()
            .map_err(|e| ArchiveError::Io {
                path: dest.to_path_buf(),
                source: e,
            })?
            .into_owned();
        if !is_plain_relative(&name) || through_symlink(dest, &name) {
            return Err(ArchiveError::UnsafePath { path: name });
        }

        let target = dest.join(&name);
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                create_dirs(&target, mode).map_err(io_err(&target))?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    create_dirs(parent, dir_mode(mode)).map_err(io_err(parent))?;
                }
                let mut file = File::create(&target).map_err(io_err(&target))?;
                let bytes = std::io::copy(&mut entry, &mut file).map_err(io_err(&target))?;
                set_mode(&target, mode).map_err(io_err(&target))?;
                tracing::trace!(path = %target.display(), bytes, "extracted file");
            }
            kind @ (tar::EntryType::Symlink | tar::EntryType::Link) => {
                let link = entry
                    .link_name()
                    .map_err(io_err(&target))?
                    .map(|l| l.into_owned())
                    .ok_or_else(|| ArchiveError::UnsafePath { path: name.clone() })?;
                let inside = if kind == tar::EntryType::Symlink {
                    // Relative to the directory holding the link
                    let resolved = name.parent().unwrap_or(Path::new("")).join(&link);
                    !link.is_absolute() && is_relative_inside(&resolved)
                } else {
                    // Hard links name another entry of the same archive
                    is_plain_relative(&link) && !through_symlink(dest, &link)
                };
                if !inside {
                    return Err(ArchiveError::UnsafePath { path: name });
                }
                if let Some(parent) = target.parent() {
                    create_dirs(parent, 0o755).map_err(io_err(parent))?;
                }
                if kind == tar::EntryType::Symlink {
                    entry.unpack(&target).map_err(io_err(&target))?;
                } else {
                    std::fs::hard_link(dest.join(&link), &target).map_err(io_err(&target))?;
                }
            }
            other => {
                tracing::debug!(path = %name.display(), kind = ?other, "skipping entry");
                continue;
            }
        }
        extracted += 1;
    }
    Ok(extracted)
}

/// Relative with no `..` components.
fn is_plain_relative(path: &Path) -> bool {
    !path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
}

/// Whether a relative path stays at or below its root once `.` and `..` are applied.
fn is_relative_inside(path: &Path) -> bool {
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(up) => depth = up,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Whether `dest/name`, or any directory on the way to it, is already a symlink.
fn through_symlink(dest: &Path, name: &Path) -> bool {
    let mut current = dest.to_path_buf();
    name.components().any(|component| {
        current.push(component);
        std::fs::symlink_metadata(&current)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    })
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + use<> {
    let path = path.to_path_buf();
    move |source| ArchiveError::Io { path, source }
}

/// Directory mode derived from a file mode: search bits follow read bits.
fn dir_mode(mode: u32) -> u32 {
    mode | ((mode & 0o444) >> 2)
}

#[cfg(unix)]
fn create_dirs(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

#[cfg(not(unix))]
fn create_dirs(path: &Path, _mode: u32) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive I/O failed for {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to walk {path}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("invalid glob pattern '{pattern}'")]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },
    #[error("archive destination {path} escapes the archive root")]
    InvalidDestination { path: PathBuf },
    #[error("archive entry {path} escapes the extraction root")]
    UnsafePath { path: PathBuf },
    #[error("archive operation cancelled")]
    Cancelled,
}
