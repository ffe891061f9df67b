use std::io::Cursor;
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use stagehand_build::{ArchiveBuilder, ArchiveError, Filters, add_assets, unpack};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Create a small application tree.
fn app_tree(dir: &Path) {
    std::fs::create_dir_all(dir.join("src/nested")).unwrap();
    std::fs::create_dir_all(dir.join("target/debug")).unwrap();
    std::fs::write(dir.join("Procfile"), "web: python app.py\n").unwrap();
    std::fs::write(dir.join("app.py"), "print('hi')\n").unwrap();
    std::fs::write(dir.join("src/lib.py"), "").unwrap();
    std::fs::write(dir.join("src/nested/deep.py"), "").unwrap();
    std::fs::write(dir.join("target/debug/out.bin"), [0u8; 16]).unwrap();
}

fn record_names(archive: Vec<u8>) -> Vec<String> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            e.path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_owned()
        })
        .collect()
}

fn pack(src: &Path, dest: &str, filters: &Filters) -> Vec<String> {
    let mut builder = ArchiveBuilder::new(Vec::new());
    builder
        .add(&CancellationToken::new(), src, Path::new(dest), filters)
        .unwrap();
    record_names(builder.close().unwrap())
}

#[test]
fn directory_is_recorded_under_destination_in_name_order() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());

    let names = pack(tmp.path(), "/app", &Filters::new());
    assert_eq!(
        names,
        vec![
            "app",
            "app/Procfile",
            "app/app.py",
            "app/src",
            "app/src/lib.py",
            "app/src/nested",
            "app/src/nested/deep.py",
            "app/target",
            "app/target/debug",
            "app/target/debug/out.bin",
        ]
    );
}

#[test]
fn single_file_is_recorded_by_basename() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());

    let names = pack(&tmp.path().join("src/lib.py"), "app", &Filters::new());
    assert_eq!(names, vec!["app/lib.py"]);
}

#[test]
fn root_at_archive_root_is_not_recorded() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.txt"), "a").unwrap();

    let names = pack(tmp.path(), ".", &Filters::new());
    assert_eq!(names, vec!["a.txt"]);
}

#[test]
fn excluded_directory_prunes_subtree() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());

    let filters = Filters::new().exclude_dirs("target").unwrap();
    let names = pack(tmp.path(), "app", &filters);
    assert!(names.iter().all(|n| !n.starts_with("app/target")));
    assert!(names.contains(&"app/src/nested/deep.py".to_owned()));
}

#[test]
fn include_files_keeps_only_matching_files() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());

    let filters = Filters::new()
        .include_files("*.py")
        .unwrap()
        .exclude_dirs("target")
        .unwrap();
    let names = pack(tmp.path(), "app", &filters);
    assert_eq!(
        names,
        vec![
            "app",
            "app/app.py",
            "app/src",
            "app/src/lib.py",
            "app/src/nested",
            "app/src/nested/deep.py",
        ]
    );
}

#[test]
fn include_dirs_requires_match_below_root() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());

    let filters = Filters::new().include_dirs("src*").unwrap();
    let names = pack(tmp.path(), "app", &filters);
    assert!(names.contains(&"app".to_owned()));
    assert!(names.contains(&"app/Procfile".to_owned()));
    assert!(names.contains(&"app/src/nested/deep.py".to_owned()));
    assert!(!names.iter().any(|n| n.starts_with("app/target")));
}

#[test]
fn invalid_glob_is_rejected() {
    let err = Filters::new().include_files("[unclosed").unwrap_err();
    assert!(matches!(err, ArchiveError::InvalidGlob { .. }));
}

#[test]
fn cancelled_walk_records_nothing() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut builder = ArchiveBuilder::new(Vec::new());
    let err = builder
        .add(&cancel, tmp.path(), Path::new("app"), &Filters::new())
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Cancelled));
    assert!(record_names(builder.close().unwrap()).is_empty());
}

/// Sink that raises cancellation as soon as the first record is written.
struct CancelOnWrite {
    bytes: Vec<u8>,
    cancel: CancellationToken,
}

impl std::io::Write for CancelOnWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        self.cancel.cancel();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn cancellation_mid_walk_stops_at_the_next_entry() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());
    let cancel = CancellationToken::new();

    let mut builder = ArchiveBuilder::new(CancelOnWrite {
        bytes: Vec::new(),
        cancel: cancel.clone(),
    });
    let err = builder
        .add(&cancel, tmp.path(), Path::new("app"), &Filters::new())
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Cancelled));

    // Only the walk root was written before the token fired
    let written = builder.close().unwrap().bytes;
    assert_eq!(record_names(written), vec!["app"]);
}

#[test]
fn cancelled_single_file_is_not_recorded() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut builder = ArchiveBuilder::new(Vec::new());
    let err = builder
        .add(&cancel, &tmp.path().join("app.py"), Path::new("app"), &Filters::new())
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Cancelled));
}

#[test]
fn parent_destination_is_rejected() {
    let tmp = TempDir::new().unwrap();
    app_tree(tmp.path());

    let mut builder = ArchiveBuilder::new(Vec::new());
    let err = builder
        .add(
            &CancellationToken::new(),
            tmp.path(),
            Path::new("app/../../etc"),
            &Filters::new(),
        )
        .unwrap_err();
    assert!(matches!(err, ArchiveError::InvalidDestination { .. }));
}

#[test]
fn missing_source_is_io_error() {
    let tmp = TempDir::new().unwrap();
    let mut builder = ArchiveBuilder::new(Vec::new());
    let err = builder
        .add(
            &CancellationToken::new(),
            &tmp.path().join("absent"),
            Path::new("app"),
            &Filters::new(),
        )
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Io { .. }));
}

#[test]
fn base_prefixes_walks_and_files() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.txt"), "a").unwrap();

    let mut builder = ArchiveBuilder::new(Vec::new()).with_base("ctx").unwrap();
    builder
        .add(&CancellationToken::new(), tmp.path(), Path::new("app"), &Filters::new())
        .unwrap();
    builder.add_file(b"#!/bin/sh\n", "run.sh", 0o755).unwrap();

    let mut archive = tar::Archive::new(Cursor::new(builder.close().unwrap()));
    let entries: Vec<(String, u32)> = archive
        .entries()
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().trim_end_matches('/').to_owned();
            (name, e.header().mode().unwrap())
        })
        .collect();

    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["ctx/app", "ctx/app/a.txt", "ctx/run.sh"]);
    assert_eq!(entries[2].1, 0o755);
}

#[test]
fn file_backed_builder_writes_archive() {
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("context.tar");

    let mut builder = ArchiveBuilder::create(&target).unwrap();
    builder.add_file(b"hello", "hello.txt", 0o644).unwrap();
    builder.close().unwrap();

    let bytes = std::fs::read(&target).unwrap();
    assert_eq!(record_names(bytes), vec!["hello.txt"]);
}

#[test]
fn embedded_assets_land_at_context_root() {
    let mut builder = ArchiveBuilder::new(Vec::new());
    add_assets(&mut builder).unwrap();
    let names = record_names(builder.close().unwrap());
    assert_eq!(names, vec!["Dockerfile", "staging.sh", "launch.sh"]);
}

#[test]
fn dockerfile_declares_staging_arguments() {
    let dockerfile = stagehand_build::ASSETS
        .iter()
        .find(|a| a.name == stagehand_build::DOCKERFILE)
        .unwrap();
    let text = std::str::from_utf8(dockerfile.data).unwrap();
    for arg in [
        "BASE",
        "CONTEXT_DIR",
        "BUILDPACKS_DIR",
        "APP_BITS",
        "APP_NAME",
        "APP_CREATED",
        "APP_VERSION",
        "APP_PORT",
        "CF_MANIFEST",
        "CF_API",
        "CF_ORG",
        "CF_SPACE",
    ] {
        assert!(text.contains(&format!("ARG {arg}")), "missing ARG {arg}");
    }
}

#[cfg(unix)]
#[test]
fn symlinks_are_recorded_not_followed() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("real.txt"), "data").unwrap();
    std::os::unix::fs::symlink("real.txt", tmp.path().join("link.txt")).unwrap();

    let mut builder = ArchiveBuilder::new(Vec::new());
    builder
        .add(&CancellationToken::new(), tmp.path(), Path::new("app"), &Filters::new())
        .unwrap();
    let mut archive = tar::Archive::new(Cursor::new(builder.close().unwrap()));
    let link = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap())
        .find(|e| e.path().unwrap().ends_with("link.txt"))
        .map(|e| e.header().entry_type())
        .unwrap();
    assert_eq!(link, tar::EntryType::Symlink);
}

#[test]
fn unpack_restores_tree() {
    let src = TempDir::new().unwrap();
    app_tree(src.path());
    let mut builder = ArchiveBuilder::new(Vec::new());
    builder
        .add(&CancellationToken::new(), src.path(), Path::new("app"), &Filters::new())
        .unwrap();
    builder.add_file(b"#!/bin/sh\n", "bin/run.sh", 0o750).unwrap();
    let archive = builder.close().unwrap();

    let dest = TempDir::new().unwrap();
    let extracted = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap();
    assert_eq!(extracted, 11);
    assert_eq!(
        std::fs::read_to_string(dest.path().join("app/Procfile")).unwrap(),
        "web: python app.py\n"
    );
    assert!(dest.path().join("app/src/nested/deep.py").is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dest.path().join("bin/run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}

#[test]
fn unpack_rejects_escaping_paths() {
    let mut header = tar::Header::new_gnu();
    let name = b"../evil.txt";
    header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_cksum();
    let mut raw = tar::Builder::new(Vec::new());
    raw.append(&header, &b"evil"[..]).unwrap();
    let archive = raw.into_inner().unwrap();

    let dest = TempDir::new().unwrap();
    let err = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap_err();
    assert!(matches!(err, ArchiveError::UnsafePath { .. }));
    assert!(!dest.path().parent().unwrap().join("evil.txt").exists());
}

fn link_archive(links: &[(&str, tar::EntryType, &Path)], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut raw = tar::Builder::new(Vec::new());
    for (name, kind, target) in links {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(*kind);
        header.set_size(0);
        header.set_mode(0o777);
        raw.append_link(&mut header, name, target).unwrap();
    }
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        raw.append_data(&mut header, name, *data).unwrap();
    }
    raw.into_inner().unwrap()
}

#[cfg(unix)]
#[test]
fn unpack_refuses_symlink_to_outside_directory() {
    let outside = TempDir::new().unwrap();
    let archive = link_archive(
        &[("escape", tar::EntryType::Symlink, outside.path())],
        &[("escape/pwned.txt", &b"owned"[..])],
    );

    let dest = TempDir::new().unwrap();
    let err = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap_err();
    assert!(matches!(err, ArchiveError::UnsafePath { .. }));
    assert!(!outside.path().join("pwned.txt").exists());
}

#[cfg(unix)]
#[test]
fn unpack_refuses_relative_symlink_leaving_root() {
    let archive = link_archive(
        &[("app/up", tar::EntryType::Symlink, Path::new("../../etc"))],
        &[],
    );

    let dest = TempDir::new().unwrap();
    let err = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap_err();
    assert!(matches!(err, ArchiveError::UnsafePath { .. }));
    assert!(std::fs::symlink_metadata(dest.path().join("app/up")).is_err());
}

#[cfg(unix)]
#[test]
fn unpack_never_writes_through_an_extracted_symlink() {
    // The link itself stays inside, but files must not be written through it
    let archive = link_archive(
        &[("alias", tar::EntryType::Symlink, Path::new("real"))],
        &[("real/keep.txt", &b"keep"[..]), ("alias/sneak.txt", &b"sneak"[..])],
    );

    let dest = TempDir::new().unwrap();
    let err = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap_err();
    assert!(matches!(err, ArchiveError::UnsafePath { ref path } if path == Path::new("alias/sneak.txt")));
    assert!(dest.path().join("real/keep.txt").is_file());
    assert!(!dest.path().join("real/sneak.txt").exists());
}

#[cfg(unix)]
#[test]
fn unpack_keeps_links_inside_root() {
    let archive = {
        let mut raw = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(4);
        header.set_mode(0o644);
        raw.append_data(&mut header, "app/Procfile", &b"web:"[..]).unwrap();
        for (name, kind, target) in [
            ("app/current", tar::EntryType::Symlink, "Procfile"),
            ("app/copy", tar::EntryType::Link, "app/Procfile"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(kind);
            header.set_size(0);
            header.set_mode(0o777);
            raw.append_link(&mut header, name, target).unwrap();
        }
        raw.into_inner().unwrap()
    };

    let dest = TempDir::new().unwrap();
    let extracted = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap();
    assert_eq!(extracted, 3);
    assert_eq!(std::fs::read_to_string(dest.path().join("app/current")).unwrap(), "web:");
    assert_eq!(std::fs::read_to_string(dest.path().join("app/copy")).unwrap(), "web:");
}

#[test]
fn unpack_refuses_hard_link_leaving_root() {
    let archive = link_archive(
        &[("app/passwd", tar::EntryType::Link, Path::new("../../etc/passwd"))],
        &[],
    );

    let dest = TempDir::new().unwrap();
    let err = unpack(&CancellationToken::new(), Cursor::new(archive), dest.path()).unwrap_err();
    assert!(matches!(err, ArchiveError::UnsafePath { .. }));
    assert!(!dest.path().join("app/passwd").exists());
}

#[test]
fn unpack_honours_cancellation() {
    let mut builder = ArchiveBuilder::new(Vec::new());
    builder.add_file(b"a", "a.txt", 0o644).unwrap();
    let archive = builder.close().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let dest = TempDir::new().unwrap();
    let err = unpack(&cancel, Cursor::new(archive), dest.path()).unwrap_err();
    assert!(matches!(err, ArchiveError::Cancelled));
    assert!(!dest.path().join("a.txt").exists());
}

fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,6}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn records_stay_under_destination(
        files in prop::collection::vec(prop::collection::vec(segment(), 1..4), 1..6),
        dest in prop::collection::vec(segment(), 1..3),
        exclude in prop::option::of(segment()),
    ) {
        let tmp = TempDir::new().unwrap();
        for parts in &files {
            let path: PathBuf = parts.iter().collect();
            let full = tmp.path().join(&path);
            // A segment may already exist as a file from an earlier path
            if let Some(parent) = full.parent() {
                if std::fs::create_dir_all(parent).is_err() {
                    continue;
                }
            }
            if !full.exists() {
                std::fs::write(&full, "x").unwrap();
            }
        }

        let mut filters = Filters::new();
        if let Some(pattern) = &exclude {
            filters = filters.exclude_dirs(pattern).unwrap();
        }
        let dest_path: PathBuf = dest.iter().collect();
        let names = pack(tmp.path(), &dest_path.to_string_lossy(), &filters);

        for name in names {
            prop_assert!(Path::new(&name).starts_with(&dest_path), "{name} escapes {}", dest_path.display());
            prop_assert!(!name.contains(".."));
        }
    }
}
