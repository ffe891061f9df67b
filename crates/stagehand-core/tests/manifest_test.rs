use stagehand_core::CfManifest;
use tempfile::TempDir;

const MANIFEST: &str = r#"
applications:
- name: web
  memory: 512M
  instances: 2
  buildpacks:
  - python_buildpack
  env:
    DEBUG: true
    WORKERS: 4
    GREETING: hello
  routes:
  - route: web.apps.example.com
  - route: www.example.com
- name: worker
  buildpack: binary_buildpack
  buildpacks: [ignored_buildpack]
  no-route: true
  path: worker
- name: preview
  random-route: true
"#;

fn write_manifest(dir: &std::path::Path, name: &str) {
    std::fs::write(dir.join(name), MANIFEST).unwrap();
}

#[test]
fn discovers_manifest_yml() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "manifest.yml");

    let manifest = CfManifest::discover(tmp.path(), None).unwrap();
    assert_eq!(manifest.application_names(), vec!["web", "worker", "preview"]);
    assert_eq!(manifest.path(), tmp.path().join("manifest.yml"));
}

#[test]
fn discovers_manifest_yaml_fallback() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "manifest.yaml");

    let manifest = CfManifest::discover(tmp.path(), None).unwrap();
    assert_eq!(manifest.filename, "manifest.yaml");
}

#[test]
fn explicit_filename_is_the_only_candidate() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "manifest.yml");

    let err = CfManifest::discover(tmp.path(), Some("cf.yml")).unwrap_err();
    assert!(matches!(err, stagehand_core::Error::ManifestNotFound { .. }));
}

#[test]
fn missing_manifest_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let err = CfManifest::discover(tmp.path(), None).unwrap_err();
    assert!(matches!(err, stagehand_core::Error::ManifestNotFound { .. }));
}

#[test]
fn empty_manifest_is_rejected() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("manifest.yml"), "applications: []\n").unwrap();

    let err = CfManifest::discover(tmp.path(), None).unwrap_err();
    assert!(matches!(err, stagehand_core::Error::ManifestEmpty { .. }));
}

#[test]
fn malformed_manifest_is_parse_error() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("manifest.yml"), "applications: {{{").unwrap();

    let err = CfManifest::discover(tmp.path(), None).unwrap_err();
    assert!(matches!(err, stagehand_core::Error::ManifestParse { .. }));
}

#[test]
fn application_fields() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "manifest.yml");
    let manifest = CfManifest::discover(tmp.path(), None).unwrap();

    let web = manifest.application("web").unwrap();
    assert_eq!(web.memory_bytes().unwrap(), 512 * 1024 * 1024);
    assert_eq!(web.instances, Some(2));
    assert_eq!(web.buildpacks(), vec!["python_buildpack"]);
    let env = web.env_strings();
    assert_eq!(env["DEBUG"], "true");
    assert_eq!(env["WORKERS"], "4");
    assert_eq!(env["GREETING"], "hello");
    assert_eq!(
        web.routes("local"),
        Some(vec![
            "web.apps.example.com".to_owned(),
            "www.example.com".to_owned()
        ])
    );

    let worker = manifest.application("worker").unwrap();
    assert_eq!(worker.buildpacks(), vec!["binary_buildpack"]);
    assert_eq!(worker.routes("local"), Some(Vec::new()));
    assert_eq!(worker.memory_bytes().unwrap(), 1024 * 1024 * 1024);
}

#[test]
fn random_route_is_deterministic_uuid() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "manifest.yml");
    let manifest = CfManifest::discover(tmp.path(), None).unwrap();
    let preview = manifest.application("preview").unwrap();

    let first = preview.routes("local").unwrap();
    let second = preview.routes("local").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);

    let host = first[0].strip_suffix(".local").unwrap();
    let groups: Vec<&str> = host.split('-').collect();
    assert_eq!(
        groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
        vec![8, 4, 4, 4, 12]
    );
    // Version nibble
    assert!(groups[2].starts_with('3'));
    assert_ne!(preview.route_uuid("local"), preview.route_uuid("other"));
}

#[test]
fn unknown_application_lists_declared_names() {
    let tmp = TempDir::new().unwrap();
    write_manifest(tmp.path(), "manifest.yml");
    let manifest = CfManifest::discover(tmp.path(), None).unwrap();

    let err = manifest.application("db").unwrap_err().to_string();
    assert!(err.contains("'db'"));
    assert!(err.contains("web, worker, preview"));
}
