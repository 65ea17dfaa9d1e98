//! Pipeline config load errors, path resolution, and schema defaults.

use std::path::PathBuf;

use assert_fs::prelude::*;
use kelp_core::{config, ConfigError, ImageName};
use predicates::prelude::*;
use rstest::rstest;

const MINIMAL: &str = r#"
apiVersion: kelp/v1
build:
  artifacts:
    - image: web
      context: ./web
      sync:
        - src: static
          dest: /app/static
    - image: api
      context: services/api
      docker:
        dockerfile: Dockerfile.dev
        buildArgs:
          PROFILE: debug
        target: dev
      test:
        commands: ["make test"]
        paths: [tests]
deploy:
  kubectl:
    manifests: [k8s, ../shared/ns.yaml]
    defaultNamespace: dev
  namespaces: [test]
"#;

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(&dir.path().join("kelp.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("kelp.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("kelp.yaml");
    file.write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("kelp.yaml"));
}

#[rstest]
#[case("apiVersion: skaffold/v2\n", "skaffold/v2")]
#[case("apiVersion: kelp/v0\n", "kelp/v0")]
fn load_rejects_unknown_api_version(#[case] yaml: &str, #[case] found: &str) {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("kelp.yaml");
    file.write_str(yaml).expect("write");

    let err = config::load_at(file.path()).unwrap_err();
    assert!(
        predicate::str::contains(found).eval(&err.to_string()),
        "got: {err}"
    );
}

#[test]
fn load_rejects_duplicate_image_names() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("kelp.yaml");
    file.write_str(
        "apiVersion: kelp/v1\nbuild:\n  artifacts:\n    - image: app\n    - image: app\n",
    )
    .expect("write");

    let err = config::load_at(file.path()).unwrap_err();
    match err {
        ConfigError::DuplicateImage { image } => assert_eq!(image, ImageName::from("app")),
        other => panic!("expected duplicate image, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 2. Successful load
// ---------------------------------------------------------------------------

#[test]
fn load_resolves_paths_against_config_dir() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let project = dir.child("project");
    project.create_dir_all().expect("mkdir");
    let file = project.child("kelp.yaml");
    file.write_str(MINIMAL).expect("write");

    let cfg = config::load_at(file.path()).expect("load");
    let root = project.path().to_path_buf();

    assert_eq!(cfg.build.artifacts[0].context, root.join("web"));
    assert_eq!(cfg.build.artifacts[1].context, root.join("services").join("api"));
    assert_eq!(
        cfg.manifests(),
        [root.join("k8s"), dir.path().join("shared").join("ns.yaml")]
    );
    // Sync and test paths stay relative to the artifact context.
    assert_eq!(cfg.build.artifacts[0].sync[0].src, PathBuf::from("static"));
}

#[test]
fn load_applies_schema_defaults() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("kelp.yaml");
    file.write_str(MINIMAL).expect("write");

    let cfg = config::load_at(file.path()).expect("load");
    let web = cfg.artifact(&ImageName::from("web")).expect("web");
    assert_eq!(web.docker.dockerfile, PathBuf::from("Dockerfile"));
    assert!(web.test.is_none());

    let api = cfg.artifact(&ImageName::from("api")).expect("api");
    assert_eq!(api.docker.target.as_deref(), Some("dev"));
    assert_eq!(api.docker.build_args["PROFILE"], "debug");
    assert_eq!(api.test_commands(), ["make test".to_string()]);

    assert!(!cfg.build.push);
    assert_eq!(cfg.status_check_deadline().as_secs(), 600);
    assert_eq!(
        cfg.configured_namespaces(),
        vec!["test".to_string(), "dev".to_string()]
    );
}

#[test]
fn test_config_is_reachable_from_crate_root() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("kelp.yaml");
    file.write_str(MINIMAL).expect("write");

    let cfg = config::load_at(file.path()).expect("load");
    let api = cfg.artifact(&ImageName::from("api")).expect("api");
    let expected = kelp_core::TestConfig {
        commands: vec!["make test".to_string()],
        paths: vec![PathBuf::from("tests")],
    };
    assert_eq!(api.test.as_ref(), Some(&expected));
}
