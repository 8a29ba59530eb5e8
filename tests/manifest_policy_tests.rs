#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for Questlink Session.
//!
//! These tests verify that `Cargo.toml` keeps the lint table, feature layout
//! and package metadata the project agreed on. If any test fails, the
//! manifest has drifted from that policy.
//!
//! All checks are synchronous filesystem reads; no network access or async
//! runtime needed.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Reads a file relative to the project root and returns its contents.
fn read_project_file(relative_path: &str) -> String {
    let path = project_root().join(relative_path);
    std::fs::read_to_string(&path).unwrap_or_else(|e| {
        panic!(
            "Failed to read '{}': {}. This file is required by project policy.",
            path.display(),
            e
        )
    })
}

/// Parses Cargo.toml into a table.
fn manifest() -> toml::Table {
    read_project_file("Cargo.toml")
        .parse::<toml::Table>()
        .expect("Cargo.toml must be valid TOML")
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_has_all_panic_free_lints() {
        let manifest = manifest();
        let clippy = manifest
            .get("lints")
            .and_then(|lints| lints.get("clippy"))
            .and_then(|clippy| clippy.as_table())
            .expect(
                "Cargo.toml is missing [lints.clippy] section. \
                 This section is required to declare deny-level lints for \
                 the panic-free policy.",
            );

        for lint in REQUIRED_DENY_LINTS {
            assert_eq!(
                clippy.get(*lint).and_then(|level| level.as_str()),
                Some("deny"),
                "Cargo.toml is missing `{lint} = \"deny\"` in [lints.clippy]. \
                 All panic-prone lints must be set to deny level to enforce \
                 the project's panic-free policy in library code."
            );
        }
    }

    #[test]
    fn unit_test_modules_opt_out_of_panic_lints() {
        let sources = [
            "src/session.rs",
            "src/bootstrap.rs",
            "src/connection.rs",
            "src/runtime.rs",
        ];
        for source in sources {
            let contents = read_project_file(source);
            if !contents.contains("#[cfg(test)]") {
                continue;
            }
            assert!(
                contents.contains("clippy::unwrap_used"),
                "{source} has a test module without the clippy allow list. \
                 Test modules must opt out of the panic-free lints explicitly."
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    fn features() -> toml::Table {
        manifest()
            .get("features")
            .and_then(|features| features.as_table())
            .cloned()
            .expect("Cargo.toml must declare a [features] table")
    }

    fn feature_members(name: &str) -> Vec<String> {
        features()
            .get(name)
            .and_then(|members| members.as_array())
            .unwrap_or_else(|| panic!("feature `{name}` must be declared"))
            .iter()
            .filter_map(|member| member.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn websocket_transport_is_the_only_default() {
        assert_eq!(feature_members("default"), vec!["transport-websocket"]);
    }

    #[test]
    fn optional_stacks_are_behind_features() {
        let websocket = feature_members("transport-websocket");
        assert!(websocket.contains(&"dep:tokio-tungstenite".to_string()));
        assert!(websocket.contains(&"dep:futures-util".to_string()));

        let http = feature_members("identity-http");
        assert!(http.contains(&"dep:reqwest".to_string()));
        assert!(http.contains(&"dep:url".to_string()));

        let manifest = manifest();
        let deps = manifest
            .get("dependencies")
            .and_then(|deps| deps.as_table())
            .expect("Cargo.toml must declare [dependencies]");
        for name in ["tokio-tungstenite", "futures-util", "reqwest", "url"] {
            let optional = deps
                .get(name)
                .and_then(|dep| dep.get("optional"))
                .and_then(|flag| flag.as_bool());
            assert_eq!(
                optional,
                Some(true),
                "`{name}` must stay optional so the core crate builds without it."
            );
        }
    }

    #[test]
    fn tokio_test_util_is_dev_only() {
        let manifest = manifest();
        let runtime_features = manifest["dependencies"]["tokio"]["features"]
            .as_array()
            .expect("tokio must list its features");
        assert!(
            !runtime_features
                .iter()
                .any(|feature| feature.as_str() == Some("test-util")),
            "tokio's `test-util` feature must only be enabled for tests."
        );

        let dev_features = manifest["dev-dependencies"]["tokio"]["features"]
            .as_array()
            .expect("dev tokio must list its features");
        assert!(dev_features
            .iter()
            .any(|feature| feature.as_str() == Some("test-util")));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: package_metadata
// ─────────────────────────────────────────────────────────────────────────────

mod package_metadata {
    use super::*;

    #[test]
    fn msrv_is_declared() {
        let manifest = manifest();
        let version = manifest["package"]["rust-version"]
            .as_str()
            .expect("Cargo.toml must declare a rust-version");
        assert!(
            version.split('.').count() == 3,
            "rust-version '{version}' must be a full major.minor.patch version."
        );
    }

    #[test]
    fn demos_are_registered_as_examples() {
        let manifest = manifest();
        let examples = manifest["example"]
            .as_array()
            .expect("Cargo.toml must register the demos as [[example]] targets");
        for example in examples {
            let path = example["path"].as_str().expect("example needs a path");
            assert!(
                path.starts_with("demos/"),
                "example '{path}' must live under demos/"
            );
            assert!(
                project_root().join(path).is_file(),
                "example '{path}' is registered but missing"
            );
        }
    }

    #[test]
    fn readme_exists() {
        let manifest = manifest();
        let readme = manifest["package"]["readme"]
            .as_str()
            .expect("Cargo.toml must declare a readme");
        assert!(project_root().join(readme).is_file());
    }
}
