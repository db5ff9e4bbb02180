//! Manifest construction: walk the firmware source tree and emit a
//! deterministic, device-scoped file list with fetchable URLs.

use std::path::{Path, PathBuf};

use thiserror::Error;

use hh_common::model::{ManifestFile, OtaManifest};

/// Directory names never included in a manifest. Dot-directories are
/// excluded wholesale; `bootstrap` is the device's recovery layer and must
/// never be replaced over the air.
const DENY_DIRS: &[&str] = &["bootstrap", "__pycache__", "node_modules"];

/// File suffixes for editor backups and compiled caches.
const DENY_SUFFIXES: &[&str] = &["~", ".swp", ".swo", ".pyc", ".tmp"];

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("invalid ref {0:?}: must be a single branch or commit token")]
    BadRef(String),
    #[error("no content base URL configured")]
    NoBaseUrl,
    #[error("bus unavailable and outbound buffer full")]
    BusUnavailable,
    #[error("source enumeration failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A ref must be a single path segment: no separators, no whitespace.
pub fn validate_ref(git_ref: &str) -> Result<(), OtaError> {
    if git_ref.is_empty()
        || git_ref.contains('/')
        || git_ref.contains('\\')
        || git_ref.chars().any(char::is_whitespace)
    {
        return Err(OtaError::BadRef(git_ref.to_string()));
    }
    Ok(())
}

/// Build the manifest for one device at one ref.
///
/// Enumerates `devices/<device_id>/app/**` and `shared/**` under the
/// source root, maps each file to its device-relative path, and resolves
/// URLs as `{base}/{ref}/{repo_path}`. Entries come back sorted by
/// device-relative path.
pub fn build_manifest(
    source_root: &Path,
    base_url: &str,
    device_id: &str,
    git_ref: &str,
) -> Result<OtaManifest, OtaError> {
    validate_ref(git_ref)?;

    let base = base_url.trim_end_matches('/');
    let mut files = Vec::new();

    let app_root = source_root.join("devices").join(device_id).join("app");
    if app_root.is_dir() {
        for rel in collect_files(&app_root)? {
            let repo_path = format!("devices/{}/app/{}", device_id, rel);
            files.push(ManifestFile {
                url: format!("{}/{}/{}", base, git_ref, repo_path),
                path: format!("app/{}", rel),
            });
        }
    }

    let shared_root = source_root.join("shared");
    if shared_root.is_dir() {
        for rel in collect_files(&shared_root)? {
            let repo_path = format!("shared/{}", rel);
            files.push(ManifestFile {
                url: format!("{}/{}/{}", base, git_ref, repo_path),
                path: format!("shared/{}", rel),
            });
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files.dedup_by(|a, b| a.path == b.path);

    Ok(OtaManifest {
        git_ref: git_ref.to_string(),
        files,
    })
}

/// Recursively list files under `root` as slash-joined relative paths,
/// applying the deny rules.
fn collect_files(root: &Path) -> Result<Vec<String>, OtaError> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if name.starts_with('.') || DENY_DIRS.contains(&name.as_str()) {
                    continue;
                }
                stack.push(path);
            } else if file_type.is_file() {
                if name.starts_with('.') || DENY_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(rel);
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "devices/garage-controller/app/main.py", "app");
        write(root, "devices/garage-controller/app/door/driver.py", "drv");
        write(root, "devices/garage-controller/app/main.py~", "backup");
        write(root, "devices/garage-controller/bootstrap/boot.py", "boot");
        write(root, "devices/garage-controller/app/__pycache__/m.pyc", "cache");
        write(root, "devices/house-monitor/app/main.py", "other");
        write(root, "shared/mqtt_client.py", "shared");
        write(root, "shared/.git/config", "git");
        dir
    }

    #[test]
    fn manifest_contains_app_and_shared_sorted() {
        let tree = source_tree();
        let manifest = build_manifest(
            tree.path(),
            "https://content.example/repo",
            "garage-controller",
            "main",
        )
        .unwrap();

        let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["app/door/driver.py", "app/main.py", "shared/mqtt_client.py"]
        );

        let mut sorted = paths.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(paths, sorted, "paths must be unique and sorted");
    }

    #[test]
    fn urls_join_base_ref_and_repo_path() {
        let tree = source_tree();
        let manifest = build_manifest(
            tree.path(),
            "https://content.example/repo/",
            "garage-controller",
            "v1.4",
        )
        .unwrap();

        let main = manifest
            .files
            .iter()
            .find(|f| f.path == "app/main.py")
            .unwrap();
        assert_eq!(
            main.url,
            "https://content.example/repo/v1.4/devices/garage-controller/app/main.py"
        );
        let shared = manifest
            .files
            .iter()
            .find(|f| f.path == "shared/mqtt_client.py")
            .unwrap();
        assert_eq!(
            shared.url,
            "https://content.example/repo/v1.4/shared/mqtt_client.py"
        );
    }

    #[test]
    fn bootstrap_backups_and_caches_never_appear() {
        let tree = source_tree();
        let manifest = build_manifest(
            tree.path(),
            "https://content.example/repo",
            "garage-controller",
            "main",
        )
        .unwrap();

        for file in &manifest.files {
            assert!(!file.path.contains("bootstrap"), "{}", file.path);
            assert!(!file.path.ends_with('~'), "{}", file.path);
            assert!(!file.path.contains("__pycache__"), "{}", file.path);
            assert!(!file.path.contains(".git"), "{}", file.path);
        }
    }

    #[test]
    fn enumeration_is_deterministic() {
        let tree = source_tree();
        let a = build_manifest(tree.path(), "https://b", "garage-controller", "main").unwrap();
        let b = build_manifest(tree.path(), "https://b", "garage-controller", "main").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn refs_with_separators_or_whitespace_are_refused() {
        for bad in ["", "main/evil", "a b", "x\ty", "back\\slash"] {
            assert!(matches!(validate_ref(bad), Err(OtaError::BadRef(_))), "{bad:?}");
        }
        assert!(validate_ref("main").is_ok());
        assert!(validate_ref("3f9c2ab").is_ok());
    }

    #[test]
    fn other_devices_trees_are_not_included() {
        let tree = source_tree();
        let manifest = build_manifest(
            tree.path(),
            "https://content.example/repo",
            "garage-controller",
            "main",
        )
        .unwrap();
        assert!(
            manifest
                .files
                .iter()
                .all(|f| !f.url.contains("house-monitor"))
        );
    }
}
