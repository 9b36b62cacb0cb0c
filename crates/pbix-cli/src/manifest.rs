//! Batch manifests for `pbix-connection apply`.
//!
//! ```json
//! {
//!   "workspace_id": "0f5c...",
//!   "dataset_id": "8d1e...",
//!   "packages": [
//!     { "path": "reports/sales.pbix" },
//!     { "path": "reports/ops.pbix", "dataset_id": "77aa..." },
//!     { "path": "templates/sales.pbix", "action": "strip" }
//!   ]
//! }
//! ```
//!
//! Per-package identifiers override the top-level ones. Relative paths are resolved against the
//! directory holding the manifest.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("package {} has no {field} (set it on the package or at the top level)", package.display())]
    MissingIdentifier {
        package: PathBuf,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageAction {
    #[default]
    Bind,
    Strip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub action: PackageAction,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingManifest {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    pub packages: Vec<PackageEntry>,
}

/// One fully resolved unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Strip {
        path: PathBuf,
    },
    Bind {
        path: PathBuf,
        workspace_id: String,
        dataset_id: String,
    },
}

impl Job {
    pub fn path(&self) -> &Path {
        match self {
            Job::Strip { path } | Job::Bind { path, .. } => path,
        }
    }
}

impl BindingManifest {
    pub fn from_json(path: &Path, text: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a manifest and resolve its jobs against the manifest's directory.
    pub fn load_jobs(path: &Path) -> Result<Vec<Job>, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::from_json(path, &text)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        manifest.jobs(base_dir)
    }

    /// Resolve every entry. Fails on the first bind entry that has no usable identifiers, before
    /// any package is touched.
    pub fn jobs(&self, base_dir: &Path) -> Result<Vec<Job>, ManifestError> {
        self.packages
            .iter()
            .map(|entry| {
                let path = base_dir.join(&entry.path);
                match entry.action {
                    PackageAction::Strip => Ok(Job::Strip { path }),
                    PackageAction::Bind => {
                        let workspace_id = pick_identifier(
                            entry.workspace_id.as_deref(),
                            self.workspace_id.as_deref(),
                        )
                        .ok_or_else(|| ManifestError::MissingIdentifier {
                            package: path.clone(),
                            field: "workspace_id",
                        })?;
                        let dataset_id = pick_identifier(
                            entry.dataset_id.as_deref(),
                            self.dataset_id.as_deref(),
                        )
                        .ok_or_else(|| ManifestError::MissingIdentifier {
                            package: path.clone(),
                            field: "dataset_id",
                        })?;
                        Ok(Job::Bind {
                            path,
                            workspace_id,
                            dataset_id,
                        })
                    }
                }
            })
            .collect()
    }
}

fn pick_identifier(own: Option<&str>, fallback: Option<&str>) -> Option<String> {
    own.or(fallback)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> BindingManifest {
        BindingManifest::from_json(Path::new("manifest.json"), text).expect("parse manifest")
    }

    #[test]
    fn resolves_defaults_and_overrides() {
        let manifest = parse(
            r#"{
                "workspace_id": "ws",
                "dataset_id": "ds",
                "packages": [
                    { "path": "a.pbix" },
                    { "path": "b.pbix", "dataset_id": "ds-b" },
                    { "path": "t.pbix", "action": "strip" }
                ]
            }"#,
        );
        let jobs = manifest.jobs(Path::new("/work")).expect("jobs");
        assert_eq!(
            jobs,
            vec![
                Job::Bind {
                    path: PathBuf::from("/work/a.pbix"),
                    workspace_id: "ws".to_string(),
                    dataset_id: "ds".to_string(),
                },
                Job::Bind {
                    path: PathBuf::from("/work/b.pbix"),
                    workspace_id: "ws".to_string(),
                    dataset_id: "ds-b".to_string(),
                },
                Job::Strip {
                    path: PathBuf::from("/work/t.pbix"),
                },
            ]
        );
    }

    #[test]
    fn absolute_package_paths_ignore_base_dir() {
        let manifest = parse(r#"{ "packages": [ { "path": "/abs/t.pbix", "action": "strip" } ] }"#);
        let jobs = manifest.jobs(Path::new("/work")).expect("jobs");
        assert_eq!(jobs[0].path(), Path::new("/abs/t.pbix"));
    }

    #[test]
    fn bind_without_identifiers_is_rejected() {
        let manifest = parse(r#"{ "workspace_id": "ws", "packages": [ { "path": "a.pbix" } ] }"#);
        let err = manifest.jobs(Path::new(".")).unwrap_err();
        assert!(
            matches!(err, ManifestError::MissingIdentifier { field: "dataset_id", .. }),
            "{err}"
        );

        let manifest = parse(
            r#"{ "workspace_id": " ", "dataset_id": "ds", "packages": [ { "path": "a.pbix" } ] }"#,
        );
        let err = manifest.jobs(Path::new(".")).unwrap_err();
        assert!(
            matches!(err, ManifestError::MissingIdentifier { field: "workspace_id", .. }),
            "{err}"
        );
    }

    #[test]
    fn unknown_fields_and_actions_are_rejected() {
        let err = BindingManifest::from_json(
            Path::new("m.json"),
            r#"{ "packages": [ { "path": "a.pbix", "action": "upload" } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }), "{err}");

        let err = BindingManifest::from_json(
            Path::new("m.json"),
            r#"{ "packages": [], "base_url": "https://example.invalid" }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }), "{err}");
    }
}
