//! Strip and rebind the live connection embedded in PowerBI report packages (`.pbix`).
//!
//! A package is a ZIP archive. Its `Connections` entry, when present, binds the report to a
//! dataset hosted in a remote workspace. [`strip`] removes that entry so the package can be shipped
//! as a template; [`bind`] replaces it with a descriptor pointing at a given workspace and
//! dataset. Every other entry is copied without being decompressed, and the package file is
//! replaced atomically: a failed call leaves it exactly as it was.
//!
//! Callers must not rewrite the same package from two places at once.

use std::path::Path;

mod connection;
mod error;
mod rewrite;
mod zip_util;

pub use connection::{
    connection_string_value, live_connection_string, parse_connection_string, ConnectionBinding,
    ConnectionDescriptor, CONNECTIONS_FORMAT_VERSION, CONNECTION_NAME, CONNECTION_TYPE,
    DATA_SOURCE, IDENTITY_PROVIDER_AUTHORITY, IDENTITY_PROVIDER_CLIENT_ID,
    IDENTITY_PROVIDER_RESOURCE, INTEGRATED_SECURITY, PBI_MODEL_VIRTUAL_SERVER_NAME,
    PBI_SERVICE_MODEL_ID,
};
pub use error::{FormatError, PackageError};
pub use rewrite::{
    open_package, rewrite_archive, rewrite_package_file, NewEntry, RewritePlan, RewriteSummary,
};

/// Name of the package entry holding the live-connection descriptor.
pub const CONNECTIONS_ENTRY_NAME: &str = "Connections";

/// Knobs for reading packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageOptions {
    /// Largest uncompressed `Connections` entry [`read_connection_with_options`] will inflate.
    pub max_connection_part_bytes: u64,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            max_connection_part_bytes: zip_util::DEFAULT_MAX_CONNECTION_PART_BYTES,
        }
    }
}

/// Remove the live connection from the package at `package_path`.
///
/// Succeeds (copying the package unchanged) when there is no connection to remove.
pub fn strip(package_path: impl AsRef<Path>) -> Result<RewriteSummary, PackageError> {
    let package_path = package_path.as_ref();
    let summary = rewrite_package_file(package_path, &RewritePlan::remove(CONNECTIONS_ENTRY_NAME))?;
    log::info!(
        "stripped {}: removed {} connection entr{}",
        package_path.display(),
        summary.removed,
        if summary.removed == 1 { "y" } else { "ies" }
    );
    Ok(summary)
}

/// Bind the package at `package_path` to `dataset_id` in `workspace_id`.
///
/// Any existing connection is replaced; afterwards the package holds exactly one. Blank
/// identifiers are rejected before the file is opened.
pub fn bind(
    package_path: impl AsRef<Path>,
    workspace_id: &str,
    dataset_id: &str,
) -> Result<RewriteSummary, PackageError> {
    validate_identifier("workspace_id", workspace_id)?;
    validate_identifier("dataset_id", dataset_id)?;

    let package_path = package_path.as_ref();
    let descriptor = ConnectionDescriptor::new(workspace_id, dataset_id);
    let plan = RewritePlan::replace(CONNECTIONS_ENTRY_NAME, descriptor.to_bytes());
    let summary = rewrite_package_file(package_path, &plan)?;
    if summary.removed > 1 {
        log::warn!(
            "{} held {} connection entries; replaced all of them",
            package_path.display(),
            summary.removed
        );
    }
    log::info!(
        "bound {} to workspace {workspace_id}, dataset {dataset_id}",
        package_path.display()
    );
    Ok(summary)
}

/// Read the binding of the package at `package_path`, or `None` when it has no connection.
pub fn read_connection(
    package_path: impl AsRef<Path>,
) -> Result<Option<ConnectionBinding>, PackageError> {
    read_connection_with_options(package_path, &PackageOptions::default())
}

pub fn read_connection_with_options(
    package_path: impl AsRef<Path>,
    options: &PackageOptions,
) -> Result<Option<ConnectionBinding>, PackageError> {
    let package_path = package_path.as_ref();
    let mut archive = open_package(package_path)?;

    let matches = zip_util::count_equivalent_entries(&archive, CONNECTIONS_ENTRY_NAME);
    if matches > 1 {
        log::warn!(
            "{} holds {matches} connection entries; reading the best match",
            package_path.display()
        );
    }
    let Some(idx) = zip_util::find_entry_index(&archive, CONNECTIONS_ENTRY_NAME) else {
        return Ok(None);
    };

    let mut file = archive.by_index(idx)?;
    let bytes = zip_util::read_entry_with_limit(&mut file, options.max_connection_part_bytes)?;
    let descriptor = ConnectionDescriptor::from_bytes(&bytes)?;
    Ok(Some(descriptor.into()))
}

fn validate_identifier(field: &'static str, value: &str) -> Result<(), PackageError> {
    if value.trim().is_empty() {
        return Err(PackageError::Validation { field });
    }
    Ok(())
}
