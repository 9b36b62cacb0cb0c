use std::path::PathBuf;

use zip::result::ZipError;

/// Reasons a package (or the connection descriptor inside it) could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("package not found: {}", path.display())]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[source] ZipError),
    #[error("connection descriptor is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid connection descriptor: {0}")]
    Descriptor(String),
    #[error(
        "connection entry {part} is too large to load safely: {size} bytes (max {max} bytes)"
    )]
    PartTooLarge { part: String, size: u64, max: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// The input is not a readable package, or its connection entry is malformed.
    #[error("invalid package: {0}")]
    Format(#[from] FormatError),
    /// Read/write/rename failure at the filesystem boundary.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A required identifier was missing or blank.
    #[error("{field} must not be empty")]
    Validation { field: &'static str },
}

impl From<ZipError> for PackageError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(err) => Self::Io(err),
            other => Self::Format(FormatError::Zip(other)),
        }
    }
}

impl PackageError {
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format(_))
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
