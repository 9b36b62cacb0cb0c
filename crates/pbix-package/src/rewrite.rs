//! Copy-all-but-one archive rewriting.
//!
//! A rewrite is a three-step pipeline:
//! 1. open the source package and read its central directory ([`open_package`])
//! 2. build a new archive entry by entry ([`rewrite_archive`]); unchanged entries are copied with
//!    `ZipWriter::raw_copy_file`, so their compressed bytes and metadata are preserved exactly
//! 3. swap the new archive over the original path ([`rewrite_package_file`])
//!
//! The source handle is owned by the write step and dropped before the rename, on success and on
//! every error path.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::error::{FormatError, PackageError};
use crate::zip_util::entry_names_equivalent;

/// An entry to append at the end of the rewritten archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl NewEntry {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// What to drop from, and what to add to, an archive.
///
/// Entry names are matched the way package readers resolve them (ASCII case-insensitive, `\` and
/// `/` interchangeable, leading separators ignored). Every source entry equivalent to `exclude` is
/// dropped. Source entries equivalent to the appended entry's name are dropped as well, so the
/// output never holds two entries a reader could confuse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewritePlan {
    pub exclude: Option<String>,
    pub append: Option<NewEntry>,
}

impl RewritePlan {
    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            exclude: Some(name.into()),
            append: None,
        }
    }

    pub fn replace(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let name = name.into();
        Self {
            exclude: Some(name.clone()),
            append: Some(NewEntry::new(name, bytes)),
        }
    }

    fn drops(&self, entry_name: &str) -> bool {
        let excluded = self
            .exclude
            .as_deref()
            .is_some_and(|name| entry_names_equivalent(entry_name, name));
        let shadowed = self
            .append
            .as_ref()
            .is_some_and(|entry| entry_names_equivalent(entry_name, &entry.name));
        excluded || shadowed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Source entries raw-copied into the output.
    pub copied: usize,
    /// Source entries dropped because they matched the plan.
    pub removed: usize,
    /// Whether a new entry was written after the copied ones.
    pub appended: bool,
}

/// Open a package for reading, surfacing a missing file or a broken central directory as a
/// format error.
pub fn open_package(path: &Path) -> Result<ZipArchive<File>, PackageError> {
    let file = File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            PackageError::Format(FormatError::Missing {
                path: path.to_path_buf(),
                source,
            })
        } else {
            PackageError::Io(source)
        }
    })?;
    ZipArchive::new(file).map_err(|err| FormatError::Zip(err).into())
}

fn appended_entry_options() -> SimpleFileOptions {
    // A fixed timestamp keeps the output a pure function of the input archive and the plan.
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
}

/// Write `archive` to `output` with the plan applied.
///
/// Entries are visited in source order. The archive comment is carried over.
pub fn rewrite_archive<R: Read + Seek, W: Write + Seek>(
    archive: &mut ZipArchive<R>,
    output: W,
    plan: &RewritePlan,
) -> Result<RewriteSummary, PackageError> {
    let mut summary = RewriteSummary::default();
    let mut zip = ZipWriter::new(output);
    zip.set_raw_comment(archive.comment().to_vec().into_boxed_slice());

    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        if plan.drops(file.name()) {
            log::debug!("dropping entry {}", file.name());
            summary.removed += 1;
            continue;
        }
        zip.raw_copy_file(file)?;
        summary.copied += 1;
    }

    if let Some(entry) = &plan.append {
        log::debug!("appending entry {} ({} bytes)", entry.name, entry.bytes.len());
        zip.start_file(entry.name.as_str(), appended_entry_options())?;
        zip.write_all(&entry.bytes)?;
        summary.appended = true;
    }

    zip.finish()?;
    Ok(summary)
}

/// Apply `plan` to the package at `path`, replacing it atomically.
///
/// On any error the file at `path` is left exactly as it was and no temp file remains.
///
/// Callers must serialize rewrites of the same path; concurrent rewrites race on the final rename.
pub fn rewrite_package_file(
    path: impl AsRef<Path>,
    plan: &RewritePlan,
) -> Result<RewriteSummary, PackageError> {
    rewrite_package_file_with(path.as_ref(), |mut archive, out| {
        rewrite_archive(&mut archive, out, plan)
    })
}

/// Shared body of [`rewrite_package_file`]; `write` receives the opened source archive by value so
/// the source handle is closed as soon as it returns.
pub(crate) fn rewrite_package_file_with<F>(
    path: &Path,
    write: F,
) -> Result<RewriteSummary, PackageError>
where
    F: FnOnce(ZipArchive<File>, &mut File) -> Result<RewriteSummary, PackageError>,
{
    let archive = open_package(path)?;
    log::debug!(
        "rewriting {} ({} entries)",
        path.display(),
        archive.len()
    );

    pbix_fs::atomic_write(path, move |out| write(archive, out)).map_err(|err| match err {
        pbix_fs::AtomicWriteError::Io(err) => PackageError::Io(err),
        pbix_fs::AtomicWriteError::Writer(err) => err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{self, Cursor, SeekFrom};

    use pretty_assertions::assert_eq;
    use zip::write::FileOptions;

    fn build_zip(entries: &[(&str, CompressionMethod, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, method, bytes) in entries {
            let options = FileOptions::<()>::default().compression_method(*method);
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        archive.file_names().map(str::to_string).collect()
    }

    fn read_entry(bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    fn rewrite_bytes(input: &[u8], plan: &RewritePlan) -> (Vec<u8>, RewriteSummary) {
        let mut archive = ZipArchive::new(Cursor::new(input)).unwrap();
        let mut out = Cursor::new(Vec::new());
        let summary = rewrite_archive(&mut archive, &mut out, plan).unwrap();
        (out.into_inner(), summary)
    }

    #[test]
    fn removes_excluded_entry_and_keeps_order() {
        let input = build_zip(&[
            ("Version", CompressionMethod::Stored, b"1.28"),
            ("Connections", CompressionMethod::Deflated, b"{}"),
            ("Report/Layout", CompressionMethod::Deflated, b"layout"),
        ]);
        let (output, summary) = rewrite_bytes(&input, &RewritePlan::remove("Connections"));

        assert_eq!(entry_names(&output), vec!["Version", "Report/Layout"]);
        assert_eq!(
            summary,
            RewriteSummary {
                copied: 2,
                removed: 1,
                appended: false
            }
        );
    }

    #[test]
    fn missing_exclusion_copies_everything() {
        let input = build_zip(&[
            ("Version", CompressionMethod::Stored, b"1.28"),
            ("DataModel", CompressionMethod::Stored, b"model"),
        ]);
        let (output, summary) = rewrite_bytes(&input, &RewritePlan::remove("Connections"));
        assert_eq!(entry_names(&output), vec!["Version", "DataModel"]);
        assert_eq!(summary.removed, 0);
        assert_eq!(summary.copied, 2);
    }

    #[test]
    fn replace_appends_new_entry_last() {
        let input = build_zip(&[
            ("Connections", CompressionMethod::Deflated, b"old"),
            ("Version", CompressionMethod::Stored, b"1.28"),
        ]);
        let (output, summary) = rewrite_bytes(&input, &RewritePlan::replace("Connections", "new"));

        assert_eq!(entry_names(&output), vec!["Version", "Connections"]);
        assert_eq!(read_entry(&output, "Connections"), b"new");
        assert!(summary.appended);
    }

    #[test]
    fn appended_name_shadows_equivalent_source_entries() {
        let input = build_zip(&[
            ("connections", CompressionMethod::Deflated, b"lower"),
            ("Version", CompressionMethod::Stored, b"1.28"),
        ]);
        let plan = RewritePlan {
            exclude: None,
            append: Some(NewEntry::new("Connections", "new")),
        };
        let (output, summary) = rewrite_bytes(&input, &plan);

        assert_eq!(entry_names(&output), vec!["Version", "Connections"]);
        assert_eq!(summary.removed, 1);
    }

    #[test]
    fn carries_archive_comment() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.set_comment("exported");
        zip.start_file("Version", FileOptions::<()>::default()).unwrap();
        zip.write_all(b"1.28").unwrap();
        let input = zip.finish().unwrap().into_inner();

        let (output, _) = rewrite_bytes(&input, &RewritePlan::default());
        let archive = ZipArchive::new(Cursor::new(output)).unwrap();
        assert_eq!(archive.comment(), b"exported");
    }

    /// Writer that fails once `budget` bytes have been written.
    struct FailAfter<'a> {
        inner: &'a mut File,
        budget: usize,
    }

    impl Write for FailAfter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() > self.budget {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.budget -= buf.len();
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FailAfter<'_> {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn write_failure_leaves_original_untouched() {
        let big = vec![7u8; 64 * 1024];
        let input = build_zip(&[
            ("Version", CompressionMethod::Stored, b"1.28"),
            ("DataModel", CompressionMethod::Stored, &big),
            ("Connections", CompressionMethod::Deflated, b"{}"),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pbix");
        std::fs::write(&path, &input).unwrap();

        let plan = RewritePlan::replace("Connections", "new");
        let err = rewrite_package_file_with(&path, |mut archive, out| {
            let out = FailAfter {
                inner: out,
                budget: 1024,
            };
            rewrite_archive(&mut archive, out, &plan)
        })
        .unwrap_err();
        assert!(err.is_io(), "expected io error, got {err:?}");

        assert_eq!(std::fs::read(&path).unwrap(), input);
        let leftovers = pbix_fs::stale_temp_files(dir.path()).unwrap();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }
}
