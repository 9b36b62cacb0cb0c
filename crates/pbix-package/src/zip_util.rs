use std::io::{Read, Seek};

use zip::read::ZipFile;
use zip::ZipArchive;

use crate::error::{FormatError, PackageError};

/// Default maximum uncompressed size accepted for the connection entry when it is inflated into
/// memory. Real descriptors are a few hundred bytes; anything near this limit is forged metadata.
pub(crate) const DEFAULT_MAX_CONNECTION_PART_BYTES: u64 = 16 * 1024 * 1024; // 16MiB

/// Compare two ZIP entry names the way package readers resolve them: percent-decoded, ASCII
/// case-insensitive, `\` treated as `/`, leading separators ignored.
pub(crate) fn entry_names_equivalent(a: &str, b: &str) -> bool {
    let mut a = NormalizedName::new(a);
    let mut b = NormalizedName::new(b);
    loop {
        match (a.next(), b.next()) {
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct NormalizedName<'a> {
    bytes: &'a [u8],
    in_leading_separators: bool,
}

impl<'a> NormalizedName<'a> {
    fn new(s: &'a str) -> Self {
        Self {
            bytes: s.as_bytes(),
            in_leading_separators: true,
        }
    }
}

impl Iterator for NormalizedName<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        fn hex_val(b: u8) -> Option<u8> {
            match b {
                b'0'..=b'9' => Some(b - b'0'),
                b'a'..=b'f' => Some(b - b'a' + 10),
                b'A'..=b'F' => Some(b - b'A' + 10),
                _ => None,
            }
        }

        loop {
            let b = *self.bytes.first()?;
            let decoded = match self.bytes {
                [b'%', hi, lo, ..] => match (hex_val(*hi), hex_val(*lo)) {
                    (Some(hi), Some(lo)) => {
                        self.bytes = &self.bytes[3..];
                        (hi << 4) | lo
                    }
                    _ => {
                        self.bytes = &self.bytes[1..];
                        b
                    }
                },
                _ => {
                    self.bytes = &self.bytes[1..];
                    b
                }
            };

            // Skip any number of leading `/` or `\` separators, even when percent-encoded.
            if self.in_leading_separators && matches!(decoded, b'/' | b'\\') {
                continue;
            }
            self.in_leading_separators = false;

            return Some(if decoded == b'\\' {
                b'/'
            } else {
                decoded.to_ascii_lowercase()
            });
        }
    }
}

/// Find the index of the entry that best matches `name`.
///
/// An exact name match wins over an equivalent one; among equivalent names the first in central
/// directory order is used.
pub(crate) fn find_entry_index<R: Read + Seek>(
    archive: &ZipArchive<R>,
    name: &str,
) -> Option<usize> {
    let mut equivalent = None;
    for (idx, entry) in archive.file_names().enumerate() {
        if entry == name {
            return Some(idx);
        }
        if equivalent.is_none() && entry_names_equivalent(entry, name) {
            equivalent = Some(idx);
        }
    }
    equivalent
}

/// Count entries whose names are equivalent to `name`.
pub(crate) fn count_equivalent_entries<R: Read + Seek>(
    archive: &ZipArchive<R>,
    name: &str,
) -> usize {
    archive
        .file_names()
        .filter(|entry| entry_names_equivalent(entry, name))
        .count()
}

/// Read a ZIP entry into memory with an uncompressed size limit.
///
/// The declared size is checked first, then the read itself is capped at `max_bytes + 1` so a
/// forged size field cannot make us inflate more than the limit.
pub(crate) fn read_entry_with_limit<R: Read>(
    file: &mut ZipFile<'_, R>,
    max_bytes: u64,
) -> Result<Vec<u8>, PackageError> {
    let part = file.name().to_string();
    let declared = file.size();
    if declared > max_bytes {
        return Err(FormatError::PartTooLarge {
            part,
            size: declared,
            max: max_bytes,
        }
        .into());
    }

    let mut buf = Vec::new();
    file.take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)?;
    let observed = buf.len() as u64;
    if observed > max_bytes {
        return Err(FormatError::PartTooLarge {
            part,
            size: observed,
            max: max_bytes,
        }
        .into());
    }
    Ok(buf)
}
