//! Source archive conversion.
//!
//! Azure DevOps only serves zip archives; module ingestion expects
//! tar+gzip. Conversion happens in-process with a hard cap of 500 MiB per
//! uncompressed entry so a hostile archive cannot expand without bound.

use std::io::{Cursor, Read, Write};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{BaliseError, Result};

/// Maximum uncompressed size of a single archive entry.
pub const MAX_ENTRY_SIZE: u64 = 500 * 1024 * 1024;

/// Convert a zip archive into a tar+gzip archive.
///
/// Entry paths are taken from the zip's sanitized (enclosed) names;
/// entries escaping the archive root are rejected.
///
/// # Errors
///
/// Returns `ArchiveFormatInvalid` when the zip cannot be read, an entry
/// escapes the root, or an entry exceeds [`MAX_ENTRY_SIZE`] uncompressed.
pub fn zip_to_tar_gz(zip_bytes: &[u8]) -> Result<Bytes> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes)).map_err(|e| {
        BaliseError::ArchiveFormatInvalid {
            message: format!("not a readable zip archive: {e}"),
        }
    })?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| BaliseError::ArchiveFormatInvalid {
            message: format!("zip entry {index}: {e}"),
        })?;

        let Some(path) = entry.enclosed_name() else {
            return Err(BaliseError::ArchiveFormatInvalid {
                message: format!("zip entry '{}' escapes the archive root", entry.name()),
            });
        };
        let path = path.to_path_buf();

        if entry.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, &path, std::io::empty())
                .map_err(tar_error)?;
            continue;
        }

        if entry.size() > MAX_ENTRY_SIZE {
            return Err(BaliseError::ArchiveFormatInvalid {
                message: format!(
                    "zip entry '{}' declares {} bytes, above the {} byte cap",
                    entry.name(),
                    entry.size(),
                    MAX_ENTRY_SIZE
                ),
            });
        }

        // Trust the header only so far: read at most cap + 1 bytes and
        // reject anything that keeps going.
        let mut content = Vec::with_capacity(entry.size() as usize);
        let read = entry
            .by_ref()
            .take(MAX_ENTRY_SIZE + 1)
            .read_to_end(&mut content)
            .map_err(|e| BaliseError::ArchiveFormatInvalid {
                message: format!("zip entry read failed: {e}"),
            })?;
        if read as u64 > MAX_ENTRY_SIZE {
            return Err(BaliseError::ArchiveFormatInvalid {
                message: format!("zip entry '{}' exceeds the uncompressed size cap", path.display()),
            });
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(if entry.unix_mode().is_some_and(|m| m & 0o111 != 0) {
            0o755
        } else {
            0o644
        });
        header.set_cksum();
        builder
            .append_data(&mut header, &path, Cursor::new(content))
            .map_err(tar_error)?;
    }

    let encoder = builder.into_inner().map_err(tar_error)?;
    let compressed = encoder.finish().map_err(tar_error)?;
    Ok(Bytes::from(compressed))
}

fn tar_error(e: std::io::Error) -> BaliseError {
    BaliseError::ArchiveFormatInvalid {
        message: format!("tar assembly failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn sample_zip() -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.add_directory("module/", options).unwrap();
            writer.start_file("module/main.tf", options).unwrap();
            writer.write_all(b"resource \"null_resource\" \"x\" {}\n").unwrap();
            writer.start_file("module/variables.tf", options).unwrap();
            writer.write_all(b"variable \"name\" {}\n").unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn converts_zip_entries_into_tar_entries() {
        let tar_gz = zip_to_tar_gz(&sample_zip()).unwrap();

        let mut tar_bytes = Vec::new();
        GzDecoder::new(&tar_gz[..]).read_to_end(&mut tar_bytes).unwrap();
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"module/main.tf".to_string()));
        assert!(names.contains(&"module/variables.tf".to_string()));
    }

    #[test]
    fn rejects_garbage_input() {
        let err = zip_to_tar_gz(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, BaliseError::ArchiveFormatInvalid { .. }));
    }

    #[test]
    fn rejects_entries_escaping_the_root() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("../outside.txt", options).unwrap();
            writer.write_all(b"escape").unwrap();
            writer.finish().unwrap();
        }
        let err = zip_to_tar_gz(&buf.into_inner()).unwrap_err();
        assert!(matches!(err, BaliseError::ArchiveFormatInvalid { .. }));
    }
}
