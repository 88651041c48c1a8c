//! `h1:` package hashes over ZIP contents.
//!
//! The hash the engines use for provider pinning: for every entry in the
//! archive, sorted by name, emit the line `"<hex sha256(content)>  <name>\n"`;
//! the package hash is `"h1:" + base64(sha256(all lines))`. Identical
//! contents produce identical hashes regardless of ZIP compression or entry
//! order.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::{Error, Result};

const BUFFER_SIZE: usize = 64 * 1024;

/// Computes the `h1:` hash of a provider ZIP.
pub fn hash_zip(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io("read", path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| Error::Archive {
        file: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();

    let mut outer = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    for name in &names {
        if name.contains('\n') {
            return Err(Error::Archive {
                file: path.display().to_string(),
                reason: format!("entry name {name:?} contains a newline"),
            });
        }

        let mut entry = archive.by_name(name).map_err(|e| Error::Archive {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut entry_hasher = Sha256::new();
        loop {
            let n = entry.read(&mut buffer).map_err(|e| Error::Archive {
                file: path.display().to_string(),
                reason: format!("reading entry {name}: {e}"),
            })?;
            if n == 0 {
                break;
            }
            entry_hasher.update(&buffer[..n]);
        }

        outer.update(format!("{}  {}\n", hex::encode(entry_hasher.finalize()), name));
    }

    Ok(format!("h1:{}", BASE64.encode(outer.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn hash_has_expected_shape() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("provider.zip");
        write_zip(&path, &[("terraform-provider-null", b"binary contents")]);

        let hash = hash_zip(&path).unwrap();
        assert!(hash.starts_with("h1:"));
        // "h1:" plus 44 base64 characters of a SHA-256 digest.
        assert_eq!(hash.len(), 47);
    }

    #[test]
    fn deterministic_for_same_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        write_zip(&a, &[("x", b"one"), ("y", b"two")]);
        write_zip(&b, &[("x", b"one"), ("y", b"two")]);

        assert_eq!(hash_zip(&a).unwrap(), hash_zip(&b).unwrap());
    }

    #[test]
    fn entry_order_does_not_matter() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        write_zip(&a, &[("x", b"one"), ("y", b"two")]);
        write_zip(&b, &[("y", b"two"), ("x", b"one")]);

        assert_eq!(hash_zip(&a).unwrap(), hash_zip(&b).unwrap());
    }

    #[test]
    fn different_content_different_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        write_zip(&a, &[("x", b"one")]);
        write_zip(&b, &[("x", b"two")]);

        assert_ne!(hash_zip(&a).unwrap(), hash_zip(&b).unwrap());
    }

    #[test]
    fn different_entry_name_different_hash() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("a.zip");
        let b = dir.path().join("b.zip");
        write_zip(&a, &[("x", b"one")]);
        write_zip(&b, &[("y", b"one")]);

        assert_ne!(hash_zip(&a).unwrap(), hash_zip(&b).unwrap());
    }

    #[test]
    fn nonexistent_file_is_io_error() {
        let err = hash_zip(Path::new("/nonexistent/provider.zip")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn invalid_zip_is_archive_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("not-a-zip.zip");
        std::fs::write(&path, b"this is not a zip archive").unwrap();

        let err = hash_zip(&path).unwrap_err();
        assert!(matches!(err, Error::Archive { .. }), "got {err:?}");
        assert!(!err.is_transient());
    }
}
