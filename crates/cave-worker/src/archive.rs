//! [ArchiveExtractor] — traversal-safe zip extraction into a workspace
//! (spec §4.2). Grounded on the Python predecessor's `StorageAdapter`
//! `_unzip_safely` (zip-slip prevention by resolved-path prefix check),
//! generalized per spec: skip-and-log rather than abort, no symlink
//! following, directory entries distinguished by trailing separator.

use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to open archive: {0}")]
    Unreadable(#[from] zip::result::ZipError),
    #[error("io error extracting archive: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts `archive_bytes` (a zip file) into `target_root`, skipping any
/// entry whose resolved destination escapes the root (zip slip).
///
/// Returns the number of entries skipped as traversal attempts, so callers
/// can decide whether to log at a higher level.
pub fn extract(archive_bytes: &[u8], target_root: &Path) -> Result<usize, ExtractError> {
    let cursor = std::io::Cursor::new(archive_bytes);
    let mut zip = zip::ZipArchive::new(cursor)?;
    let mut skipped = 0;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();

        let Some(dest) = resolve_entry_path(target_root, &name) else {
            warn!(entry = %name, "zip slip attempt detected, skipping entry");
            skipped += 1;
            continue;
        };

        let is_dir = name.ends_with('/') || name.ends_with('\\');
        if is_dir {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        std::fs::write(&dest, &buf)?;
    }

    Ok(skipped)
}

/// Resolves an archive entry name against `root`, rejecting anything that
/// would land outside it. Entry names are attacker-controlled: we reject
/// absolute paths, `..` components, and anything that normalizes outside
/// `root` without touching the filesystem (no symlink following, per spec
/// §4.2 — `Path::components` never dereferences symlinks).
fn resolve_entry_path(root: &Path, entry_name: &str) -> Option<PathBuf> {
    let candidate = Path::new(entry_name);
    if candidate.is_absolute() {
        return None;
    }

    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_) => {
                return None;
            }
        }
    }

    if resolved.starts_with(root) {
        Some(resolved)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options =
                zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, contents) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extracts_well_formed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip(&[("main.py", b"print('hello')"), ("nested/util.py", b"x = 1")]);

        let skipped = extract(&archive, dir.path()).unwrap();

        assert_eq!(skipped, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("main.py")).unwrap(),
            "print('hello')"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/util.py")).unwrap(),
            "x = 1"
        );
    }

    #[test]
    fn skips_traversal_entries_without_writing_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip(&[
            ("../../etc/passwd", b"root:x:0:0"),
            ("safe.txt", b"ok"),
        ]);

        let skipped = extract(&archive, dir.path()).unwrap();

        assert_eq!(skipped, 1);
        assert!(std::fs::read_to_string(dir.path().join("safe.txt")).is_ok());
        assert!(!dir.path().parent().unwrap().join("etc/passwd").exists());
    }

    #[test]
    fn rejects_absolute_entry_paths() {
        assert!(resolve_entry_path(Path::new("/workspace/req1"), "/etc/shadow").is_none());
    }

    #[test]
    fn round_trips_a_plain_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip(&[("a.txt", b"aaa"), ("dir/b.txt", b"bbb"), ("dir/c.txt", b"ccc")]);

        extract(&archive, dir.path()).unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "aaa");
        assert_eq!(std::fs::read_to_string(dir.path().join("dir/b.txt")).unwrap(), "bbb");
        assert_eq!(std::fs::read_to_string(dir.path().join("dir/c.txt")).unwrap(), "ccc");
    }
}
