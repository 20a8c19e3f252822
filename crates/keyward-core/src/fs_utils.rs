//! Owner-only file helpers for registry databases and operation logs.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

pub fn ensure_secure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    restrict(path, DIR_MODE)
}

pub fn ensure_file_permissions(path: &Path) -> io::Result<()> {
    if path.exists() {
        restrict(path, FILE_MODE)?;
    }
    Ok(())
}

pub fn open_secure(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    options.mode(FILE_MODE);
    let file = options.open(path)?;
    restrict(path, FILE_MODE)?;
    Ok(file)
}

/// Sibling path used to stage a rewrite before it replaces `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// True once `file` no longer has a directory entry, e.g. after a rename
/// replaced it.
#[cfg(unix)]
pub fn is_unlinked(file: &File) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    Ok(file.metadata()?.nlink() == 0)
}

#[cfg(not(unix))]
pub fn is_unlinked(_file: &File) -> io::Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn created_files_are_owner_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("state");
        ensure_secure_dir(&nested).expect("dir");
        let path = nested.join("ops.jsonl");
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        open_secure(&path, &mut options).expect("open");

        let file_mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        let dir_mode = fs::metadata(&nested).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn replaced_files_report_unlinked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ops.jsonl");
        let staged = staging_path(&path);
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let original = open_secure(&path, &mut options).expect("open");
        assert!(!is_unlinked(&original).expect("meta"));

        fs::write(&staged, b"").expect("stage");
        fs::rename(&staged, &path).expect("rename");
        assert!(is_unlinked(&original).expect("meta"));
    }

    #[test]
    fn staging_path_is_a_sibling() {
        let staged = staging_path(Path::new("/var/lib/keyward/ops.jsonl"));
        assert_eq!(staged, Path::new("/var/lib/keyward/ops.jsonl.tmp"));
    }
}
