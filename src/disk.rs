//! Small filesystem helpers shared by the chunk writer, the TOC and the
//! fatal-error diagnostics.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Free bytes available to unprivileged users on the filesystem holding
/// `path`, or `None` if it cannot be determined.
pub fn free_space(path: &Path) -> Option<u64> {
    let probe = if path.exists() { path } else { path.parent()? };
    let c_path = CString::new(probe.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Fsyncs a directory so renames and unlinks inside it are durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Removes a file, treating an already-missing file as success.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_of_temp_dir() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(free_space(dir.path()).is_some());
        // missing files fall back to their parent directory
        assert!(free_space(&dir.path().join("missing")).is_some());
        Ok(())
    }

    #[test]
    fn test_remove_file_if_exists() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("f");
        std::fs::write(&path, b"x")?;
        assert!(remove_file_if_exists(&path)?);
        assert!(!remove_file_if_exists(&path)?);
        sync_dir(dir.path())?;
        Ok(())
    }
}
