//! Shared files written and read concurrently by all ranks at disjoint offsets.
//!
//! Rank 0 creates (and truncates) the file at its final length; after an
//! agreement step every rank writes its own byte range. Readers check the
//! file length first so a truncated file is reported as a format error
//! instead of a short read.

use crate::algs::collective::agree_on_result;
use crate::algs::communicator::Communicator;
use crate::mesh_error::MeshForestError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Create `path` with `len` zero bytes on rank 0. Collective; every rank
/// fails if the creation failed.
pub fn create_shared<C: Communicator + ?Sized>(
    comm: &C,
    path: &Path,
    len: u64,
) -> Result<(), MeshForestError> {
    let local = if comm.rank() == 0 {
        File::create(path)
            .and_then(|f| f.set_len(len))
            .map_err(|e| MeshForestError::io(path, e))
    } else {
        Ok(())
    };
    agree_on_result(comm, local)
}

/// Write `bytes` at `offset` of an existing file.
pub fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> Result<(), MeshForestError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| MeshForestError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(bytes))
        .and_then(|_| file.flush())
        .map_err(|e| MeshForestError::io(path, e))
}

/// Read `len` bytes at `offset`.
pub fn read_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, MeshForestError> {
    let mut file = File::open(path).map_err(|e| MeshForestError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| MeshForestError::io(path, e))?
        .len();
    let end = offset.saturating_add(len as u64);
    if end > file_len {
        return Err(MeshForestError::save_format(
            path,
            format!("needs {end} bytes but the file has {file_len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| MeshForestError::io(path, e))?;
    Ok(buf)
}

/// `stem` with `suffix` appended to its file name (`out/mesh` + `.info`).
pub fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    stem.with_file_name(name)
}

/// Length of `path` in bytes.
pub fn file_len(path: &Path) -> Result<u64, MeshForestError> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| MeshForestError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        create_shared(&NoComm, &path, 8).unwrap();
        write_at(&path, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_at(&path, 0, 8).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(file_len(&path).unwrap(), 8);
    }

    #[test]
    fn suffix_extends_the_file_name() {
        assert_eq!(
            with_suffix(Path::new("out/run.3"), "-fixed.data"),
            PathBuf::from("out/run.3-fixed.data")
        );
    }

    #[test]
    fn short_files_are_format_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        create_shared(&NoComm, &path, 2).unwrap();
        assert!(matches!(
            read_at(&path, 0, 4),
            Err(MeshForestError::SaveFileFormat { .. })
        ));
        assert!(matches!(
            read_at(&dir.path().join("missing.bin"), 0, 1),
            Err(MeshForestError::Io { .. })
        ));
    }
}
