//! Backup folder archiving
//!
//! Backup folders are packed into a gzip compressed tarball before upload
//! and unpacked next to the downloaded archive on restore. These functions
//! block; call them from `spawn_blocking`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder as TarBuilder};
use tracing::debug;
use walkdir::WalkDir;

/// Pack the contents of `source_dir` into `archive_path`.
///
/// Entries are stored relative to `source_dir`. Returns the archive size
/// in bytes.
pub fn pack_directory(source_dir: &Path, archive_path: &Path) -> io::Result<u64> {
    if !source_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("backup folder {} does not exist", source_dir.display()),
        ));
    }

    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
    let mut builder = TarBuilder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source_dir)?;

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    io::Write::flush(&mut writer)?;
    drop(writer);

    let size = std::fs::metadata(archive_path)?.len();
    debug!(archive = %archive_path.display(), size, "Packed backup folder");
    Ok(size)
}

/// Unpack `archive_path` into `destination_dir`, creating it if needed
pub fn unpack_archive(archive_path: &Path, destination_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(destination_dir)?;
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.unpack(destination_dir)?;
    debug!(
        archive = %archive_path.display(),
        destination = %destination_dir.display(),
        "Unpacked backup archive"
    );
    Ok(())
}

/// Total size in bytes of the files under `path`
pub fn directory_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_restores_tree() {
        let work = tempfile::tempdir().unwrap();
        let source = work.path().join("backup");
        std::fs::create_dir_all(source.join("logs")).unwrap();
        std::fs::write(source.join("state.db"), vec![7u8; 4096]).unwrap();
        std::fs::write(source.join("logs/000001.log"), b"entry").unwrap();

        let archive = work.path().join("2024-01-01 00.00.00.tgz");
        let size = pack_directory(&source, &archive).unwrap();
        assert!(size > 0);
        assert!(size < directory_size(&source).unwrap());

        let restored = work.path().join("restored");
        unpack_archive(&archive, &restored).unwrap();
        assert_eq!(std::fs::read(restored.join("state.db")).unwrap(), vec![7u8; 4096]);
        assert_eq!(std::fs::read(restored.join("logs/000001.log")).unwrap(), b"entry");
    }

    #[test]
    fn missing_folder_is_not_found() {
        let work = tempfile::tempdir().unwrap();
        let err =
            pack_directory(&work.path().join("missing"), &work.path().join("x.tgz")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn garbage_archive_fails() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("bad.tgz");
        std::fs::write(&archive, b"not a tarball").unwrap();
        assert!(unpack_archive(&archive, &work.path().join("out")).is_err());
    }
}
