//! Tar/gzip codec (component D): used for the worker tools tarball and for
//! PXE tar output, with an explicit path-traversal guard on extract.

use std::{
	fs::File,
	path::{Component, Path},
};

use color_eyre::{eyre::eyre, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::Archive;

use crate::error::OkonomiError;

/// Rejects any entry path containing `..` or an absolute component, so
/// extraction can never escape `dest`.
fn is_safe_entry_path(path: &Path) -> bool {
	path.components().all(|c| matches!(c, Component::Normal(_)))
}

pub fn create_tar_gz(src_dir: &Path, out_file: &Path) -> Result<()> {
	let file = File::create(out_file).map_err(|e| OkonomiError::io(out_file, e))?;
	let encoder = GzEncoder::new(file, Compression::default());
	let mut builder = tar::Builder::new(encoder);
	builder.append_dir_all(".", src_dir).map_err(|e| OkonomiError::io(src_dir, e))?;
	builder.into_inner().and_then(|mut e| e.try_finish().map(|()| e)).map_err(|e| OkonomiError::io(out_file, e))?;
	Ok(())
}

pub fn extract_tar_gz(archive_file: &Path, dest: &Path) -> Result<()> {
	let file = File::open(archive_file).map_err(|e| OkonomiError::io(archive_file, e))?;
	let decoder = GzDecoder::new(file);
	let mut archive = Archive::new(decoder);

	std::fs::create_dir_all(dest).map_err(|e| OkonomiError::io(dest, e))?;

	for entry in archive.entries().map_err(|e| OkonomiError::io(archive_file, e))? {
		let mut entry = entry.map_err(|e| OkonomiError::io(archive_file, e))?;
		let path = entry.path().map_err(|e| OkonomiError::io(archive_file, e))?.to_path_buf();
		if !is_safe_entry_path(&path) {
			return Err(eyre!("tar entry {path:?} escapes the destination directory; refusing to extract"));
		}
		entry.unpack_in(dest).map_err(|e| OkonomiError::io(dest, e))?;
	}
	Ok(())
}

/// Validates that `path` is a valid gzip-then-tar stream by decoding the
/// gzip header and the first tar header, without extracting anything.
/// Used at config-validate time to check the worker tools tarball.
pub fn validate_tar_gz_header(path: &Path) -> Result<()> {
	let file = File::open(path).map_err(|e| OkonomiError::io(path, e))?;
	let decoder = GzDecoder::new(file);
	if decoder.header().is_none() {
		return Err(eyre!("{path:?} is not a valid gzip stream"));
	}
	let mut archive = Archive::new(decoder);
	let mut entries = archive.entries().map_err(|e| OkonomiError::io(path, e))?;
	match entries.next() {
		Some(Ok(_)) => Ok(()),
		Some(Err(e)) => Err(OkonomiError::io(path, e).into()),
		None => Err(eyre!("{path:?} is an empty tar archive")),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	#[test]
	fn rejects_traversal_paths() {
		assert!(!is_safe_entry_path(&PathBuf::from("../etc/passwd")));
		assert!(!is_safe_entry_path(&PathBuf::from("/etc/passwd")));
		assert!(is_safe_entry_path(&PathBuf::from("usr/bin/bash")));
	}

	#[test]
	fn round_trip_create_and_extract() {
		let src = tempfile::tempdir().unwrap();
		std::fs::write(src.path().join("f"), b"hi").unwrap();
		let archive_dir = tempfile::tempdir().unwrap();
		let archive_path = archive_dir.path().join("t.tar.gz");
		create_tar_gz(src.path(), &archive_path).unwrap();
		validate_tar_gz_header(&archive_path).unwrap();

		let dest = tempfile::tempdir().unwrap();
		extract_tar_gz(&archive_path, dest.path()).unwrap();
		assert_eq!(std::fs::read(dest.path().join("f")).unwrap(), b"hi");
	}
}
