//! File utilities (component B): atomic file/dir copy, append, walk,
//! mode-preserving operations.

use std::{
	fs,
	os::unix::fs::{MetadataExt, PermissionsExt},
	path::Path,
};

use color_eyre::Result;
use tracing::trace;
use walkdir::WalkDir;

use crate::error::OkonomiError;

/// Writes `contents` to `path`, creating parent directories as needed.
pub fn just_write(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
	let path = path.as_ref();
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).map_err(|e| OkonomiError::io(parent, e))?;
	}
	fs::write(path, contents).map_err(|e| OkonomiError::io(path, e))?;
	Ok(())
}

/// Appends `contents` to `path`, creating it (and parents) if absent.
pub fn append(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
	use std::io::Write;
	let path = path.as_ref();
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).map_err(|e| OkonomiError::io(parent, e))?;
	}
	let mut f = fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.map_err(|e| OkonomiError::io(path, e))?;
	f.write_all(contents.as_ref()).map_err(|e| OkonomiError::io(path, e))?;
	Ok(())
}

/// Creates a sparse file of `size` bytes at `path`, used to preallocate
/// raw disk images.
pub fn create_sparse(path: impl AsRef<Path>, size: u64) -> Result<()> {
	let path = path.as_ref();
	let f = fs::File::create(path).map_err(|e| OkonomiError::io(path, e))?;
	f.set_len(size).map_err(|e| OkonomiError::io(path, e))?;
	Ok(())
}

/// Recursively copies `src` onto `dst`, preserving POSIX mode bits
/// (including setuid/setgid/sticky) and following no symlinks to outside
/// the tree (symlinks are recreated, not dereferenced).
pub fn copy_tree(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
	let src = src.as_ref();
	let dst = dst.as_ref();
	for entry in WalkDir::new(src).follow_links(false) {
		let entry = entry.map_err(|e| color_eyre::eyre::eyre!("walk error: {e}"))?;
		let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
		let target = dst.join(rel);
		let meta = entry.metadata().map_err(|e| color_eyre::eyre::eyre!("stat error: {e}"))?;

		if meta.is_dir() {
			fs::create_dir_all(&target).map_err(|e| OkonomiError::io(&target, e))?;
		} else if meta.file_type().is_symlink() {
			let link = fs::read_link(entry.path()).map_err(|e| OkonomiError::io(entry.path(), e))?;
			if let Some(parent) = target.parent() {
				fs::create_dir_all(parent).map_err(|e| OkonomiError::io(parent, e))?;
			}
			let _ = fs::remove_file(&target);
			std::os::unix::fs::symlink(&link, &target).map_err(|e| OkonomiError::io(&target, e))?;
		} else {
			if let Some(parent) = target.parent() {
				fs::create_dir_all(parent).map_err(|e| OkonomiError::io(parent, e))?;
			}
			fs::copy(entry.path(), &target).map_err(|e| OkonomiError::io(&target, e))?;
			fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode()))
				.map_err(|e| OkonomiError::io(&target, e))?;
		}
		trace!(from = ?entry.path(), to = ?target, "copied tree entry");
	}
	Ok(())
}

/// Changes ownership of `path` to `uid:gid` without following symlinks.
pub fn chown(path: impl AsRef<Path>, uid: u32, gid: u32) -> Result<()> {
	let path = path.as_ref();
	nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(uid)), Some(nix::unistd::Gid::from_raw(gid)))
		.map_err(|e| color_eyre::eyre::eyre!("chown {path:?} failed: {e}"))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_sparse_reports_exact_size() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("sparse.img");
		create_sparse(&path, 4096).unwrap();
		assert_eq!(fs::metadata(&path).unwrap().len(), 4096);
	}

	#[test]
	fn copy_tree_preserves_mode_and_symlinks() {
		let src = tempfile::tempdir().unwrap();
		let dst = tempfile::tempdir().unwrap();
		fs::write(src.path().join("a"), b"hi").unwrap();
		fs::set_permissions(src.path().join("a"), fs::Permissions::from_mode(0o741)).unwrap();
		std::os::unix::fs::symlink("a", src.path().join("link")).unwrap();

		copy_tree(src.path(), dst.path()).unwrap();

		let mode = fs::metadata(dst.path().join("a")).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o741);
		assert_eq!(fs::read_link(dst.path().join("link")).unwrap(), Path::new("a"));
	}
}
