use crate::fsops;
use alfred_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Unpacks a `.tar.gz` source archive into `staging` and returns the
/// component root inside it: the first top-level directory (by name) that is
/// not `__MACOSX`, or `staging` itself for archives without a wrapper dir.
pub fn unpack(bytes: &[u8], staging: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(staging)?;
    let dec = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(dec);
    archive
        .unpack(staging)
        .map_err(|e| Error::Archive(format!("Failed to extract archive: {}", e)))?;

    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut has_files = false;
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if entry.file_name() != "__MACOSX" {
                dirs.push(entry.path());
            }
        } else {
            has_files = true;
        }
    }
    dirs.sort();

    match dirs.into_iter().next() {
        Some(root) => Ok(root),
        None if has_files => Ok(staging.to_path_buf()),
        None => Err(Error::Archive("Archive is empty".to_string())),
    }
}

/// Extracts `bytes` into a staging area under `cache_dir` and atomically
/// installs the component root at `target`.
pub fn install(bytes: &[u8], cache_dir: &Path, id: &str, target: &Path) -> Result<()> {
    let staging = cache_dir.join(format!(".staging-{}-{}", id, uuid::Uuid::new_v4().simple()));
    let result = unpack(bytes, &staging).and_then(|root| fsops::replace_dir(&root, target));
    if staging.exists() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result?;
    info!(component = %id, path = %target.display(), "Component installed");
    Ok(())
}

/// Packs the directory `dir` into a gzipped tarball whose entries live
/// under `root_name/`.
pub fn pack_dir(dir: &Path, root_name: &str) -> Result<Vec<u8>> {
    let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut tar = tar::Builder::new(enc);
    tar.append_dir_all(root_name, dir)?;
    let enc = tar.into_inner()?;
    Ok(enc.finish()?)
}
