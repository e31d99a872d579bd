use alfred_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Copies the directory tree at `src` to `dst`, creating `dst`.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        std::fs::create_dir_all(&to)?;
        for entry in std::fs::read_dir(&from)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                std::fs::copy(entry.path(), &target)?;
            } else {
                debug!(path = %entry.path().display(), "Skipping non-regular file");
            }
        }
    }
    Ok(())
}

fn sibling(target: &Path, tag: &str) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| Error::Validation(format!("Invalid directory: {}", target.display())))?;
    let mut name = name.to_os_string();
    name.push(format!(".{}-{}", tag, uuid::Uuid::new_v4().simple()));
    Ok(target.with_file_name(name))
}

/// Moves `source` into place at `target`, replacing any existing directory.
///
/// The previous directory is renamed aside first and restored if the new one
/// cannot be moved in, so `target` is either the old or the new tree.
pub fn replace_dir(source: &Path, target: &Path) -> Result<()> {
    let previous = if target.exists() {
        let aside = sibling(target, "old")?;
        std::fs::rename(target, &aside)?;
        Some(aside)
    } else {
        None
    };

    let installed = match std::fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(error = %e, "Rename failed, falling back to copy");
            copy_dir_all(source, target).map(|_| {
                let _ = std::fs::remove_dir_all(source);
            })
        }
    };

    if let Err(e) = installed {
        let _ = std::fs::remove_dir_all(target);
        if let Some(aside) = &previous {
            if let Err(restore) = std::fs::rename(aside, target) {
                warn!(error = %restore, path = %target.display(), "Failed to restore previous directory");
            }
        }
        return Err(Error::Other(format!(
            "Failed to install {}: {}",
            target.display(),
            e
        )));
    }

    if let Some(aside) = previous {
        if let Err(e) = std::fs::remove_dir_all(&aside) {
            warn!(error = %e, path = %aside.display(), "Failed to remove replaced directory");
        }
    }
    Ok(())
}

/// Copies `source` next to `target` and swaps it in with `replace_dir`.
pub fn install_copy(source: &Path, target: &Path) -> Result<()> {
    let staging = sibling(target, "staging")?;
    if let Err(e) = copy_dir_all(source, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    replace_dir(&staging, target)
}
