//! OS adapters for the `open` and `pick_*` commands.
//!
//! `open` hands a path to the platform's default handler, or to an override
//! launcher when one is configured. The pickers run the native file dialog;
//! cancellation is an empty list, never an error. Picked directories are
//! suffixed with `/` so the browser can tell them apart from files.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Launches the OS default handler for `path`, or `launcher path` when an
/// override is configured. Returns false when the path does not exist or the
/// handler could not be started; never blocks on the handler itself.
pub async fn open_path(path: &Path, launcher: Option<&Path>) -> Result<bool> {
    if !path.exists() {
        debug!(path = %path.display(), "open target does not exist");
        return Ok(false);
    }
    match launcher {
        Some(launcher) => {
            let spawned = tokio::process::Command::new(launcher).arg(path).spawn();
            match spawned {
                Ok(_child) => Ok(true),
                Err(err) => {
                    debug!(launcher = %launcher.display(), %err, "override launcher failed");
                    Ok(false)
                }
            }
        }
        None => {
            let path = path.to_path_buf();
            let outcome = tokio::task::spawn_blocking(move || open::that(path)).await?;
            match outcome {
                Ok(()) => Ok(true),
                Err(err) => {
                    debug!(%err, "default handler failed");
                    Ok(false)
                }
            }
        }
    }
}

pub async fn pick_file_or_directory() -> Vec<String> {
    let picked = rfd::AsyncFileDialog::new().pick_file().await;
    picked
        .map(|file| vec![format_picked(&file.path().to_path_buf())])
        .unwrap_or_default()
}

pub async fn pick_files_or_directories() -> Vec<String> {
    let picked = rfd::AsyncFileDialog::new().pick_files().await;
    picked
        .map(|files| {
            files
                .iter()
                .map(|file| format_picked(&file.path().to_path_buf()))
                .collect()
        })
        .unwrap_or_default()
}

/// Absolute path as a string, `/`-suffixed when it names a directory.
fn format_picked(path: &PathBuf) -> String {
    let mut rendered = path.display().to_string();
    if path.is_dir() && !rendered.ends_with('/') {
        rendered.push('/');
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directories_are_suffixed() {
        let tmp = tempdir().unwrap();
        let rendered = format_picked(&tmp.path().to_path_buf());
        assert!(rendered.ends_with('/'));
    }

    #[test]
    fn files_are_not_suffixed() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("shot.mov");
        std::fs::write(&file, b"x").unwrap();
        let rendered = format_picked(&file);
        assert!(!rendered.ends_with('/'));
    }

    #[tokio::test]
    async fn open_missing_path_is_false() {
        let tmp = tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(!open_path(&missing, None).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn override_launcher_is_used() {
        let tmp = tempdir().unwrap();
        let target = tmp.path().join("scene.ma");
        std::fs::write(&target, b"x").unwrap();
        assert!(open_path(&target, Some(Path::new("/bin/true"))).await.unwrap());
    }
}
