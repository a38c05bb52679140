use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

/// Pinned upstream location of the Gerrit commit-msg hook, the script that
/// injects `Change-Id` trailers into new commit messages.
pub const COMMIT_MSG_HOOK_URL: &str = "https://raw.githubusercontent.com/GerritCodeReview/gerrit/43d985a2a15a7d59d42e19ffd60d41c0de6c3e59/gerrit-server/src/main/resources/com/google/gerrit/server/tools/root/hooks/commit-msg";

/// Path of the commit-msg hook for a git dir. Linked worktrees keep their
/// hooks in the common dir, reached through the `commondir` file.
pub fn hook_path(git_dir: &Path) -> PathBuf {
    let mut git_dir = git_dir.to_path_buf();
    if let Ok(contents) = fs::read_to_string(git_dir.join("commondir")) {
        git_dir = git_dir.join(contents.trim());
    }
    git_dir.join("hooks").join("commit-msg")
}

/// Whether the commit-msg hook is present.
pub fn installed(git_dir: &Path) -> bool {
    let path = hook_path(git_dir);
    let present = path.exists();
    debug!(path = %path.display(), present, "checked commit-msg hook");
    present
}

/// Download the commit-msg hook into the repository and make it executable.
pub async fn install(git_dir: &Path) -> Result<()> {
    let path = hook_path(git_dir);
    debug!(path = %path.display(), url = COMMIT_MSG_HOOK_URL, "downloading commit-msg hook");

    let response = reqwest::get(COMMIT_MSG_HOOK_URL)
        .await
        .with_context(|| format!("failed to download commit-msg hook from {COMMIT_MSG_HOOK_URL}"))?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "failed to download commit-msg hook from {COMMIT_MSG_HOOK_URL}: {}",
            response.status()
        ));
    }
    let contents = response
        .bytes()
        .await
        .context("failed to read the commit-msg hook body")?;

    let hooks_dir = path
        .parent()
        .ok_or_else(|| anyhow!("hook path {} has no parent directory", path.display()))?;
    fs::create_dir_all(hooks_dir)
        .with_context(|| format!("failed to create hooks directory {}", hooks_dir.display()))?;
    fs::write(&path, &contents)
        .with_context(|| format!("failed to write commit-msg hook file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).with_context(|| {
            format!("failed to set execution rights on hook file {}", path.display())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_path() {
        assert_eq!(
            hook_path(Path::new("/repo/.git")),
            PathBuf::from("/repo/.git/hooks/commit-msg")
        );
    }

    #[test]
    fn test_hook_path_follows_commondir() {
        let dir = tempfile::tempdir().unwrap();
        let worktree_git_dir = dir.path().join("worktrees").join("wt");
        fs::create_dir_all(&worktree_git_dir).unwrap();
        fs::write(worktree_git_dir.join("commondir"), "../..\n").unwrap();

        assert_eq!(
            hook_path(&worktree_git_dir),
            worktree_git_dir.join("../..").join("hooks").join("commit-msg")
        );
    }

    #[test]
    fn test_installed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!installed(dir.path()));

        let hooks = dir.path().join("hooks");
        fs::create_dir_all(&hooks).unwrap();
        fs::write(hooks.join("commit-msg"), "#!/bin/sh\n").unwrap();
        assert!(installed(dir.path()));
    }
}
