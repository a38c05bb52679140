use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, warn};

use crate::credentials::Credentials;

const RECORD_SEPARATOR: char = '\u{1e}';
const FIELD_SEPARATOR: char = '\u{1f}';

/// A commit as needed by the review flow: identity, parent hashes, raw
/// message. The full tree is never loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    /// Parent hashes in git order; more than one marks a merge commit.
    pub parents: Vec<String>,
    pub message: String,
}

/// A resolved ref, typically HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Full ref name (`refs/heads/feature`), or `HEAD` when detached.
    pub name: String,
    /// Shortened name (`feature`).
    pub short_name: String,
    pub sha: String,
}

/// The git operations the review engine needs. Implemented by
/// [`GitRepository`] over the system git binary; tests substitute fakes.
pub trait Repository {
    fn root(&self) -> &Path;
    fn git_dir(&self) -> Result<PathBuf>;
    fn head(&self) -> Result<Reference>;
    /// All configured URLs of the named remote. Errors when the remote does
    /// not exist.
    fn remote_urls(&self, name: &str) -> Result<Vec<String>>;
    /// The tracking remote of a branch from git config, when set.
    fn branch_remote(&self, branch: &str) -> Option<String>;
    /// `init.defaultBranch` from git config, when set.
    fn default_branch_config(&self) -> Option<String>;
    fn fetch(&self, remote: &str) -> Result<()>;
    /// Resolve a revision expression to a commit hash.
    fn resolve_revision(&self, rev: &str) -> Result<String>;
    fn merge_base(&self, a: &str, b: &str) -> Result<String>;
    /// First-parent walk of `(base, head]`, newest first.
    fn commits_between(&self, base: &str, head: &str) -> Result<Vec<Commit>>;
    /// Force-push the given refspecs. When credentials are provided and the
    /// remote is reached over HTTP(S), they are passed as a basic
    /// authorization header; otherwise git's own transport auth applies.
    fn push(&self, remote: &str, refspecs: &[String], creds: Option<&Credentials>) -> Result<()>;
}

/// Repository backed by the system `git` binary, every operation a
/// `git -C <root> ...` invocation.
pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    /// Locate the repository containing `path`.
    pub fn discover(path: &Path) -> Result<Self> {
        let root = run_git(path, &["rev-parse", "--show-toplevel"])
            .with_context(|| format!("{} is not inside a git repository", path.display()))?;
        Ok(Self {
            root: PathBuf::from(root),
        })
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        run_git(&self.root, args)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        ));
    }
    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("git {} produced non-UTF-8 output", args.join(" ")))?;
    Ok(stdout.trim_end_matches('\n').to_string())
}

impl Repository for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn git_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.run(&["rev-parse", "--absolute-git-dir"])?))
    }

    fn head(&self) -> Result<Reference> {
        let sha = self.run(&["rev-parse", "HEAD"]).context("failed to resolve HEAD")?;
        // symbolic-ref fails on a detached HEAD; fall back to the literal name.
        let name = self
            .run(&["symbolic-ref", "HEAD"])
            .unwrap_or_else(|_| "HEAD".to_string());
        let short_name = name
            .strip_prefix("refs/heads/")
            .unwrap_or(name.as_str())
            .to_string();
        Ok(Reference {
            name,
            short_name,
            sha,
        })
    }

    fn remote_urls(&self, name: &str) -> Result<Vec<String>> {
        let out = self
            .run(&["remote", "get-url", "--all", name])
            .with_context(|| format!("failed to find remote {name}"))?;
        Ok(out.lines().map(str::to_string).collect())
    }

    fn branch_remote(&self, branch: &str) -> Option<String> {
        let key = format!("branch.{branch}.remote");
        self.run(&["config", "--get", &key])
            .ok()
            .filter(|remote| !remote.is_empty())
    }

    fn default_branch_config(&self) -> Option<String> {
        self.run(&["config", "--get", "init.defaultBranch"])
            .ok()
            .filter(|branch| !branch.is_empty())
    }

    fn fetch(&self, remote: &str) -> Result<()> {
        debug!(remote, "fetching remote");
        self.run(&["fetch", remote])
            .with_context(|| format!("failed to fetch remote {remote}"))?;
        Ok(())
    }

    fn resolve_revision(&self, rev: &str) -> Result<String> {
        let revspec = format!("{rev}^{{commit}}");
        self.run(&["rev-parse", "--verify", &revspec])
            .with_context(|| format!("failed to resolve revision {rev}"))
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.run(&["merge-base", a, b])
            .with_context(|| format!("failed to find the common ancestor of {a} and {b}"))
    }

    fn commits_between(&self, base: &str, head: &str) -> Result<Vec<Commit>> {
        let format = format!("--format=%H{FIELD_SEPARATOR}%P{FIELD_SEPARATOR}%B{RECORD_SEPARATOR}");
        let range = format!("{base}..{head}");
        let out = self.run(&["log", "--first-parent", &format, &range])?;
        let mut commits = Vec::new();
        for record in out.split(RECORD_SEPARATOR) {
            let record = record.trim_matches('\n');
            if record.is_empty() {
                continue;
            }
            let mut fields = record.splitn(3, FIELD_SEPARATOR);
            let (Some(sha), Some(parents), Some(message)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(anyhow!("unexpected git log record: {record:?}"));
            };
            commits.push(Commit {
                sha: sha.to_string(),
                parents: parents.split_whitespace().map(str::to_string).collect(),
                message: message.trim_end_matches('\n').to_string(),
            });
        }
        Ok(commits)
    }

    fn push(&self, remote: &str, refspecs: &[String], creds: Option<&Credentials>) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.root);
        if let Some(creds) = creds {
            match self.remote_urls(remote) {
                Ok(urls) => {
                    if let Some(url) = urls.iter().find(|u| u.starts_with("http")) {
                        let token = general_purpose::STANDARD
                            .encode(format!("{}:{}", creds.username, creds.password));
                        cmd.arg("-c")
                            .arg(format!("http.{url}.extraheader=Authorization: Basic {token}"));
                    }
                }
                Err(err) => warn!(remote, "failed to look up remote URLs for push auth: {err}"),
            }
        }
        cmd.args(["push", "--force", remote]);
        cmd.args(refspecs);
        let output = cmd.output().context("Failed to execute git push")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git push failed: {}", stderr.trim()));
        }
        debug!(remote, ?refspecs, "pushed review branches");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_fails_outside_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitRepository::discover(dir.path()).is_err());
    }
}
