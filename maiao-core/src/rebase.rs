use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::change::{
    extract_change_ids, extract_changes, rebase_todo, remove_merged_changes, Change,
};
use crate::repo::Repository;

/// Environment variable carrying the JSON-encoded original argv across the
/// rebase `exec` step. The re-entrant process must clear it immediately.
pub const REBASE_ARGS_ENV: &str = "MAIAO_REBASE_ARGUMENTS";

/// Subcommand name this binary answers to when git invokes it as the editor.
pub const EDITOR_SUBCOMMAND: &str = "add-change-id-editor";

/// Rebase the local stack onto the remote tip, rewording commits that still
/// lack a change identifier so the commit-msg hook can inject one.
///
/// Changes whose identifier already landed in `(base, remote_head]` are
/// dropped from the instruction list. Returns after spawning the rebase; the
/// terminal `exec` step re-invokes this program to finish the review.
pub fn rebase_commits(
    repo: &dyn Repository,
    base: &str,
    remote_head: &str,
    head: &str,
) -> Result<()> {
    let changes = extract_changes(&repo.commits_between(base, head)?)?;
    let landed = extract_change_ids(&repo.commits_between(base, remote_head)?);
    let changes = remove_merged_changes(changes, &landed);

    if changes.is_empty() {
        println!("nothing to review");
        return Ok(());
    }
    run_interactive_rebase(repo, base, remote_head, &changes)
}

fn run_interactive_rebase(
    repo: &dyn Repository,
    base: &str,
    onto: &str,
    changes: &[Change],
) -> Result<()> {
    let exe = env::current_exe().context("Failed to locate the current executable")?;
    let exe = exe
        .to_str()
        .ok_or_else(|| anyhow!("executable path is not valid UTF-8"))?;

    // The file must outlive the whole rebase run: git hands it to the editor
    // subcommand while processing the todo list. Dropping the handle after
    // the subprocess returns removes it on every exit path.
    let mut todo_file = tempfile::Builder::new()
        .prefix("rebase-todo-")
        .tempfile()
        .context("Failed to create the rebase instruction file")?;
    todo_file
        .write_all(instructions(changes, exe).as_bytes())
        .context("Failed to write the rebase instruction file")?;
    todo_file
        .flush()
        .context("Failed to flush the rebase instruction file")?;

    let original_args: Vec<String> = env::args().skip(1).collect();
    let args_json =
        serde_json::to_string(&original_args).context("Failed to encode rebase arguments")?;

    let editor = format!("{exe} {EDITOR_SUBCOMMAND} {}", todo_file.path().display());
    debug!(base, onto, editor = %editor, "starting interactive rebase");

    // Stdio is inherited so the user can resolve conflicts in place.
    let status = Command::new("git")
        .arg("-C")
        .arg(repo.root())
        .args(["rebase", "-i", "--onto", onto, base])
        .env("GIT_EDITOR", &editor)
        .env(REBASE_ARGS_ENV, &args_json)
        .status()
        .context("Failed to run git rebase -i")?;

    if !status.success() {
        if rebase_in_progress(repo) {
            info!("rebase stopped on conflicts, resolve them and run `git rebase --continue`");
            return Ok(());
        }
        return Err(anyhow!("git rebase -i exited with {status}"));
    }
    Ok(())
}

/// The full instruction file: the todo list plus a terminal `exec` step that
/// re-invokes this program once the history is rewritten.
pub fn instructions(changes: &[Change], exe: &str) -> String {
    format!("{}\nexec {exe}\n", rebase_todo(changes))
}

fn rebase_in_progress(repo: &dyn Repository) -> bool {
    match repo.git_dir() {
        Ok(git_dir) => {
            git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists()
        }
        Err(_) => false,
    }
}

/// Replace git's in-progress `git-rebase-todo` with the prepared instruction
/// list. Invoked by git as `GIT_EDITOR`; also called for every other file git
/// wants edited during the rebase (reworded commit messages in particular),
/// which must be left untouched for the commit-msg hook to do its work.
///
/// Never surfaces an error: problems are printed to stderr and the editor
/// still exits 0 so the rebase keeps going.
pub fn apply_prepared_todo(prepared: &Path, target: &Path) {
    if target.file_name().and_then(|name| name.to_str()) != Some("git-rebase-todo") {
        return;
    }
    if let Err(err) = fs::copy(prepared, target) {
        eprintln!(
            "failed to copy rebase todo {} to {}: {err}",
            prepared.display(),
            target.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Commit;

    #[test]
    fn test_instructions_appends_exec_step() {
        let changes = vec![Change {
            commits: vec![Commit {
                sha: "b34ccd81a342e155b8382992cddb116c56bee95c".to_string(),
                message: "add feature".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }];
        assert_eq!(
            instructions(&changes, "/usr/local/bin/maiao"),
            "reword b34ccd81a342e155b8382992cddb116c56bee95c add feature\n\
             exec /usr/local/bin/maiao\n"
        );
    }

    #[test]
    fn test_apply_prepared_todo_copies_rebase_todo() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = dir.path().join("prepared");
        let target = dir.path().join("git-rebase-todo");
        fs::write(&prepared, "pick abc subject\n").unwrap();
        fs::write(&target, "noise\n").unwrap();

        apply_prepared_todo(&prepared, &target);
        assert_eq!(fs::read_to_string(&target).unwrap(), "pick abc subject\n");
    }

    #[test]
    fn test_apply_prepared_todo_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = dir.path().join("prepared");
        let target = dir.path().join("COMMIT_EDITMSG");
        fs::write(&prepared, "pick abc subject\n").unwrap();
        fs::write(&target, "original message\n").unwrap();

        apply_prepared_todo(&prepared, &target);
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "original message\n",
            "commit messages must be left for the commit-msg hook"
        );
    }

    #[test]
    fn test_apply_prepared_todo_missing_source_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("git-rebase-todo");
        fs::write(&target, "kept\n").unwrap();

        apply_prepared_todo(&dir.path().join("absent"), &target);
        assert_eq!(fs::read_to_string(&target).unwrap(), "kept\n");
    }
}
