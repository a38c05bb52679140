use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::error::ReviewError;
use crate::forge::PullRequest;
use crate::message::Message;
use crate::repo::Commit;

/// Per-change remote branches are named `maiao.<change id>`.
pub const BRANCH_PREFIX: &str = "maiao.";

/// A logical unit of review: one non-fixup commit plus every fixup folded
/// onto it, keyed by its `Change-Id` trailer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Change {
    /// Commits in git order, oldest first. Never empty after extraction.
    pub commits: Vec<Commit>,
    /// Parsed message of the non-fixup commit.
    pub message: Message,
    pub change_id: Option<String>,
    /// `maiao.<change id>`, or empty while the change has no identifier yet.
    pub branch: String,
    pub pr: Option<PullRequest>,
    pub created: bool,
}

impl Change {
    /// The newest commit of the change, the one pushed as the branch tip.
    pub fn head(&self) -> Option<&Commit> {
        self.commits.last()
    }
}

/// Group the commits of a range into changes, folding fixups onto the commit
/// whose folded title they name.
///
/// `commits` is the walk output, newest first, excluding the base. Changes
/// that already carry an identifier come back oldest first; commits still
/// missing one are appended after them and will force a rebase before any
/// pull request is opened.
pub fn extract_changes(commits: &[Commit]) -> Result<Vec<Change>, ReviewError> {
    let mut pending_fixups: HashMap<String, Vec<Commit>> = HashMap::new();
    let mut changes: Vec<Change> = Vec::new();

    for commit in commits {
        if commit.parents.len() > 1 {
            return Err(ReviewError::MergeCommitsUnsupported);
        }
        let message = Message::parse(&commit.message);
        let folded_title = message.folded_title().to_string();
        if message.is_fixup() {
            trace!(sha = %commit.sha, title = %folded_title, "stacking fixup commit");
            pending_fixups
                .entry(folded_title)
                .or_default()
                .insert(0, commit.clone());
            continue;
        }

        let mut change_commits = vec![commit.clone()];
        if let Some(fixups) = pending_fixups.remove(&folded_title) {
            change_commits.extend(fixups);
        }
        match message.change_id().map(str::to_string) {
            Some(id) => {
                let branch = format!("{BRANCH_PREFIX}{id}");
                changes.insert(
                    0,
                    Change {
                        commits: change_commits,
                        message,
                        change_id: Some(id),
                        branch,
                        ..Default::default()
                    },
                );
            }
            None => changes.push(Change {
                commits: change_commits,
                message,
                ..Default::default()
            }),
        }
    }

    if !pending_fixups.is_empty() {
        return Err(ReviewError::UnmatchedFixups);
    }
    Ok(changes)
}

/// Collect every change identifier present in a commit range, newest first or
/// not; only membership matters.
pub fn extract_change_ids(commits: &[Commit]) -> HashSet<String> {
    commits
        .iter()
        .filter_map(|commit| {
            Message::parse(&commit.message)
                .change_id()
                .map(str::to_string)
        })
        .collect()
}

/// Drop changes whose identifier already landed upstream.
pub fn remove_merged_changes(changes: Vec<Change>, landed: &HashSet<String>) -> Vec<Change> {
    changes
        .into_iter()
        .filter(|change| {
            change
                .change_id
                .as_deref()
                .is_none_or(|id| !landed.contains(id))
        })
        .collect()
}

/// Whether the extracted changes require a rebase: any change missing an
/// identifier, or any break in the first-parent chain across the
/// concatenated commit lists.
pub fn changes_need_rebase(changes: &[Change]) -> bool {
    let mut previous: Option<&Commit> = None;
    for change in changes {
        if change.change_id.is_none() {
            debug!("change is missing an identifier, rebase required");
            return true;
        }
        for commit in &change.commits {
            if let Some(parent) = previous {
                match commit.parents.first() {
                    None => {
                        debug!(commit = %commit.sha, "commit has no parent, rebase required");
                        return true;
                    }
                    Some(first_parent) if first_parent != &parent.sha => {
                        debug!(
                            commit = %commit.sha,
                            expected = %parent.sha,
                            actual = %first_parent,
                            "commit history change detected, rebase required"
                        );
                        return true;
                    }
                    Some(_) => {}
                }
            }
            previous = Some(commit);
        }
    }
    debug!("no change needing rebase detected");
    false
}

/// Render the rebase instruction list: `reword` for the first commit of a
/// change without an identifier (so the commit-msg hook can inject one),
/// `pick` everywhere else.
pub fn rebase_todo(changes: &[Change]) -> String {
    let mut lines = Vec::new();
    for change in changes {
        for (i, commit) in change.commits.iter().enumerate() {
            let action = if i == 0 && change.change_id.is_none() {
                "reword"
            } else {
                "pick"
            };
            let subject = commit.message.split('\n').next().unwrap_or_default();
            lines.push(format!("{action} {} {subject}", commit.sha));
        }
    }
    lines.join("\n")
}
