use sha1::{Digest, Sha1};

use crate::change::Change;
use crate::forge::{PullRequestOptions, PullRequester};

/// The key grouping pull requests of one topic across repositories:
/// SHA-1 of `topic: <topic>`, hex encoded. Stable, opaque, and unlikely to
/// collide with anything a human would type into the forge search box.
pub fn topic_search_sha(topic: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"topic: ");
    hasher.update(topic.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn details(body: &[String], summary: &str) -> Vec<String> {
    let mut lines = vec!["<details>".to_string()];
    if !summary.is_empty() {
        lines.push("<summary>".to_string());
        lines.push(summary.to_string());
        lines.push("</summary>".to_string());
    }
    lines.extend_from_slice(body);
    lines.push("</details>".to_string());
    lines
}

fn topic_details(upserter: &dyn PullRequester, topic: &str) -> Vec<String> {
    let topic_sha = topic_search_sha(topic);
    details(
        &[
            "This change is part of a broader topic that can be in multiple repositories."
                .to_string(),
            "<br/>".to_string(),
            format!(
                r#"Topic: <a href="{}" searchSha="{topic_sha}">{topic}</a>"#,
                upserter.linked_topic_issues(&topic_sha)
            ),
        ],
        "Broader related changes",
    )
}

fn committer_details(branch: &str) -> Vec<String> {
    details(&[format!("Local-Branch: {branch}")], "Committer details")
}

fn change_details(changes: &[Change]) -> Vec<String> {
    let mut lines = Vec::new();
    for change in changes {
        let mut title = change.message.title.clone();
        if let Some(pr) = &change.pr {
            title = format!("{title} (#{})", pr.id);
        }
        lines.extend(details(&[change.message.body.clone()], &title));
    }
    lines
}

fn related_changes(parents: &[Change], futures: &[Change]) -> Vec<String> {
    if parents.is_empty() && futures.is_empty() {
        return Vec::new();
    }
    let mut content = Vec::new();
    if !parents.is_empty() {
        content.extend(details(&change_details(parents), "Parent changes"));
    }
    if !futures.is_empty() {
        content.extend(details(&change_details(futures), "Future changes"));
    }
    details(&content, "Related changes")
}

/// Assemble the creation/update options for the pull request of
/// `changes[index]`.
///
/// The base is the parent change's branch when there is one, the review
/// target branch otherwise; the title gains a `[need #<id>]` marker once the
/// parent has a pull request. The body is the change's own commit body
/// followed by the committer, related-changes and topic sections.
pub fn pr_options(
    upserter: &dyn PullRequester,
    target_branch: &str,
    topic: Option<&str>,
    ready: bool,
    wip: bool,
    head_branch: Option<&str>,
    changes: &[Change],
    index: usize,
) -> PullRequestOptions {
    let change = &changes[index];
    let parent = index.checked_sub(1).map(|i| &changes[i]);

    let mut base = target_branch.to_string();
    let mut title = change.message.title.clone();
    if let Some(parent) = parent {
        if !parent.branch.is_empty() {
            base = parent.branch.clone();
        }
        if let Some(pr) = &parent.pr {
            title = format!("[need #{}] {title}", pr.id);
        }
    }

    let mut additions = Vec::new();
    if let Some(head_branch) = head_branch {
        additions.extend(committer_details(head_branch));
    }
    additions.extend(related_changes(&changes[..index], &changes[index + 1..]));
    if let Some(topic) = topic {
        additions.extend(topic_details(upserter, topic));
    }

    let mut body_lines = vec![change.message.body.clone()];
    body_lines.extend(additions);

    PullRequestOptions {
        base,
        head: change.branch.clone(),
        title,
        body: body_lines.join("\n"),
        ready,
        wip,
    }
}
