use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::body;
use crate::change::{changes_need_rebase, extract_changes};
use crate::credentials::{default_chain, CredentialGetter};
use crate::error::ReviewError;
use crate::forge::{new_pull_requester, Endpoint, PullRequester};
use crate::rebase;
use crate::repo::{Reference, Repository};

/// Configuration of one review run. Unset fields are resolved from the
/// repository configuration and the forge.
#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    /// Remote to review against; defaults to the branch's tracking remote,
    /// then `origin`.
    pub remote: Option<String>,
    /// Target base branch; defaults to the forge's default branch, then
    /// `init.defaultBranch`, then `master`.
    pub branch: Option<String>,
    pub skip_rebase: bool,
    /// Groups related pull requests across repositories.
    pub topic: Option<String>,
    /// Transition draft pull requests to ready for review.
    pub ready: bool,
    /// Open new pull requests as drafts.
    pub wip: bool,
}

/// Builds the forge client for a remote's URLs; the seam through which
/// tests substitute a fake forge.
#[async_trait]
pub trait ForgeFactory: Send + Sync {
    async fn for_remote(
        &self,
        urls: &[String],
        creds: &dyn CredentialGetter,
    ) -> Result<Box<dyn PullRequester>>;
}

struct DefaultForgeFactory;

#[async_trait]
impl ForgeFactory for DefaultForgeFactory {
    async fn for_remote(
        &self,
        urls: &[String],
        creds: &dyn CredentialGetter,
    ) -> Result<Box<dyn PullRequester>> {
        new_pull_requester(urls, creds).await
    }
}

/// Process-level capabilities threaded into the engine, gathered in one
/// value so tests can substitute every external dependency at once.
pub struct Environment {
    pub credentials: Box<dyn CredentialGetter>,
    pub forge: Box<dyn ForgeFactory>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            credentials: Box::new(default_chain()),
            forge: Box::new(DefaultForgeFactory),
        }
    }
}

/// Run a review: bring the local stack up to date with the remote, then
/// ensure one chained pull request per change.
///
/// When a rebase is required this returns right after spawning it; the
/// rebase's terminal `exec` step re-invokes the program, which re-enters
/// here with the rewritten history.
pub async fn review(
    repo: &dyn Repository,
    env: &Environment,
    options: &ReviewOptions,
) -> Result<()> {
    let remote = default_remote(repo, options);
    let head = repo.head().context("failed to retrieve git HEAD")?;
    debug!(remote, head_ref = %head.name, head_sha = %head.sha, "starting review");

    let remote_urls = repo.remote_urls(&remote)?;
    let upserter = env
        .forge
        .for_remote(&remote_urls, env.credentials.as_ref())
        .await?;
    let branch = default_branch(repo, upserter.as_ref(), options).await;

    repo.fetch(&remote)?;

    let remote_ref = format!("{remote}/{branch}");
    let base = repo
        .merge_base(&remote_ref, "HEAD")
        .context("unable to find common ancestor")?;
    let remote_commit = repo.resolve_revision(&remote_ref)?;

    let mut need_rebase = remote_commit != base;
    if !need_rebase {
        let changes = extract_changes(&repo.commits_between(&base, &head.sha)?)?;
        need_rebase = changes_need_rebase(&changes);
    }

    if need_rebase && !options.skip_rebase {
        debug!(remote_sha = %remote_commit, base_sha = %base, "local branch is not up to date, needs rebasing");
        return rebase::rebase_commits(repo, &base, &remote_commit, &head.sha);
    }
    debug!(remote_sha = %remote_commit, base_sha = %base, "no rebase needed");

    if base == head.sha {
        println!("nothing to review");
        return Ok(());
    }

    send_pull_requests(
        repo,
        env,
        upserter.as_ref(),
        options,
        &remote,
        &remote_urls,
        &branch,
        &base,
        &head,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn send_pull_requests(
    repo: &dyn Repository,
    env: &Environment,
    upserter: &dyn PullRequester,
    options: &ReviewOptions,
    remote: &str,
    remote_urls: &[String],
    branch: &str,
    base: &str,
    head: &Reference,
) -> Result<()> {
    let mut changes = extract_changes(&repo.commits_between(base, &head.sha)?)?;

    let mut refspecs = Vec::with_capacity(changes.len());
    for change in &changes {
        let head_commit = change.head().ok_or(ReviewError::EmptyChange)?;
        refspecs.push(format!("{}:refs/heads/{}", head_commit.sha, change.branch));
    }
    debug!(?refspecs, "pushing review branches");
    let push_creds = remote_urls
        .first()
        .and_then(|url| Endpoint::parse(url).ok())
        .and_then(|endpoint| env.credentials.credential_for_host(&endpoint.host).ok());
    repo.push(remote, &refspecs, push_creds.as_ref())?;

    let topic = options.topic.as_deref();
    // First pass: every change gets its pull request, oldest first, so each
    // child can reference its parent's freshly assigned id.
    for index in 0..changes.len() {
        let pr_options = body::pr_options(
            upserter,
            branch,
            topic,
            options.ready,
            options.wip,
            Some(&head.short_name),
            &changes,
            index,
        );
        let (pr, created) = upserter.ensure(&pr_options).await?;
        if created {
            println!("created PR {}", pr.url);
        }
        changes[index].pr = Some(pr);
        changes[index].created = created;
    }
    // Second pass: now that every sibling has a known id, recompute the
    // bodies for the full cross-linking and push the updates.
    for index in 0..changes.len() {
        let pr_options = body::pr_options(
            upserter,
            branch,
            topic,
            options.ready,
            options.wip,
            Some(&head.short_name),
            &changes,
            index,
        );
        let pr = changes[index]
            .pr
            .clone()
            .ok_or_else(|| anyhow!("change has no pull request after the first pass"))?;
        upserter.update(&pr, &pr_options).await?;
        if !changes[index].created {
            println!("updated PR {}", pr.url);
        }
    }
    Ok(())
}

fn default_remote(repo: &dyn Repository, options: &ReviewOptions) -> String {
    if let Some(remote) = options.remote.as_deref() {
        if !remote.is_empty() {
            return remote.to_string();
        }
    }
    let branch = options.branch.clone().unwrap_or_default();
    match repo.branch_remote(&branch) {
        Some(remote) => {
            debug!(branch, remote, "found tracking remote");
            remote
        }
        None => {
            debug!(branch, "no tracking remote found, using default \"origin\"");
            "origin".to_string()
        }
    }
}

async fn default_branch(
    repo: &dyn Repository,
    upserter: &dyn PullRequester,
    options: &ReviewOptions,
) -> String {
    if let Some(branch) = options.branch.as_deref() {
        if !branch.is_empty() {
            return branch.to_string();
        }
    }
    if let Some(branch) = upserter.default_branch().await {
        if !branch.is_empty() {
            debug!(branch, "using the remote default branch");
            return branch;
        }
    }
    if let Some(branch) = repo.default_branch_config() {
        debug!(branch, "using init.defaultBranch from git configuration");
        return branch;
    }
    debug!("using default \"master\" branch");
    "master".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::forge::{PullRequest, PullRequestOptions};
    use crate::repo::Commit;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    struct FakeRepository {
        root: PathBuf,
        head: Reference,
        remote_tip: String,
        merge_base: String,
        commits: Vec<Commit>,
        branch_remote: Option<String>,
        default_branch: Option<String>,
        pushes: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRepository {
        fn new(head_sha: &str, base: &str, commits: Vec<Commit>) -> Self {
            Self {
                root: PathBuf::from("/fake"),
                head: Reference {
                    name: "refs/heads/feature".to_string(),
                    short_name: "feature".to_string(),
                    sha: head_sha.to_string(),
                },
                remote_tip: base.to_string(),
                merge_base: base.to_string(),
                commits,
                branch_remote: None,
                default_branch: None,
                pushes: Mutex::new(Vec::new()),
            }
        }
    }

    impl Repository for FakeRepository {
        fn root(&self) -> &Path {
            &self.root
        }
        fn git_dir(&self) -> Result<PathBuf> {
            Ok(self.root.join(".git"))
        }
        fn head(&self) -> Result<Reference> {
            Ok(self.head.clone())
        }
        fn remote_urls(&self, _name: &str) -> Result<Vec<String>> {
            Ok(vec!["https://github.com/owner/repo.git".to_string()])
        }
        fn branch_remote(&self, _branch: &str) -> Option<String> {
            self.branch_remote.clone()
        }
        fn default_branch_config(&self) -> Option<String> {
            self.default_branch.clone()
        }
        fn fetch(&self, _remote: &str) -> Result<()> {
            Ok(())
        }
        fn resolve_revision(&self, _rev: &str) -> Result<String> {
            Ok(self.remote_tip.clone())
        }
        fn merge_base(&self, _a: &str, _b: &str) -> Result<String> {
            Ok(self.merge_base.clone())
        }
        fn commits_between(&self, _base: &str, head: &str) -> Result<Vec<Commit>> {
            if head == self.head.sha {
                Ok(self.commits.clone())
            } else {
                Ok(Vec::new())
            }
        }
        fn push(
            &self,
            _remote: &str,
            refspecs: &[String],
            _creds: Option<&Credentials>,
        ) -> Result<()> {
            self.pushes.lock().unwrap().push(refspecs.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct ForgeLog {
        events: Vec<String>,
        ensures: Vec<PullRequestOptions>,
        updates: Vec<(PullRequest, PullRequestOptions)>,
        existing: HashMap<String, PullRequest>,
        next_id: u64,
        fail_with_too_many: bool,
        default_branch: Option<String>,
    }

    struct FakeUpserter {
        log: Arc<Mutex<ForgeLog>>,
    }

    #[async_trait]
    impl PullRequester for FakeUpserter {
        async fn ensure(&self, options: &PullRequestOptions) -> Result<(PullRequest, bool)> {
            let mut log = self.log.lock().unwrap();
            if log.fail_with_too_many {
                return Err(ReviewError::TooManyPullRequests.into());
            }
            log.events.push(format!("ensure {}", options.head));
            log.ensures.push(options.clone());
            if let Some(pr) = log.existing.get(&options.head) {
                return Ok((pr.clone(), false));
            }
            log.next_id += 1;
            let pr = PullRequest {
                id: log.next_id.to_string(),
                url: format!("https://github.com/owner/repo/pull/{}", log.next_id),
            };
            log.existing.insert(options.head.clone(), pr.clone());
            Ok((pr, true))
        }

        async fn update(
            &self,
            pr: &PullRequest,
            options: &PullRequestOptions,
        ) -> Result<PullRequest> {
            let mut log = self.log.lock().unwrap();
            log.events.push(format!("update {}", pr.id));
            log.updates.push((pr.clone(), options.clone()));
            Ok(pr.clone())
        }

        fn linked_topic_issues(&self, topic_search: &str) -> String {
            format!("https://github.com/search/{topic_search}")
        }

        async fn default_branch(&self) -> Option<String> {
            self.log.lock().unwrap().default_branch.clone()
        }
    }

    struct FakeForgeFactory {
        log: Arc<Mutex<ForgeLog>>,
    }

    #[async_trait]
    impl ForgeFactory for FakeForgeFactory {
        async fn for_remote(
            &self,
            _urls: &[String],
            _creds: &dyn CredentialGetter,
        ) -> Result<Box<dyn PullRequester>> {
            Ok(Box::new(FakeUpserter {
                log: self.log.clone(),
            }))
        }
    }

    struct NoCredentials;

    impl CredentialGetter for NoCredentials {
        fn credential_for_host(&self, host: &str) -> Result<Credentials> {
            Err(anyhow!("no credentials for {host}"))
        }
    }

    fn environment(log: &Arc<Mutex<ForgeLog>>) -> Environment {
        Environment {
            credentials: Box::new(NoCredentials),
            forge: Box::new(FakeForgeFactory { log: log.clone() }),
        }
    }

    fn forge_log() -> Arc<Mutex<ForgeLog>> {
        Arc::new(Mutex::new(ForgeLog {
            default_branch: Some("main".to_string()),
            ..Default::default()
        }))
    }

    fn commit(sha: &str, parent: &str, message: &str) -> Commit {
        Commit {
            sha: sha.to_string(),
            parents: vec![parent.to_string()],
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_review_single_change_creates_one_pr() {
        let repo = FakeRepository::new(
            "headsha",
            "basesha",
            vec![commit(
                "headsha",
                "basesha",
                "Add feature X\n\nBody\n\nChange-Id: I1234",
            )],
        );
        let log = forge_log();
        let env = environment(&log);

        review(&repo, &env, &ReviewOptions::default()).await.unwrap();

        assert_eq!(
            *repo.pushes.lock().unwrap(),
            vec![vec!["headsha:refs/heads/maiao.I1234".to_string()]]
        );
        let log = log.lock().unwrap();
        assert_eq!(log.ensures.len(), 1);
        assert_eq!(log.ensures[0].base, "main");
        assert_eq!(log.ensures[0].head, "maiao.I1234");
        assert_eq!(log.ensures[0].title, "Add feature X");
        assert!(
            log.ensures[0].body.starts_with("Body\n<details>"),
            "body must open with the commit body: {:?}",
            log.ensures[0].body
        );
        assert!(log.ensures[0].body.contains("Local-Branch: feature"));
        assert_eq!(log.updates.len(), 1);
    }

    #[tokio::test]
    async fn test_review_chains_stacked_changes() {
        let repo = FakeRepository::new(
            "c2",
            "basesha",
            vec![
                commit("c2", "c1", "feat: bar\n\nChange-Id: Ib"),
                commit("c1", "basesha", "feat: foo\n\nChange-Id: Ia"),
            ],
        );
        let log = forge_log();
        let env = environment(&log);

        review(&repo, &env, &ReviewOptions::default()).await.unwrap();

        assert_eq!(
            *repo.pushes.lock().unwrap(),
            vec![vec![
                "c1:refs/heads/maiao.Ia".to_string(),
                "c2:refs/heads/maiao.Ib".to_string(),
            ]]
        );
        let log = log.lock().unwrap();
        assert_eq!(log.ensures.len(), 2);
        assert_eq!(log.ensures[0].base, "main");
        assert_eq!(log.ensures[1].base, "maiao.Ia");
        assert_eq!(log.ensures[1].title, "[need #1] feat: bar");
        // No update may run before every ensure completed.
        assert_eq!(
            log.events,
            ["ensure maiao.Ia", "ensure maiao.Ib", "update 1", "update 2"]
        );
        // Second pass bodies cross-link siblings by their now-known ids.
        assert!(log.updates[0].1.body.contains("feat: bar (#2)"));
        assert!(log.updates[1].1.body.contains("feat: foo (#1)"));
    }

    #[tokio::test]
    async fn test_review_is_idempotent_for_existing_prs() {
        let repo = FakeRepository::new(
            "headsha",
            "basesha",
            vec![commit(
                "headsha",
                "basesha",
                "Add feature X\n\nBody\n\nChange-Id: I1234",
            )],
        );
        let log = forge_log();
        log.lock().unwrap().existing.insert(
            "maiao.I1234".to_string(),
            PullRequest {
                id: "7".to_string(),
                url: "https://github.com/owner/repo/pull/7".to_string(),
            },
        );
        let env = environment(&log);

        review(&repo, &env, &ReviewOptions::default()).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.next_id, 0, "no pull request may be created");
        assert_eq!(log.updates.len(), 1);
        assert_eq!(log.updates[0].0.id, "7");
    }

    #[tokio::test]
    async fn test_review_propagates_duplicate_pr_error() {
        let repo = FakeRepository::new(
            "headsha",
            "basesha",
            vec![commit(
                "headsha",
                "basesha",
                "Add feature X\n\nChange-Id: I1234",
            )],
        );
        let log = forge_log();
        log.lock().unwrap().fail_with_too_many = true;
        let env = environment(&log);

        let err = review(&repo, &env, &ReviewOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many matching pull requests"));
        assert!(log.lock().unwrap().updates.is_empty());
    }

    #[tokio::test]
    async fn test_review_nothing_to_do_when_head_is_the_base() {
        let repo = FakeRepository::new("basesha", "basesha", Vec::new());
        let log = forge_log();
        let env = environment(&log);

        review(&repo, &env, &ReviewOptions::default()).await.unwrap();

        let log = log.lock().unwrap();
        assert!(log.ensures.is_empty());
        assert!(log.updates.is_empty());
        assert!(repo.pushes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_remote_prefers_explicit_option() {
        let repo = FakeRepository::new("h", "b", Vec::new());
        let options = ReviewOptions {
            remote: Some("upstream".to_string()),
            ..Default::default()
        };
        assert_eq!(default_remote(&repo, &options), "upstream");
    }

    #[test]
    fn test_default_remote_uses_tracking_remote() {
        let mut repo = FakeRepository::new("h", "b", Vec::new());
        repo.branch_remote = Some("fork".to_string());
        let options = ReviewOptions {
            branch: Some("feature".to_string()),
            ..Default::default()
        };
        assert_eq!(default_remote(&repo, &options), "fork");
    }

    #[test]
    fn test_default_remote_falls_back_to_origin() {
        let repo = FakeRepository::new("h", "b", Vec::new());
        assert_eq!(default_remote(&repo, &ReviewOptions::default()), "origin");
    }

    #[tokio::test]
    async fn test_default_branch_prefers_explicit_option() {
        let repo = FakeRepository::new("h", "b", Vec::new());
        let log = forge_log();
        let upserter = FakeUpserter { log };
        let options = ReviewOptions {
            branch: Some("release".to_string()),
            ..Default::default()
        };
        assert_eq!(default_branch(&repo, &upserter, &options).await, "release");
    }

    #[tokio::test]
    async fn test_default_branch_asks_the_forge() {
        let repo = FakeRepository::new("h", "b", Vec::new());
        let log = forge_log();
        let upserter = FakeUpserter { log };
        assert_eq!(
            default_branch(&repo, &upserter, &ReviewOptions::default()).await,
            "main"
        );
    }

    #[tokio::test]
    async fn test_default_branch_falls_back_to_git_config_then_master() {
        let mut repo = FakeRepository::new("h", "b", Vec::new());
        repo.default_branch = Some("trunk".to_string());
        let log = Arc::new(Mutex::new(ForgeLog::default()));
        let upserter = FakeUpserter { log: log.clone() };
        assert_eq!(
            default_branch(&repo, &upserter, &ReviewOptions::default()).await,
            "trunk"
        );

        let repo = FakeRepository::new("h", "b", Vec::new());
        let upserter = FakeUpserter { log };
        assert_eq!(
            default_branch(&repo, &upserter, &ReviewOptions::default()).await,
            "master"
        );
    }
}
