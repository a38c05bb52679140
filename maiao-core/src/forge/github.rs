use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::credentials::{token_of, CredentialGetter};
use crate::error::ReviewError;
use crate::forge::{Endpoint, PullRequest, PullRequestOptions, PullRequester};

const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";
const USER_AGENT: &str = concat!("maiao/", env!("CARGO_PKG_VERSION"));

/// Pull request upserter for github.com and GitHub Enterprise.
pub struct GitHubUpserter {
    client: Client,
    /// Host of the remote, used for browse/search URLs.
    host: String,
    api_base: String,
    graphql_url: String,
    owner: String,
    repo: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreatePullRequestRequest<'a> {
    title: &'a str,
    body: &'a str,
    base: &'a str,
    head: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    draft: Option<bool>,
}

#[derive(Debug, Serialize)]
struct UpdatePullRequestRequest<'a> {
    title: &'a str,
    body: &'a str,
    base: &'a str,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    html_url: String,
    node_id: String,
    #[serde(default)]
    draft: bool,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    name: String,
    default_branch: String,
    owner: OwnerResponse,
}

#[derive(Debug, Deserialize)]
struct OwnerResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

impl GitHubUpserter {
    /// Build an upserter for the repository behind a remote endpoint. The
    /// token comes from the credential chain; the owner and repository names
    /// are canonicalized against the API.
    pub async fn new(endpoint: &Endpoint, creds: &dyn CredentialGetter) -> Result<Self> {
        let api_domain = api_domain(&endpoint.host);
        let creds = creds
            .credential_for_host(api_domain)
            .with_context(|| format!("unable to find a token for {api_domain}"))?;
        let token = token_of(&creds)
            .ok_or_else(|| anyhow!("unable to find a token for {api_domain}"))?
            .to_string();

        let (owner, repo) = split_repository(&endpoint.path)?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        let mut upserter = Self {
            client,
            host: endpoint.host.clone(),
            api_base: api_base(&endpoint.host),
            graphql_url: graphql_url(&endpoint.host),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
        };

        // Canonicalize owner and name; this also validates the token early.
        let repository = upserter.get_repository().await?;
        upserter.owner = repository.owner.login;
        upserter.repo = repository.name;
        debug!(owner = %upserter.owner, repo = %upserter.repo, "initialized GitHub client");
        Ok(upserter)
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}{suffix}",
            self.api_base, self.owner, self.repo
        )
    }

    async fn get_repository(&self) -> Result<RepositoryResponse> {
        let response = self
            .client
            .get(self.repo_url(""))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", ACCEPT_HEADER)
            .send()
            .await
            .context("Failed to send repository request")?;
        if !response.status().is_success() {
            return Err(api_error("fetching repository", response).await);
        }
        response
            .json()
            .await
            .context("Failed to parse repository response")
    }

    /// The REST edit endpoint cannot clear draft status; GraphQL can.
    async fn mark_ready_for_review(&self, node_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "query": "mutation($id: ID!) { markPullRequestReadyForReview(input: {pullRequestId: $id}) { pullRequest { number } } }",
            "variables": { "id": node_id },
        });
        let response = self
            .client
            .post(&self.graphql_url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&body)
            .send()
            .await
            .context("Failed to send ready-for-review request")?;
        if !response.status().is_success() {
            return Err(api_error("marking pull request ready", response).await);
        }
        let parsed: GraphQlResponse = response
            .json()
            .await
            .context("Failed to parse ready-for-review response")?;
        if let Some(errors) = parsed.errors {
            return Err(anyhow!("failed to mark pull request as ready: {errors}"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PullRequester for GitHubUpserter {
    async fn ensure(&self, options: &PullRequestOptions) -> Result<(PullRequest, bool)> {
        let head_filter = format!("{}:{}", self.owner, options.head);
        let response = self
            .client
            .get(self.repo_url("/pulls"))
            .query(&[
                ("head", head_filter.as_str()),
                ("state", "open"),
                ("sort", "created"),
                ("direction", "desc"),
            ])
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", ACCEPT_HEADER)
            .send()
            .await
            .context("Failed to send pull request list request")?;
        if !response.status().is_success() {
            return Err(api_error("listing pull requests", response).await);
        }
        let matching: Vec<PullRequestResponse> = response
            .json()
            .await
            .context("Failed to parse pull request list response")?;

        match matching.as_slice() {
            [] => {
                let request = CreatePullRequestRequest {
                    title: &options.title,
                    body: &options.body,
                    base: &options.base,
                    head: &options.head,
                    draft: options.wip.then_some(true),
                };
                let response = self
                    .client
                    .post(self.repo_url("/pulls"))
                    .header("Authorization", format!("Bearer {}", self.token))
                    .header("Accept", ACCEPT_HEADER)
                    .json(&request)
                    .send()
                    .await
                    .context("Failed to send pull request creation request")?;
                if !response.status().is_success() {
                    return Err(api_error("creating pull request", response).await);
                }
                let created: PullRequestResponse = response
                    .json()
                    .await
                    .context("Failed to parse created pull request response")?;
                info!(number = created.number, head = %options.head, "created pull request");
                Ok((to_pull_request(&created), true))
            }
            [existing] => {
                debug!(number = existing.number, head = %options.head, "pull request already exists");
                Ok((to_pull_request(existing), false))
            }
            _ => {
                error!(head = %options.head, count = matching.len(), "more than one open pull request for head");
                Err(ReviewError::TooManyPullRequests.into())
            }
        }
    }

    async fn update(&self, pr: &PullRequest, options: &PullRequestOptions) -> Result<PullRequest> {
        let request = UpdatePullRequestRequest {
            title: &options.title,
            body: &options.body,
            base: &options.base,
        };
        let response = self
            .client
            .patch(self.repo_url(&format!("/pulls/{}", pr.id)))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", ACCEPT_HEADER)
            .json(&request)
            .send()
            .await
            .context("Failed to send pull request update request")?;
        if !response.status().is_success() {
            return Err(api_error("updating pull request", response).await);
        }
        let updated: PullRequestResponse = response
            .json()
            .await
            .context("Failed to parse updated pull request response")?;

        if options.ready && updated.draft {
            info!(number = updated.number, "marking pull request as ready");
            self.mark_ready_for_review(&updated.node_id).await?;
        }
        Ok(to_pull_request(&updated))
    }

    fn linked_topic_issues(&self, topic_search: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("q", &format!("is:pr is:open \"{topic_search}\""))
            .append_pair("type", "issues")
            .finish();
        format!("https://{}/search?{query}", self.host)
    }

    async fn default_branch(&self) -> Option<String> {
        match self.get_repository().await {
            Ok(repository) => Some(repository.default_branch),
            Err(err) => {
                warn!("failed to look up the remote default branch: {err}");
                None
            }
        }
    }
}

fn to_pull_request(response: &PullRequestResponse) -> PullRequest {
    PullRequest {
        id: response.number.to_string(),
        url: response.html_url.clone(),
    }
}

async fn api_error(operation: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    error!("GitHub API error {operation}: {status} - {text}");
    anyhow!("GitHub API error {operation}: {status} - {text}")
}

/// github.com hosts its API on a dedicated domain; GitHub Enterprise serves
/// it from the instance host.
fn api_domain(host: &str) -> &str {
    if host == "github.com" {
        "api.github.com"
    } else {
        host
    }
}

fn api_base(host: &str) -> String {
    if host == "github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("https://{host}/api/v3")
    }
}

fn graphql_url(host: &str) -> String {
    if host == "github.com" {
        "https://api.github.com/graphql".to_string()
    } else {
        format!("https://{host}/api/graphql")
    }
}

fn split_repository(path: &str) -> Result<(&str, &str)> {
    match path.split('/').collect::<Vec<_>>()[..] {
        [owner, repo] if !owner.is_empty() && !repo.is_empty() => Ok((owner, repo)),
        _ => Err(anyhow!("invalid repository {path:?}, expecting <owner>/<repo>")),
    }
}
