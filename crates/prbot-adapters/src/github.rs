//! GitHub REST integration
//!
//! Comment threads, file contents, pull request diffs and collaborator
//! permissions for a single repository.

use crate::config::GithubSettings;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use prbot_core::{
    Comment, CommentStore, CommentThread, DiffSource, FileContent, FilePatch, FileSource,
    PullRequestInfo, ThreadKind,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const API_TIMEOUT_SECS: u64 = 30;
const PER_PAGE: usize = 100;
/// Upper bound on pages fetched for any listing.
const MAX_PAGES: usize = 30;

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

/// Truncate an API error body and redact it entirely if it looks like it
/// carries credentials.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghs_",
        "github_pat_",
    ];

    let truncated = prbot_core::truncate::truncate_ellipsis(body, MAX_ERROR_BODY_LEN);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }
    truncated
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[derive(Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Deserialize)]
struct CommentPayload {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: Option<UserPayload>,
    #[serde(default)]
    in_reply_to_id: Option<u64>,
}

impl From<CommentPayload> for Comment {
    fn from(payload: CommentPayload) -> Self {
        Comment {
            id: payload.id,
            body: payload.body.unwrap_or_default(),
            author: payload.user.map(|u| u.login).unwrap_or_default(),
            in_reply_to: payload.in_reply_to_id,
        }
    }
}

#[derive(Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[derive(Deserialize)]
struct ContentsPayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct BranchPayload {
    sha: String,
}

#[derive(Deserialize)]
struct PullPayload {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    head: BranchPayload,
    base: BranchPayload,
}

#[derive(Deserialize)]
struct PullFilePayload {
    filename: String,
    #[serde(default)]
    patch: Option<String>,
}

#[derive(Deserialize)]
struct PermissionPayload {
    #[serde(default)]
    permission: String,
    #[serde(default)]
    role_name: Option<String>,
}

/// Collaborator permission level on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Admin,
    Maintain,
    Write,
    Triage,
    Read,
    None,
}

impl Permission {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "admin" => Permission::Admin,
            "maintain" => Permission::Maintain,
            "write" | "push" => Permission::Write,
            "triage" => Permission::Triage,
            "read" | "pull" => Permission::Read,
            _ => Permission::None,
        }
    }

    /// Whether this level may invoke the bot.
    pub fn can_invoke(&self) -> bool {
        matches!(self, Permission::Admin | Permission::Maintain | Permission::Write)
    }
}

/// Decode a contents-API response. Arrays (directories) are handled by the caller.
fn decode_contents(payload: ContentsPayload) -> Result<Option<FileContent>> {
    match payload.kind.as_str() {
        "dir" => return Ok(Some(FileContent::Directory)),
        "file" => {}
        // symlink / submodule
        _ => return Ok(Some(FileContent::Binary)),
    }

    match (payload.encoding.as_deref(), payload.content) {
        (Some("base64"), Some(content)) => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = STANDARD
                .decode(compact)
                .context("Failed to decode file content")?;
            Ok(Some(FileContent::from_bytes(bytes)))
        }
        // Files over 1 MB come back without inline content.
        _ => Ok(None),
    }
}

/// Percent-encode each segment of a repository path.
fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| url::form_urlencoded::byte_serialize(segment.as_bytes()).collect::<String>())
        .collect::<Vec<_>>()
        .join("/")
        .replace('+', "%20")
}

/// Client for one repository.
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
    owner: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(settings: &GithubSettings, owner: &str, repo: &str) -> Result<Self> {
        let token = settings
            .token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Not authenticated with GitHub. Set GITHUB_TOKEN."))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            token,
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, self.owner, self.repo, suffix)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;
        check_status(resp).await
    }

    async fn get_paged<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let builder = self
                .request(reqwest::Method::GET, url)
                .query(&[("per_page", PER_PAGE), ("page", page)]);
            let batch: Vec<T> = self
                .send(builder, what)
                .await?
                .json()
                .await
                .with_context(|| format!("Failed to parse {} response", what))?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }
        tracing::warn!(what, pages = MAX_PAGES, "listing truncated at page limit");
        Ok(items)
    }

    async fn list_comments_impl(&self, thread: &CommentThread) -> Result<Vec<Comment>> {
        let url = match thread.kind {
            ThreadKind::Conversation => self.repo_url(&format!("issues/{}/comments", thread.number)),
            ThreadKind::Review => self.repo_url(&format!("pulls/{}/comments", thread.number)),
        };
        let payloads: Vec<CommentPayload> = self.get_paged(&url, "list comments").await?;
        Ok(payloads.into_iter().map(Comment::from).collect())
    }

    async fn create_comment_impl(
        &self,
        thread: &CommentThread,
        body: &str,
        reply_to: Option<u64>,
    ) -> Result<Comment> {
        let url = match (thread.kind, reply_to) {
            (ThreadKind::Review, Some(parent)) => {
                self.repo_url(&format!("pulls/{}/comments/{}/replies", thread.number, parent))
            }
            // Top-level review comments need a commit and position; a reply-less
            // answer goes to the conversation instead.
            _ => self.repo_url(&format!("issues/{}/comments", thread.number)),
        };
        let payload: CommentPayload = self
            .send(
                self.request(reqwest::Method::POST, &url).json(&CommentBody { body }),
                "create comment",
            )
            .await?
            .json()
            .await
            .context("Failed to parse created comment")?;
        Ok(payload.into())
    }

    async fn update_comment_impl(&self, thread: &CommentThread, id: u64, body: &str) -> Result<Comment> {
        let url = match thread.kind {
            ThreadKind::Conversation => self.repo_url(&format!("issues/comments/{}", id)),
            ThreadKind::Review => self.repo_url(&format!("pulls/comments/{}", id)),
        };
        let payload: CommentPayload = self
            .send(
                self.request(reqwest::Method::PATCH, &url).json(&CommentBody { body }),
                "update comment",
            )
            .await?
            .json()
            .await
            .context("Failed to parse updated comment")?;
        Ok(payload.into())
    }

    async fn get_file_at_impl(&self, path: &str, git_ref: &str) -> Result<FileContent> {
        let url = self.repo_url(&format!("contents/{}", encode_path(path)));
        let resp = self
            .request(reqwest::Method::GET, &url)
            .query(&[("ref", git_ref)])
            .send()
            .await
            .context("Failed to send file contents request")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(FileContent::NotFound);
        }
        let value: serde_json::Value = check_status(resp)
            .await?
            .json()
            .await
            .context("Failed to parse file contents response")?;

        if value.is_array() {
            return Ok(FileContent::Directory);
        }
        let payload: ContentsPayload =
            serde_json::from_value(value).context("Unexpected file contents response")?;
        if let Some(content) = decode_contents(payload)? {
            return Ok(content);
        }

        tracing::debug!(path, "no inline content, fetching raw");
        let bytes = self
            .send(
                self.request(reqwest::Method::GET, &url)
                    .query(&[("ref", git_ref)])
                    .header("Accept", "application/vnd.github.raw"),
                "raw file contents",
            )
            .await?
            .bytes()
            .await
            .context("Failed to read raw file contents")?;
        Ok(FileContent::from_bytes(bytes.to_vec()))
    }

    async fn pull_request_impl(&self, number: u64) -> Result<PullRequestInfo> {
        let url = self.repo_url(&format!("pulls/{}", number));
        let pr: PullPayload = self
            .send(self.request(reqwest::Method::GET, &url), "pull request")
            .await?
            .json()
            .await
            .context("Failed to parse pull request response")?;
        Ok(PullRequestInfo {
            number: pr.number,
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            head_sha: pr.head.sha,
            base_sha: pr.base.sha,
        })
    }

    async fn pull_request_patches_impl(&self, number: u64) -> Result<Vec<FilePatch>> {
        let url = self.repo_url(&format!("pulls/{}/files", number));
        let files: Vec<PullFilePayload> = self.get_paged(&url, "pull request files").await?;
        Ok(files
            .into_iter()
            .map(|f| FilePatch {
                filename: f.filename,
                patch: f.patch,
            })
            .collect())
    }

    /// Permission level of `login` on this repository.
    pub async fn collaborator_permission(&self, login: &str) -> Result<Permission> {
        let url = self.repo_url(&format!("collaborators/{}/permission", encode_path(login)));
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to send permission request")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Permission::None);
        }
        let payload: PermissionPayload = check_status(resp)
            .await?
            .json()
            .await
            .context("Failed to parse permission response")?;
        Ok(payload_permission(&payload))
    }
}

fn payload_permission(payload: &PermissionPayload) -> Permission {
    // role_name distinguishes maintain/triage, which `permission` folds into write/read.
    match payload.role_name.as_deref() {
        Some(role) if Permission::parse(role) != Permission::None => Permission::parse(role),
        _ => Permission::parse(&payload.permission),
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let error_body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("{}", describe_api_error(status, &error_body)))
}

fn describe_api_error(status: reqwest::StatusCode, error_body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(error_body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        let msg = if detail.is_empty() {
            api_error.message
        } else {
            format!("{}: {}", api_error.message, detail)
        };
        return format!("GitHub API error ({}): {}", status.as_u16(), sanitize_error_body(&msg));
    }
    format!(
        "GitHub API error ({}): {}",
        status.as_u16(),
        sanitize_error_body(error_body)
    )
}

impl CommentStore for GitHubClient {
    fn list_comments<'a>(
        &'a self,
        thread: &'a CommentThread,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Comment>>> + Send + 'a>> {
        Box::pin(self.list_comments_impl(thread))
    }

    fn create_comment<'a>(
        &'a self,
        thread: &'a CommentThread,
        body: &'a str,
        reply_to: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<Comment>> + Send + 'a>> {
        Box::pin(self.create_comment_impl(thread, body, reply_to))
    }

    fn update_comment<'a>(
        &'a self,
        thread: &'a CommentThread,
        id: u64,
        body: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Comment>> + Send + 'a>> {
        Box::pin(self.update_comment_impl(thread, id, body))
    }
}

impl FileSource for GitHubClient {
    fn get_file_at<'a>(
        &'a self,
        path: &'a str,
        git_ref: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FileContent>> + Send + 'a>> {
        Box::pin(self.get_file_at_impl(path, git_ref))
    }
}

impl DiffSource for GitHubClient {
    fn pull_request<'a>(
        &'a self,
        number: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PullRequestInfo>> + Send + 'a>> {
        Box::pin(self.pull_request_impl(number))
    }

    fn pull_request_patches<'a>(
        &'a self,
        number: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FilePatch>>> + Send + 'a>> {
        Box::pin(self.pull_request_patches_impl(number))
    }
}
