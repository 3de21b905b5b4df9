//! Read-only collaborators the command handler pulls context from.

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;

/// Result of fetching a path at a ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    /// Present, but not valid UTF-8 text.
    Binary,
    Directory,
    NotFound,
}

impl FileContent {
    /// Classify raw bytes: NUL bytes or invalid UTF-8 mean binary.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes.contains(&0) {
            return FileContent::Binary;
        }
        match String::from_utf8(bytes) {
            Ok(text) => FileContent::Text(text),
            Err(_) => FileContent::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head_sha: String,
    /// Commit the base branch pointed at when the pull request was last
    /// synchronized; old-side line numbers refer to it.
    pub base_sha: String,
}

/// One changed file of a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub filename: String,
    /// Absent for binary files and very large diffs.
    pub patch: Option<String>,
}

pub trait FileSource: Send + Sync {
    fn get_file_at<'a>(
        &'a self,
        path: &'a str,
        git_ref: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<FileContent>> + Send + 'a>>;
}

pub trait DiffSource: Send + Sync {
    fn pull_request<'a>(
        &'a self,
        number: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PullRequestInfo>> + Send + 'a>>;

    fn pull_request_patches<'a>(
        &'a self,
        number: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FilePatch>>> + Send + 'a>>;
}
