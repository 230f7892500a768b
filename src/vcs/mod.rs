//! Optimistic-concurrency file versioning.
//!
//! Every (project, file path) owns an append-only log of snapshots numbered
//! 1..N. A commit names the version it was based on; if someone else has
//! committed since, the commit is rejected and a conflict record is kept
//! until somebody resolves or ignores it.

pub mod detector;
pub mod resolver;
pub mod service;

pub use detector::{ConflictDetector, Verdict};
pub use resolver::ConflictResolver;
pub use service::VersionControl;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::directory::UserRef;
use crate::error::{parse_id, AppError, AppResult};
use crate::session::UserId;

pub type ProjectId = Uuid;
pub type VersionId = Uuid;
pub type ConflictId = Uuid;

/// Longest file path accepted, in bytes
pub const MAX_PATH_LEN: usize = 1024;

/// One immutable snapshot of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: VersionId,
    pub project_id: ProjectId,
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    /// Position in the per-path log, starting at 1
    pub version: u64,
    pub content: String,
    pub file_hash: String,
    pub file_size: u64,
    pub commit_message: String,
    pub author_id: UserId,
    /// Tombstone marker; history is never physically removed
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to append a version except its number
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub project_id: ProjectId,
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub author_id: UserId,
    pub content: String,
    pub file_hash: String,
    pub file_size: u64,
    pub commit_message: String,
    pub is_deleted: bool,
}

impl NewVersion {
    /// Stamp a version number onto the draft
    pub fn into_version(self, version: u64) -> FileVersion {
        FileVersion {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            file_path: self.file_path,
            file_name: self.file_name,
            file_type: self.file_type,
            version,
            content: self.content,
            file_hash: self.file_hash,
            file_size: self.file_size,
            commit_message: self.commit_message,
            author_id: self.author_id,
            is_deleted: self.is_deleted,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

impl ConflictStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConflictStatus::Pending)
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStatus::Pending => write!(f, "pending"),
            ConflictStatus::Resolved => write!(f, "resolved"),
            ConflictStatus::Ignored => write!(f, "ignored"),
        }
    }
}

/// Durable evidence of a rejected stale commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub id: ConflictId,
    pub project_id: ProjectId,
    pub file_path: String,
    pub base_version: u64,
    /// Head version at the time the stale commit arrived
    pub latest_version: u64,
    /// The committer whose write was rejected
    pub local_author_id: UserId,
    /// Author of the head version
    pub remote_author_id: UserId,
    pub local_content: String,
    pub remote_content: String,
    pub status: ConflictStatus,
    pub resolved_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FileConflict {
    /// Build a pending conflict between a rejected commit and the current head
    pub fn detected(commit: &PendingCommit, committer: UserId, head: &FileVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: commit.project_id,
            file_path: commit.file_path.clone(),
            base_version: commit.base_version,
            latest_version: head.version,
            local_author_id: committer,
            remote_author_id: head.author_id,
            local_content: commit.content.clone(),
            remote_content: head.content.clone(),
            status: ConflictStatus::Pending,
            resolved_by: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Leave `pending` for a terminal state; allowed exactly once
    pub fn transition(&mut self, to: ConflictStatus, by: UserId) -> AppResult<()> {
        if self.status.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "conflict {} is already {}",
                self.id, self.status
            )));
        }
        if !to.is_terminal() {
            return Err(AppError::InvalidState(format!(
                "conflict {} cannot move to {}",
                self.id, to
            )));
        }

        self.status = to;
        self.resolved_by = Some(by);
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// Commit request as it arrives from a client
#[derive(Debug, Clone, Deserialize)]
pub struct CommitRequest {
    pub project_id: String,
    pub file_path: String,
    /// User id, email or username of the committer
    #[serde(alias = "user_email")]
    pub author: String,
    pub content: String,
    #[serde(default, alias = "file_hash")]
    pub hash: Option<String>,
    #[serde(default, alias = "file_size")]
    pub size: Option<u64>,
    #[serde(default, alias = "commit_msg")]
    pub commit_message: String,
    #[serde(default)]
    pub base_version: u64,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
}

/// Request to record a tombstone for a path
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRequest {
    pub project_id: String,
    pub file_path: String,
    #[serde(alias = "user_email")]
    pub author: String,
    #[serde(default, alias = "commit_msg")]
    pub commit_message: String,
    #[serde(default)]
    pub base_version: u64,
}

/// A commit whose fields have been checked, awaiting the version pipeline
#[derive(Debug, Clone)]
pub struct PendingCommit {
    pub project_id: ProjectId,
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub author: UserRef,
    pub content: String,
    pub file_hash: String,
    pub file_size: u64,
    pub commit_message: String,
    pub base_version: u64,
    pub is_deleted: bool,
}

impl PendingCommit {
    pub fn into_new_version(self, author_id: UserId) -> NewVersion {
        NewVersion {
            project_id: self.project_id,
            file_path: self.file_path,
            file_name: self.file_name,
            file_type: self.file_type,
            author_id,
            content: self.content,
            file_hash: self.file_hash,
            file_size: self.file_size,
            commit_message: self.commit_message,
            is_deleted: self.is_deleted,
        }
    }
}

impl CommitRequest {
    pub fn validate(self) -> AppResult<PendingCommit> {
        let project_id = parse_id("project_id", &self.project_id)?;
        validate_file_path(&self.file_path)?;
        let author = UserRef::parse(&self.author)?;

        if self.content.is_empty() {
            return Err(AppError::validation("content is required"));
        }

        let computed = content_hash(&self.content);
        let file_hash = match self.hash.as_deref().map(str::trim) {
            Some(given) if !given.is_empty() => {
                if !given.eq_ignore_ascii_case(&computed) {
                    return Err(AppError::validation(format!(
                        "file_hash {} does not match content hash {}",
                        given, computed
                    )));
                }
                computed
            }
            _ => computed,
        };

        let actual_size = self.content.len() as u64;
        if let Some(size) = self.size {
            if size != actual_size {
                return Err(AppError::validation(format!(
                    "file_size {} does not match content length {}",
                    size, actual_size
                )));
            }
        }

        let file_name = self
            .file_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| file_name_of(&self.file_path));
        let file_type = self
            .file_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| detect_file_type(&self.file_path));

        Ok(PendingCommit {
            project_id,
            file_path: self.file_path,
            file_name,
            file_type,
            author,
            content: self.content,
            file_hash,
            file_size: actual_size,
            commit_message: self.commit_message,
            base_version: self.base_version,
            is_deleted: false,
        })
    }
}

impl DeleteRequest {
    pub fn validate(self) -> AppResult<PendingCommit> {
        let project_id = parse_id("project_id", &self.project_id)?;
        validate_file_path(&self.file_path)?;
        let author = UserRef::parse(&self.author)?;

        let commit_message = if self.commit_message.trim().is_empty() {
            format!("Delete {}", self.file_path)
        } else {
            self.commit_message
        };

        Ok(PendingCommit {
            project_id,
            file_name: file_name_of(&self.file_path),
            file_type: detect_file_type(&self.file_path),
            file_path: self.file_path,
            author,
            content: String::new(),
            file_hash: content_hash(""),
            file_size: 0,
            commit_message,
            base_version: self.base_version,
            is_deleted: true,
        })
    }
}

/// Lowercase hex SHA-256 of the content
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check that a path can be used as a storage key
pub fn validate_file_path(path: &str) -> AppResult<()> {
    if path.trim().is_empty() {
        return Err(AppError::validation("file_path is required"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(AppError::validation(format!(
            "file_path exceeds {} bytes",
            MAX_PATH_LEN
        )));
    }
    if path.contains('\0') {
        return Err(AppError::validation("file_path must not contain NUL"));
    }
    if path.starts_with('/') {
        return Err(AppError::validation("file_path must be relative"));
    }
    for segment in path.split(['/', '\\']) {
        match segment {
            ".." => return Err(AppError::validation("file_path must not contain '..'")),
            // `./a.txt` and `a//b` would alias `a.txt` and `a/b`
            "." | "" => {
                return Err(AppError::validation(
                    "file_path must be normalized (no '.' or empty segments)",
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Final path segment
pub fn file_name_of(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

/// Guess a file type from the extension
pub fn detect_file_type(path: &str) -> String {
    let name = file_name_of(path).to_lowercase();
    if name == "dockerfile" || name == "makefile" {
        return name;
    }
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return "plaintext".to_string(),
    };

    match ext {
        "rs" => "rust",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "html" | "htm" => "html",
        "css" | "scss" => "css",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "sql" => "sql",
        "sh" | "bash" => "shellscript",
        // Game-engine assets shared through the tool
        "unity" | "prefab" | "mat" | "asset" => "asset",
        "shader" | "hlsl" | "glsl" => "shader",
        _ => "plaintext",
    }
    .to_string()
}
