//! Direct user-to-user sharing of files, snippets and file bundles.
//!
//! Shares are never stored. They are routed through the dispatcher and a
//! recipient who is offline simply never sees them.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::directory::{
    CollaboratorDirectory, Directories, Project, ProjectDirectory, User, UserDirectory, UserRef,
};
use crate::error::{parse_id, AppError, AppResult};
use crate::session::{CollaboratorPresence, Dispatcher, Envelope, EventType, Presence};
use crate::vcs::ProjectId;

/// Most files accepted in one bulk share
pub const MAX_BULK_FILES: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct FileShareRequest {
    #[serde(alias = "sender_email")]
    pub sender: String,
    #[serde(alias = "recipient_email")]
    pub recipient: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub file_name: String,
    pub file_content: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeShareRequest {
    #[serde(alias = "sender_email")]
    pub sender: String,
    #[serde(alias = "recipient_email")]
    pub recipient: String,
    pub code_snippet: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    pub file_name: String,
    pub file_content: String,
    #[serde(default)]
    pub file_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkShareRequest {
    #[serde(alias = "sender_email")]
    pub sender: String,
    #[serde(alias = "recipient_email")]
    pub recipient: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub files: Vec<SharedFile>,
    #[serde(default)]
    pub message: String,
}

/// What the sender gets back; `is_online` says whether delivery was even possible
#[derive(Debug, Clone, Serialize)]
pub struct ShareReceipt {
    pub recipient: String,
    pub recipient_id: crate::session::UserId,
    pub is_online: bool,
    pub project_name: Option<String>,
    pub file_names: Vec<String>,
}

#[derive(Clone)]
pub struct ShareService {
    dispatcher: Dispatcher,
    presence: Presence,
    directories: Directories,
}

struct Parties {
    sender: User,
    recipient: User,
    project: Option<Project>,
}

impl ShareService {
    pub fn new(dispatcher: Dispatcher, presence: Presence, directories: Directories) -> Self {
        Self {
            dispatcher,
            presence,
            directories,
        }
    }

    pub async fn share_file(&self, request: FileShareRequest) -> AppResult<ShareReceipt> {
        if request.file_name.trim().is_empty() || request.file_content.is_empty() {
            return Err(AppError::validation("file_name and file_content are required"));
        }
        let parties = self
            .parties(&request.sender, &request.recipient, request.project_id.as_deref())
            .await?;

        let payload = json!({
            "project_id": parties.project.as_ref().map(|p| p.id),
            "project_name": parties.project.as_ref().map(|p| p.name.clone()),
            "sender_email": parties.sender.email,
            "file_name": request.file_name,
            "file_content": request.file_content,
            "file_type": request.file_type,
            "message": request.message,
        });
        Ok(self.send(EventType::FileShare, parties, payload, vec![request.file_name]))
    }

    pub async fn share_code(&self, request: CodeShareRequest) -> AppResult<ShareReceipt> {
        if request.code_snippet.is_empty() {
            return Err(AppError::validation("code_snippet is required"));
        }
        let parties = self.parties(&request.sender, &request.recipient, None).await?;

        let payload = json!({
            "sender_email": parties.sender.email,
            "code_snippet": request.code_snippet,
            "language": request.language,
            "file_name": request.file_name,
            "message": request.message,
        });
        let names = if request.file_name.is_empty() {
            Vec::new()
        } else {
            vec![request.file_name]
        };
        Ok(self.send(EventType::CodeShare, parties, payload, names))
    }

    pub async fn share_bulk(&self, request: BulkShareRequest) -> AppResult<ShareReceipt> {
        if request.files.is_empty() {
            return Err(AppError::validation("files must not be empty"));
        }
        if request.files.len() > MAX_BULK_FILES {
            return Err(AppError::validation(format!(
                "at most {} files per bulk share",
                MAX_BULK_FILES
            )));
        }
        let parties = self
            .parties(&request.sender, &request.recipient, request.project_id.as_deref())
            .await?;

        let names: Vec<String> = request.files.iter().map(|f| f.file_name.clone()).collect();
        let payload = json!({
            "project_id": parties.project.as_ref().map(|p| p.id),
            "project_name": parties.project.as_ref().map(|p| p.name.clone()),
            "sender_email": parties.sender.email,
            "files": request.files,
            "file_count": names.len(),
            "message": request.message,
        });
        Ok(self.send(EventType::BulkFileShare, parties, payload, names))
    }

    /// Approved collaborators of a project with their online status
    pub async fn shareable_collaborators(&self, project_id: ProjectId) -> AppResult<Vec<CollaboratorPresence>> {
        self.directories.projects.require(project_id).await?;
        let collaborators = self.directories.collaborators.approved_collaborators(project_id).await?;
        Ok(self.presence.annotate(collaborators))
    }

    async fn parties(&self, sender: &str, recipient: &str, project_id: Option<&str>) -> AppResult<Parties> {
        let sender = self.directories.users.require(&UserRef::parse(sender)?).await?;
        let recipient = self.directories.users.require(&UserRef::parse(recipient)?).await?;
        if sender.id == recipient.id {
            return Err(AppError::validation("Cannot share files with yourself"));
        }

        let project = match project_id.map(str::trim).filter(|p| !p.is_empty()) {
            None => None,
            Some(raw) => {
                let project = self
                    .directories
                    .projects
                    .require(parse_id("project_id", raw)?)
                    .await?;
                if project.owner_id != sender.id {
                    return Err(AppError::Forbidden(
                        "You don't have permission to share from this project".to_string(),
                    ));
                }
                if !self.directories.collaborators.is_approved(project.id, recipient.id).await? {
                    return Err(AppError::Forbidden(
                        "Recipient is not an approved collaborator on this project".to_string(),
                    ));
                }
                Some(project)
            }
        };

        Ok(Parties {
            sender,
            recipient,
            project,
        })
    }

    fn send(&self, kind: EventType, parties: Parties, payload: serde_json::Value, file_names: Vec<String>) -> ShareReceipt {
        let is_online = self.presence.is_online(parties.recipient.id);
        self.dispatcher.send(
            Envelope::new(kind)
                .with_sender(parties.sender.id)
                .to(parties.recipient.id)
                .with_payload(payload),
        );
        tracing::info!(
            user_id = %parties.sender.id,
            "{} to {} ({} files, recipient online: {})",
            kind,
            parties.recipient.id,
            file_names.len(),
            is_online
        );

        ShareReceipt {
            recipient: parties.recipient.username,
            recipient_id: parties.recipient.id,
            is_online,
            project_name: parties.project.map(|p| p.name),
            file_names,
        }
    }
}
