use serde::{Deserialize, Serialize};

/// Destination of an upload. Immutable once the upload starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UploadContext {
    /// Upload into a workspace owned by an authenticated user.
    #[serde(rename_all = "camelCase")]
    Workspace {
        workspace_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder_id: Option<String>,
        user_id: String,
    },
    /// Upload through a public shared link.
    #[serde(rename_all = "camelCase")]
    SharedLink {
        link_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder_id: Option<String>,
        uploader_identity: String,
    },
}

impl UploadContext {
    /// Returns the id whose storage quota the upload is charged against.
    pub fn owner_id(&self) -> &str {
        match self {
            Self::Workspace { workspace_id, .. } => workspace_id,
            Self::SharedLink { link_id, .. } => link_id,
        }
    }

    /// Returns the target folder, if any.
    pub fn folder_id(&self) -> Option<&str> {
        match self {
            Self::Workspace { folder_id, .. } | Self::SharedLink { folder_id, .. } => {
                folder_id.as_deref()
            }
        }
    }

    /// Returns the object-key prefix for this destination.
    ///
    /// `workspaces/<id>/<folder|root>` or `links/<id>/<folder|root>`.
    pub fn destination_prefix(&self) -> String {
        let folder = self.folder_id().unwrap_or("root");
        match self {
            Self::Workspace { workspace_id, .. } => format!("workspaces/{workspace_id}/{folder}"),
            Self::SharedLink { link_id, .. } => format!("links/{link_id}/{folder}"),
        }
    }
}

/// Identity of the file being uploaded (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIdentity {
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

/// Lifecycle status of an upload handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Admitted, not yet started.
    Pending,
    /// Validating and computing the chunk plan.
    Planning,
    /// Transferring bytes.
    Uploading,
    /// Asking the backend to assemble the object.
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time progress of one upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub upload_id: String,
    pub status: UploadStatus,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadProgress {
    /// Returns the upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}
