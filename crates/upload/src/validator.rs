//! Pre-flight checks run before any network activity.
//!
//! Every check runs regardless of earlier failures so the caller sees the
//! complete list of problems at once.

use std::sync::Arc;
use std::time::Duration;

use chunkwise_protocol::{FileIdentity, UploadContext};
use chunkwise_transfer::{file_extension, validate_file_name};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::quota::QuotaService;

/// Usage ratio from which a near-quota warning is raised.
pub const NEAR_QUOTA_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    FileTooLarge,
    BlockedExtension,
    MimeNotAllowed,
    InvalidFileName,
    QuotaExceeded,
    QuotaUnavailable,
    NearQuota,
    IdentityMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of [`Validator::validate`]. Warnings never block an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Converts into the engine error, keeping warnings on success.
    ///
    /// A result whose only errors are quota errors becomes
    /// [`UploadError::QuotaExceeded`].
    pub fn into_result(self) -> Result<Vec<ValidationIssue>, UploadError> {
        if self.valid {
            return Ok(self.warnings);
        }
        if self
            .errors
            .iter()
            .all(|issue| issue.kind == IssueKind::QuotaExceeded)
        {
            return Err(UploadError::QuotaExceeded);
        }
        Err(UploadError::Validation(self.errors))
    }
}

/// Limits applied to one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRules {
    pub max_file_size: u64,
    /// Lowercase extensions without the dot.
    pub blocked_extensions: Vec<String>,
    /// Exact types or `type/*` patterns; `None` accepts everything.
    pub allowed_mime_types: Option<Vec<String>>,
}

impl ValidationRules {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            blocked_extensions: config.blocked_extensions.clone(),
            allowed_mime_types: config.allowed_mime_types.clone(),
        }
    }

    /// Checks that need no I/O, in order: size, extension, MIME type, name.
    pub fn check(&self, file: &FileIdentity) -> Vec<ValidationIssue> {
        let mut errors = Vec::new();

        if file.size > self.max_file_size {
            errors.push(ValidationIssue::new(
                IssueKind::FileTooLarge,
                format!(
                    "{} is {} bytes, limit is {}",
                    file.name, file.size, self.max_file_size
                ),
            ));
        }

        if let Some(ext) = file_extension(&file.name)
            && self.blocked_extensions.iter().any(|b| b.eq_ignore_ascii_case(&ext))
        {
            errors.push(ValidationIssue::new(
                IssueKind::BlockedExtension,
                format!("files with extension .{ext} are not allowed"),
            ));
        }

        if let Some(allowed) = &self.allowed_mime_types
            && !allowed.iter().any(|p| mime_matches(p, &file.content_type))
        {
            errors.push(ValidationIssue::new(
                IssueKind::MimeNotAllowed,
                format!("content type {} is not allowed here", file.content_type),
            ));
        }

        if let Err(e) = validate_file_name(&file.name) {
            errors.push(ValidationIssue::new(IssueKind::InvalidFileName, e.to_string()));
        }

        errors
    }
}

/// `image/*` matches any image type; anything else must match exactly.
fn mime_matches(pattern: &str, content_type: &str) -> bool {
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    match pattern.strip_suffix("/*") {
        Some(prefix) => content_type
            .split_once('/')
            .is_some_and(|(top, _)| top.eq_ignore_ascii_case(prefix)),
        None => pattern.eq_ignore_ascii_case(content_type),
    }
}

/// Runs the static checks and the asynchronous quota check.
pub struct Validator {
    quota: Option<Arc<dyn QuotaService>>,
    quota_timeout: Duration,
}

impl Validator {
    pub fn new(quota: Option<Arc<dyn QuotaService>>, quota_timeout: Duration) -> Self {
        Self {
            quota,
            quota_timeout,
        }
    }

    pub async fn validate(
        &self,
        file: &FileIdentity,
        context: &UploadContext,
        rules: &ValidationRules,
    ) -> ValidationResult {
        let mut errors = rules.check(file);
        let mut warnings = Vec::new();
        self.check_quota(file, context, &mut errors, &mut warnings)
            .await;

        debug!(
            file = %file.name,
            errors = errors.len(),
            warnings = warnings.len(),
            "validation finished"
        );
        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Unreachable or slow quota services fail open with a warning.
    async fn check_quota(
        &self,
        file: &FileIdentity,
        context: &UploadContext,
        errors: &mut Vec<ValidationIssue>,
        warnings: &mut Vec<ValidationIssue>,
    ) {
        let Some(quota) = &self.quota else {
            return;
        };
        let owner = context.owner_id();
        let outcome =
            tokio::time::timeout(self.quota_timeout, quota.check_quota(owner, file.size)).await;

        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(owner, error = %e, "quota check failed, allowing upload");
                warnings.push(ValidationIssue::new(
                    IssueKind::QuotaUnavailable,
                    format!("quota could not be checked: {e}"),
                ));
                return;
            }
            Err(_) => {
                warn!(
                    owner,
                    timeout_ms = self.quota_timeout.as_millis() as u64,
                    "quota check timed out, allowing upload"
                );
                warnings.push(ValidationIssue::new(
                    IssueKind::QuotaUnavailable,
                    "quota check timed out",
                ));
                return;
            }
        };

        if !status.can_upload {
            errors.push(ValidationIssue::new(
                IssueKind::QuotaExceeded,
                format!(
                    "upload of {} bytes exceeds quota ({} of {} used)",
                    file.size, status.current_usage, status.limit
                ),
            ));
        } else if status.usage_ratio(file.size) >= NEAR_QUOTA_RATIO {
            warnings.push(ValidationIssue::new(
                IssueKind::NearQuota,
                format!(
                    "storage will be {:.0}% full after this upload",
                    status.usage_ratio(file.size) * 100.0
                ),
            ));
        }
    }
}
