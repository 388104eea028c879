//! Storage quota lookups.

use std::collections::HashMap;
use std::sync::RwLock;

use chunkwise_transfer::sync::{read, write};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::storage::BoxFuture;

/// Answer of a quota check for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub can_upload: bool,
    pub current_usage: u64,
    pub limit: u64,
}

impl QuotaStatus {
    /// Fraction of the limit in use once `additional` more bytes land.
    pub fn usage_ratio(&self, additional: u64) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.current_usage.saturating_add(additional) as f64 / self.limit as f64
    }
}

/// Remaining-capacity lookups for an upload destination owner.
pub trait QuotaService: Send + Sync {
    fn check_quota<'a>(
        &'a self,
        owner_id: &'a str,
        additional_bytes: u64,
    ) -> BoxFuture<'a, Result<QuotaStatus, QuotaError>>;
}

/// In-memory quota table keyed by owner id.
///
/// Owners without an entry get `default_limit`.
#[derive(Debug, Default)]
pub struct FixedQuota {
    default_limit: u64,
    owners: RwLock<HashMap<String, (u64, u64)>>,
}

impl FixedQuota {
    pub fn new(default_limit: u64) -> Self {
        Self {
            default_limit,
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the usage and limit of `owner_id`.
    pub fn set(&self, owner_id: &str, current_usage: u64, limit: u64) {
        write(&self.owners).insert(owner_id.to_string(), (current_usage, limit));
    }

    fn status(&self, owner_id: &str, additional_bytes: u64) -> QuotaStatus {
        let (current_usage, limit) = read(&self.owners)
            .get(owner_id)
            .copied()
            .unwrap_or((0, self.default_limit));
        QuotaStatus {
            can_upload: current_usage.saturating_add(additional_bytes) <= limit,
            current_usage,
            limit,
        }
    }
}

impl QuotaService for FixedQuota {
    fn check_quota<'a>(
        &'a self,
        owner_id: &'a str,
        additional_bytes: u64,
    ) -> BoxFuture<'a, Result<QuotaStatus, QuotaError>> {
        let status = self.status(owner_id, additional_bytes);
        Box::pin(async move { Ok(status) })
    }
}
