//! Assembly of uploaded chunks into the final object.

use std::sync::Arc;
use std::time::Duration;

use chunkwise_transfer::UploadSession;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::storage::StorageAdapter;

/// Asks the backend to assemble a session and checks the result exists.
pub struct Finalizer {
    storage: Arc<dyn StorageAdapter>,
    timeout: Duration,
}

impl Finalizer {
    pub fn new(storage: Arc<dyn StorageAdapter>, timeout: Duration) -> Self {
        Self { storage, timeout }
    }

    /// Assembles `session` and returns the object URL.
    ///
    /// Backends without an assemble step only get the existence check. Every
    /// failure is reported as [`UploadError::Finalize`].
    pub async fn finalize(&self, session: &UploadSession) -> Result<String, UploadError> {
        let url = if self.storage.assembles_chunks() {
            match tokio::time::timeout(self.timeout, self.storage.finalize(&session.storage_ref))
                .await
            {
                Ok(Ok(url)) => url,
                Ok(Err(e)) => return Err(UploadError::Finalize(e.to_string())),
                Err(_) => {
                    return Err(UploadError::Finalize(format!(
                        "backend did not assemble {} within {:?}",
                        session.object_path, self.timeout
                    )));
                }
            }
        } else {
            debug!(object = %session.object_path, "backend has no assemble step");
            self.storage.object_url(&session.object_path)
        };

        self.verify(&session.object_path).await?;
        info!(
            upload_id = %session.upload_id,
            object = %session.object_path,
            bytes = session.uploaded_bytes,
            "upload finalized"
        );
        Ok(url)
    }

    /// Fails unless an object exists at `object_path`.
    pub async fn verify(&self, object_path: &str) -> Result<(), UploadError> {
        let exists = tokio::time::timeout(self.timeout, self.storage.exists(object_path))
            .await
            .map_err(|_| {
                UploadError::Finalize(format!("existence check for {object_path} timed out"))
            })?
            .map_err(|e| UploadError::Finalize(e.to_string()))?;
        if !exists {
            return Err(UploadError::Finalize(format!(
                "object {object_path} missing after upload"
            )));
        }
        Ok(())
    }
}
