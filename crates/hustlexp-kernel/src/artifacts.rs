//! Proof artifact storage seam.
//!
//! Clients upload directly to object storage through short-lived presigned
//! URLs; the kernel records object keys only and never streams file bytes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceiling on presigned-URL validity.
pub const MAX_PRESIGN_TTL: Duration = Duration::minutes(15);

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("presign ttl of {0} minutes exceeds the 15 minute ceiling")]
    TtlTooLong(i64),

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUpload {
    pub object_key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Object-storage seam for proof artifacts.
#[async_trait::async_trait]
pub trait ProofArtifactStore: Send + Sync {
    async fn presign_upload(
        &self,
        object_key: &str,
        ttl: Duration,
    ) -> Result<PresignedUpload, ArtifactError>;
}

/// Test double producing deterministic URLs.
#[derive(Default)]
pub struct MockArtifactStore;

#[async_trait::async_trait]
impl ProofArtifactStore for MockArtifactStore {
    async fn presign_upload(
        &self,
        object_key: &str,
        ttl: Duration,
    ) -> Result<PresignedUpload, ArtifactError> {
        if ttl > MAX_PRESIGN_TTL {
            return Err(ArtifactError::TtlTooLong(ttl.num_minutes()));
        }
        Ok(PresignedUpload {
            object_key: object_key.to_string(),
            url: format!("https://uploads.test/{object_key}"),
            expires_at: Utc::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_ceiling_is_enforced() {
        let store = MockArtifactStore;
        assert!(store
            .presign_upload("proofs/a.jpg", Duration::minutes(15))
            .await
            .is_ok());
        assert!(matches!(
            store
                .presign_upload("proofs/a.jpg", Duration::minutes(16))
                .await,
            Err(ArtifactError::TtlTooLong(_))
        ));
    }
}
