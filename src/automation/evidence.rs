use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diesel::prelude::*;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::{run_blocking, BlockingDbError, PgPool},
    models::{Media, NewMedia},
    schema::media,
    status::MediaSource,
    storage::ObjectStorage,
};

pub const EVIDENCE_CONTENT_TYPE: &str = "image/png";
pub const EVIDENCE_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("object storage error: {0}")]
    Storage(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<diesel::result::Error> for EvidenceError {
    fn from(err: diesel::result::Error) -> Self {
        EvidenceError::Database(err.to_string())
    }
}

impl From<BlockingDbError> for EvidenceError {
    fn from(err: BlockingDbError) -> Self {
        EvidenceError::Database(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EvidenceCapture {
    pub source: MediaSource,
    pub label: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvidence {
    pub media_id: Uuid,
    pub key: String,
    pub url: String,
}

/// Destination for screenshots and scraped images produced during a run.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    async fn store(&self, capture: EvidenceCapture) -> Result<StoredEvidence, EvidenceError>;
}

/// Owner of the evidence: keys are scoped by user and PCN.
#[derive(Debug, Clone)]
pub struct EvidenceOwner {
    pub ticket_id: Uuid,
    pub user_id: Uuid,
    pub pcn_number: String,
}

/// Uploads captures to object storage and records them as ticket media.
/// A ticket holds at most one media row per distinct image.
pub struct TicketEvidenceSink {
    storage: Arc<dyn ObjectStorage>,
    pool: PgPool,
    owner: EvidenceOwner,
}

impl TicketEvidenceSink {
    pub fn new(storage: Arc<dyn ObjectStorage>, pool: PgPool, owner: EvidenceOwner) -> Self {
        Self {
            storage,
            pool,
            owner,
        }
    }

    async fn find_by_hash(&self, digest: &str) -> Result<Option<Media>, EvidenceError> {
        let ticket_id = self.owner.ticket_id;
        let digest = digest.to_string();
        run_blocking(&self.pool, move |conn| {
            Ok::<_, EvidenceError>(
                media::table
                    .filter(media::ticket_id.eq(ticket_id))
                    .filter(media::content_hash.eq(&digest))
                    .first::<Media>(conn)
                    .optional()?,
            )
        })
        .await
    }

    /// Uploads content no media row references yet and records it.
    async fn upload_new(
        &self,
        capture: EvidenceCapture,
        digest: String,
    ) -> Result<(Uuid, String), EvidenceError> {
        let key = evidence_key(&self.owner, capture.source, &capture.label, &digest);
        debug!(%key, bytes = capture.bytes.len(), "uploading evidence");
        self.storage
            .put_object(&key, capture.bytes, EVIDENCE_CONTENT_TYPE)
            .await
            .map_err(|err| EvidenceError::Storage(err.to_string()))?;

        let new_media = NewMedia {
            id: Uuid::new_v4(),
            ticket_id: self.owner.ticket_id,
            s3_key: key.clone(),
            media_type: EVIDENCE_CONTENT_TYPE.to_string(),
            source: capture.source.as_str().to_string(),
            description: Some(capture.label),
            content_hash: digest,
        };
        let recorded = run_blocking(&self.pool, move |conn| {
            diesel::insert_into(media::table)
                .values(&new_media)
                .on_conflict((media::ticket_id, media::content_hash))
                .do_nothing()
                .execute(conn)?;
            Ok::<_, EvidenceError>(
                media::table
                    .filter(media::ticket_id.eq(new_media.ticket_id))
                    .filter(media::content_hash.eq(&new_media.content_hash))
                    .first::<Media>(conn)?,
            )
        })
        .await;

        match recorded {
            Ok(row) => {
                if row.s3_key != key {
                    // A concurrent capture of the same image recorded its own key first.
                    self.discard(&key).await;
                }
                Ok((row.id, row.s3_key))
            }
            Err(err) => {
                // No row referenced this content before the upload.
                self.discard(&key).await;
                Err(err)
            }
        }
    }

    async fn discard(&self, key: &str) {
        if let Err(err) = self.storage.delete_object(key).await {
            warn!(%key, error = %err, "failed to remove unreferenced evidence object");
        }
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn evidence_key(owner: &EvidenceOwner, source: MediaSource, label: &str, digest: &str) -> String {
    format!(
        "tickets/{}/{}/{}/{}-{}.png",
        owner.user_id,
        sanitize(&owner.pcn_number),
        source.as_str().to_ascii_lowercase(),
        sanitize(label),
        &digest[..digest.len().min(16)]
    )
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let collapsed = cleaned
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        "capture".to_string()
    } else {
        collapsed
    }
}

#[async_trait]
impl EvidenceSink for TicketEvidenceSink {
    async fn store(&self, capture: EvidenceCapture) -> Result<StoredEvidence, EvidenceError> {
        let digest = content_hash(&capture.bytes);
        let source = capture.source;
        let label = capture.label.clone();

        let (media_id, key) = match self.find_by_hash(&digest).await? {
            Some(existing) => {
                debug!(media_id = %existing.id, key = %existing.s3_key, %label, "evidence already stored");
                (existing.id, existing.s3_key)
            }
            None => self.upload_new(capture, digest).await?,
        };

        let url = self
            .storage
            .presign_get_object(&key, EVIDENCE_URL_TTL)
            .await
            .map_err(|err| EvidenceError::Storage(err.to_string()))?;

        info!(media_id = %media_id, %source, %label, "evidence stored");
        Ok(StoredEvidence { media_id, key, url })
    }
}

/// Presigned URLs for evidence already attached to a ticket.
pub async fn existing_evidence_urls(
    storage: &dyn ObjectStorage,
    media_rows: &[Media],
) -> Vec<String> {
    let mut urls = Vec::new();
    for row in media_rows {
        if row.source == MediaSource::Screenshot.as_str() {
            continue;
        }
        match storage.presign_get_object(&row.s3_key, EVIDENCE_URL_TTL).await {
            Ok(url) => urls.push(url),
            Err(err) => {
                tracing::warn!(media_id = %row.id, error = %err, "failed to presign evidence");
            }
        }
    }
    urls
}
