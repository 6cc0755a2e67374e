mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{acquire_db_lock, TestApp};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use ticketpal::automation::evidence::{
    EvidenceCapture, EvidenceError, EvidenceOwner, EvidenceSink, TicketEvidenceSink,
};
use ticketpal::status::MediaSource;
use ticketpal::storage::ObjectStorage;

async fn sink_for(
    app: &TestApp,
    email: &str,
    pcn: &str,
) -> Result<(EvidenceOwner, TicketEvidenceSink)> {
    let user_id = app.insert_user(email, "pw", "user").await?;
    let ticket_id = app.insert_ticket(user_id, pcn, "Lewisham Council").await?;
    let owner = EvidenceOwner {
        ticket_id,
        user_id,
        pcn_number: pcn.to_string(),
    };
    let storage: Arc<dyn ObjectStorage> = app.storage.clone();
    let sink = TicketEvidenceSink::new(storage, app.state.pool.clone(), owner.clone());
    Ok((owner, sink))
}

fn capture(source: MediaSource, label: &str, bytes: &[u8]) -> EvidenceCapture {
    EvidenceCapture {
        source,
        label: label.to_string(),
        bytes: bytes.to_vec(),
    }
}

#[tokio::test]
async fn same_image_under_different_labels_is_stored_once() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (owner, sink) = sink_for(&app, "ev@example.com", "LW90000001").await?;

    let first = sink
        .store(capture(MediaSource::Evidence, "portal-photo-1", b"photo"))
        .await?;
    let second = sink
        .store(capture(MediaSource::Evidence, "portal-photo-2", b"photo"))
        .await?;
    let from_challenge = sink
        .store(capture(MediaSource::Screenshot, "challenge", b"photo"))
        .await?;
    let other = sink
        .store(capture(MediaSource::Evidence, "portal-photo-3", b"another photo"))
        .await?;

    assert_eq!(first.media_id, second.media_id);
    assert_eq!(first.key, from_challenge.key);
    assert_ne!(first.media_id, other.media_id);
    assert!(first.key.contains("/evidence/portal-photo-1-"));

    let rows = app.media(owner.ticket_id).await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(app.storage.keys().await.len(), 2);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn database_failure_keeps_previously_stored_objects() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (owner, sink) = sink_for(&app, "blip@example.com", "LW90000002").await?;
    let stored = sink
        .store(capture(MediaSource::Evidence, "portal-photo-1", b"photo"))
        .await?;

    let unreachable = Pool::builder()
        .connection_timeout(Duration::from_millis(200))
        .build_unchecked(ConnectionManager::<PgConnection>::new(
            "postgres://ticketpal@127.0.0.1:9/unreachable",
        ));
    let storage: Arc<dyn ObjectStorage> = app.storage.clone();
    let broken = TicketEvidenceSink::new(storage, unreachable, owner.clone());

    let result = broken
        .store(capture(MediaSource::Evidence, "portal-photo-1", b"photo"))
        .await;
    assert!(matches!(result, Err(EvidenceError::Database(_))));
    assert!(app.storage.contains(&stored.key).await);
    assert_eq!(app.media(owner.ticket_id).await?.len(), 1);

    app.cleanup().await?;
    Ok(())
}
