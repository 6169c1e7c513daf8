//! Brute-force enumeration over a known identifier range.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CollectionConfig;
use crate::models::DocumentRecord;
use crate::repository::DocumentStore;
use crate::services::download::PauseGate;

/// Rows staged per store transaction; the cursor is persisted on each flush.
const BATCH_SIZE: usize = 1000;

/// Walk `first_id..=last_id`, staging a PENDING row for every identifier not
/// yet known to the store. Restarts resume from the persisted cursor.
pub async fn run_brute_force(
    config: CollectionConfig,
    store: Arc<DocumentStore>,
    download_root: PathBuf,
    pause: PauseGate,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if config.last_id == 0 || config.last_id < config.first_id {
        warn!(
            collection = config.id,
            "no identifier range configured, brute force has nothing to do"
        );
        return Ok(());
    }

    let cursor = store.get_brute_force_cursor(config.id)?;
    let start = if cursor < config.first_id {
        config.first_id
    } else {
        cursor
    };
    info!(
        collection = config.id,
        from = %config.document_id(start),
        to = %config.document_id(config.last_id),
        "brute force enumeration starting"
    );

    let mut batch: Vec<DocumentRecord> = Vec::with_capacity(BATCH_SIZE);
    let mut last_inspected = start;

    for id in start..=config.last_id {
        if cancel.is_cancelled() {
            break;
        }
        pause.wait(&cancel).await;

        let document_id = config.document_id(id);
        if !store.exists(config.id, &document_id)? {
            batch.push(DocumentRecord::pending(
                config.id,
                &document_id,
                config.file_url(&document_id),
                config.local_path(&download_root, &document_id),
            ));
        }
        last_inspected = id;

        if batch.len() >= BATCH_SIZE {
            store.bulk_insert_or_ignore(&batch)?;
            store.set_brute_force_cursor(config.id, id)?;
            batch.clear();
        }
    }

    if !batch.is_empty() {
        store.bulk_insert_or_ignore(&batch)?;
    }
    store.set_brute_force_cursor(config.id, last_inspected)?;

    info!(
        collection = config.id,
        cursor = last_inspected,
        "brute force enumeration finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::watch;

    fn test_config() -> CollectionConfig {
        let mut config = CollectionConfig::for_data_set(11);
        config.first_id = 100;
        config.last_id = 104;
        config
    }

    fn gate() -> PauseGate {
        let (_tx, rx) = watch::channel(false);
        PauseGate::new(rx)
    }

    #[tokio::test]
    async fn stages_the_whole_range() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(&dir.path().join("state.db")).unwrap());

        run_brute_force(
            test_config(),
            store.clone(),
            dir.path().to_path_buf(),
            gate(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let stats = store.get_stats(11).unwrap();
        assert_eq!(stats.pending, 5);
        assert_eq!(store.get_brute_force_cursor(11).unwrap(), 104);
        assert!(store.exists(11, "EFTA00000100").unwrap());
        assert!(store.exists(11, "EFTA00000104").unwrap());
    }

    #[tokio::test]
    async fn rerun_stages_nothing_new() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(&dir.path().join("state.db")).unwrap());

        for _ in 0..2 {
            run_brute_force(
                test_config(),
                store.clone(),
                dir.path().to_path_buf(),
                gate(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        }
        assert_eq!(store.get_stats(11).unwrap().pending, 5);
    }

    #[tokio::test]
    async fn resumes_from_the_cursor() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(&dir.path().join("state.db")).unwrap());
        store.set_brute_force_cursor(11, 103).unwrap();

        run_brute_force(
            test_config(),
            store.clone(),
            dir.path().to_path_buf(),
            gate(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // Only the cursor position onward was inspected.
        let stats = store.get_stats(11).unwrap();
        assert_eq!(stats.pending, 2);
        assert!(store.exists(11, "EFTA00000103").unwrap());
        assert!(store.exists(11, "EFTA00000104").unwrap());
        assert!(!store.exists(11, "EFTA00000100").unwrap());
    }

    #[tokio::test]
    async fn empty_range_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(&dir.path().join("state.db")).unwrap());
        let mut config = test_config();
        config.first_id = 0;
        config.last_id = 0;

        run_brute_force(
            config,
            store.clone(),
            dir.path().to_path_buf(),
            gate(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(store.get_stats(11).unwrap().pending, 0);
    }
}
