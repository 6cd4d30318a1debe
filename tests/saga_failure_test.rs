//! Failure injection tests for the storage sagas.
//!
//! Each test makes one blob step fail and checks that neither a metadata row
//! nor a stray blob survives.

mod common;

use std::sync::atomic::Ordering;

use common::setup;
use rapidstore::{CreateOptions, Status, StatusFilter, StorageError};

#[tokio::test]
async fn test_failed_blob_write_rolls_back_create() {
    let storage = setup().await;
    storage.blobs.fail_writes.store(true, Ordering::SeqCst);

    let result = storage
        .service
        .create_from_content(b"never stored", &CreateOptions::new())
        .await;

    assert!(matches!(result, Err(StorageError::BlobIo(_))));
    assert!(storage
        .service
        .get_record(1, StatusFilter::Any)
        .await
        .unwrap()
        .is_none());
    assert_eq!(storage.blob_count(), 0);
    assert!(!storage.public_root().join("35r").exists());
}

#[tokio::test]
async fn test_failed_reconcile_rolls_back_create() {
    let storage = setup().await;
    storage.blobs.fail_inspect.store(true, Ordering::SeqCst);

    let result = storage
        .service
        .create_from_content(b"unreconciled", &CreateOptions::new().private(true))
        .await;

    assert!(matches!(result, Err(StorageError::Inconsistency(_))));
    assert!(storage
        .service
        .get_record(1, StatusFilter::Any)
        .await
        .unwrap()
        .is_none());
    assert_eq!(storage.blob_count(), 0);
}

#[tokio::test]
async fn test_failed_copy_keeps_source() {
    let storage = setup().await;
    let source = storage.source_file("upload.txt", b"source bytes");
    storage.blobs.fail_writes.store(true, Ordering::SeqCst);

    let result = storage
        .service
        .create_from_path(&source, &CreateOptions::new().remove_source(true))
        .await;

    assert!(result.is_err());
    assert!(source.exists());
    assert_eq!(std::fs::read(&source).unwrap(), b"source bytes");
    assert_eq!(storage.blob_count(), 0);
}

#[tokio::test]
async fn test_failed_reconcile_keeps_source_to_be_removed() {
    let storage = setup().await;
    let source = storage.source_file("only-copy.txt", b"irreplaceable");
    storage.blobs.fail_inspect.store(true, Ordering::SeqCst);

    let result = storage
        .service
        .create_from_path(&source, &CreateOptions::new().remove_source(true))
        .await;

    assert!(matches!(result, Err(StorageError::Inconsistency(_))));
    assert_eq!(std::fs::read(&source).unwrap(), b"irreplaceable");
    assert_eq!(storage.blob_count(), 0);
    assert!(storage
        .service
        .get_record(1, StatusFilter::Any)
        .await
        .unwrap()
        .is_none());

    storage.blobs.fail_inspect.store(false, Ordering::SeqCst);
    let id = storage
        .service
        .create_from_path(&source, &CreateOptions::new().remove_source(true))
        .await
        .unwrap();
    assert!(!source.exists());
    assert_eq!(
        storage.service.get_content(id).await.unwrap().unwrap(),
        b"irreplaceable"
    );
}

#[tokio::test]
async fn test_service_recovers_after_failure() {
    let storage = setup().await;
    storage.blobs.fail_writes.store(true, Ordering::SeqCst);
    assert!(storage
        .service
        .create_from_content(b"first", &CreateOptions::new())
        .await
        .is_err());

    storage.blobs.fail_writes.store(false, Ordering::SeqCst);
    let id = storage
        .service
        .create_from_content(b"second", &CreateOptions::new())
        .await
        .unwrap();

    assert_eq!(storage.service.get_content(id).await.unwrap().unwrap(), b"second");
    assert_eq!(storage.blob_count(), 1);
}

#[tokio::test]
async fn test_failed_put_marks_file_lost() {
    let storage = setup().await;
    let id = storage
        .service
        .create_from_content(b"original", &CreateOptions::new())
        .await
        .unwrap();
    let before = storage
        .service
        .get_record(id, StatusFilter::Any)
        .await
        .unwrap()
        .unwrap();

    storage.blobs.fail_writes.store(true, Ordering::SeqCst);
    let result = storage.service.put_content(id, b"a much longer body", true).await;
    assert!(matches!(result, Err(StorageError::BlobIo(_))));

    // The write was rolled back but compensation erased the committed bytes.
    let after = storage
        .service
        .get_record(id, StatusFilter::Any)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, Status::Lost);
    assert_eq!(after.size, before.size);
    assert_eq!(after.name, before.name);
    assert_eq!(after.mime_type, before.mime_type);
    assert_eq!(storage.blob_count(), 0);
    assert!(!storage.service.exists(id).await.unwrap());
    assert!(storage.service.get_content(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_put_from_path_marks_file_lost() {
    let storage = setup().await;
    let id = storage
        .service
        .create_from_content(b"original", &CreateOptions::new())
        .await
        .unwrap();
    let source = storage.source_file("replacement.txt", b"replacement");

    storage.blobs.fail_inspect.store(true, Ordering::SeqCst);
    let result = storage.service.put_from_path(id, &source, false, true).await;
    assert!(matches!(result, Err(StorageError::Inconsistency(_))));

    assert!(source.exists());
    let record = storage
        .service
        .get_record(id, StatusFilter::Any)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Lost);
}

#[tokio::test]
async fn test_failed_visibility_move_rolls_back_flag() {
    let storage = setup().await;
    let id = storage
        .service
        .create_from_content(b"stay public", &CreateOptions::new())
        .await
        .unwrap();

    storage.blobs.fail_visibility.store(true, Ordering::SeqCst);
    let result = storage.service.set_private(id).await;
    assert!(matches!(result, Err(StorageError::BlobIo(_))));

    let record = storage
        .service
        .get_record(id, StatusFilter::Any)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.is_private);
    assert!(storage.service.get_url(id, false).await.unwrap().is_some());
    assert_eq!(
        storage.service.get_content(id).await.unwrap().unwrap(),
        b"stay public"
    );
}

#[tokio::test]
async fn test_failed_reconcile_moves_blob_back() {
    let storage = setup().await;
    let id = storage
        .service
        .create_from_content(b"bounce", &CreateOptions::new())
        .await
        .unwrap();

    storage.blobs.fail_inspect.store(true, Ordering::SeqCst);
    let result = storage.service.set_private(id).await;
    assert!(matches!(result, Err(StorageError::Inconsistency(_))));
    storage.blobs.fail_inspect.store(false, Ordering::SeqCst);

    let record = storage
        .service
        .get_record(id, StatusFilter::Any)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.is_private);
    assert_eq!(storage.service.get_content(id).await.unwrap().unwrap(), b"bounce");
    assert!(!storage.private_root().join("35r").exists());
}

#[tokio::test]
async fn test_caller_transaction_commits_nested_create() {
    let storage = setup().await;

    let mut tx = storage.service.database().begin().await.unwrap();
    let id = storage
        .service
        .create_from_content_in(&mut tx, b"nested", &CreateOptions::new())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(storage.service.get_content(id).await.unwrap().unwrap(), b"nested");
}
