use std::time::{Duration, SystemTime};

use assert2::{assert, check, let_assert};
use buildgrid_common::model::BuildId;
use test_r::test;
use tokio::io::AsyncReadExt;

use buildgrid_controller_service::config::StorageConfig;
use buildgrid_controller_service::storage::{ArtifactKind, ArtifactStore, StorageError};

use crate::common::credentials_zip;

async fn small_store(root: &std::path::Path, source_cap: u64) -> ArtifactStore {
    ArtifactStore::new(&StorageConfig {
        root: root.to_path_buf(),
        source_max_bytes: source_cap,
        credentials_max_bytes: 1024 * 1024,
        result_max_bytes: 1024 * 1024,
        chunk_size: 16,
    })
    .await
    .unwrap()
}

async fn read_artifact(store: &ArtifactStore, relative: &str) -> Vec<u8> {
    let (mut file, len) = store.open_stream(relative).await.unwrap();
    let mut bytes = Vec::with_capacity(len as usize);
    file.read_to_end(&mut bytes).await.unwrap();
    bytes
}

#[test]
async fn ingest_round_trips_bytes_under_the_build_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;
    let build_id = BuildId::new_v4();

    let stored = store
        .ingest(&build_id, ArtifactKind::Source, &mut &b"the source"[..])
        .await
        .unwrap();

    check!(stored.relative_path == format!("builds/{build_id}/source/bundle"));
    check!(stored.size == 10);
    check!(read_artifact(&store, &stored.relative_path).await == b"the source");
}

#[test]
async fn oversized_ingest_fails_without_leaving_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 64).await;
    let build_id = BuildId::new_v4();
    let payload = vec![7u8; 128];

    let result = store
        .ingest(&build_id, ArtifactKind::Source, &mut payload.as_slice())
        .await;

    let_assert!(Err(StorageError::PayloadTooLarge { limit: 64 }) = result);

    // no staging leftovers and no final file
    let mut staging = tokio::fs::read_dir(dir.path().join("staging")).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());
    let final_path = dir.path().join(format!("builds/{build_id}/source/bundle"));
    assert!(!final_path.exists());
}

#[test]
async fn discarded_staging_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;

    let staged = store
        .stage(ArtifactKind::Result, &mut &b"partial result"[..])
        .await
        .unwrap();
    store.discard(staged).await;

    let mut staging = tokio::fs::read_dir(dir.path().join("staging")).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());
}

#[test]
async fn stale_staging_files_are_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;

    // stage without committing, as an aborted request would
    let _staged = store
        .stage(ArtifactKind::Result, &mut &b"orphan"[..])
        .await
        .unwrap();

    let removed = store
        .clean_staging(SystemTime::now() + Duration::from_secs(10))
        .await
        .unwrap();
    assert!(removed == 1);

    let mut staging = tokio::fs::read_dir(dir.path().join("staging")).await.unwrap();
    assert!(staging.next_entry().await.unwrap().is_none());
}

#[test]
async fn link_or_copy_duplicates_stored_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;
    let original = BuildId::new_v4();
    let copy = BuildId::new_v4();

    let stored = store
        .ingest(&original, ArtifactKind::Source, &mut &b"shared source"[..])
        .await
        .unwrap();
    let copy_path = ArtifactStore::relative_path(&copy, ArtifactKind::Source);
    store
        .link_or_copy(&stored.relative_path, &copy_path)
        .await
        .unwrap();

    check!(read_artifact(&store, &copy_path).await == b"shared source");
    check!(read_artifact(&store, &stored.relative_path).await == b"shared source");
}

#[test]
async fn secure_credentials_decode_the_bundle_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;
    let build_id = BuildId::new_v4();

    let bundle = credentials_zip(
        b"key material",
        "tr0ub4dor",
        &[b"profile one", b"profile two"],
    )
    .await;
    let stored = store
        .ingest(&build_id, ArtifactKind::Credentials, &mut bundle.as_slice())
        .await
        .unwrap();

    let credentials = store
        .read_secure_credentials(&stored.relative_path)
        .await
        .unwrap();

    check!(credentials.key == b"key material");
    check!(credentials.password == "tr0ub4dor");
    assert!(credentials.profiles.len() == 2);
    check!(credentials.profiles[0] == b"profile one");
    check!(credentials.profiles[1] == b"profile two");
}

#[test]
async fn credential_bundle_without_a_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;
    let build_id = BuildId::new_v4();

    let bundle = {
        use async_zip::tokio::write::ZipFileWriter;
        use async_zip::{Compression, ZipEntryBuilder};
        let zip_path = dir.path().join("no-key.zip");
        let zip_file = tokio::fs::File::create(&zip_path).await.unwrap();
        let mut writer = ZipFileWriter::with_tokio(zip_file);
        writer
            .write_entry_whole(
                ZipEntryBuilder::new("password.txt".to_string().into(), Compression::Deflate),
                b"secret",
            )
            .await
            .unwrap();
        writer.close().await.unwrap();
        tokio::fs::read(&zip_path).await.unwrap()
    };

    let stored = store
        .ingest(&build_id, ArtifactKind::Credentials, &mut bundle.as_slice())
        .await
        .unwrap();
    let result = store.read_secure_credentials(&stored.relative_path).await;

    let_assert!(Err(StorageError::InvalidBundle(message)) = result);
    check!(message.contains("signing key"));
}

#[test]
async fn garbage_bytes_are_not_a_credential_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;
    let build_id = BuildId::new_v4();

    let stored = store
        .ingest(
            &build_id,
            ArtifactKind::Credentials,
            &mut &b"not a zip at all"[..],
        )
        .await
        .unwrap();
    let result = store.read_secure_credentials(&stored.relative_path).await;

    let_assert!(Err(StorageError::InvalidBundle(_)) = result);
}

#[test]
async fn missing_artifact_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;
    let build_id = BuildId::new_v4();

    let result = store
        .open_stream(&ArtifactStore::relative_path(&build_id, ArtifactKind::Result))
        .await;

    let_assert!(Err(StorageError::NotFound { .. }) = result);
}

#[test]
async fn traversal_paths_are_rejected_on_egress() {
    let dir = tempfile::tempdir().unwrap();
    let store = small_store(dir.path(), 1024).await;

    let result = store.open_stream("builds/../../../etc/shadow").await;

    let_assert!(Err(StorageError::PathViolation { .. }) = result);
}
