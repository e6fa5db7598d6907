use chrono::{TimeZone, Utc};
use darc::adapters::simulated::{Content, Operation, SimulatedStorage};
use darc::core::{ByteSource, ExportSpec, ListQuery, LocationFilter, RemoteFile, StorageClient};
use darc::error::StorageError;

fn file(id: &str, owned: bool, primary: bool) -> RemoteFile {
    RemoteFile {
        id: id.to_string(),
        name: format!("{}.bin", id),
        size: 4,
        mime_type: "application/octet-stream".to_string(),
        owned_by_me: owned,
        in_primary_drive: primary,
        modified_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single(),
        created_time: None,
    }
}

async fn read_all(storage: &SimulatedStorage, id: &str) -> Result<Vec<u8>, StorageError> {
    let mut stream = storage.download(id).await?;
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        bytes.extend(chunk);
    }
    Ok(bytes)
}

#[tokio::test]
async fn test_list_honours_ownership_and_location() {
    let (storage, controller) = SimulatedStorage::new();
    controller.add_file(file("mine", true, true), Content::Bytes(b"abcd".to_vec()));
    controller.add_file(file("shared", true, false), Content::Bytes(b"abcd".to_vec()));
    controller.add_file(file("theirs", false, false), Content::Bytes(b"abcd".to_vec()));

    let owned = storage.list(ListQuery::default()).await.unwrap();
    let ids: Vec<_> = owned.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["mine", "shared"]);

    let primary = storage
        .list(ListQuery {
            owned_only: true,
            location: LocationFilter::PrimaryDrive,
        })
        .await
        .unwrap();
    assert_eq!(primary.len(), 1);

    let everything = storage
        .list(ListQuery {
            owned_only: false,
            location: LocationFilter::Any,
        })
        .await
        .unwrap();
    assert_eq!(everything.len(), 3);
}

#[tokio::test]
async fn test_trashed_files_disappear_from_listing() {
    let (storage, controller) = SimulatedStorage::new();
    controller.add_file(file("a", true, true), Content::Bytes(b"abcd".to_vec()));

    storage.trash("a").await.unwrap();

    assert!(controller.is_trashed("a"));
    assert!(storage.list(ListQuery::default()).await.unwrap().is_empty());
    assert!(matches!(
        storage.download("a").await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_pattern_content_streams_in_chunks() {
    let (storage, controller) = SimulatedStorage::new();
    let len = 300 * 1024;
    controller.add_file(file("big", true, true), Content::Pattern { len });

    let mut stream = storage.download("big").await.unwrap();
    let mut chunks = 0;
    let mut total = 0;
    while let Some(chunk) = stream.next_chunk().await.unwrap() {
        chunks += 1;
        total += chunk.len() as u64;
    }

    assert_eq!(total, len);
    assert_eq!(chunks, 3);
    assert_eq!(
        read_all(&storage, "big").await.unwrap(),
        controller.content("big").unwrap().to_bytes()
    );
}

#[tokio::test]
async fn test_injected_failures_run_out() {
    let (storage, controller) = SimulatedStorage::new();
    controller.add_file(file("a", true, true), Content::Bytes(b"abcd".to_vec()));
    controller.fail_next("a", Operation::Trash, StorageError::RateLimited("429".into()), 2);

    assert!(storage.trash("a").await.is_err());
    assert!(storage.trash("a").await.is_err());
    assert!(storage.trash("a").await.is_ok());
    assert_eq!(controller.trash_calls("a"), 3);
}

#[tokio::test]
async fn test_interrupted_stream_fails_mid_way() {
    let (storage, controller) = SimulatedStorage::new();
    controller.add_file(file("a", true, true), Content::Pattern { len: 1000 });
    controller.interrupt_download("a", 100, StorageError::Transient("reset".into()), 1);

    let mut stream = storage.download("a").await.unwrap();
    assert_eq!(stream.next_chunk().await.unwrap().unwrap().len(), 100);
    assert!(matches!(
        stream.next_chunk().await,
        Err(StorageError::Transient(_))
    ));
    drop(stream);

    assert_eq!(read_all(&storage, "a").await.unwrap().len(), 1000);
}

#[tokio::test]
async fn test_native_documents_must_be_exported() {
    let (storage, controller) = SimulatedStorage::new();
    let mut doc = file("doc", true, true);
    doc.mime_type = "application/vnd.google-apps.document".to_string();
    doc.size = 0;
    controller.add_file(doc, Content::Bytes(b"PK docx bytes".to_vec()));

    assert!(matches!(
        storage.download("doc").await,
        Err(StorageError::Fatal(_))
    ));

    let format = ExportSpec {
        mime_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            .to_string(),
        extension: ".docx".to_string(),
    };
    let mut stream = storage.export_native("doc", &format).await.unwrap();
    assert_eq!(stream.next_chunk().await.unwrap().unwrap(), b"PK docx bytes");
    assert_eq!(controller.export_calls("doc"), 1);
}

#[tokio::test]
async fn test_listing_failure_injection() {
    let (storage, controller) = SimulatedStorage::new();
    controller.fail_next("", Operation::List, StorageError::Unauthorized("expired".into()), 1);

    assert!(matches!(
        storage.list(ListQuery::default()).await,
        Err(StorageError::Unauthorized(_))
    ));
    assert!(storage.list(ListQuery::default()).await.is_ok());
    assert_eq!(controller.list_calls(), 2);
}
