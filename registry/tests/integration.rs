//! Integration tests for registry blob uploads

mod common;

use std::sync::atomic::Ordering;

use common::{
    InstrumentedDriver, archive, digest_of, init_tracing, instrumented_registry, registry_over,
    retouch,
};
use registry::{Digest, EMPTY_TAR, Registry, RegistryError, UploadState};
use storage::{StorageConfig, TempDriver};
use tokio::io::AsyncReadExt;

async fn read_layer(store: &registry::BlobStore, layer: &registry::Layer) -> Vec<u8> {
    let mut reader = store.open(layer).await.unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();
    data
}

#[tokio::test]
async fn test_upload_and_fetch() {
    init_tracing();
    let (registry, _driver) = instrumented_registry();
    let store = registry.repository("foo/bar").unwrap();

    let data = archive(&[("etc/motd", &b"hello\n"[..]), ("bin/true", &b"\x7fELF"[..])]);
    let digest = digest_of(&data).await;
    assert_eq!(digest.algorithm(), "tarsum.v1+sha256");

    let upload = store.upload().await.unwrap();
    upload.write(&data[..1000]).await.unwrap();
    upload.write(&data[1000..]).await.unwrap();
    let layer = upload.finish(&digest).await.unwrap();

    assert_eq!(layer.digest, digest);
    assert_eq!(layer.size, data.len() as u64);
    assert_eq!(layer.repository, "foo/bar");
    assert_eq!(upload.state().await, UploadState::Finished);

    let fetched = store.fetch(&digest).await.unwrap();
    assert_eq!(fetched.size, data.len() as u64);
    assert_eq!(read_layer(&store, &fetched).await, data);
    assert!(store.linked(&digest).await.unwrap());

    let scratch = registry.paths().upload_dir("foo/bar", upload.id());
    assert!(!registry.storage().exists(&scratch).await.unwrap());
}

#[tokio::test]
async fn test_unsupported_version_reads_nothing() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo/bar").unwrap();

    let data = archive(&[("a", &b"content"[..])]);
    let upload = store.upload().await.unwrap();
    upload.write(&data).await.unwrap();

    let claimed = Digest::parse(&format!("tarsum.v0+sha1:{}", "a".repeat(40))).unwrap();
    let err = upload.finish(&claimed).await.unwrap_err();
    assert!(matches!(err, RegistryError::UnsupportedDigestVersion(_)));
    assert!(!err.is_retryable());
    assert_eq!(driver.reads(), 0);

    for digest in [claimed, digest_of(&data).await] {
        assert!(matches!(
            store.fetch(&digest).await,
            Err(RegistryError::BlobNotFound(_))
        ));
    }
    assert_eq!(driver.moves(), 0);
}

#[tokio::test]
async fn test_dev_version_is_unsupported() {
    let (registry, _driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();
    let upload = store.upload().await.unwrap();

    let claimed = Digest::parse(&EMPTY_TAR.replace("tarsum.v1", "tarsum.dev")).unwrap();
    assert!(matches!(
        upload.finish(&claimed).await,
        Err(RegistryError::UnsupportedDigestVersion(_))
    ));
}

#[tokio::test]
async fn test_empty_upload_without_scratch_file() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo/bar").unwrap();

    let upload = store.upload().await.unwrap();
    let scratch = registry.paths().upload_data_path("foo/bar", upload.id());
    assert!(!registry.storage().exists(&scratch).await.unwrap());

    let layer = upload.finish(&Digest::empty_tar()).await.unwrap();
    assert_eq!(layer.size, 0);
    assert_eq!(driver.moves(), 0);

    let blob = registry.paths().blob_data_path(&Digest::empty_tar());
    assert_eq!(registry.storage().stat(&blob).await.unwrap().size, 0);
    assert!(store.linked(&Digest::empty_tar()).await.unwrap());
}

#[tokio::test]
async fn test_mismatch_leaves_scratch_in_place() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo/bar").unwrap();

    let written = archive(&[("a", &b"x"[..])]);
    let claimed = digest_of(&archive(&[("a", &b"y"[..])])).await;

    let upload = store.upload().await.unwrap();
    upload.write(&written).await.unwrap();

    let err = upload.finish(&claimed).await.unwrap_err();
    match &err {
        RegistryError::ContentMismatch { expected, actual } => {
            assert_eq!(expected, &claimed);
            assert_eq!(actual, &digest_of(&written).await);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(err.error_code(), "DIGEST_INVALID");

    let scratch = registry.paths().upload_data_path("foo/bar", upload.id());
    assert_eq!(
        registry.storage().get_content(&scratch).await.unwrap(),
        written
    );
    assert_eq!(driver.moves(), 0);
    assert!(!store.exists(&claimed).await.unwrap());

    // The session stays usable: finishing with the right digest succeeds.
    assert_eq!(upload.state().await, UploadState::Writing);
    let layer = upload.finish(&digest_of(&written).await).await.unwrap();
    assert_eq!(layer.size, written.len() as u64);
}

#[tokio::test]
async fn test_invalid_archive() {
    let (registry, _driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();

    let upload = store.upload().await.unwrap();
    upload.write(&[0x5a; 1024]).await.unwrap();
    let err = upload.finish(&Digest::empty_tar()).await.unwrap_err();
    assert!(matches!(err, RegistryError::InvalidArchive(_)));
    assert_eq!(err.error_code(), "BLOB_UPLOAD_INVALID");
}

#[tokio::test]
async fn test_concurrent_commits_of_same_content() {
    let (registry, _driver) = instrumented_registry();
    let data = archive(&[("shared", &b"identical bytes"[..])]);
    let digest = digest_of(&data).await;

    let first = registry.repository("one").unwrap().upload().await.unwrap();
    let second = registry.repository("two").unwrap().upload().await.unwrap();

    let (a, b) = tokio::join!(
        async {
            first.write(&data[..100]).await?;
            first.write(&data[100..]).await?;
            first.finish(&digest).await
        },
        async {
            second.write(&data).await?;
            second.finish(&digest).await
        },
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.path, b.path);
    assert_eq!(a.size, b.size);

    let blobs = registry
        .storage()
        .list(&registry.paths().root().join("blobs"))
        .await
        .unwrap();
    assert_eq!(blobs, vec![a.path.to_string()]);

    for name in ["one", "two"] {
        let store = registry.repository(name).unwrap();
        assert!(store.linked(&digest).await.unwrap());
        let layer = store.fetch(&digest).await.unwrap();
        assert_eq!(read_layer(&store, &layer).await, data);
    }
}

#[tokio::test]
async fn test_second_commit_does_not_move() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();

    // v1 ignores modification times, so these archives share a digest but
    // not their bytes.
    let original = archive(&[("file", &b"content"[..])]);
    let retouched = retouch(&original);
    assert_ne!(original, retouched);
    let digest = digest_of(&original).await;
    assert_eq!(digest_of(&retouched).await, digest);

    let upload = store.upload().await.unwrap();
    upload.write(&original).await.unwrap();
    upload.finish(&digest).await.unwrap();
    assert_eq!(driver.moves(), 1);

    let upload = store.upload().await.unwrap();
    upload.write(&retouched).await.unwrap();
    let layer = upload.finish(&digest).await.unwrap();
    assert_eq!(driver.moves(), 1);

    assert_eq!(read_layer(&store, &layer).await, original);
    let scratch = registry.paths().upload_dir("foo", upload.id());
    assert!(!registry.storage().exists(&scratch).await.unwrap());
}

#[tokio::test]
async fn test_racing_commits_keep_one_blob() {
    // Both sessions find no blob before either moves its content.
    let (registry, driver) = registry_over(InstrumentedDriver::gated(2));

    let original = archive(&[("file", &b"content"[..])]);
    let retouched = retouch(&original);
    assert_ne!(original, retouched);
    let digest = digest_of(&original).await;
    assert_eq!(digest_of(&retouched).await, digest);

    let first = registry.repository("one").unwrap().upload().await.unwrap();
    let second = registry.repository("two").unwrap().upload().await.unwrap();
    first.write(&original).await.unwrap();
    second.write(&retouched).await.unwrap();

    let (a, b) = tokio::join!(first.finish(&digest), second.finish(&digest));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.path, b.path);
    assert_eq!(driver.moves(), 2);
    assert_eq!(driver.commits(), 1);

    let blob = registry.storage().get_content(&a.path).await.unwrap();
    assert!(blob == original || blob == retouched);
    for name in ["one", "two"] {
        let store = registry.repository(name).unwrap();
        assert!(store.linked(&digest).await.unwrap());
        let layer = store.fetch(&digest).await.unwrap();
        assert_eq!(read_layer(&store, &layer).await, blob);
    }
}

#[tokio::test]
async fn test_cancel_removes_scratch() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo/bar").unwrap();
    let data = archive(&[("a", &b"1"[..]), ("b", &b"2"[..]), ("c", &b"3"[..])]);

    let upload = store.upload().await.unwrap();
    for chunk in data.chunks(data.len() / 3 + 1) {
        upload.write(chunk).await.unwrap();
    }
    assert_eq!(upload.offset().await, data.len() as u64);

    upload.cancel().await.unwrap();

    let scratch = registry.paths().upload_data_path("foo/bar", upload.id());
    let err = registry.storage().stat(&scratch).await.unwrap_err();
    assert!(err.is_not_found());
    let dir = registry.paths().upload_dir("foo/bar", upload.id());
    assert!(!registry.storage().exists(&dir).await.unwrap());

    let digest = digest_of(&data).await;
    assert!(!store.exists(&digest).await.unwrap());
    assert!(!store.linked(&digest).await.unwrap());
    assert_eq!(driver.moves(), 0);

    assert!(matches!(
        upload.finish(&digest).await,
        Err(RegistryError::SessionClosed(_))
    ));
    assert!(matches!(
        store.resume(upload.id()).await,
        Err(RegistryError::UploadUnknown(_))
    ));
}

#[tokio::test]
async fn test_fetch_without_link() {
    let (registry, _driver) = instrumented_registry();
    let data = archive(&[("layer", &b"from another repository"[..])]);
    let digest = digest_of(&data).await;

    let upload = registry
        .repository("library/base")
        .unwrap()
        .upload()
        .await
        .unwrap();
    upload.write(&data).await.unwrap();
    upload.finish(&digest).await.unwrap();

    let other = registry.repository("someone/else").unwrap();
    assert!(!other.linked(&digest).await.unwrap());
    let layer = other.fetch(&digest).await.unwrap();
    assert_eq!(layer.repository, "someone/else");
    assert_eq!(read_layer(&other, &layer).await, data);

    // Removing the only link leaves the blob in place.
    let base = registry.repository("library/base").unwrap();
    base.unlink(&digest).await.unwrap();
    assert!(!base.linked(&digest).await.unwrap());
    assert!(base.fetch(&digest).await.is_ok());
}

#[tokio::test]
async fn test_double_finish() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();
    let data = archive(&[("a", &b"once"[..])]);
    let digest = digest_of(&data).await;

    let upload = store.upload().await.unwrap();
    upload.write(&data).await.unwrap();
    upload.finish(&digest).await.unwrap();

    let err = upload.finish(&digest).await.unwrap_err();
    assert!(matches!(err, RegistryError::SessionClosed(id) if id == upload.id()));
    assert!(matches!(
        upload.cancel().await,
        Err(RegistryError::SessionClosed(_))
    ));
    assert!(matches!(
        upload.write(b"more").await,
        Err(RegistryError::SessionClosed(_))
    ));
    assert_eq!(driver.moves(), 1);
}

#[tokio::test]
async fn test_resume_continues_at_offset() {
    let (registry, _driver) = instrumented_registry();
    let store = registry.repository("foo/bar").unwrap();
    let data = archive(&[("resumable", &[7u8; 3000][..])]);
    let digest = digest_of(&data).await;

    let upload = store.upload().await.unwrap();
    upload.write(&data[..2048]).await.unwrap();
    let id = upload.id();
    drop(upload);

    let upload = store.resume(id).await.unwrap();
    assert_eq!(upload.offset().await, 2048);
    assert_eq!(upload.state().await, UploadState::Writing);
    assert_eq!(
        upload.write(&data[2048..]).await.unwrap(),
        data.len() as u64
    );

    let layer = upload.finish(&digest).await.unwrap();
    assert_eq!(read_layer(&store, &layer).await, data);
}

#[tokio::test]
async fn test_cleanup_failure_does_not_fail_finish() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();
    let data = archive(&[("a", &b"sticky"[..])]);
    let digest = digest_of(&data).await;

    let upload = store.upload().await.unwrap();
    upload.write(&data).await.unwrap();

    driver.fail_deletes.store(true, Ordering::SeqCst);
    let layer = upload.finish(&digest).await.unwrap();
    assert_eq!(layer.digest, digest);
    assert_eq!(upload.state().await, UploadState::Finished);
    assert!(store.linked(&digest).await.unwrap());

    // The start record is left behind.
    let dir = registry.paths().upload_dir("foo", upload.id());
    assert!(registry.storage().exists(&dir).await.unwrap());
}

#[tokio::test]
async fn test_move_failure_can_be_retried() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();
    let data = archive(&[("a", &b"retry me"[..])]);
    let digest = digest_of(&data).await;

    let upload = store.upload().await.unwrap();
    upload.write(&data).await.unwrap();

    driver.fail_moves.store(true, Ordering::SeqCst);
    let err = upload.finish(&digest).await.unwrap_err();
    assert!(matches!(err, RegistryError::Storage(_)));
    assert!(err.is_retryable());
    assert_eq!(upload.state().await, UploadState::Writing);

    driver.fail_moves.store(false, Ordering::SeqCst);
    let layer = upload.finish(&digest).await.unwrap();
    assert_eq!(layer.size, data.len() as u64);
}

#[tokio::test]
async fn test_link_failure_closes_session() {
    let (registry, driver) = instrumented_registry();
    let store = registry.repository("foo").unwrap();
    let data = archive(&[("a", &b"half done"[..])]);
    let digest = digest_of(&data).await;

    let upload = store.upload().await.unwrap();
    upload.write(&data).await.unwrap();

    driver.fail_link_writes.store(true, Ordering::SeqCst);
    let err = upload.finish(&digest).await.unwrap_err();
    assert!(matches!(err, RegistryError::Storage(_)));
    assert_eq!(upload.state().await, UploadState::Committed);

    // The blob was committed even though the repository does not link it.
    assert!(store.exists(&digest).await.unwrap());
    assert!(!store.linked(&digest).await.unwrap());
    assert!(matches!(
        upload.finish(&digest).await,
        Err(RegistryError::SessionClosed(_))
    ));
}

#[tokio::test]
async fn test_invalid_repository_name() {
    let registry = Registry::memory().unwrap();
    let err = registry.repository("Not/Valid").unwrap_err();
    assert!(matches!(err, RegistryError::InvalidRepository(_)));
    assert_eq!(err.error_code(), "NAME_INVALID");
}

#[tokio::test]
async fn test_upload_on_disk() {
    let driver = TempDriver::new().unwrap();
    let root = driver.root().to_owned();
    let registry = Registry::new(driver.into(), registry::PathBuilder::default());
    let store = registry.repository("library/ubuntu").unwrap();

    let data = archive(&[("etc/os-release", &b"NAME=test\n"[..])]);
    let digest = digest_of(&data).await;

    let upload = store.upload().await.unwrap();
    upload
        .copy_from(std::io::Cursor::new(data.clone()))
        .await
        .unwrap();
    let layer = upload.finish(&digest).await.unwrap();

    let on_disk = root.join(layer.path.as_str().trim_start_matches('/'));
    assert_eq!(std::fs::read(on_disk).unwrap(), data);
    assert!(
        !root
            .join("docker/registry/v2/repositories/library/ubuntu/_uploads")
            .join(upload.id().to_string())
            .exists()
    );
}

#[tokio::test]
async fn test_registry_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = registry::RegistryConfig {
        storage: StorageConfig::Local {
            path: camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap(),
        },
        root: "/v2".into(),
        events: None,
    };
    let registry = Registry::from_config(config).unwrap();
    let store = registry.repository("foo").unwrap();

    let upload = store.upload().await.unwrap();
    let layer = upload.finish(&Digest::empty_tar()).await.unwrap();
    assert!(layer.path.starts_with("/v2/blobs/tarsum/v1/sha256"));
    assert!(dir.path().join(layer.path.as_str().trim_start_matches('/')).exists());
}
