//! End-to-end transfer scenarios over real mutual TLS.

use std::time::{Duration, Instant};

use harbor_client::{Client, Connection};
use harbor_core::checksum::hash_bytes;
use harbor_core::error::Error;
use harbor_core::message::{Command, Message};
use harbor_core::proto::{PutChunkRequest, PutStartRequest, PutStartResponse};
use harbor_core::TEMP_FILE_PREFIX;

use harbor_integration_tests::{
    FixtureOptions, ServerFixture, TestCa, client_config, client_config_with_chunk, test_payload,
};

#[tokio::test]
async fn test_handshake_and_ping() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();
    assert_eq!(client.session_id().len(), 32);
    assert!(client.ping().await);
    assert_eq!(fixture.registry.session_count(), 1);

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_upload_download_round_trip() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let data = test_payload(2 * 1024 * 1024, 7);
    let digest = hash_bytes(&data);

    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("source.bin");
    std::fs::write(&local, &data).unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    client.upload(&local, "dir/data.bin", false, None).await.unwrap();

    // The server sees the full file with the advertised digest.
    assert!(client.exists("dir/data.bin").await.unwrap());
    let info = client.stat("dir/data.bin").await.unwrap();
    assert_eq!(info.size, data.len() as u64);
    assert_eq!(info.checksum, digest);
    assert_eq!(client.checksum("dir/data.bin").await.unwrap(), digest);

    // Round trip: the downloaded copy is byte-identical.
    let copy = workdir.path().join("copy.bin");
    client.download("dir/data.bin", &copy, false, None).await.unwrap();
    assert_eq!(std::fs::read(&copy).unwrap(), data);

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_upload_progress_reports_both_passes() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let data = test_payload(512 * 1024, 3);
    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("progress.bin");
    std::fs::write(&local, &data).unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    let mut last = (0u64, 0u64);
    let mut on_progress = |done: u64, total: u64| last = (done, total);
    client
        .upload(&local, "progress.bin", false, Some(&mut on_progress))
        .await
        .unwrap();

    // Digest pass plus send pass: the operation covers the file twice.
    assert_eq!(last.1, data.len() as u64 * 2);
    assert_eq!(last.0, last.1);

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_fresh_upload_over_existing_file_is_409() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("twice.bin");
    std::fs::write(&local, b"only once").unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    client.upload(&local, "twice.bin", false, None).await.unwrap();
    let err = client.upload(&local, "twice.bin", false, None).await.unwrap_err();
    assert!(matches!(err, Error::FileExists(_)), "{err}");

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_resumed_upload_after_interruption() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let data = test_payload(8 * 256 * 1024, 11);
    let digest = hash_bytes(&data);
    let chunk = 256 * 1024usize;

    // First attempt: PUT_START plus two chunks, then the connection dies
    // without PUT_COMPLETE.
    let config = client_config(&ca, &alice, fixture.addr);
    let mut connection = Connection::connect(&config).await.unwrap();
    let response = connection
        .round_trip(
            Message::request(
                Command::PutStart,
                &PutStartRequest {
                    filepath: "resume.bin".to_string(),
                    file_size: data.len() as u64,
                    checksum: digest.clone(),
                    chunk_size: chunk as u64,
                    resume: false,
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let started: PutStartResponse = response.parse_body().unwrap();
    assert_eq!(started.resume_offset, 0);

    for i in 0..2 {
        let offset = i * chunk;
        connection
            .send(
                &Message::request(
                    Command::PutChunk,
                    &PutChunkRequest {
                        filepath: "resume.bin".to_string(),
                        temp_filepath: started.temp_filepath.clone(),
                        offset: offset as u64,
                        chunk_size: chunk as u64,
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        connection.write_raw(&data[offset..offset + chunk]).await.unwrap();
        connection.read_response().await.unwrap();
    }
    drop(connection);

    // The shadow file survives the dead session.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let temp_name = format!("{TEMP_FILE_PREFIX}resume.bin");
    let temp_on_disk = fixture.library_root.path().join(&temp_name);
    assert_eq!(
        std::fs::metadata(&temp_on_disk).unwrap().len(),
        (2 * chunk) as u64
    );

    // Second attempt resumes and completes; the digest proves nothing was
    // lost or doubled.
    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("resume.bin");
    std::fs::write(&local, &data).unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();
    client.upload(&local, "resume.bin", true, None).await.unwrap();

    assert_eq!(client.checksum("resume.bin").await.unwrap(), digest);
    assert!(!temp_on_disk.exists());

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_resumed_download_after_truncation() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let data = test_payload(1024 * 1024, 23);
    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("full.bin");
    std::fs::write(&local, &data).unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();
    client.upload(&local, "file.bin", false, None).await.unwrap();

    // A partial local copy, as an interrupted download would leave.
    let partial = workdir.path().join("partial.bin");
    std::fs::write(&partial, &data[..300_000]).unwrap();

    client.download("file.bin", &partial, true, None).await.unwrap();
    assert_eq!(std::fs::read(&partial).unwrap(), data);

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_checksum_mismatch_on_completion() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let real_data = b"what actually went over the wire";
    let claimed_digest = hash_bytes(b"what the client promised");

    let config = client_config(&ca, &alice, fixture.addr);
    let mut connection = Connection::connect(&config).await.unwrap();

    let response = connection
        .round_trip(
            Message::request(
                Command::PutStart,
                &PutStartRequest {
                    filepath: "corrupt.bin".to_string(),
                    file_size: real_data.len() as u64,
                    checksum: claimed_digest.clone(),
                    chunk_size: real_data.len() as u64,
                    resume: false,
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let started: PutStartResponse = response.parse_body().unwrap();

    connection
        .send(
            &Message::request(
                Command::PutChunk,
                &PutChunkRequest {
                    filepath: "corrupt.bin".to_string(),
                    temp_filepath: started.temp_filepath.clone(),
                    offset: 0,
                    chunk_size: real_data.len() as u64,
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    connection.write_raw(real_data).await.unwrap();
    connection.read_response().await.unwrap();

    let err = connection
        .round_trip(
            Message::request(
                Command::PutComplete,
                &harbor_core::proto::PutCompleteRequest {
                    filepath: "corrupt.bin".to_string(),
                    temp_filepath: started.temp_filepath.clone(),
                    checksum: claimed_digest,
                    modified_time: None,
                    created_time: None,
                },
            )
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }), "{err}");

    // Shadow gone, target never created, session still alive.
    assert!(!fixture
        .library_root
        .path()
        .join(format!("{TEMP_FILE_PREFIX}corrupt.bin"))
        .exists());
    assert!(!fixture.library_root.path().join("corrupt.bin").exists());
    assert!(connection.ping().await);

    connection.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_rate_limit_paces_upload() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    // 200 KiB/s library cap; 600 KiB upload in 200 KiB chunks: the first
    // chunk rides the burst, the next two wait about a second each.
    let fixture = ServerFixture::start(
        &ca,
        &[(&alice, false, 0)],
        FixtureOptions {
            rate_limit_bps: 200 * 1024,
            ..Default::default()
        },
    )
    .await;

    let data = test_payload(600 * 1024, 31);
    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("paced.bin");
    std::fs::write(&local, &data).unwrap();

    let mut client = Client::connect(client_config_with_chunk(
        &ca,
        &alice,
        fixture.addr,
        200 * 1024,
    ))
    .await
    .unwrap();

    let start = Instant::now();
    client.upload(&local, "paced.bin", false, None).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(1500),
        "upload finished in {elapsed:?}, limiter not engaged"
    );
    assert_eq!(client.checksum("paced.bin").await.unwrap(), hash_bytes(&data));

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_per_client_rate_override_beats_library_cap() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    // Library is throttled hard, but the client record overrides with
    // unlimited-ish bandwidth.
    let fixture = ServerFixture::start(
        &ca,
        &[(&alice, false, 100 * 1024 * 1024)],
        FixtureOptions {
            rate_limit_bps: 10 * 1024,
            ..Default::default()
        },
    )
    .await;

    let data = test_payload(256 * 1024, 5);
    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("fast.bin");
    std::fs::write(&local, &data).unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    let start = Instant::now();
    client.upload(&local, "fast.bin", false, None).await.unwrap();
    // At the library's 10 KiB/s this would take ~25 seconds.
    assert!(start.elapsed() < Duration::from_secs(5));

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_directory_operations() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("doc.txt");
    std::fs::write(&local, b"hello harbor").unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    client.mkdir("docs").await.unwrap();
    let err = client.mkdir("docs").await.unwrap_err();
    assert!(matches!(err, Error::FileExists(_)));

    client.upload(&local, "docs/doc.txt", false, None).await.unwrap();

    let listing = client.list("/", false).await.unwrap();
    let names: Vec<_> = listing.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(names, vec!["docs"]);

    let deep = client.list("/", true).await.unwrap();
    assert!(deep.iter().any(|e| e.path == "docs/doc.txt"));
    assert!(deep.iter().all(|e| e.checksum.is_empty()));

    let manifest = client.manifest("/").await.unwrap();
    let doc = manifest.iter().find(|e| e.path == "docs/doc.txt").unwrap();
    assert_eq!(doc.checksum, hash_bytes(b"hello harbor"));

    client.rename("docs/doc.txt", "docs/renamed.txt").await.unwrap();
    assert!(!client.exists("docs/doc.txt").await.unwrap());
    assert!(client.exists("docs/renamed.txt").await.unwrap());

    let err = client.rmdir("docs", false).await.unwrap_err();
    assert!(matches!(err, Error::DirectoryNotEmpty(_)));

    client.delete("docs/renamed.txt").await.unwrap();
    client.rmdir("docs", false).await.unwrap();
    assert!(!client.exists("docs").await.unwrap());

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_delete_missing_file_is_404_and_harmless() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    let before: Vec<_> = std::fs::read_dir(fixture.library_root.path())
        .unwrap()
        .collect();

    let err = client.delete("never-existed.txt").await.unwrap_err();
    assert!(matches!(err, Error::FileNotFound(_)));

    let after: Vec<_> = std::fs::read_dir(fixture.library_root.path())
        .unwrap()
        .collect();
    assert_eq!(before.len(), after.len());

    // The 404 was a per-command error; the session survives it.
    assert!(client.ping().await);

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("empty.bin");
    std::fs::write(&local, b"").unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();

    client.upload(&local, "empty.bin", false, None).await.unwrap();
    let info = client.stat("empty.bin").await.unwrap();
    assert_eq!(info.size, 0);

    let copy = workdir.path().join("empty-copy.bin");
    client.download("empty.bin", &copy, false, None).await.unwrap();
    assert_eq!(std::fs::metadata(&copy).unwrap().len(), 0);

    client.disconnect().await;
    fixture.stop().await;
}

#[tokio::test]
async fn test_upload_applies_modified_time() {
    let ca = TestCa::new();
    let alice = ca.issue("client-alice", 1);
    let fixture = ServerFixture::start(&ca, &[(&alice, false, 0)], FixtureOptions::default()).await;

    let workdir = tempfile::tempdir().unwrap();
    let local = workdir.path().join("stamped.bin");
    std::fs::write(&local, b"timestamped").unwrap();
    let local_mtime = std::fs::metadata(&local).unwrap().modified().unwrap();

    let mut client = Client::connect(client_config(&ca, &alice, fixture.addr))
        .await
        .unwrap();
    client.upload(&local, "stamped.bin", false, None).await.unwrap();

    let remote_mtime = std::fs::metadata(fixture.library_root.path().join("stamped.bin"))
        .unwrap()
        .modified()
        .unwrap();
    let drift = remote_mtime
        .duration_since(local_mtime)
        .unwrap_or_else(|e| e.duration());
    assert!(drift < Duration::from_secs(1), "mtime drifted by {drift:?}");

    client.disconnect().await;
    fixture.stop().await;
}
