use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use deltasync::config::ClientConfig;
use deltasync::fingerprint::{FileDigest, Fingerprint};
use deltasync::protocol::{
    ChunkPayload, DeltaSync, GetMissingChunks, UploadFrame, UploadHeader, UploadStream,
};
use deltasync::store::{ChunkStore, FjallStore};
use deltasync::{HttpClient, SyncClient, SyncError, SyncServer};
use futures_util::{stream, StreamExt};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::net::TcpListener;

const MIB: usize = 1024 * 1024;

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut data = vec![0; len];
    rng.fill_bytes(&mut data);
    data
}

async fn start_server() -> (HttpClient, Arc<FjallStore>) {
    let store = Arc::new(FjallStore::temporary().unwrap());
    let app = SyncServer::new(store.clone(), store.clone()).router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    (HttpClient::new(format!("http://{addr}")), store)
}

fn write(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn upload_frames(header: UploadHeader, chunks: Vec<ChunkPayload>) -> UploadStream {
    let frames = std::iter::once(UploadFrame::Begin(header))
        .chain(chunks.into_iter().map(UploadFrame::Chunk))
        .chain(std::iter::once(UploadFrame::End))
        .map(Ok::<_, SyncError>);
    stream::iter(frames).boxed()
}

#[tokio::test]
async fn sync_and_download_over_http() {
    let (transport, store) = start_server().await;
    let client = SyncClient::new(transport, ClientConfig::default());
    let dir = tempfile::tempdir().unwrap();

    let mut contents = random_bytes(100, 2 * MIB);
    let path = write(&dir, "report.bin", &contents);
    let first = client.sync_file_as(&path, "report.bin").await.unwrap();
    assert_eq!(first.uploaded_chunks, first.chunk_count);
    assert_eq!(store.stats().await.unwrap().bytes, contents.len() as u64);

    for byte in &mut contents[MIB..MIB + 10] {
        *byte ^= 0xff;
    }
    write(&dir, "report.bin", &contents);
    let second = client.sync_file_as(&path, "report.bin").await.unwrap();
    assert!(
        (1..=2).contains(&second.uploaded_chunks),
        "uploaded {} chunks",
        second.uploaded_chunks
    );
    assert_eq!(second.recipe_version, Some(2));

    let files = client.transport().list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_id, "report.bin");
    assert_eq!(files[0].size, contents.len() as u64);
    assert_eq!(files[0].version, 2);

    let dest = dir.path().join("restored.bin");
    let summary = client.download_file("report.bin", &dest).await.unwrap();
    assert_eq!(summary.digest, FileDigest::of(&contents));
    assert_eq!(std::fs::read(&dest).unwrap(), contents);
}

#[tokio::test]
async fn errors_keep_their_kind_over_http() {
    let (transport, _store) = start_server().await;

    let result = transport.download_file("missing.txt").await;
    assert!(matches!(result, Err(SyncError::NotFound(file_id)) if file_id == "missing.txt"));

    let forged = ChunkPayload::new(Fingerprint::of(b"claimed"), Bytes::from_static(b"actual"));
    let header = UploadHeader {
        file_id: "forged".into(),
        chunk_fingerprints: vec![Fingerprint::of(b"claimed")],
        file_size: 6,
        file_digest: FileDigest::of(b"actual"),
        base_version: None,
        expected_chunks: 1,
    };
    let result = transport.upload_chunks(upload_frames(header, vec![forged])).await;
    assert!(matches!(result, Err(SyncError::Integrity(_))));
    assert!(transport.list_files().await.unwrap().is_empty());
}

fn shared_signature(part: &[u8]) -> GetMissingChunks {
    GetMissingChunks {
        file_id: "shared".into(),
        chunk_fingerprints: vec![Fingerprint::of(part)],
    }
}

fn shared_header(part: &[u8], base_version: Option<u64>) -> UploadHeader {
    UploadHeader {
        file_id: "shared".into(),
        chunk_fingerprints: vec![Fingerprint::of(part)],
        file_size: part.len() as u64,
        file_digest: FileDigest::of(part),
        base_version,
        expected_chunks: 1,
    }
}

fn payload(part: &'static [u8]) -> ChunkPayload {
    ChunkPayload::new(Fingerprint::of(part), Bytes::from_static(part))
}

#[tokio::test]
async fn concurrent_writers_conflict_over_http() {
    let (transport, _store) = start_server().await;

    let alice = transport.get_missing_chunks(shared_signature(b"alice")).await.unwrap();
    let bob = transport.get_missing_chunks(shared_signature(b"bob")).await.unwrap();

    transport
        .upload_chunks(upload_frames(shared_header(b"bob", bob.base_version), vec![payload(b"bob")]))
        .await
        .unwrap();
    let result = transport
        .upload_chunks(upload_frames(
            shared_header(b"alice", alice.base_version),
            vec![payload(b"alice")],
        ))
        .await;
    assert!(matches!(result, Err(SyncError::Conflict(file_id)) if file_id == "shared"));

    let files = transport.list_files().await.unwrap();
    assert_eq!(files[0].digest, FileDigest::of(b"bob"));
}
