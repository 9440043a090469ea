use std::io;

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::{Body, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{ErrorKind, ErrorResponse, SyncError};
use crate::protocol::{
    ChunkPayload, ChunkStream, DeltaSync, DownloadFrame, DownloadRequest, GetMissingChunks,
    MissingChunks, UploadStatus, UploadStream,
};
use crate::store::RecipeSummary;
use crate::wire;

/// Talks to a [`SyncServer`](crate::server::SyncServer) router over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, client }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.base_url)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = send(request).await?;
        let body = response.bytes().await?;
        wire::decode(&body)
    }
}

/// Sends the request, turning error responses back into the [`SyncError`] the server
/// reported.
async fn send(request: RequestBuilder) -> Result<reqwest::Response, SyncError> {
    let response = request
        .header(reqwest::header::CONTENT_TYPE, wire::CONTENT_TYPE)
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await?;
    debug!(%status, "server returned an error");
    Err(match wire::decode::<ErrorResponse>(&body) {
        Ok(error) => SyncError::from_remote(error),
        Err(_) => SyncError::Remote {
            kind: ErrorKind::Transport,
            message: format!("server responded with {status}"),
        },
    })
}

#[async_trait::async_trait]
impl DeltaSync for HttpClient {
    async fn get_missing_chunks(
        &self,
        request: GetMissingChunks,
    ) -> Result<MissingChunks, SyncError> {
        let body = wire::encode(&request)?;
        self.call(self.client.post(self.url("/missing")).body(body)).await
    }

    async fn upload_chunks(&self, frames: UploadStream) -> Result<UploadStatus, SyncError> {
        let body = frames.and_then(|frame| async move { wire::encode_frame(&frame) });
        self.call(
            self.client
                .post(self.url("/upload"))
                .body(Body::wrap_stream(body)),
        )
        .await
    }

    async fn download_file(
        &self,
        file_id: &str,
    ) -> Result<(RecipeSummary, ChunkStream), SyncError> {
        let request = wire::encode(&DownloadRequest {
            file_id: file_id.into(),
        })?;
        let response = send(self.client.post(self.url("/download")).body(request)).await?;

        let body = response.bytes_stream().map_err(io::Error::other);
        let mut frames = wire::decode_frames(StreamReader::new(body)).boxed();
        let summary = match frames.next().await {
            Some(Ok(DownloadFrame::Header(summary))) => summary,
            Some(Ok(DownloadFrame::Error(error))) => return Err(SyncError::from_remote(error)),
            Some(Ok(DownloadFrame::Chunk(_))) => {
                return Err(SyncError::Protocol(
                    "download did not start with a header".into(),
                ))
            }
            Some(Err(err)) => return Err(err),
            None => return Err(SyncError::Protocol("empty download".into())),
        };

        Ok((summary, download_chunks(frames).boxed()))
    }

    async fn list_files(&self) -> Result<Vec<RecipeSummary>, SyncError> {
        self.call(self.client.get(self.url("/files"))).await
    }
}

fn download_chunks(
    mut frames: BoxStream<'static, Result<DownloadFrame, SyncError>>,
) -> impl Stream<Item = Result<ChunkPayload, SyncError>> + Send + 'static {
    async_stream::try_stream! {
        while let Some(frame) = frames.next().await {
            yield chunk_of(frame?)?;
        }
    }
}

fn chunk_of(frame: DownloadFrame) -> Result<ChunkPayload, SyncError> {
    match frame {
        DownloadFrame::Chunk(chunk) => Ok(chunk),
        DownloadFrame::Error(error) => Err(SyncError::from_remote(error)),
        DownloadFrame::Header(_) => Err(SyncError::Protocol(
            "download contains more than one header".into(),
        )),
    }
}
