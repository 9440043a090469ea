//! Encoding of protocol messages for the HTTP transport.
//!
//! Unary bodies are a single postcard message. Streaming bodies are a sequence of
//! postcard messages, each prefixed with its length as a big-endian `u32`.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::codec::{Encoder, FramedRead, LengthDelimitedCodec};

use crate::error::SyncError;

/// Comfortably above the largest chunk FastCDC can produce.
pub const MAX_FRAME_LENGTH: usize = 32 * 1024 * 1024;

pub const CONTENT_TYPE: &str = "application/octet-stream";

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, SyncError> {
    Ok(postcard::to_stdvec(message)?.into())
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, SyncError> {
    Ok(postcard::from_bytes(body)?)
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, SyncError> {
    let payload = encode(message)?;
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    codec().encode(payload, &mut frame)?;
    Ok(frame.freeze())
}

pub fn decode_frames<T, R>(reader: R) -> impl Stream<Item = Result<T, SyncError>>
where
    T: DeserializeOwned,
    R: AsyncRead,
{
    FramedRead::new(reader, codec()).map(|frame| -> Result<T, SyncError> {
        let frame = frame?;
        decode(&frame)
    })
}
