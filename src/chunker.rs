use std::pin::pin;

use bytes::Bytes;
use fastcdc::v2020::{
    AsyncStreamCDC, AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
};
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::SyncError;
use crate::fingerprint::Fingerprint;

const KIB: u32 = 1024;
const MIN_CHUNK: u32 = 32 * KIB;
const AVG_CHUNK: u32 = 64 * KIB;
const MAX_CHUNK: u32 = 256 * KIB;

/// Size bounds for content-defined chunking.
///
/// A boundary is declared at the first position past `min_size` where the gear hash
/// matches a mask tuned for `avg_size`, or unconditionally at `max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: MIN_CHUNK,
            avg_size: AVG_CHUNK,
            max_size: MAX_CHUNK,
        }
    }
}

impl ChunkerConfig {
    /// Checks the sizes against what FastCDC accepts, which would otherwise panic.
    pub fn validate(&self) -> Result<(), SyncError> {
        let Self {
            min_size,
            avg_size,
            max_size,
        } = *self;
        if !(MINIMUM_MIN..=MINIMUM_MAX).contains(&min_size) {
            return Err(SyncError::Config(format!(
                "min_size {min_size} outside {MINIMUM_MIN}..={MINIMUM_MAX}"
            )));
        }
        if !(AVERAGE_MIN..=AVERAGE_MAX).contains(&avg_size) {
            return Err(SyncError::Config(format!(
                "avg_size {avg_size} outside {AVERAGE_MIN}..={AVERAGE_MAX}"
            )));
        }
        if !(MAXIMUM_MIN..=MAXIMUM_MAX).contains(&max_size) {
            return Err(SyncError::Config(format!(
                "max_size {max_size} outside {MAXIMUM_MIN}..={MAXIMUM_MAX}"
            )));
        }
        if min_size > avg_size || avg_size > max_size {
            return Err(SyncError::Config(format!(
                "sizes must satisfy min <= avg <= max, got {min_size}/{avg_size}/{max_size}"
            )));
        }
        Ok(())
    }
}

/// A content-defined chunk of a file, still carrying its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub fingerprint: Fingerprint,
    /// Byte offset of the chunk within the chunked stream.
    pub offset: u64,
    pub payload: Bytes,
}

impl Chunk {
    pub fn new(offset: u64, payload: Bytes) -> Self {
        Self {
            fingerprint: Fingerprint::of(&payload),
            offset,
            payload,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Splits `stream` into content-defined chunks in a single pass.
///
/// The final chunk may be shorter than `min_size`, and an empty stream yields no chunks.
pub fn chunk_stream(
    config: ChunkerConfig,
    stream: impl AsyncRead + Unpin,
) -> impl Stream<Item = Result<Chunk, SyncError>> {
    async_stream::try_stream! {
        config.validate()?;

        let mut chunks = AsyncStreamCDC::new(stream, config.min_size, config.avg_size, config.max_size);
        let mut chunks = pin!(chunks.as_stream());

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            yield Chunk::new(chunk.offset, Bytes::from(chunk.data));
        }
    }
}

pub async fn chunk_all(
    config: ChunkerConfig,
    stream: impl AsyncRead + Unpin,
) -> Result<Vec<Chunk>, SyncError> {
    chunk_stream(config, stream).try_collect().await
}

/// The ordered fingerprints of `chunks`, i.e. the file's signature.
pub fn signature_of(chunks: &[Chunk]) -> Vec<Fingerprint> {
    chunks.iter().map(|chunk| chunk.fingerprint).collect()
}
