use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The content-addressable ID of a chunk: the SHA-256 of its payload.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(hex: &str) -> Result<Self, InvalidFingerprint> {
        if hex.len() != 64 {
            return Err(InvalidFingerprint(hex.into()));
        }
        let mut bytes = [0; 32];
        base16ct::mixed::decode(hex, &mut bytes).map_err(|_| InvalidFingerprint(hex.into()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid fingerprint {0:?}")]
pub struct InvalidFingerprint(String);

impl FromStr for Fingerprint {
    type Err = InvalidFingerprint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Digest over the full contents of a file, used to verify a reconstruction end to end.
#[derive(Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileDigest([u8; 32]);

impl FileDigest {
    pub fn of(contents: &[u8]) -> Self {
        Self(*blake3::hash(contents).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Incrementally computes a [`FileDigest`] while a file is streamed chunk by chunk.
#[derive(Default)]
pub struct FileHasher {
    hasher: blake3::Hasher,
    len: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(&self) -> FileDigest {
        FileDigest(*self.hasher.finalize().as_bytes())
    }
}

mod dbg {
    use super::*;

    impl fmt::Display for Fingerprint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for Fingerprint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "Fingerprint(SHA256:{:x})",
                base16ct::HexDisplay(&self.0[..8])
            )
        }
    }

    impl fmt::Display for FileDigest {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Debug for FileDigest {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FileDigest(BLAKE3:{:x})", base16ct::HexDisplay(&self.0))
        }
    }
}
