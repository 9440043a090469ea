pub mod chunker;
pub mod client;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod protocol;
pub mod reconciler;
pub mod reconstructor;
pub mod server;
pub mod signature_cache;
pub mod store;
pub mod wire;

#[cfg(test)]
mod testutil;

pub use client::{HttpClient, SyncClient, SyncReport};
pub use error::SyncError;
pub use fingerprint::Fingerprint;
pub use server::SyncServer;
