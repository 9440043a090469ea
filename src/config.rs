use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::chunker::ChunkerConfig;
use crate::error::SyncError;

pub const LISTEN_ENV: &str = "DELTASYNC_LISTEN";
pub const DATA_DIR_ENV: &str = "DELTASYNC_DATA_DIR";

const DEFAULT_LISTEN: &str = "127.0.0.1:3000";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub chunker: ChunkerConfig,
    /// Skip the round trip to the server when a file's modification time and signature
    /// match what was recorded at its last successful sync.
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Where the fjall keyspace lives. `None` keeps it in a temporary directory that is
    /// removed on shutdown.
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_vars(env::var(LISTEN_ENV).ok(), env::var_os(DATA_DIR_ENV).map(PathBuf::from))
    }

    fn from_vars(listen: Option<String>, data_dir: Option<PathBuf>) -> Result<Self, SyncError> {
        let listen = listen.unwrap_or_else(|| DEFAULT_LISTEN.into());
        let listen_addr = listen
            .parse()
            .map_err(|err| SyncError::Config(format!("invalid {LISTEN_ENV} {listen:?}: {err}")))?;
        let data_dir = data_dir.filter(|dir| !dir.as_os_str().is_empty());
        Ok(Self {
            listen_addr,
            data_dir,
        })
    }
}
