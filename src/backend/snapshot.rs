//! Snapshot files of a [`MemoryBackend`].
//!
//! Layout:
//!
//! ```text
//! magic (4) | format version (1) | body length (u64 LE) | body (rmp) | crc32 of body (u32 LE)
//! ```

use super::memory::{MemoryBackend, MemoryState};
use crate::error::{BackendError, BackendResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

const SNAPSHOT_MAGIC: &[u8; 4] = b"SBK\0";
const SNAPSHOT_VERSION: u8 = 1;

impl MemoryBackend {
    /// Write all tables and sequences to `path`, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> BackendResult<()> {
        let path = path.as_ref();
        let encoded = {
            let state = self.state.read();
            rmp_serde::to_vec_named(&*state)?
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(SNAPSHOT_MAGIC)?;
        file.write_all(&[SNAPSHOT_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;

        info!(path = %path.display(), bytes = encoded.len(), "Saved backend snapshot");
        Ok(())
    }

    /// Restore a backend from a file written by [`MemoryBackend::save`].
    pub fn load(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(BackendError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(BackendError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(BackendError::ChecksumMismatch { expected, got });
        }

        let state: MemoryState = rmp_serde::from_slice(&encoded)?;
        info!(path = %path.display(), schemas = state.schemas.len(), "Loaded backend snapshot");

        let backend = MemoryBackend::new();
        *backend.state.write() = state;
        Ok(backend)
    }
}
