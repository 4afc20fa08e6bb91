use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{ChunkStore, ModelError, Result};

const SNAPSHOT_MAGIC: &[u8; 4] = b"CMSN";
const SNAPSHOT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 32;

/// Layout: magic, little-endian version, SHA-256 of the payload, bincode payload.
pub fn encode_snapshot(store: &ChunkStore) -> Result<Vec<u8>> {
    let payload = bincode::serialize(store)?;
    let checksum = Sha256::digest(&payload);

    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    buffer.extend_from_slice(SNAPSHOT_MAGIC);
    buffer.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buffer.extend_from_slice(&checksum);
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<ChunkStore> {
    if bytes.len() < HEADER_LEN {
        return Err(ModelError::Corruption("snapshot is truncated".to_string()));
    }
    if &bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(ModelError::Corruption("bad snapshot magic".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != SNAPSHOT_VERSION {
        return Err(ModelError::Corruption(format!("unsupported snapshot version {}", version)));
    }

    let payload = &bytes[HEADER_LEN..];
    if Sha256::digest(payload).as_slice() != &bytes[8..HEADER_LEN] {
        return Err(ModelError::Corruption("snapshot checksum mismatch".to_string()));
    }

    let mut store: ChunkStore = bincode::deserialize(payload)?;
    store.rebuild_after_load();
    Ok(store)
}

/// Writes through a temporary file and renames it into place.
pub async fn write_snapshot(path: &Path, store: &ChunkStore) -> Result<()> {
    let bytes = encode_snapshot(store)?;
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    fs::rename(&tmp_path, path).await?;
    tracing::info!("Snapshot written: {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Returns `None` when no snapshot exists yet.
pub async fn read_snapshot(path: &Path) -> Result<Option<ChunkStore>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let store = decode_snapshot(&bytes)?;
    tracing::info!("Snapshot loaded: {} ({} chunks)", path.display(), store.chunk_count());
    Ok(Some(store))
}
