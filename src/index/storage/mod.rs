//! On-disk format of a similarity index artifact.
//!
//! Header (24 bytes, little-endian):
//! - magic: `CVIX`
//! - version: u8
//! - metric: u8 (0 = l2, 1 = cosine)
//! - reserved: u16
//! - dimension: u32
//! - vector_count: u64
//! - checksum: u32 (CRC32 of the 20 bytes before it)
//!
//! Payload: `vector_count * dimension` f32 values in position order,
//! followed by a CRC32 of the payload bytes.


use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::database::sqlite::VectorType;
use crate::index::{DistanceMetric, FlatIndex};

const MAGIC: &[u8; 4] = b"CVIX";
const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 24;
const TRAILER_SIZE: usize = 4;

pub const FILE_EXTENSION: &str = "vec";

#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch in {0}: file may be corrupted")]
    ChecksumMismatch(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub metric: DistanceMetric,
    pub dimension: usize,
    pub vector_count: usize,
}

/// Stable file name for the artifact of a key
#[inline]
pub fn file_name(group_id: i64, index_type: VectorType) -> String {
    format!("{group_id}_{index_type}.{FILE_EXTENSION}")
}

/// Fresh file name for a rebuilt generation, never equal to a previous one
#[inline]
pub fn generation_file_name(group_id: i64, index_type: VectorType) -> String {
    format!(
        "{group_id}_{index_type}_{}.{FILE_EXTENSION}",
        Uuid::new_v4().simple()
    )
}

#[inline]
pub fn encoded_len(index: &FlatIndex) -> u64 {
    (HEADER_SIZE + index.raw().len() * 4 + TRAILER_SIZE) as u64
}

#[inline]
pub fn encode(index: &FlatIndex) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded_len(index) as usize);

    bytes.extend_from_slice(MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.push(index.metric().to_byte());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&(index.dimension() as u32).to_le_bytes());
    bytes.extend_from_slice(&(index.len() as u64).to_le_bytes());
    let header_checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&header_checksum.to_le_bytes());

    for value in index.raw() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let payload_checksum = crc32fast::hash(&bytes[HEADER_SIZE..]);
    bytes.extend_from_slice(&payload_checksum.to_le_bytes());

    bytes
}

#[inline]
pub fn decode_header(bytes: &[u8]) -> Result<Header, IndexStorageError> {
    let header = bytes
        .get(..HEADER_SIZE)
        .ok_or_else(|| IndexStorageError::InvalidFormat("file shorter than header".to_string()))?;

    if &header[0..4] != MAGIC {
        return Err(IndexStorageError::InvalidFormat("bad magic".to_string()));
    }

    let version = header[4];
    if version != FORMAT_VERSION {
        return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes(le_array(&header[20..24]));
    if crc32fast::hash(&header[..20]) != stored_checksum {
        return Err(IndexStorageError::ChecksumMismatch("header"));
    }

    let metric = DistanceMetric::from_byte(header[5])
        .ok_or_else(|| IndexStorageError::InvalidFormat(format!("unknown metric {}", header[5])))?;
    let dimension = u32::from_le_bytes(le_array(&header[8..12])) as usize;
    let vector_count = u64::from_le_bytes(le_array(&header[12..20]));

    if dimension == 0 {
        return Err(IndexStorageError::InvalidFormat("zero dimension".to_string()));
    }

    let vector_count = usize::try_from(vector_count)
        .map_err(|_| IndexStorageError::InvalidFormat("vector count overflows".to_string()))?;

    Ok(Header {
        metric,
        dimension,
        vector_count,
    })
}

#[inline]
pub fn decode(bytes: &[u8]) -> Result<FlatIndex, IndexStorageError> {
    let header = decode_header(bytes)?;

    let payload_len = header
        .vector_count
        .checked_mul(header.dimension)
        .and_then(|values| values.checked_mul(4))
        .ok_or_else(|| IndexStorageError::InvalidFormat("payload size overflows".to_string()))?;

    let expected_len = HEADER_SIZE + payload_len + TRAILER_SIZE;
    if bytes.len() != expected_len {
        return Err(IndexStorageError::InvalidFormat(format!(
            "expected {expected_len} bytes, found {}",
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + payload_len];
    let stored_checksum = u32::from_le_bytes(le_array(&bytes[HEADER_SIZE + payload_len..]));
    if crc32fast::hash(payload) != stored_checksum {
        return Err(IndexStorageError::ChecksumMismatch("payload"));
    }

    let data = payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(le_array(chunk)))
        .collect();

    Ok(FlatIndex::from_raw(header.dimension, header.metric, data))
}

/// Reads and decodes an artifact
#[inline]
pub async fn read(path: &Path) -> Result<FlatIndex, IndexStorageError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IndexStorageError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    decode(&bytes)
}

/// Reads only the header, for status reporting
#[inline]
pub async fn read_header(path: &Path) -> Result<Header, IndexStorageError> {
    use tokio::io::AsyncReadExt;

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IndexStorageError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header).await?;
    decode_header(&header)
}

/// Writes the artifact with temp file, fsync and rename. Returns the file size.
#[inline]
pub async fn write_atomic(path: &Path, index: &FlatIndex) -> Result<u64, IndexStorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = encode(index);
    let temp_path = path.with_extension(format!("{FILE_EXTENSION}.tmp"));

    if let Err(e) = write_synced(&temp_path, &bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    tokio::fs::rename(&temp_path, path).await?;

    debug!(
        "Wrote {} vectors ({} bytes) to {}",
        index.len(),
        bytes.len(),
        path.display()
    );

    Ok(bytes.len() as u64)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(&bytes[..N]);
    array
}
