//! Chunked file reader
//!
//! Splits a file into contiguous, non-overlapping chunks of at most
//! `chunk_size` bytes. The file is opened for each read and closed as soon as
//! the bytes are in memory, so a long upload does not pin a descriptor across
//! network round trips.

use super::UploadError;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// One contiguous byte range of the source file
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u64,
    pub offset: u64,
    pub bytes: Bytes,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the last byte in the chunk, `None` when empty
    pub fn last_byte(&self) -> Option<u64> {
        (self.len() > 0).then(|| self.offset + self.len() - 1)
    }
}

/// Reads fixed-size chunks from a file on demand
#[derive(Debug, Clone, Copy)]
pub struct ChunkReader {
    chunk_size: u64,
}

impl ChunkReader {
    /// Create a reader; a zero chunk size is raised to one byte
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(file_size / chunk_size)`
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size)
    }

    /// Byte range `[start, end)` of chunk `index`
    ///
    /// Index 0 of an empty file is the empty range, so protocols that need at
    /// least one request still get one.
    pub fn bounds(&self, file_size: u64, index: u64) -> Option<(u64, u64)> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= file_size && !(index == 0 && file_size == 0) {
            return None;
        }
        let end = start.saturating_add(self.chunk_size).min(file_size);
        Some((start, end))
    }

    /// Size of `file` in bytes
    pub async fn file_size(&self, file: &Path) -> Result<u64, UploadError> {
        let metadata = tokio::fs::metadata(file)
            .await
            .map_err(|source| read_error(file, source))?;
        Ok(metadata.len())
    }

    /// Read chunk `index` of `file`
    pub async fn read_chunk(&self, file: &Path, index: u64) -> Result<Chunk, UploadError> {
        let file_size = self.file_size(file).await?;
        let (start, end) = self.bounds(file_size, index).ok_or_else(|| {
            read_error(
                file,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "chunk {} is past the end of a {} byte file",
                        index, file_size
                    ),
                ),
            )
        })?;

        let bytes = read_exact_at(file, start, end - start).await?;
        Ok(Chunk {
            index,
            offset: start,
            bytes,
        })
    }

    /// Read up to one chunk of `file` starting at an arbitrary `offset`
    ///
    /// Used when the provider resumes from a byte it chose rather than from a
    /// chunk boundary.
    pub async fn read_from(&self, file: &Path, offset: u64) -> Result<Chunk, UploadError> {
        let file_size = self.file_size(file).await?;
        if offset > file_size {
            return Err(read_error(
                file,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("offset {} is past the end of a {} byte file", offset, file_size),
                ),
            ));
        }
        let len = self.chunk_size.min(file_size - offset);
        let bytes = read_exact_at(file, offset, len).await?;
        Ok(Chunk {
            index: offset / self.chunk_size,
            offset,
            bytes,
        })
    }
}

fn read_error(file: &Path, source: io::Error) -> UploadError {
    UploadError::ChunkRead {
        path: file.to_path_buf(),
        source,
    }
}

/// Open, seek and read exactly `len` bytes; a short read is an error
async fn read_exact_at(file: &Path, offset: u64, len: u64) -> Result<Bytes, UploadError> {
    let len = usize::try_from(len).map_err(|_| {
        read_error(
            file,
            io::Error::new(io::ErrorKind::InvalidInput, "chunk does not fit in memory"),
        )
    })?;

    let mut handle = File::open(file)
        .await
        .map_err(|source| read_error(file, source))?;
    handle
        .seek(SeekFrom::Start(offset))
        .await
        .map_err(|source| read_error(file, source))?;

    let mut buffer = vec![0u8; len];
    handle
        .read_exact(&mut buffer)
        .await
        .map_err(|source| read_error(file, source))?;

    tracing::trace!(
        path = %file.display(),
        offset = offset,
        len = len,
        "Read chunk"
    );

    Ok(Bytes::from(buffer))
}
