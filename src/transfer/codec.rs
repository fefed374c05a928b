//! Chunk codec: splits a file into fixed-size slices and converts chunk bytes
//! to and from the base64 text carried inside structured transport messages.
//!
//! Offsets are explicit. A chunk's `offset` is the number of bytes sent before
//! it, so the last chunk of a file satisfies `offset + len == bytes_total`.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }
}

/// Lazily reads a file as a finite sequence of chunks.
#[derive(Debug)]
pub struct ChunkReader {
    file: File,
    chunk_size: usize,
    offset: u64,
    exhausted: bool,
}

impl ChunkReader {
    pub fn new(file: File, chunk_size: usize) -> Self {
        Self {
            file,
            chunk_size: chunk_size.max(1),
            offset: 0,
            exhausted: false,
        }
    }

    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::new(file, chunk_size))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Offset the next chunk will start at.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Restart the sequence from an explicit offset.
    pub async fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        self.exhausted = false;
        Ok(())
    }

    /// Next chunk, or `None` once the file is exhausted. Every chunk but the
    /// last is exactly `chunk_size` bytes long.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        let chunk = Chunk {
            offset: self.offset,
            data: buf,
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }
}

/// Lengths of the chunks a file of `total` bytes splits into.
pub fn chunk_plan(total: u64, chunk_size: usize) -> Vec<u64> {
    let size = chunk_size.max(1) as u64;
    let mut plan = Vec::with_capacity(total.div_ceil(size) as usize);
    let mut remaining = total;
    while remaining > 0 {
        let len = remaining.min(size);
        plan.push(len);
        remaining -= len;
    }
    plan
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Serde adapter storing chunk bytes as base64 text.
pub mod base64_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CHUNK_SIZE;
    use tempfile::tempdir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_plan_for_clip() {
        assert_eq!(chunk_plan(150000, 65536), vec![65536, 65536, 18928]);
        assert_eq!(chunk_plan(131072, 65536), vec![65536, 65536]);
        assert!(chunk_plan(0, 65536).is_empty());
    }

    #[test]
    fn test_encode_decode_binary() {
        let bytes: Vec<u8> = (0..=255).collect();
        let text = encode(&bytes);
        assert!(text.is_ascii());
        assert_eq!(decode(&text).unwrap(), bytes);
        assert!(decode("not base64!").is_err());
    }

    #[tokio::test]
    async fn test_reader_offsets_cover_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.bin");
        let source = pattern(150000);
        std::fs::write(&path, &source).unwrap();

        let mut reader = ChunkReader::open(&path, 65536).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }

        let lengths: Vec<u64> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(lengths, vec![65536, 65536, 18928]);
        assert_eq!(chunks[1].offset, 65536);
        assert_eq!(chunks.last().unwrap().end(), 150000);

        let rebuilt: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(rebuilt, source);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_restarts_at_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let source = pattern(10);
        std::fs::write(&path, &source).unwrap();

        let mut reader = ChunkReader::open(&path, 4).await.unwrap();
        while reader.next_chunk().await.unwrap().is_some() {}

        reader.seek_to(8).await.unwrap();
        let chunk = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk.offset, 8);
        assert_eq!(chunk.data, source[8..].to_vec());
    }

    #[tokio::test]
    async fn test_empty_file_has_no_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let mut reader = ChunkReader::open(&path, DEFAULT_CHUNK_SIZE).await.unwrap();
        assert_eq!(reader.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }
}
