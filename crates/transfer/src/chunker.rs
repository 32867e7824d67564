//! Fixed-size chunked reads of the file being sent.

use std::path::Path;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use zipline_protocol::CHUNK_SIZE;

/// Reads a file sequentially in [`CHUNK_SIZE`] chunks.
///
/// Every chunk is full-size except possibly the last; for a file whose
/// length is an exact multiple of the chunk size the last chunk is
/// full-size too.
pub struct ChunkReader {
    file: File,
    offset: u64,
    len: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            offset: 0,
            len,
        })
    }

    /// Total file size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let remaining = self.len.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(None);
        }

        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        if filled == 0 {
            return Ok(None);
        }

        self.offset += filled as u64;
        Ok(Some(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_in_chunk_size_pieces_with_short_tail() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; 17000];
        let path = write_file(&dir, "payload.bin", &data);

        let mut reader = ChunkReader::open(&path).await.unwrap();
        assert_eq!(reader.len(), 17000);

        let c1 = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c1.len(), CHUNK_SIZE);
        let c2 = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c2.len(), CHUNK_SIZE);
        let c3 = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(c3.len(), 17000 - 2 * CHUNK_SIZE);
        assert!(reader.next_chunk().await.unwrap().is_none());
        assert_eq!(reader.offset(), 17000);
    }

    #[tokio::test]
    async fn exact_multiple_ends_cleanly() {
        let dir = TempDir::new().unwrap();
        let data = vec![1u8; CHUNK_SIZE * 2];
        let path = write_file(&dir, "even.bin", &data);

        let mut reader = ChunkReader::open(&path).await.unwrap();
        assert_eq!(reader.next_chunk().await.unwrap().unwrap().len(), CHUNK_SIZE);
        assert_eq!(reader.next_chunk().await.unwrap().unwrap().len(), CHUNK_SIZE);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_file_yields_no_chunks() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "empty.bin", b"");

        let mut reader = ChunkReader::open(&path).await.unwrap();
        assert!(reader.is_empty());
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunks_carry_the_file_bytes() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(10000).collect();
        let path = write_file(&dir, "pattern.bin", &data);

        let mut reader = ChunkReader::open(&path).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, data);
    }
}
