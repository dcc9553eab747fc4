//! Chunked file serving for snapshot transfer.
//!
//! A leader that wants a follower to install a snapshot registers a
//! [`FileReader`] for the snapshot directory and hands out its id. The
//! follower then pulls each file in bounded chunks through `GetFile`.
//!
//! With hole detection on, every chunk is inspected block by block and
//! all-zero blocks are left out of the response. Each remaining segment
//! carries its absolute file offset, so the receiver rebuilds sparse files
//! exactly.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::types::{FileSegment, GetFileRequest, GetFileResponse};

/// Bytes read from one file.
#[derive(Debug, Clone, Default)]
pub struct ReadChunk {
    pub data: Bytes,
    pub eof: bool,
}

#[async_trait]
pub trait FileReader: Send + Sync {
    /// Read up to `max_count` bytes at `offset`.
    ///
    /// With `read_partly` the reader may stop after a single short read;
    /// otherwise it keeps reading until `max_count` bytes or end of file.
    async fn read_file(
        &self,
        filename: &str,
        offset: u64,
        max_count: usize,
        read_partly: bool,
    ) -> Result<ReadChunk>;
}

/// Serves files below one directory.
pub struct LocalDirReader {
    root: PathBuf,
}

impl LocalDirReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reject names that could escape the served directory.
pub(crate) fn check_file_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(RaftError::invalid(format!("bad file name {:?}", name)))
    }
}

#[async_trait]
impl FileReader for LocalDirReader {
    async fn read_file(
        &self,
        filename: &str,
        offset: u64,
        max_count: usize,
        read_partly: bool,
    ) -> Result<ReadChunk> {
        check_file_name(filename)?;
        let path = self.root.join(filename);
        let mut file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(ReadChunk {
                data: Bytes::new(),
                eof: true,
            });
        }

        let want = std::cmp::min(max_count as u64, len - offset) as usize;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            if read_partly {
                break;
            }
        }
        buf.truncate(filled);

        Ok(ReadChunk {
            eof: offset + filled as u64 >= len,
            data: Bytes::from(buf),
        })
    }
}

/// Registry of readers plus the `GetFile` handler.
pub struct FileService {
    readers: Mutex<HashMap<i64, Arc<dyn FileReader>>>,
    next_id: AtomicI64,
    check_hole: bool,
    hole_block_size: usize,
}

impl FileService {
    pub fn new(check_hole: bool, hole_block_size: usize) -> Self {
        Self {
            readers: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(initial_reader_id()),
            check_hole,
            hole_block_size: hole_block_size.max(1),
        }
    }

    pub fn from_config(config: &RaftConfig) -> Self {
        Self::new(config.file_check_hole, config.hole_check_block_size)
    }

    pub fn add_reader(&self, reader: Arc<dyn FileReader>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.readers.lock().insert(id, reader);
        tracing::debug!(reader_id = id, "Registered file reader");
        id
    }

    /// False when the id was never registered or already removed.
    pub fn remove_reader(&self, reader_id: i64) -> bool {
        self.readers.lock().remove(&reader_id).is_some()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    pub async fn get_file(&self, request: &GetFileRequest) -> Result<GetFileResponse> {
        if request.count <= 0 || request.offset < 0 {
            return Err(RaftError::invalid(format!(
                "offset={} count={}",
                request.offset, request.count
            )));
        }
        let reader = self
            .readers
            .lock()
            .get(&request.reader_id)
            .cloned()
            .ok_or(RaftError::ReaderNotFound {
                reader_id: request.reader_id,
            })?;

        let offset = request.offset as u64;
        let chunk = reader
            .read_file(
                &request.filename,
                offset,
                request.count as usize,
                request.read_partly,
            )
            .await?;

        let read_size = chunk.data.len() as u64;
        let segments = if self.check_hole {
            split_non_zero(offset, &chunk.data, self.hole_block_size)
        } else if chunk.data.is_empty() {
            Vec::new()
        } else {
            vec![FileSegment {
                offset,
                data: chunk.data,
            }]
        };

        Ok(GetFileResponse {
            segments,
            eof: chunk.eof,
            read_size,
        })
    }
}

/// Split `data` into runs of blocks that are not entirely zero. Adjacent
/// non-zero blocks are merged into one segment.
fn split_non_zero(offset: u64, data: &Bytes, block: usize) -> Vec<FileSegment> {
    let mut segments = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut pos = 0;

    while pos < data.len() {
        let end = std::cmp::min(pos + block, data.len());
        let zero = data[pos..end].iter().all(|&b| b == 0);
        match (zero, run_start) {
            (false, None) => run_start = Some(pos),
            (true, Some(start)) => {
                segments.push(FileSegment {
                    offset: offset + start as u64,
                    data: data.slice(start..pos),
                });
                run_start = None;
            }
            _ => {}
        }
        pos = end;
    }
    if let Some(start) = run_start {
        segments.push(FileSegment {
            offset: offset + start as u64,
            data: data.slice(start..),
        });
    }
    segments
}

/// Ids start from `(pid << 45) | micros` so a restarted process does not
/// hand out ids an old follower may still be holding.
fn initial_reader_id() -> i64 {
    let pid = std::process::id() as i64 & 0x3FFFF;
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    (pid << 45) | (micros & ((1i64 << 45) - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(reader_id: i64, name: &str, offset: i64, count: i64) -> GetFileRequest {
        GetFileRequest {
            reader_id,
            filename: name.to_string(),
            offset,
            count,
            read_partly: false,
        }
    }

    #[tokio::test]
    async fn test_get_file_chunks_to_eof() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data"), vec![7u8; 100]).unwrap();

        let service = FileService::new(false, 8);
        let id = service.add_reader(Arc::new(LocalDirReader::new(dir.path())));

        let first = service.get_file(&request(id, "data", 0, 60)).await.unwrap();
        assert_eq!(first.read_size, 60);
        assert!(!first.eof);

        let second = service.get_file(&request(id, "data", 60, 60)).await.unwrap();
        assert_eq!(second.read_size, 40);
        assert!(second.eof);
        assert_eq!(second.segments[0].offset, 60);
    }

    #[tokio::test]
    async fn test_get_file_validation() {
        let service = FileService::new(true, 8);
        let err = service.get_file(&request(1, "x", -1, 10)).await.unwrap_err();
        assert!(matches!(err, RaftError::InvalidRequest { .. }));
        let err = service.get_file(&request(1, "x", 0, 0)).await.unwrap_err();
        assert!(matches!(err, RaftError::InvalidRequest { .. }));
        let err = service.get_file(&request(1, "x", 0, 10)).await.unwrap_err();
        assert!(matches!(err, RaftError::ReaderNotFound { reader_id: 1 }));
    }

    #[tokio::test]
    async fn test_hole_detection_keeps_logical_offsets() {
        let dir = TempDir::new().unwrap();
        let mut content = vec![0u8; 64];
        content[0..8].copy_from_slice(&[1; 8]);
        content[40..48].copy_from_slice(&[2; 8]);
        content[48..56].copy_from_slice(&[3; 8]);
        std::fs::write(dir.path().join("sparse"), &content).unwrap();

        let service = FileService::new(true, 8);
        let id = service.add_reader(Arc::new(LocalDirReader::new(dir.path())));
        let resp = service.get_file(&request(id, "sparse", 0, 64)).await.unwrap();

        assert_eq!(resp.read_size, 64);
        assert!(resp.eof);
        assert_eq!(resp.segments.len(), 2);
        assert_eq!(resp.segments[0].offset, 0);
        assert_eq!(resp.segments[0].data.len(), 8);
        assert_eq!(resp.segments[1].offset, 40);
        assert_eq!(&resp.segments[1].data[..], &content[40..56]);
    }

    #[tokio::test]
    async fn test_remove_reader_twice() {
        let dir = TempDir::new().unwrap();
        let service = FileService::new(false, 8);
        let id = service.add_reader(Arc::new(LocalDirReader::new(dir.path())));
        assert!(service.remove_reader(id));
        assert!(!service.remove_reader(id));
        assert_eq!(service.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_reader_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let reader = LocalDirReader::new(dir.path());
        assert!(reader.read_file("../etc/passwd", 0, 10, false).await.is_err());
        assert!(reader.read_file("/abs", 0, 10, false).await.is_err());
    }

    #[test]
    fn test_reader_ids_are_unique() {
        let service = FileService::new(false, 8);
        let reader: Arc<dyn FileReader> = Arc::new(LocalDirReader::new("/tmp"));
        let a = service.add_reader(reader.clone());
        let b = service.add_reader(reader);
        assert_ne!(a, b);
        assert!(a > 0);
    }
}
