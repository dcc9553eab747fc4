//! Pulls snapshot files from a remote [`FileService`](crate::file_service::FileService).
//!
//! Each chunk is sized by the throttle first. Budget that the remote end
//! did not fill is handed back so other installs can use it. Transient
//! failures are retried a bounded number of times.

use bytes::{Bytes, BytesMut};
use nori_observe::{obs_count, Meter};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::throttle::SnapshotThrottle;
use crate::transport::RaftTransport;
use crate::types::GetFileRequest;

const URI_SCHEME: &str = "remote://";

/// `remote://ip:port/reader_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteUri {
    pub addr: SocketAddr,
    pub reader_id: i64,
}

impl fmt::Display for RemoteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", URI_SCHEME, self.addr, self.reader_id)
    }
}

impl FromStr for RemoteUri {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RaftError::invalid(format!("bad snapshot uri {:?}", s));
        let rest = s.strip_prefix(URI_SCHEME).ok_or_else(invalid)?;
        let (addr, id) = rest.split_once('/').ok_or_else(invalid)?;
        Ok(Self {
            addr: addr.parse().map_err(|_| invalid())?,
            reader_id: id.parse().map_err(|_| invalid())?,
        })
    }
}

/// Knobs for one copy session.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub chunk_size: usize,
    pub read_partly: bool,
    pub max_retry: u32,
    pub retry_interval: Duration,
    pub rpc_timeout: Duration,
}

impl CopyOptions {
    pub fn from_config(config: &RaftConfig) -> Self {
        Self {
            chunk_size: config.snapshot_chunk_size.max(1),
            read_partly: config.read_partly,
            max_retry: config.copy_max_retry,
            retry_interval: config.copy_retry_interval,
            rpc_timeout: config.rpc_timeout,
        }
    }
}

pub struct RemoteFileCopier {
    uri: RemoteUri,
    transport: Arc<dyn RaftTransport>,
    throttle: Option<Arc<dyn SnapshotThrottle>>,
    clock: Arc<dyn Clock>,
    meter: Arc<dyn Meter>,
    options: CopyOptions,
    cancel: watch::Receiver<bool>,
    copied: AtomicU64,
}

impl RemoteFileCopier {
    pub fn new(
        uri: RemoteUri,
        transport: Arc<dyn RaftTransport>,
        throttle: Option<Arc<dyn SnapshotThrottle>>,
        clock: Arc<dyn Clock>,
        meter: Arc<dyn Meter>,
        options: CopyOptions,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uri,
            transport,
            throttle,
            clock,
            meter,
            options,
            cancel,
            copied: AtomicU64::new(0),
        }
    }

    pub fn uri(&self) -> RemoteUri {
        self.uri
    }

    /// Logical bytes fetched so far, holes included.
    pub fn copied_bytes(&self) -> u64 {
        self.copied.load(Ordering::Relaxed)
    }

    /// Fetch one whole file into memory.
    pub async fn copy_to_bytes(&self, filename: &str) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let mut offset: u64 = 0;
        let mut failures: u32 = 0;

        loop {
            self.check_cancelled()?;

            let want = self.options.chunk_size as u64;
            let granted = match &self.throttle {
                Some(throttle) => throttle.throttled_by_throughput(want),
                None => want,
            };
            if granted == 0 {
                obs_count!(self.meter, "snapshot_chunk_throttled", &[], 1);
                let wait = self
                    .throttle
                    .as_ref()
                    .map_or(self.options.retry_interval, |t| t.retry_interval());
                self.sleep(wait).await?;
                continue;
            }

            let request = GetFileRequest {
                reader_id: self.uri.reader_id,
                filename: filename.to_string(),
                offset: offset as i64,
                count: granted as i64,
                read_partly: self.options.read_partly,
            };
            let started = self.clock.now();
            let result = self
                .transport
                .get_file(self.uri.addr, request, self.options.rpc_timeout)
                .await;

            let consumed = match &result {
                Ok(resp) => resp.read_size.min(granted),
                Err(_) => 0,
            };
            if let Some(throttle) = &self.throttle {
                let elapsed = self.clock.now().saturating_duration_since(started);
                throttle.return_unused_throughput(granted, consumed, elapsed);
            }

            let failure = match result {
                Ok(resp) if resp.read_size > granted => {
                    return Err(RaftError::invalid(format!(
                        "peer returned {} bytes of {} at {}, only {} requested",
                        resp.read_size, filename, offset, granted
                    )));
                }
                Ok(resp) if resp.read_size > 0 || resp.eof => {
                    let end = offset + resp.read_size;
                    if buf.len() < end as usize {
                        buf.resize(end as usize, 0);
                    }
                    for segment in &resp.segments {
                        let start = segment.offset as usize;
                        let stop = start + segment.data.len();
                        if segment.offset < offset || stop as u64 > end {
                            return Err(RaftError::invalid(format!(
                                "segment {}..{} outside chunk {}..{}",
                                start, stop, offset, end
                            )));
                        }
                        buf[start..stop].copy_from_slice(&segment.data);
                    }
                    offset = end;
                    self.copied.fetch_add(resp.read_size, Ordering::Relaxed);
                    failures = 0;
                    if resp.eof {
                        return Ok(buf.freeze());
                    }
                    continue;
                }
                Ok(_) => RaftError::Internal {
                    reason: format!("no progress reading {} at {}", filename, offset),
                },
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            failures += 1;
            if failures > self.options.max_retry {
                tracing::warn!(
                    uri = %self.uri,
                    file = filename,
                    offset,
                    error = %failure,
                    "Giving up on snapshot file"
                );
                return Err(failure);
            }
            tracing::debug!(uri = %self.uri, file = filename, attempt = failures, error = %failure, "Retrying chunk");
            self.sleep(self.options.retry_interval).await?;
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(RaftError::Cancelled {
                reason: "snapshot copy cancelled".to_string(),
            });
        }
        Ok(())
    }

    async fn sleep(&self, wait: Duration) -> Result<()> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            Ok(_) = cancel.wait_for(|c| *c) => self.check_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::file_service::{FileService, LocalDirReader};
    use crate::throttle::ThroughputSnapshotThrottle;
    use crate::types::*;
    use async_trait::async_trait;
    use nori_observe::MemoryMeter;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Serves `get_file` straight from a local service, failing the first
    /// `fail_first` calls. `inflate` overstates every `read_size`.
    struct DirectTransport {
        service: Arc<FileService>,
        fail_first: Mutex<u32>,
        inflate: Mutex<bool>,
    }

    fn unsupported<T>() -> Result<T> {
        Err(RaftError::Internal {
            reason: "unsupported".to_string(),
        })
    }

    #[async_trait]
    impl RaftTransport for DirectTransport {
        async fn pre_vote(&self, _: &PeerAddress, _: RequestVoteRequest, _: Duration) -> Result<RequestVoteResponse> {
            unsupported()
        }
        async fn request_vote(&self, _: &PeerAddress, _: RequestVoteRequest, _: Duration) -> Result<RequestVoteResponse> {
            unsupported()
        }
        async fn append_entries(&self, _: &PeerAddress, _: AppendEntriesRequest, _: Duration) -> Result<AppendEntriesResponse> {
            unsupported()
        }
        async fn install_snapshot(&self, _: &PeerAddress, _: InstallSnapshotRequest, _: Duration) -> Result<InstallSnapshotResponse> {
            unsupported()
        }
        async fn timeout_now(&self, _: &PeerAddress, _: TimeoutNowRequest, _: Duration) -> Result<TimeoutNowResponse> {
            unsupported()
        }
        async fn get_file(&self, _: SocketAddr, request: GetFileRequest, _: Duration) -> Result<GetFileResponse> {
            {
                let mut fail = self.fail_first.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(RaftError::Unreachable {
                        peer: "leader".to_string(),
                    });
                }
            }
            let mut resp = self.service.get_file(&request).await?;
            if *self.inflate.lock() {
                resp.read_size += 1 << 40;
            }
            Ok(resp)
        }
    }

    fn options(chunk_size: usize, max_retry: u32) -> CopyOptions {
        CopyOptions {
            chunk_size,
            read_partly: false,
            max_retry,
            retry_interval: Duration::from_millis(1),
            rpc_timeout: Duration::from_secs(1),
        }
    }

    struct Fixture {
        _dir: TempDir,
        transport: Arc<DirectTransport>,
        reader_id: i64,
    }

    fn fixture(content: &[u8], fail_first: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data"), content).unwrap();
        let service = Arc::new(FileService::new(true, 16));
        let reader_id = service.add_reader(Arc::new(LocalDirReader::new(dir.path())));
        Fixture {
            _dir: dir,
            transport: Arc::new(DirectTransport {
                service,
                fail_first: Mutex::new(fail_first),
                inflate: Mutex::new(false),
            }),
            reader_id,
        }
    }

    fn copier(
        f: &Fixture,
        throttle: Option<Arc<dyn SnapshotThrottle>>,
        opts: CopyOptions,
        cancel: watch::Receiver<bool>,
    ) -> RemoteFileCopier {
        RemoteFileCopier::new(
            RemoteUri {
                addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
                reader_id: f.reader_id,
            },
            f.transport.clone(),
            throttle,
            Arc::new(ManualClock::new()),
            Arc::new(MemoryMeter::new()),
            opts,
            cancel,
        )
    }

    #[test]
    fn test_uri_parse_and_display() {
        let uri: RemoteUri = "remote://127.0.0.1:8100/42".parse().unwrap();
        assert_eq!(uri.reader_id, 42);
        assert_eq!(uri.to_string(), "remote://127.0.0.1:8100/42");
        assert!("http://127.0.0.1:8100/42".parse::<RemoteUri>().is_err());
        assert!("remote://127.0.0.1:8100".parse::<RemoteUri>().is_err());
        assert!("remote://127.0.0.1:8100/x".parse::<RemoteUri>().is_err());
    }

    #[tokio::test]
    async fn test_copy_rebuilds_sparse_file() {
        let mut content = vec![0u8; 200];
        content[3] = 9;
        content[150..170].copy_from_slice(&[5; 20]);
        let f = fixture(&content, 0);
        let (_tx, rx) = watch::channel(false);

        let c = copier(&f, None, options(64, 0), rx);
        let data = c.copy_to_bytes("data").await.unwrap();
        assert_eq!(&data[..], &content[..]);
        assert_eq!(c.copied_bytes(), 200);
    }

    #[tokio::test]
    async fn test_copy_retries_transient_failures() {
        let f = fixture(&[1u8; 50], 2);
        let (_tx, rx) = watch::channel(false);
        let data = copier(&f, None, options(64, 3), rx)
            .copy_to_bytes("data")
            .await
            .unwrap();
        assert_eq!(data.len(), 50);
    }

    #[tokio::test]
    async fn test_copy_gives_up_after_max_retry() {
        let f = fixture(&[1u8; 50], 5);
        let (_tx, rx) = watch::channel(false);
        let err = copier(&f, None, options(64, 2), rx)
            .copy_to_bytes("data")
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_missing_reader_is_not_retried_forever() {
        let f = fixture(&[1u8; 10], 0);
        f.transport.service.remove_reader(f.reader_id);
        let (_tx, rx) = watch::channel(false);
        let err = copier(&f, None, options(64, 2), rx)
            .copy_to_bytes("data")
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::ReaderNotFound { .. }));
    }

    #[tokio::test]
    async fn test_throttled_copy_is_chunked_by_budget() {
        let f = fixture(&[7u8; 100], 0);
        let clock = Arc::new(ManualClock::new());
        // 300 B/s over 10 cycles: 30 bytes per cycle
        let throttle: Arc<dyn SnapshotThrottle> =
            Arc::new(ThroughputSnapshotThrottle::new(300, 0, 10, 1, clock.clone()));
        let (_tx, rx) = watch::channel(false);
        let c = copier(&f, Some(throttle.clone()), options(1024, 0), rx);

        let advance = {
            let clock = clock.clone();
            tokio::spawn(async move {
                for _ in 0..1000 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    clock.advance(Duration::from_millis(100));
                }
            })
        };
        let data = c.copy_to_bytes("data").await.unwrap();
        advance.abort();
        assert_eq!(&data[..], &[7u8; 100][..]);
    }

    #[tokio::test]
    async fn test_cancel_stops_copy() {
        let f = fixture(&[1u8; 10], 0);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = copier(&f, None, options(64, 0), rx)
            .copy_to_bytes("data")
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_oversized_read_is_rejected() {
        let f = fixture(&[1u8; 50], 0);
        *f.transport.inflate.lock() = true;
        let (_tx, rx) = watch::channel(false);
        let err = copier(&f, None, options(64, 3), rx)
            .copy_to_bytes("data")
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::InvalidRequest { .. }));
    }
}
