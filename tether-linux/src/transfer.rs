//! Transfer engine: moves bytes between an HTTP endpoint and storage, driving
//! the core's `Download` / `Upload` sessions chunk by chunk.

use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use tether_core::progress::ProgressSample;
use tether_core::storage::{Filesystem, StorageManager};
use tether_core::transfer::{
    Direction, Download, TransferError, TransferJob, TransferLimits, TransferReport, Upload,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Chunks buffered between the storage reader and the upload request.
const UPLOAD_PIPE_DEPTH: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// Body source failure seen by an in-process transport.
    #[cfg(test)]
    #[error("body: {0}")]
    Body(#[from] io::Error),
}

/// Response head plus a streaming body.
pub struct Fetched<B> {
    pub status: u16,
    /// Content-Length, when the server sent one.
    pub content_length: Option<u64>,
    pub body: B,
}

/// Request/response byte stream used for file transfers, independent of the control link.
#[async_trait]
pub trait ByteTransport: Send + Sync {
    type Body: Stream<Item = Result<Bytes, TransportError>> + Send + Unpin;

    async fn fetch(&self, url: &str) -> Result<Fetched<Self::Body>, TransportError>;

    /// Push `size` bytes read from `body` as a multipart file part named `file`. Returns the HTTP status.
    async fn push(
        &self,
        url: &str,
        filename: &str,
        size: u64,
        body: mpsc::Receiver<io::Result<Bytes>>,
    ) -> Result<u16, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ByteTransport for HttpTransport {
    type Body = BoxStream<'static, Result<Bytes, TransportError>>;

    async fn fetch(&self, url: &str) -> Result<Fetched<Self::Body>, TransportError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let body = resp
            .bytes_stream()
            .map(|r| r.map_err(TransportError::from))
            .boxed();
        Ok(Fetched {
            status,
            content_length,
            body,
        })
    }

    async fn push(
        &self,
        url: &str,
        filename: &str,
        size: u64,
        body: mpsc::Receiver<io::Result<Bytes>>,
    ) -> Result<u16, TransportError> {
        let chunks = stream::unfold(body, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let part =
            reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(chunks), size)
                .file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self.client.post(url).multipart(form).send().await?;
        Ok(resp.status().as_u16())
    }
}

/// Cancellation for the active job, raised when the control link drops.
/// Pending reads and writes wake on it.
#[derive(Debug, Clone, Default)]
pub struct Ticket(CancellationToken);

impl Ticket {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }

    fn check(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        Ok(())
    }
}

fn stalled(idle: Duration) -> TransferError {
    TransferError::Network(format!("no progress for {}s", idle.as_secs()))
}

/// Await one network step, giving up on cancellation or after `idle`.
async fn guarded<O>(
    ticket: &Ticket,
    idle: Duration,
    step: impl Future<Output = O>,
) -> Result<O, TransferError> {
    tokio::select! {
        biased;
        _ = ticket.cancelled() => Err(TransferError::Aborted),
        out = tokio::time::timeout(idle, step) => out.map_err(|_| stalled(idle)),
    }
}

fn network(e: TransportError) -> TransferError {
    TransferError::Network(e.to_string())
}

fn check_status(status: u16) -> Result<(), TransferError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TransferError::HttpStatus(status))
    }
}

/// Run one job to completion or failure.
pub async fn run<F, T, P>(
    storage: &mut StorageManager<F>,
    transport: &T,
    job: &TransferJob,
    limits: TransferLimits,
    ticket: &Ticket,
    idle: Duration,
    progress: P,
) -> Result<TransferReport, TransferError>
where
    F: Filesystem + Send + Sync,
    T: ByteTransport,
    P: FnMut(&ProgressSample) + Send,
{
    match job.direction {
        Direction::Download => download(storage, transport, job, limits, ticket, idle, progress).await,
        Direction::Upload => upload(storage, transport, job, limits, ticket, idle, progress).await,
    }
}

/// Capacity is reserved before the request goes out, so a job that cannot fit
/// never touches the network. Every network step is bounded by `idle`.
pub async fn download<F, T, P>(
    storage: &mut StorageManager<F>,
    transport: &T,
    job: &TransferJob,
    limits: TransferLimits,
    ticket: &Ticket,
    idle: Duration,
    mut progress: P,
) -> Result<TransferReport, TransferError>
where
    F: Filesystem + Send + Sync,
    T: ByteTransport,
    P: FnMut(&ProgressSample) + Send,
{
    let mut dl = Download::begin(storage, job.clone(), limits)?;
    let streamed = async {
        let fetched = guarded(ticket, idle, transport.fetch(&job.remote_locator))
            .await?
            .map_err(network)?;
        check_status(fetched.status)?;
        dl.set_content_length(storage, fetched.content_length)?;
        let mut body = fetched.body;
        while let Some(chunk) = guarded(ticket, idle, body.next()).await? {
            let chunk = chunk.map_err(network)?;
            if let Some(sample) = dl.write(storage, &chunk, Instant::now())? {
                progress(&sample);
            }
        }
        Ok::<(), TransferError>(())
    }
    .await;
    if let Err(e) = streamed {
        debug!(job = %job.id, written = dl.written(), error = %e, "download interrupted");
        dl.abort(storage);
        return Err(e);
    }
    let (record, last) = dl.finish(storage, Instant::now())?;
    if let Some(sample) = last {
        progress(&sample);
    }
    Ok(TransferReport::Downloaded(record))
}

/// Storage is read on this task and fed to the request through a small pipe;
/// a failure on the read side drops the request. Each pipe write, and
/// the server's answer once the body is done, must happen within `idle`.
pub async fn upload<F, T, P>(
    storage: &StorageManager<F>,
    transport: &T,
    job: &TransferJob,
    limits: TransferLimits,
    ticket: &Ticket,
    idle: Duration,
    mut progress: P,
) -> Result<TransferReport, TransferError>
where
    F: Filesystem + Send + Sync,
    T: ByteTransport,
    P: FnMut(&ProgressSample) + Send,
{
    let mut up = Upload::begin(storage, job.clone(), limits)?;
    let size = up.size();
    let (tx, rx) = mpsc::channel(UPLOAD_PIPE_DEPTH);
    let pushed = {
        let push = transport.push(&job.remote_locator, &job.local_name, size, rx);
        let feed = async {
            let fed = async {
                loop {
                    ticket.check()?;
                    match up.next_chunk(storage, Instant::now())? {
                        Some((chunk, sample)) => {
                            if let Some(sample) = sample {
                                progress(&sample);
                            }
                            if guarded(ticket, idle, tx.send(Ok(Bytes::from(chunk))))
                                .await?
                                .is_err()
                            {
                                // The request ended early; its own result says why.
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Ok::<(), TransferError>(())
            }
            .await;
            drop(tx);
            fed
        };
        tokio::pin!(push);
        tokio::pin!(feed);
        let mut fed = false;
        loop {
            let body_done = fed;
            let answer = push.as_mut();
            tokio::select! {
                biased;
                _ = ticket.cancelled() => return Err(TransferError::Aborted),
                r = feed.as_mut(), if !fed => {
                    r?;
                    fed = true;
                }
                r = async move {
                    if body_done {
                        tokio::time::timeout(idle, answer).await.map_err(|_| stalled(idle))
                    } else {
                        Ok(answer.await)
                    }
                } => break r?,
            }
        }
    };
    check_status(pushed.map_err(network)?)?;
    let (report, last) = up.finish(Instant::now());
    if let TransferReport::Uploaded { size: sent, .. } = &report {
        if *sent != size {
            return Err(TransferError::Truncated {
                expected: size,
                got: *sent,
            });
        }
    }
    if let Some(sample) = last {
        progress(&sample);
    }
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;
    use tether_core::integrity::hash_bytes;
    use tether_core::storage::{MemFs, ReclaimOrder, StorageError};

    const IDLE: Duration = Duration::from_secs(30);

    fn store(capacity: u64) -> StorageManager<MemFs> {
        StorageManager::open(MemFs::new(), capacity, ReclaimOrder::OldestFirst).unwrap()
    }

    fn body(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn download_streams_and_reports() {
        let data = body(20_000);
        let md5 = hash_bytes(&data).to_hex();
        let transport = FakeTransport::serving(&data, 3000);
        let mut s = store(64 * 1024);
        let job = TransferJob::download("http://x/a.bin", "a.bin", data.len() as u64, &md5);
        let mut samples = Vec::new();
        let report = download(
            &mut s,
            &transport,
            &job,
            TransferLimits::default(),
            &Ticket::default(),
            IDLE,
            |p: &ProgressSample| samples.push(*p),
        )
        .await
        .unwrap();
        match report {
            TransferReport::Downloaded(rec) => {
                assert_eq!(rec.md5, md5);
                assert_eq!(s.read(&rec.name).unwrap(), data);
            }
            other => panic!("unexpected {other:?}"),
        }
        let last = samples.last().unwrap();
        assert_eq!(last.bytes_so_far, last.total_bytes);
        assert!(samples.windows(2).all(|w| w[0].percent <= w[1].percent));
    }

    #[tokio::test]
    async fn download_capacity_failure_never_fetches() {
        let transport = FakeTransport::serving(&body(500), 100);
        let mut s = store(300);
        let job = TransferJob::download("u", "a.bin", 500, "00");
        let err = download(
            &mut s,
            &transport,
            &job,
            TransferLimits::default(),
            &Ticket::default(),
            IDLE,
            |_: &ProgressSample| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Storage(StorageError::InsufficientSpace { .. })
        ));
        assert_eq!(transport.fetch_count(), 0);
        assert!(s.list().is_empty());
        assert_eq!(s.used(), 0);
    }

    #[tokio::test]
    async fn download_http_error_and_overrun_leave_nothing() {
        let data = body(1000);
        let mut s = store(64 * 1024);

        let mut transport = FakeTransport::serving(&data, 100);
        transport.status = 404;
        let job = TransferJob::download("u", "a", 1000, "00");
        let err = download(&mut s, &transport, &job, TransferLimits::default(), &Ticket::default(), IDLE, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::HttpStatus(404)));

        let mut transport = FakeTransport::serving(&data, 100);
        transport.content_length = None;
        let job = TransferJob::download("u", "a", 500, "00");
        let err = download(&mut s, &transport, &job, TransferLimits::default(), &Ticket::default(), IDLE, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Overrun { limit: 500 }));
        assert!(s.list().is_empty());
        assert_eq!(s.used(), 0);
    }

    #[tokio::test]
    async fn cancelled_ticket_aborts_download() {
        let data = body(1000);
        let transport = FakeTransport::serving(&data, 100);
        let mut s = store(64 * 1024);
        let job = TransferJob::download("u", "a", 1000, &hash_bytes(&data).to_hex());
        let ticket = Ticket::default();
        ticket.cancel();
        let err = download(&mut s, &transport, &job, TransferLimits::default(), &ticket, IDLE, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
        assert_eq!(s.used(), 0);
    }

    #[tokio::test]
    async fn upload_pushes_stored_bytes() {
        let data = body(10_000);
        let mut s = store(64 * 1024);
        s.write_new("f.bin", &data).unwrap();
        let transport = FakeTransport {
            status: 200,
            ..FakeTransport::default()
        };
        let job = TransferJob::upload("http://x/up", "f.bin");
        let mut samples = Vec::new();
        let report = upload(
            &s,
            &transport,
            &job,
            TransferLimits::default(),
            &Ticket::default(),
            IDLE,
            |p: &ProgressSample| samples.push(*p),
        )
        .await
        .unwrap();
        assert_eq!(*transport.pushed.lock().unwrap(), data);
        assert_eq!(transport.pushed_name.lock().unwrap().as_deref(), Some("f.bin"));
        assert_eq!(
            report,
            TransferReport::Uploaded {
                name: "f.bin".into(),
                size: 10_000,
                md5: hash_bytes(&data).to_hex()
            }
        );
        assert_eq!(samples.last().map(|p| p.percent), Some(100));
    }

    #[tokio::test]
    async fn upload_rejected_by_server() {
        let mut s = store(1024);
        s.write_new("f.bin", b"abc").unwrap();
        let transport = FakeTransport {
            status: 500,
            ..FakeTransport::default()
        };
        let job = TransferJob::upload("u", "f.bin");
        let err = upload(&s, &transport, &job, TransferLimits::default(), &Ticket::default(), IDLE, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::HttpStatus(500)));
        assert_eq!(err.code(Direction::Upload), 1002);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wakes_a_silent_download() {
        let data = body(1000);
        let mut transport = FakeTransport::serving(&data, 100);
        transport.chunks.truncate(1);
        transport.stall = true;
        let mut s = store(64 * 1024);
        let job = TransferJob::download("u", "a", 1000, &hash_bytes(&data).to_hex());
        let ticket = Ticket::default();
        let remote = ticket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.cancel();
        });
        let idle = Duration::from_secs(3600);
        let started = tokio::time::Instant::now();
        let err = download(&mut s, &transport, &job, TransferLimits::default(), &ticket, idle, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(s.used(), 0);
        assert!(s.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_download_times_out() {
        let data = body(1000);
        let mut transport = FakeTransport::serving(&data, 100);
        transport.chunks.truncate(1);
        transport.stall = true;
        let mut s = store(64 * 1024);
        let job = TransferJob::download("u", "a", 1000, "00");
        let err = download(&mut s, &transport, &job, TransferLimits::default(), &Ticket::default(), IDLE, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
        assert_eq!(err.code(Direction::Download), 1001);
        assert_eq!(s.used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_upload_times_out_or_cancels() {
        let data = body(64 * 1024);
        let mut s = store(128 * 1024);
        s.write_new("f.bin", &data).unwrap();
        let transport = FakeTransport {
            status: 200,
            stall: true,
            ..FakeTransport::default()
        };
        let job = TransferJob::upload("u", "f.bin");
        let err = upload(&s, &transport, &job, TransferLimits::default(), &Ticket::default(), IDLE, |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));

        let ticket = Ticket::default();
        let remote = ticket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.cancel();
        });
        let err = upload(&s, &transport, &job, TransferLimits::default(), &ticket, Duration::from_secs(3600), |_: &ProgressSample| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Aborted));
    }
}
