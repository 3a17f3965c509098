use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_compression::tokio::bufread::DeflateDecoder;
use async_compression::tokio::write::DeflateEncoder;
use async_compression::Level;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::buffers::BufferPool;
use crate::config::ConnectionConfig;
use crate::proto::header::{Header, MessageKind, RawHeader, PROTOCOL_VERSION};
use crate::proto::types::{BlockRequest, FileInfo};
use crate::proto::wire::{WireReader, WireWriter};

/// The domain collaborator behind a connection: it stores announced file indexes, answers
///  block requests from disk, and is told when the connection goes away.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    /// an index announcement arrived from the peer node
    async fn on_index(&self, peer: &str, files: Vec<FileInfo>);

    /// The peer node asked for a block of data. Failure is local to this exchange: the
    ///  peer gets an empty response, the connection stays up.
    async fn on_request(
        &self,
        peer: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> anyhow::Result<Vec<u8>>;

    /// the connection to the peer node was closed - called exactly once per connection
    async fn on_close(&self, peer: &str);
}

/// Point-in-time throughput and latency snapshot, as returned by
///  [Connection::statistics]. Byte counts are as marshalled, i.e. before compression.
#[derive(Clone, Copy, Debug)]
pub struct Statistics {
    pub at: Instant,
    pub in_bytes_total: u64,
    pub in_bytes_per_sec: u64,
    pub out_bytes_total: u64,
    pub out_bytes_per_sec: u64,
    pub latency: Duration,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type StreamReader = WireReader<DeflateDecoder<BufReader<BoxedReader>>>;
type StreamWriter = WireWriter<DeflateEncoder<BoxedWriter>>;

/// Correlation ids live in 0..4096 and wrap. At most 4096 correlated sends may be
///  outstanding at a time; nothing enforces that ceiling, a 4097th concurrent request
///  would silently reuse a still-pending id.
const fn next_correlation_id(id: u16) -> u16 {
    (id + 1) & 0xfff
}

fn closed_error(peer: &str) -> anyhow::Error {
    anyhow!("connection to {} is closed", peer)
}

/// near-zero intervals report zero throughput rather than a nonsense spike
fn per_sec(delta_bytes: u64, elapsed_secs: f64) -> u64 {
    if elapsed_secs < 1e-3 {
        return 0;
    }
    (delta_bytes as f64 / elapsed_secs) as u64
}

struct ConnectionState {
    writer: StreamWriter,
    closed: bool,
    next_id: u16,
    awaiting: FxHashMap<u16, oneshot::Sender<Vec<u8>>>,
    last_receive: Instant,
    peer_latency: Duration,
    last_statistics: Statistics,
}

impl ConnectionState {
    async fn send_index(&mut self, id: u16, files: &[FileInfo]) -> anyhow::Result<()> {
        self.writer.write_header(&Header::new(id, MessageKind::Index)).await?;
        self.writer.write_index(files).await?;
        self.writer.flush().await
    }

    async fn send_request(&mut self, id: u16, request: &BlockRequest) -> anyhow::Result<()> {
        self.writer.write_header(&Header::new(id, MessageKind::Request)).await?;
        self.writer.write_request(request).await?;
        self.writer.flush().await
    }

    async fn send_ping(&mut self, id: u16) -> anyhow::Result<()> {
        self.writer.write_header(&Header::new(id, MessageKind::Ping)).await?;
        self.writer.flush().await
    }

    async fn send_pong(&mut self, id: u16) -> anyhow::Result<()> {
        self.writer.write_header(&Header::new(id, MessageKind::Pong)).await?;
        self.writer.flush().await
    }

    async fn send_response(&mut self, id: u16, data: &[u8]) -> anyhow::Result<()> {
        self.writer.write_header(&Header::new(id, MessageKind::Response)).await?;
        self.writer.write_response(data).await?;
        self.writer.flush().await
    }
}

struct Shared {
    peer: String,
    config: ConnectionConfig,
    receiver: Arc<dyn Receiver>,
    pool: Arc<dyn BufferPool>,
    in_bytes: Arc<AtomicU64>,
    out_bytes: Arc<AtomicU64>,
    state: Mutex<ConnectionState>,
}

impl Shared {
    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Idempotent teardown, shared by every failure path and by [Connection::stop].
    ///  Internal state changes happen under the lock; the receiver notification happens
    ///  outside it so a receiver calling back into the connection cannot deadlock.
    //TODO shut the transport down here so a reader blocked mid-read does not linger
    // until the peer hangs up
    async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;

            // dropping the senders wakes every blocked caller with a closed-channel signal
            state.awaiting.clear();
        }

        self.receiver.on_close(&self.peer).await;
        debug!("connection to {} closed", self.peer);
    }

    /// Hand a response/pong payload to whoever is waiting on the correlation id. An
    ///  unknown id is silently discarded - the entry may have been drained by a racing
    ///  close, or never have existed on a misbehaving peer.
    async fn deliver(&self, id: u16, data: Vec<u8>) {
        let sender = self.state.lock().await.awaiting.remove(&id);
        match sender {
            Some(tx) => {
                if tx.send(data).is_err() {
                    trace!("caller for correlation id {} of {} is gone", id, self.peer);
                }
            }
            None => trace!("discarding uncorrelated reply {} from {}", id, self.peer),
        }
    }
}

/// One live connection to a peer node, multiplexing index announcements, block fetches
///  and keepalive pings over a single deflate-compressed stream pair. Cheap to clone;
///  all clones refer to the same underlying connection.
///
/// The connection is `Open` from construction until the single `Open -> Closed`
///  transition, triggered by a codec failure, a protocol violation, a keepalive timeout
///  or [Connection::stop]. Closing wakes every caller blocked in [Connection::request]
///  or [Connection::ping] with a closed-connection result.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Wires up a connection over the given stream pair and starts its background reader
    ///  and pinger tasks. The returned handle is live immediately: both tasks are
    ///  scheduled before this returns, so the reply to the very first request cannot be
    ///  missed. Must be called from within a tokio runtime.
    pub fn new(
        peer: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        receiver: Arc<dyn Receiver>,
        pool: Arc<dyn BufferPool>,
        config: ConnectionConfig,
    ) -> Connection {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);

        let wire_reader = WireReader::new(
            DeflateDecoder::new(BufReader::new(reader)),
            config.max_element_len,
        );
        let wire_writer = WireWriter::new(DeflateEncoder::with_quality(writer, Level::Fastest));

        let in_bytes = wire_reader.bytes_processed();
        let out_bytes = wire_writer.bytes_processed();

        let now = Instant::now();
        let shared = Arc::new(Shared {
            peer: peer.into(),
            config,
            receiver,
            pool,
            in_bytes,
            out_bytes,
            state: Mutex::new(ConnectionState {
                writer: wire_writer,
                closed: false,
                next_id: 0,
                awaiting: FxHashMap::default(),
                last_receive: now,
                peer_latency: Duration::ZERO,
                last_statistics: Statistics {
                    at: now,
                    in_bytes_total: 0,
                    in_bytes_per_sec: 0,
                    out_bytes_total: 0,
                    out_bytes_per_sec: 0,
                    latency: Duration::ZERO,
                },
            }),
        });

        tokio::spawn(reader_loop(shared.clone(), wire_reader));
        tokio::spawn(pinger_loop(shared.clone()));

        Connection { shared }
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.is_closed().await
    }

    /// Sends the list of file information to the peer node. Fire and forget: a failure
    ///  closes the connection and is logged rather than reported to the caller.
    pub async fn index(&self, files: &[FileInfo]) {
        let res = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return;
            }
            let id = state.next_id;
            state.next_id = next_correlation_id(id);
            state.send_index(id, files).await
        };

        if let Err(e) = res {
            error!("error sending index to {}: {}", self.shared.peer, e);
            self.shared.close().await;
        }
    }

    /// Fetches a block of data from the peer node. Resolves once the peer answers or the
    ///  connection closes - there is no intrinsic timeout, a caller talking to a live
    ///  but unresponsive peer waits indefinitely unless it imposes its own bound.
    pub async fn request(
        &self,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let request = BlockRequest {
            name: name.to_string(),
            offset,
            size,
            hash: hash.to_vec(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(closed_error(&self.shared.peer));
            }
            let id = state.next_id;
            state.next_id = next_correlation_id(id);
            state.awaiting.insert(id, tx);
            if let Err(e) = state.send_request(id, &request).await {
                // the pending entry stays registered until close() drains it just below
                drop(state);
                self.shared.close().await;
                return Err(e);
            }
        }

        match rx.await {
            Ok(data) => Ok(data),
            Err(_) => Err(closed_error(&self.shared.peer)),
        }
    }

    /// Measures round-trip latency to the peer node. `None` means the connection closed
    ///  before the peer answered.
    pub async fn ping(&self) -> Option<Duration> {
        let (tx, rx) = oneshot::channel();
        let t0 = Instant::now();
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return None;
            }
            let id = state.next_id;
            state.next_id = next_correlation_id(id);
            state.awaiting.insert(id, tx);
            if let Err(e) = state.send_ping(id).await {
                debug!("error sending ping to {}: {}", self.shared.peer, e);
                drop(state);
                self.shared.close().await;
                return None;
            }
        }

        match rx.await {
            Ok(_) => Some(t0.elapsed()),
            Err(_) => None,
        }
    }

    /// Throughput and latency since the previous snapshot; the returned snapshot becomes
    ///  the baseline for the next call (the first interval starts at construction).
    pub async fn statistics(&self) -> Statistics {
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        let elapsed_secs = now.duration_since(state.last_statistics.at).as_secs_f64();
        let in_total = self.shared.in_bytes.load(Ordering::Relaxed);
        let out_total = self.shared.out_bytes.load(Ordering::Relaxed);

        let stats = Statistics {
            at: now,
            in_bytes_total: in_total,
            in_bytes_per_sec: per_sec(in_total - state.last_statistics.in_bytes_total, elapsed_secs),
            out_bytes_total: out_total,
            out_bytes_per_sec: per_sec(out_total - state.last_statistics.out_bytes_total, elapsed_secs),
            latency: state.peer_latency,
        };
        state.last_statistics = stats;
        stats
    }

    /// Explicit shutdown. Runs the same teardown as the failure paths, so it is safe to
    ///  call at any time and any number of times.
    pub async fn stop(&self) {
        self.shared.close().await;
    }
}

/// Sequentially decodes inbound frames until the connection closes. Index announcements
///  are handed to the receiver inline (index application is fast bookkeeping); request
///  answering is decoupled into its own task so slow disk I/O cannot stall the stream.
async fn reader_loop(shared: Arc<Shared>, mut reader: StreamReader) {
    while !shared.is_closed().await {
        let word = match reader.read_word().await {
            Ok(word) => word,
            Err(e) => {
                debug!("reading from {} failed: {}", shared.peer, e);
                shared.close().await;
                break;
            }
        };
        let header = RawHeader::decode(word);

        if header.version != PROTOCOL_VERSION {
            warn!(
                "protocol error: {}: unknown message version {:#x}",
                shared.peer, header.version
            );
            shared.close().await;
            break;
        }

        shared.state.lock().await.last_receive = Instant::now();

        match header.kind() {
            Some(MessageKind::Index) => match reader.read_index().await {
                Ok(files) => shared.receiver.on_index(&shared.peer, files).await,
                Err(e) => {
                    warn!("unreadable index from {}: {}", shared.peer, e);
                    shared.close().await;
                }
            },

            Some(MessageKind::Request) => match reader.read_request().await {
                Ok(request) => {
                    let shared = shared.clone();
                    tokio::spawn(answer_request(shared, header.id, request));
                }
                Err(e) => {
                    warn!("unreadable request from {}: {}", shared.peer, e);
                    shared.close().await;
                }
            },

            Some(MessageKind::Response) => match reader.read_response().await {
                Ok(data) => shared.deliver(header.id, data).await,
                Err(e) => {
                    warn!("unreadable response from {}: {}", shared.peer, e);
                    shared.close().await;
                }
            },

            Some(MessageKind::Ping) => {
                let res = {
                    let mut state = shared.state.lock().await;
                    state.send_pong(header.id).await
                };
                if let Err(e) = res {
                    debug!("error sending pong to {}: {}", shared.peer, e);
                    shared.close().await;
                }
            }

            Some(MessageKind::Pong) => shared.deliver(header.id, Vec::new()).await,

            Some(MessageKind::Reserved) | None => {
                warn!(
                    "protocol error: {}: unknown message kind {:#x}",
                    shared.peer, header.kind_tag
                );
                shared.close().await;
            }
        }
    }
    trace!("reader loop for {} terminated", shared.peer);
}

/// Answers one inbound block request. Runs as its own task so the reader loop keeps
///  consuming messages while the receiver does disk I/O; answers may therefore overtake
///  each other, and the state lock alone serializes their frames on the wire.
async fn answer_request(shared: Arc<Shared>, id: u16, request: BlockRequest) {
    let data = match shared
        .receiver
        .on_request(&shared.peer, &request.name, request.offset, request.size, &request.hash)
        .await
    {
        Ok(data) => data,
        Err(e) => {
            warn!("request for {:?} from {} failed: {}", request.name, shared.peer, e);
            Vec::new()
        }
    };

    let res = {
        let mut state = shared.state.lock().await;
        state.send_response(id, &data).await
    };
    shared.pool.reclaim(data);

    if let Err(e) = res {
        debug!("error sending response to {}: {}", shared.peer, e);
        shared.close().await;
    }
}

/// Probes a silent peer: once the stream has been idle beyond the configured threshold,
///  a ping is issued from its own task, and a peer that does not answer it within the
///  timeout is declared dead.
async fn pinger_loop(shared: Arc<Shared>) {
    while !shared.is_closed().await {
        let last_receive = shared.state.lock().await.last_receive;

        if last_receive.elapsed() > shared.config.ping_idle {
            let conn = Connection {
                shared: shared.clone(),
            };
            let probe = tokio::spawn(async move { conn.ping().await });

            match tokio::time::timeout(shared.config.ping_timeout, probe).await {
                Ok(Ok(Some(latency))) => {
                    let mut state = shared.state.lock().await;
                    state.peer_latency = (state.peer_latency + latency) / 2;
                    trace!("latency to {}: {:?}", shared.peer, state.peer_latency);
                }
                Ok(Ok(None)) => {
                    // the connection closed under the probe; the loop condition ends us
                }
                Ok(Err(e)) => {
                    error!("keepalive ping task for {} failed: {}", shared.peer, e);
                    shared.close().await;
                }
                Err(_) => {
                    warn!(
                        "peer {} did not answer a keepalive ping within {:?}: closing",
                        shared.peer, shared.config.ping_timeout
                    );
                    shared.close().await;
                }
            }
        }

        tokio::time::sleep(shared.config.tick).await;
    }
    trace!("pinger loop for {} terminated", shared.peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::VecBufferPool;
    use crate::proto::types::BlockInfo;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{duplex, split};

    struct RecordingReceiver {
        indexes: StdMutex<Vec<Vec<FileInfo>>>,
        requests: StdMutex<Vec<(String, u64, u32, Vec<u8>)>>,
        response: Vec<u8>,
        fail_requests: bool,
        close_count: AtomicUsize,
    }

    impl RecordingReceiver {
        fn new(response: Vec<u8>) -> Arc<RecordingReceiver> {
            Arc::new(RecordingReceiver {
                indexes: StdMutex::new(Vec::new()),
                requests: StdMutex::new(Vec::new()),
                response,
                fail_requests: false,
                close_count: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<RecordingReceiver> {
            Arc::new(RecordingReceiver {
                indexes: StdMutex::new(Vec::new()),
                requests: StdMutex::new(Vec::new()),
                response: Vec::new(),
                fail_requests: true,
                close_count: AtomicUsize::new(0),
            })
        }

        fn close_count(&self) -> usize {
            self.close_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Receiver for RecordingReceiver {
        async fn on_index(&self, _peer: &str, files: Vec<FileInfo>) {
            self.indexes.lock().unwrap().push(files);
        }

        async fn on_request(
            &self,
            _peer: &str,
            name: &str,
            offset: u64,
            size: u32,
            hash: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            self.requests
                .lock()
                .unwrap()
                .push((name.to_string(), offset, size, hash.to_vec()));
            if self.fail_requests {
                return Err(anyhow!("no such block"));
            }
            Ok(self.response.clone())
        }

        async fn on_close(&self, _peer: &str) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingPool {
        reclaimed: AtomicUsize,
    }

    impl CountingPool {
        fn new() -> Arc<CountingPool> {
            Arc::new(CountingPool {
                reclaimed: AtomicUsize::new(0),
            })
        }
    }

    impl BufferPool for CountingPool {
        fn take(&self, len: usize) -> Vec<u8> {
            vec![0; len]
        }

        fn reclaim(&self, _buffer: Vec<u8>) {
            self.reclaimed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connected_pair(
        a_receiver: Arc<dyn Receiver>,
        b_receiver: Arc<dyn Receiver>,
        b_pool: Arc<dyn BufferPool>,
        config: ConnectionConfig,
    ) -> (Connection, Connection) {
        let (a_stream, b_stream) = duplex(1024 * 1024);
        let (a_read, a_write) = split(a_stream);
        let (b_read, b_write) = split(b_stream);

        let a = Connection::new(
            "node-b",
            a_read,
            a_write,
            a_receiver,
            Arc::new(VecBufferPool::new(4)),
            config.clone(),
        );
        let b = Connection::new("node-a", b_read, b_write, b_receiver, b_pool, config);
        (a, b)
    }

    fn fast_keepalive() -> ConnectionConfig {
        ConnectionConfig {
            tick: Duration::from_millis(10),
            ping_idle: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(200),
            ..ConnectionConfig::default()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    fn test_files() -> Vec<FileInfo> {
        vec![FileInfo {
            name: "docs/readme.md".to_string(),
            flags: 0o644,
            modified: 1_400_000_000,
            blocks: vec![BlockInfo {
                length: 128 * 1024,
                hash: vec![0x5a; 32],
            }],
        }]
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (a, b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            RecordingReceiver::new(Vec::new()),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        assert!(a.ping().await.is_some());
        assert!(b.ping().await.is_some());
        assert!(!a.is_closed().await);
    }

    #[tokio::test]
    async fn test_index_is_delivered_to_receiver() {
        let b_receiver = RecordingReceiver::new(Vec::new());
        let (a, _b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            b_receiver.clone(),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        a.index(&test_files()).await;

        wait_for(|| !b_receiver.indexes.lock().unwrap().is_empty()).await;
        assert_eq!(b_receiver.indexes.lock().unwrap()[0], test_files());
    }

    #[tokio::test]
    async fn test_request_is_answered_and_buffer_reclaimed() {
        let b_receiver = RecordingReceiver::new(vec![0x42; 1024]);
        let b_pool = CountingPool::new();
        let (a, _b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            b_receiver.clone(),
            b_pool.clone(),
            ConnectionConfig::default(),
        );

        let data = a.request("foo.txt", 0, 1024, &[7; 32]).await.unwrap();
        assert_eq!(data, vec![0x42; 1024]);

        assert_eq!(
            b_receiver.requests.lock().unwrap()[0],
            ("foo.txt".to_string(), 0, 1024, vec![7; 32])
        );

        // the answer buffer goes back to the pool after the flush
        wait_for(|| b_pool.reclaimed.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_failed_request_is_not_fatal() {
        let (a, _b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            RecordingReceiver::failing(),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        // the failure stays local to the exchange: empty payload, connection stays up
        let data = a.request("missing.bin", 0, 64, &[]).await.unwrap();
        assert!(data.is_empty());

        assert!(a.ping().await.is_some());
        assert!(!a.is_closed().await);
    }

    #[tokio::test]
    async fn test_stop_wakes_pending_callers_and_notifies_once() {
        let a_receiver = RecordingReceiver::new(Vec::new());
        let (near, far) = duplex(64 * 1024);
        let (a_read, a_write) = split(near);
        let a = Connection::new(
            "node-b",
            a_read,
            a_write,
            a_receiver.clone(),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        // the far side stays open but silent, so both callers block
        let request = tokio::spawn({
            let a = a.clone();
            async move { a.request("foo.txt", 0, 1024, &[]).await }
        });
        let ping = tokio::spawn({
            let a = a.clone();
            async move { a.ping().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.stop().await;

        assert!(request.await.unwrap().is_err());
        assert!(ping.await.unwrap().is_none());
        assert!(a.is_closed().await);

        // racing/repeated closes collapse to a single receiver notification
        a.stop().await;
        assert_eq!(a_receiver.close_count(), 1);

        assert!(a.request("foo.txt", 0, 1024, &[]).await.is_err());
        drop(far);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_connection() {
        let a_receiver = RecordingReceiver::new(Vec::new());
        let (near, far) = duplex(64 * 1024);
        let (a_read, a_write) = split(near);
        let a = Connection::new(
            "node-b",
            a_read,
            a_write,
            a_receiver.clone(),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        drop(far);

        wait_for(|| a_receiver.close_count() == 1).await;
        assert!(a.is_closed().await);
    }

    #[tokio::test]
    async fn test_unanswered_keepalive_closes_connection() {
        let a_receiver = RecordingReceiver::new(Vec::new());
        let (near, _far) = duplex(64 * 1024);
        let (a_read, a_write) = split(near);
        let a = Connection::new(
            "node-b",
            a_read,
            a_write,
            a_receiver.clone(),
            CountingPool::new(),
            fast_keepalive(),
        );

        // a caller-issued ping against the silent peer resolves not-ok once the
        // keepalive timeout tears the connection down
        let ping = tokio::spawn({
            let a = a.clone();
            async move { a.ping().await }
        });

        wait_for(|| a_receiver.close_count() == 1).await;
        assert!(a.is_closed().await);
        assert!(ping.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_statistics_twice_in_a_row() {
        let (a, _b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            RecordingReceiver::new(Vec::new()),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        a.index(&test_files()).await;
        assert!(a.ping().await.is_some());

        let first = a.statistics().await;
        let second = a.statistics().await;

        assert!(first.out_bytes_total > 0);
        assert!(first.in_bytes_total > 0);
        assert!(second.out_bytes_total >= first.out_bytes_total);
        // near-zero interval must not blow up into a nonsense rate
        assert_eq!(second.out_bytes_per_sec, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_never_interleave_frames() {
        let b_receiver = RecordingReceiver::new(vec![0x99; 256]);
        let (a, _b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            b_receiver.clone(),
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        let mut tasks = Vec::new();
        for i in 0..16_u32 {
            let a_index = a.clone();
            tasks.push(tokio::spawn(async move {
                let files = vec![FileInfo {
                    name: format!("file-{}", i),
                    flags: i,
                    modified: i as i64,
                    blocks: Vec::new(),
                }];
                a_index.index(&files).await;
            }));
            let a_request = a.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("block-{}", i);
                let data = a_request.request(&name, i as u64 * 1024, 256, &[i as u8; 32]).await.unwrap();
                assert_eq!(data, vec![0x99; 256]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // if any two frames had interleaved mid-message, the peer's decoder would have
        // derailed and closed the connection long before seeing all of them
        wait_for(|| {
            b_receiver.indexes.lock().unwrap().len() == 16
                && b_receiver.requests.lock().unwrap().len() == 16
        })
        .await;
        assert!(!a.is_closed().await);

        let mut names: Vec<String> = b_receiver
            .indexes
            .lock()
            .unwrap()
            .iter()
            .map(|files| files[0].name.clone())
            .collect();
        names.sort();
        let mut expected: Vec<String> = (0..16).map(|i| format!("file-{}", i)).collect();
        expected.sort();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_many_sequential_requests_use_distinct_ids() {
        let b_receiver = RecordingReceiver::new(vec![1, 2, 3]);
        let (a, _b) = connected_pair(
            RecordingReceiver::new(Vec::new()),
            b_receiver,
            CountingPool::new(),
            ConnectionConfig::default(),
        );

        for i in 0..64_u64 {
            let data = a.request("blob", i * 3, 3, &[]).await.unwrap();
            assert_eq!(data, vec![1, 2, 3]);
        }
        assert!(!a.is_closed().await);
    }

    #[test]
    fn test_correlation_id_wraps_at_4096() {
        assert_eq!(next_correlation_id(0), 1);
        assert_eq!(next_correlation_id(4094), 4095);
        assert_eq!(next_correlation_id(4095), 0);
    }

    #[test]
    fn test_per_sec_is_zero_for_near_zero_interval() {
        assert_eq!(per_sec(1_000_000, 0.0), 0);
        assert_eq!(per_sec(1_000_000, 1e-9), 0);
        assert_eq!(per_sec(1_000, 2.0), 500);
    }
}
