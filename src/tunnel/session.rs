//! Multiplexed session over a pool of disguised connections
//!
//! A session owns every connection the bootstrap produced. Outbound frames
//! go to the connections in turn; each connection has a reader task that
//! decodes inbound records and hands frames to their stream's pump.
//!
//! ```text
//! Stream <-duplex-> pump --frames--> send_frame --round robin--> writer[i] --> conn i
//!                    ^                                                          |
//!                    +------------- dispatch <-------- reader[i] <--------------+
//! ```
//!
//! Losing the last connection closes the session. A closed session is never
//! reopened.

use super::stream::FrameSorter;
use super::{Closing, Frame, Obfuscator, SessionHandle, Stream, TunnelError, MAX_PAYLOAD_SIZE};
use crate::transport::{
    add_record_layer, read_record, Connection, ContentType, TransportError, RECORD_HEADER_LEN,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Bytes buffered between a [`Stream`] and its pump
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Wire units queued per connection writer
const CONNECTION_QUEUE: usize = 256;

/// Session construction parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frame protection shared by every connection
    pub obfuscator: Arc<Obfuscator>,
    /// Inbound frames queued per stream before its connection reader waits
    pub stream_queue: usize,
}

impl SessionConfig {
    pub fn new(obfuscator: Obfuscator) -> Self {
        Self {
            obfuscator: Arc::new(obfuscator),
            stream_queue: 64,
        }
    }
}

struct ConnectionSlot {
    id: usize,
    tx: mpsc::Sender<Bytes>,
}

struct Inner {
    id: u32,
    obfuscator: Arc<Obfuscator>,
    stream_queue: usize,
    streams: Mutex<HashMap<u32, mpsc::Sender<Frame>>>,
    next_stream_id: AtomicU32,
    connections: RwLock<Vec<ConnectionSlot>>,
    next_connection_id: AtomicUsize,
    round_robin: AtomicUsize,
    readers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A multiplexed session
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create an empty session; it carries traffic once connections are added
    pub fn new(id: u32, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                obfuscator: config.obfuscator,
                stream_queue: config.stream_queue.max(1),
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU32::new(1),
                connections: RwLock::new(Vec::new()),
                next_connection_id: AtomicUsize::new(0),
                round_robin: AtomicUsize::new(0),
                readers: std::sync::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Session identifier shared with the relay
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Attach a prepared connection to the pool
    pub async fn add_connection<C: Connection>(&self, conn: C) -> Result<(), TunnelError> {
        let conn_id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(conn);
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);

        {
            let mut connections = self.inner.connections.write().await;
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            connections.push(ConnectionSlot { id: conn_id, tx });
        }

        tokio::spawn(write_loop(self.inner.clone(), conn_id, writer, rx));
        let handle = tokio::spawn(read_loop(self.inner.clone(), conn_id, reader));
        if let Ok(mut readers) = self.inner.readers.lock() {
            readers.push(handle);
        }
        if self.is_closed() {
            self.inner.abort_readers();
        }

        debug!("Session {}: connection {} attached", self.inner.id, conn_id);
        Ok(())
    }

    /// Open a new stream
    ///
    /// Nothing is sent until the stream carries data.
    pub async fn open_stream(&self) -> Result<Stream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.stream_queue);
        {
            let mut streams = self.inner.streams.lock().await;
            if self.is_closed() {
                return Err(TunnelError::SessionClosed);
            }
            streams.insert(stream_id, tx);
        }

        let (user_half, pump_half) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        tokio::spawn(pump(self.inner.clone(), stream_id, pump_half, rx));

        trace!("Session {}: opened stream {}", self.inner.id, stream_id);
        Ok(Stream::new(stream_id, user_half))
    }

    /// Check if the session is closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Get number of live connections
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Get number of active streams
    pub async fn stream_count(&self) -> usize {
        self.inner.streams.lock().await.len()
    }

    /// Tell the relay goodbye and tear the session down
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.inner.send_frame(&Frame::close_session()).await {
            debug!("Session {}: goodbye not sent: {}", self.inner.id, e);
        }
        self.inner.shutdown().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = match (
            self.inner.connections.try_write(),
            self.inner.streams.try_lock(),
        ) {
            (Ok(mut connections), Ok(mut streams)) => {
                connections.clear();
                streams.clear();
                true
            }
            _ => false,
        };
        if !released {
            // A pump or reader holds a lock; release once it lets go
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let inner = self.inner.clone();
                    runtime.spawn(async move {
                        inner.release().await;
                    });
                }
                Err(_) => warn!("Session {} dropped outside a runtime", self.inner.id),
            }
        }
        self.inner.abort_readers();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionHandle for Session {
    type Stream = Stream;

    async fn open_stream(&self) -> Result<Stream, TunnelError> {
        Session::open_stream(self).await
    }

    fn is_closed(&self) -> bool {
        Session::is_closed(self)
    }

    async fn close(&self) {
        Session::close(self).await
    }
}

impl Inner {
    /// Obfuscate a frame and queue it on the next connection in turn
    async fn send_frame(&self, frame: &Frame) -> Result<(), TunnelError> {
        let body = self.obfuscator.obfuscate(frame)?;
        let unit = add_record_layer(ContentType::ApplicationData, &body)?.freeze();

        loop {
            let (conn_id, tx) = {
                let connections = self.connections.read().await;
                if connections.is_empty() {
                    return Err(TunnelError::SessionClosed);
                }
                let i = self.round_robin.fetch_add(1, Ordering::Relaxed) % connections.len();
                (connections[i].id, connections[i].tx.clone())
            };

            match tx.send(unit.clone()).await {
                Ok(()) => return Ok(()),
                Err(_) => self.connection_lost(conn_id).await,
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        if frame.closing == Closing::Session {
            info!("Session {} closed by relay", self.id);
            self.shutdown().await;
            return;
        }

        let tx = self.streams.lock().await.get(&frame.stream_id).cloned();
        match tx {
            Some(tx) => {
                let stream_id = frame.stream_id;
                if tx.send(frame).await.is_err() {
                    trace!("Session {}: stream {} already finished", self.id, stream_id);
                }
            }
            None => trace!(
                "Session {}: frame for unknown stream {}",
                self.id,
                frame.stream_id
            ),
        }
    }

    async fn connection_lost(&self, conn_id: usize) {
        let remaining = {
            let mut connections = self.connections.write().await;
            connections.retain(|c| c.id != conn_id);
            connections.len()
        };

        if remaining == 0 && !self.closed.load(Ordering::SeqCst) {
            warn!("Session {} lost its last connection", self.id);
            self.shutdown().await;
        } else {
            debug!(
                "Session {}: connection {} lost, {} remaining",
                self.id, conn_id, remaining
            );
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (connections, streams) = self.release().await;
        info!(
            "Session {} closed ({} connections, {} streams)",
            self.id, connections, streams
        );

        // Last: this may be running on one of the readers
        self.abort_readers();
    }

    /// Drop every connection sender and stream sender, ending the writers
    /// and pumps; returns how many of each there were
    async fn release(&self) -> (usize, usize) {
        let connections = std::mem::take(&mut *self.connections.write().await);
        let streams = std::mem::take(&mut *self.streams.lock().await);
        (connections.len(), streams.len())
    }

    fn abort_readers(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for handle in readers.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn write_loop<C>(
    inner: Arc<Inner>,
    conn_id: usize,
    mut writer: WriteHalf<C>,
    mut rx: mpsc::Receiver<Bytes>,
) where
    C: AsyncRead + AsyncWrite,
{
    while let Some(unit) = rx.recv().await {
        if let Err(e) = writer.write_all(&unit).await {
            debug!("Session {}: write on connection {} failed: {}", inner.id, conn_id, e);
            inner.connection_lost(conn_id).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<C>(inner: Arc<Inner>, conn_id: usize, mut reader: ReadHalf<C>)
where
    C: AsyncRead + AsyncWrite,
{
    loop {
        let record = match read_record(&mut reader).await {
            Ok(record) => record,
            Err(TransportError::Closed) => {
                debug!("Session {}: connection {} closed by relay", inner.id, conn_id);
                break;
            }
            Err(e) => {
                debug!("Session {}: read on connection {} failed: {}", inner.id, conn_id, e);
                break;
            }
        };

        if record[0] != ContentType::ApplicationData as u8 {
            trace!("Session {}: skipping record type {:#04x}", inner.id, record[0]);
            continue;
        }

        match inner.obfuscator.deobfuscate(&record[RECORD_HEADER_LEN..]) {
            Ok(frame) => inner.dispatch(frame).await,
            Err(e) => warn!(
                "Session {}: dropping undecodable unit on connection {}: {}",
                inner.id, conn_id, e
            ),
        }
    }
    inner.connection_lost(conn_id).await;
}

/// Moves bytes between one stream's duplex pipe and the session
async fn pump(
    inner: Arc<Inner>,
    stream_id: u32,
    io: DuplexStream,
    mut inbound: mpsc::Receiver<Frame>,
) {
    let (mut local_rd, mut local_wr) = tokio::io::split(io);
    let mut sorter = FrameSorter::new();
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];
    let mut seq = 0u64;
    let mut sending = true;
    let mut receiving = true;

    while sending || receiving {
        tokio::select! {
            read = local_rd.read(&mut buf), if sending => {
                let frame = match read {
                    Ok(n) if n > 0 => {
                        Frame::data(stream_id, seq, Bytes::copy_from_slice(&buf[..n]))
                    }
                    _ => {
                        sending = false;
                        Frame::close_stream(stream_id, seq)
                    }
                };
                seq += 1;
                if let Err(e) = inner.send_frame(&frame).await {
                    debug!("Stream {}: send failed: {}", stream_id, e);
                    break;
                }
            }
            frame = inbound.recv(), if receiving => {
                let Some(frame) = frame else {
                    // Session torn down
                    break;
                };
                let ready = match sorter.push(frame) {
                    Ok(ready) => ready,
                    Err(e) => {
                        warn!("Stream {}: reset: {}", stream_id, e);
                        let _ = local_wr.shutdown().await;
                        if sending {
                            let _ = inner.send_frame(&Frame::close_stream(stream_id, seq)).await;
                        }
                        break;
                    }
                };
                for frame in ready {
                    if frame.closing != Closing::Nothing {
                        receiving = false;
                        let _ = local_wr.shutdown().await;
                    } else if local_wr.write_all(&frame.payload).await.is_err() {
                        receiving = false;
                    }
                }
            }
            else => break,
        }
    }

    inner.streams.lock().await.remove(&stream_id);
    trace!("Stream {} finished", stream_id);
}
