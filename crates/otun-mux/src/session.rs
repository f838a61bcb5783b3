//! Multiplexed session and stream handles.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameType, StreamId, INITIAL_WINDOW, MAX_FRAME_LEN};
use crate::MuxError;

/// Session-level keepalive period, independent of application heartbeats.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Which side of the session we are. The client allocates odd stream ids,
/// the server even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Client,
    Server,
}

/// Per-stream state shared between the stream handle and the demux loop.
struct StreamState {
    send_window: Mutex<u32>,
    write_waker: Mutex<Option<Waker>>,
    /// Peer aborted the stream (or the session died mid-stream).
    reset: AtomicBool,
    /// Peer half-closed its write side cleanly.
    fin: AtomicBool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            send_window: Mutex::new(INITIAL_WINDOW),
            write_waker: Mutex::new(None),
            reset: AtomicBool::new(false),
            fin: AtomicBool::new(false),
        }
    }

    fn grow_window(&self, credit: u32) {
        let mut window = self.send_window.lock().unwrap();
        *window = window.saturating_add(credit);
        drop(window);
        self.wake_writer();
    }

    fn mark_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.wake_writer();
    }

    fn wake_writer(&self) {
        if let Some(waker) = self.write_waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

struct StreamEntry {
    /// `None` once the peer has half-closed its write side.
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    state: Arc<StreamState>,
}

/// State shared by the session handle, its streams and the I/O tasks.
struct Shared {
    frame_tx: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    next_id: Mutex<StreamId>,
    closed: AtomicBool,
}

impl Shared {
    /// Wakes every stream with a terminal condition and empties the map.
    /// Streams that saw a clean FIN still read to EOF; the rest observe a
    /// reset.
    fn fail_all_streams(&self) {
        let mut streams = self.streams.lock().unwrap();
        for (_, entry) in streams.drain() {
            entry.state.mark_reset();
        }
    }
}

/// Aborts the session's I/O tasks once the last handle (session or stream)
/// is gone.
struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap().push(handle);
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.abort();
        }
    }
}

/// A multiplexed session over a single underlying bytestream.
///
/// Cloning the handle is cheap; the session lives until every clone and
/// every outstanding [`MuxStream`] has been dropped, or [`close`] is
/// called.
///
/// [`close`]: MuxSession::close
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>>,
    tasks: Arc<TaskSet>,
}

impl MuxSession {
    /// Wraps the client side of a connection.
    pub fn client<T>(conn: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, Mode::Client)
    }

    /// Wraps the server side of a connection.
    pub fn server<T>(conn: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, Mode::Server)
    }

    fn new<T>(conn: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            frame_tx,
            streams: Mutex::new(HashMap::new()),
            next_id: Mutex::new(match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            }),
            closed: AtomicBool::new(false),
        });

        let tasks = Arc::new(TaskSet::new());

        tasks.register(tokio::spawn(write_loop(write_half, frame_rx, shared.clone())));
        tasks.register(tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            accept_tx,
            Arc::downgrade(&tasks),
        )));
        tasks.register(tokio::spawn(keepalive_loop(shared.clone())));

        Self {
            shared,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
            tasks,
        }
    }

    /// Opens a new outgoing stream.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MuxError::SessionClosed);
        }

        let id = {
            let mut next = self.shared.next_id.lock().unwrap();
            let id = *next;
            *next = next.wrapping_add(2);
            id
        };

        let state = Arc::new(StreamState::new());
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        self.shared.streams.lock().unwrap().insert(
            id,
            StreamEntry {
                data_tx: Some(data_tx),
                state: state.clone(),
            },
        );

        if self.shared.frame_tx.send(Frame::open(id)).is_err() {
            self.shared.streams.lock().unwrap().remove(&id);
            return Err(MuxError::SessionClosed);
        }

        trace!(stream_id = id, "opened stream");
        Ok(MuxStream::new(
            id,
            state,
            data_rx,
            self.shared.clone(),
            self.tasks.clone(),
        ))
    }

    /// Accepts the next stream opened by the peer. Returns `None` once the
    /// session is closed and no further streams will arrive.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await
    }

    /// Gracefully shuts the session down: sends `GoAway`, terminates every
    /// stream and makes subsequent `open_stream`/`accept_stream` calls
    /// fail.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing session");
        let _ = self.shared.frame_tx.send(Frame::go_away());
        self.shared.fail_all_streams();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Serialises all outgoing frames onto the write half.
async fn write_loop<W>(mut writer: W, mut frame_rx: mpsc::UnboundedReceiver<Frame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(frame) = frame_rx.recv().await {
        let is_go_away = frame.frame_type == FrameType::GoAway;
        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&encoded).await {
            debug!(error = %e, "session write failed");
            break;
        }
        if is_go_away {
            let _ = writer.shutdown().await;
            break;
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.fail_all_streams();
}

/// Reads frames off the wire and routes them to their streams.
async fn read_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    tasks: Weak<TaskSet>,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let mut header = [0u8; Frame::HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut header).await {
            debug!(error = %e, "session read ended");
            break;
        }

        let (stream_id, frame_type, flags, len) = match Frame::decode_header(&header) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "malformed frame header");
                break;
            }
        };

        let mut payload = vec![0u8; len];
        if len > 0 {
            if let Err(e) = reader.read_exact(&mut payload).await {
                debug!(error = %e, "session read ended mid-frame");
                break;
            }
        }
        let payload = Bytes::from(payload);

        match frame_type {
            FrameType::Open => handle_open(&shared, stream_id, &accept_tx, &tasks),
            FrameType::Data => handle_data(&shared, stream_id, payload),
            FrameType::Close => handle_close(&shared, stream_id, flags.has_rst()),
            FrameType::WindowUpdate => handle_window_update(&shared, stream_id, &payload),
            FrameType::Ping => {
                if flags.has_ack() {
                    trace!("keepalive acknowledged");
                } else {
                    let _ = shared.frame_tx.send(Frame::pong());
                }
            }
            FrameType::GoAway => {
                debug!("peer closed session");
                break;
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.fail_all_streams();
}

fn handle_open(
    shared: &Arc<Shared>,
    stream_id: StreamId,
    accept_tx: &mpsc::UnboundedSender<MuxStream>,
    tasks: &Weak<TaskSet>,
) {
    let tasks = match tasks.upgrade() {
        Some(tasks) => tasks,
        // Every external handle is gone; nobody can accept this stream.
        None => return,
    };

    let state = Arc::new(StreamState::new());
    let (data_tx, data_rx) = mpsc::unbounded_channel();

    {
        let mut streams = shared.streams.lock().unwrap();
        if streams.contains_key(&stream_id) {
            warn!(stream_id, "duplicate stream open");
            let _ = shared.frame_tx.send(Frame::reset(stream_id));
            return;
        }
        streams.insert(
            stream_id,
            StreamEntry {
                data_tx: Some(data_tx),
                state: state.clone(),
            },
        );
    }

    let stream = MuxStream::new(stream_id, state, data_rx, shared.clone(), tasks);
    if accept_tx.send(stream).is_err() {
        // Receiver gone; the returned stream is dropped, which resets it.
        trace!(stream_id, "no acceptor for incoming stream");
    }
}

fn handle_data(shared: &Shared, stream_id: StreamId, payload: Bytes) {
    let streams = shared.streams.lock().unwrap();
    match streams.get(&stream_id) {
        Some(StreamEntry {
            data_tx: Some(tx), ..
        }) => {
            // A conforming peer never has more than one receive window in
            // flight, so the queue stays bounded by INITIAL_WINDOW.
            if tx.send(payload).is_err() {
                trace!(stream_id, "data for stream with closed reader");
            }
        }
        Some(_) => trace!(stream_id, "data after half-close"),
        None => trace!(stream_id, "data for unknown stream"),
    }
}

fn handle_close(shared: &Shared, stream_id: StreamId, rst: bool) {
    let mut streams = shared.streams.lock().unwrap();
    if rst {
        if let Some(entry) = streams.remove(&stream_id) {
            trace!(stream_id, "stream reset by peer");
            entry.state.mark_reset();
        }
    } else if let Some(entry) = streams.get_mut(&stream_id) {
        trace!(stream_id, "stream half-closed by peer");
        entry.state.fin.store(true, Ordering::SeqCst);
        // Dropping the sender delivers EOF once buffered data drains; the
        // entry stays so window updates still reach the local writer.
        entry.data_tx = None;
    }
}

fn handle_window_update(shared: &Shared, stream_id: StreamId, payload: &[u8]) {
    let credit = match <[u8; 4]>::try_from(payload) {
        Ok(bytes) => u32::from_be_bytes(bytes),
        Err(_) => {
            warn!(stream_id, "malformed window update");
            return;
        }
    };
    let streams = shared.streams.lock().unwrap();
    if let Some(entry) = streams.get(&stream_id) {
        entry.state.grow_window(credit);
    }
}

/// Sends periodic pings while the session is alive.
async fn keepalive_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if shared.frame_tx.send(Frame::ping()).is_err() {
            return;
        }
    }
}

/// One bidirectional, flow-controlled byte channel within a session.
///
/// Reads and writes are ordered within the stream; nothing is guaranteed
/// across streams. `shutdown` half-closes the write side so the peer's
/// reader observes EOF. Dropping a stream whose write side was never shut
/// down aborts it.
pub struct MuxStream {
    id: StreamId,
    state: Arc<StreamState>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    read_buf: BytesMut,
    /// Bytes consumed since the last window credit sent to the peer.
    consumed: u32,
    shared: Arc<Shared>,
    write_shutdown: bool,
    read_eof: bool,
    _tasks: Arc<TaskSet>,
}

impl MuxStream {
    fn new(
        id: StreamId,
        state: Arc<StreamState>,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        shared: Arc<Shared>,
        tasks: Arc<TaskSet>,
    ) -> Self {
        Self {
            id,
            state,
            data_rx,
            read_buf: BytesMut::new(),
            consumed: 0,
            shared,
            write_shutdown: false,
            read_eof: false,
            _tasks: tasks,
        }
    }

    /// The stream's id, stable for the session lifetime.
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn credit(&mut self, n: usize) {
        self.consumed = self.consumed.saturating_add(n as u32);
        if self.consumed >= INITIAL_WINDOW / 2 {
            let _ = self
                .shared
                .frame_tx
                .send(Frame::window_update(self.id, self.consumed));
            self.consumed = 0;
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.read_buf.is_empty() {
                let n = me.read_buf.len().min(buf.remaining());
                let chunk = me.read_buf.split_to(n);
                buf.put_slice(&chunk);
                me.credit(n);
                return Poll::Ready(Ok(()));
            }
            if me.read_eof {
                return Poll::Ready(Ok(()));
            }
            match me.data_rx.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    me.read_buf.extend_from_slice(&data);
                }
                Poll::Ready(None) => {
                    if me.state.fin.load(Ordering::SeqCst) {
                        me.read_eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset",
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if me.write_shutdown {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if me.state.reset.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }

        let n = {
            let mut window = me.state.send_window.lock().unwrap();
            if *window == 0 {
                *me.state.write_waker.lock().unwrap() = Some(cx.waker().clone());
                // A reset between the check above and waker registration
                // would otherwise be missed.
                if me.state.reset.load(Ordering::SeqCst) {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "stream reset",
                    )));
                }
                return Poll::Pending;
            }
            let n = buf.len().min(*window as usize).min(MAX_FRAME_LEN);
            *window -= n as u32;
            n
        };

        let frame = Frame::data(me.id, Bytes::copy_from_slice(&buf[..n]));
        if me.shared.frame_tx.send(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session closed",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the dedicated writer task; per-stream
        // buffering is bounded by the send window.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.write_shutdown {
            me.write_shutdown = true;
            let _ = me.shared.frame_tx.send(Frame::close(me.id));
            trace!(stream_id = me.id, "half-closed write side");
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let removed = self.shared.streams.lock().unwrap().remove(&self.id).is_some();
        if removed && !self.write_shutdown {
            let _ = self.shared.frame_tx.send(Frame::reset(self.id));
        }
    }
}
