//! TCP bindings.
//!
//! All three channels speak newline-delimited frames:
//! - broadcast: the subscriber opens with one JSON line `{"addresses": [...]}`
//!   listing its filters, then receives `"<target>\t<payload>\n"` frames for
//!   matching targets only
//! - funnel and intake: any number of clients write `"<payload>\n"` lines,
//!   merged into one bounded queue on the bound side
//!
//! Each subscriber and each pusher has its own bounded queue; when it is full
//! the frame is dropped rather than blocking the sender.
//!
//! Frames are read as raw bytes, at most [`MAX_FRAME_LEN`] long. A frame that
//! is not valid JSON (or not even UTF-8) is passed on for the node to reject;
//! an oversized line is skipped. Neither ends the connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use rpilot_protocol::Address;

use crate::channel::{BroadcastSender, Filters, FunnelSender, Inbound};
use crate::NetworkError;

/// Longest frame accepted on any TCP channel, excluding the newline.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Queueing and reconnect settings shared by the TCP bindings.
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Frames buffered per connection before new ones are dropped.
    pub queue_capacity: usize,
    /// Wait between reconnect attempts on the connecting side.
    pub reconnect_delay: Duration,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast endpoint (bound by the Terminal)
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    conn_id: u64,
    peer: SocketAddr,
    filters: Filters,
    tx: mpsc::Sender<Bytes>,
}

/// Publisher side of the broadcast channel.
#[derive(Clone)]
pub struct TcpPublisher {
    subscribers: Arc<Mutex<Vec<SubscriberSlot>>>,
    local_addr: SocketAddr,
}

impl TcpPublisher {
    /// Bind the broadcast endpoint and start accepting subscribers.
    pub async fn bind(addr: &str, options: TcpOptions) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Broadcast endpoint listening");

        let subscribers: Arc<Mutex<Vec<SubscriberSlot>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_subscribers = Arc::clone(&subscribers);

        tokio::spawn(async move {
            let mut next_conn_id = 0u64;
            let mut failures = 0u32;
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => {
                        failures = 0;
                        accepted
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        tracing::warn!(error = %e, failures, "Broadcast accept failed");
                        tokio::time::sleep(accept_backoff(failures)).await;
                        continue;
                    }
                };
                let conn_id = next_conn_id;
                next_conn_id += 1;
                let subscribers = Arc::clone(&accept_subscribers);
                let capacity = options.queue_capacity;
                tokio::spawn(async move {
                    if let Err(e) =
                        serve_subscriber(stream, peer, conn_id, Arc::clone(&subscribers), capacity).await
                    {
                        tracing::debug!(peer = %peer, error = %e, "Subscriber connection ended");
                    }
                    lock_slots(&subscribers).retain(|s| s.conn_id != conn_id);
                });
            }
        });

        Ok(Self {
            subscribers,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of subscribers that completed their handshake.
    pub fn subscriber_count(&self) -> usize {
        lock_slots(&self.subscribers).len()
    }
}

impl BroadcastSender for TcpPublisher {
    fn send(&self, target: &Address, payload: Bytes) -> Result<(), NetworkError> {
        let mut line = BytesMut::with_capacity(target.as_str().len() + payload.len() + 2);
        line.put_slice(target.as_str().as_bytes());
        line.put_u8(b'\t');
        line.put_slice(&payload);
        line.put_u8(b'\n');
        let line = line.freeze();

        let mut slots = lock_slots(&self.subscribers);
        slots.retain(|slot| {
            if !slot.filters.matches(target) {
                return true;
            }
            match slot.tx.try_send(line.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(peer = %slot.peer, target_addr = %target, "Subscriber queue full, frame dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }
}

fn lock_slots(slots: &Mutex<Vec<SubscriberSlot>>) -> std::sync::MutexGuard<'_, Vec<SubscriberSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    subscribers: Arc<Mutex<Vec<SubscriberSlot>>>,
    capacity: usize,
) -> Result<(), NetworkError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let hello = match read_frame(&mut reader, &mut buf).await? {
        ReadFrame::Frame => &buf,
        ReadFrame::Oversized => {
            return Err(NetworkError::Handshake("subscription line too long".into()))
        }
        ReadFrame::Eof => {
            return Err(NetworkError::Handshake("connection closed before subscribing".into()))
        }
    };
    let filters: Filters = serde_json::from_slice(hello)
        .map_err(|e| NetworkError::Handshake(format!("invalid subscription: {e}")))?;
    tracing::info!(peer = %peer, filters = ?filters.addresses(), "Subscriber connected");

    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    lock_slots(&subscribers).push(SubscriberSlot {
        conn_id,
        peer,
        filters,
        tx,
    });

    let mut scratch = [0u8; 256];
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                writer.write_all(&frame).await?;
            }
            // The subscriber never writes after the handshake; anything it
            // sends is discarded and EOF means it went away.
            n = reader.read(&mut scratch) => {
                if n? == 0 {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Broadcast receiver (connected by each Pilot)
// ---------------------------------------------------------------------------

/// Connect to a broadcast endpoint and return the stream of payloads whose
/// target matches `filters`. Reconnects until the returned receiver is
/// dropped.
pub fn subscribe(addr: String, filters: Filters, options: TcpOptions) -> Inbound {
    let (tx, rx) = mpsc::channel(options.queue_capacity);

    tokio::spawn(async move {
        let hello = match serde_json::to_string(&filters) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "Cannot encode subscription");
                return;
            }
        };
        while !tx.is_closed() {
            match read_broadcast(&addr, &hello, &filters, &tx).await {
                Ok(()) => tracing::info!(addr = %addr, "Broadcast endpoint closed the connection"),
                Err(e) => tracing::warn!(addr = %addr, error = %e, "Broadcast connection failed"),
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(options.reconnect_delay).await;
        }
    });

    rx
}

async fn read_broadcast(
    addr: &str,
    hello: &str,
    filters: &Filters,
    tx: &mpsc::Sender<Bytes>,
) -> Result<(), NetworkError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(hello.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    tracing::info!(addr = %addr, "Subscribed to broadcast endpoint");

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_frame(&mut reader, &mut buf).await? {
            ReadFrame::Frame => {}
            ReadFrame::Oversized => {
                tracing::warn!(max = MAX_FRAME_LEN, "Oversized broadcast frame, dropped");
                continue;
            }
            ReadFrame::Eof => return Ok(()),
        }
        let Some(split) = buf.iter().position(|&b| b == b'\t') else {
            tracing::warn!("Broadcast frame without target, dropped");
            continue;
        };
        let (target, payload) = (&buf[..split], &buf[split + 1..]);
        let Some(target) = std::str::from_utf8(target).ok().and_then(|t| Address::new(t).ok()) else {
            tracing::warn!(
                target_addr = %String::from_utf8_lossy(target),
                "Broadcast frame with invalid target, dropped"
            );
            continue;
        };
        if !filters.matches(&target) {
            continue;
        }
        match tx.try_send(Bytes::copy_from_slice(payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(target_addr = %target, "Inbound queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Funnel / intake endpoints
// ---------------------------------------------------------------------------

/// Bind a many-to-one line endpoint (funnel or intake). Every non-empty line
/// from every client is queued on the returned receiver.
pub async fn bind_line_listener(
    addr: &str,
    capacity: usize,
) -> Result<(SocketAddr, Inbound), NetworkError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(capacity);
    tracing::info!(addr = %local_addr, "Line endpoint listening");

    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(error = %e, failures, "Line endpoint accept failed");
                    tokio::time::sleep(accept_backoff(failures)).await;
                    continue;
                }
            };
            if tx.is_closed() {
                break;
            }
            tracing::debug!(peer = %peer, "Line client connected");
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = read_lines(stream, &tx).await {
                    tracing::debug!(peer = %peer, error = %e, "Line client disconnected");
                }
            });
        }
    });

    Ok((local_addr, rx))
}

async fn read_lines(stream: TcpStream, tx: &mpsc::Sender<Bytes>) -> Result<(), NetworkError> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        match read_frame(&mut reader, &mut buf).await? {
            ReadFrame::Frame => {}
            ReadFrame::Oversized => {
                tracing::warn!(max = MAX_FRAME_LEN, "Oversized line, dropped");
                continue;
            }
            ReadFrame::Eof => return Ok(()),
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match tx.try_send(Bytes::copy_from_slice(&buf)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Line endpoint queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(NetworkError::ChannelClosed),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

enum ReadFrame {
    /// `buf` holds one frame without its line ending.
    Frame,
    /// The line exceeded [`MAX_FRAME_LEN`] and was skipped.
    Oversized,
    Eof,
}

/// Read one newline-terminated frame into `buf`. Bytes are not checked for
/// UTF-8. A final line without a newline still counts as a frame.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<ReadFrame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_FRAME_LEN as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(ReadFrame::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_FRAME_LEN {
        skip_line(reader).await?;
        buf.clear();
        return Ok(ReadFrame::Oversized);
    }
    Ok(ReadFrame::Frame)
}

/// Discard input up to and including the next newline, without buffering it.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        if done {
            return Ok(());
        }
    }
}

/// Wait after the `failures`-th consecutive accept error.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << failures.min(6))
        .min(ACCEPT_BACKOFF_MAX)
}

/// Client side of a line endpoint. Frames are queued locally and written by
/// a background task that reconnects after failures.
#[derive(Clone)]
pub struct TcpPusher {
    tx: mpsc::Sender<Bytes>,
}

impl TcpPusher {
    pub fn connect(addr: String, options: TcpOptions) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(options.queue_capacity);

        tokio::spawn(async move {
            let mut pending: Option<Bytes> = None;
            loop {
                let mut stream = match TcpStream::connect(&addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(addr = %addr, error = %e, "Push endpoint unreachable");
                        tokio::time::sleep(options.reconnect_delay).await;
                        continue;
                    }
                };
                tracing::info!(addr = %addr, "Connected to push endpoint");

                loop {
                    let frame = match pending.take() {
                        Some(f) => f,
                        None => match rx.recv().await {
                            Some(f) => f,
                            None => return,
                        },
                    };
                    if let Err(e) = write_line(&mut stream, &frame).await {
                        tracing::warn!(addr = %addr, error = %e, "Push failed, reconnecting");
                        pending = Some(frame);
                        break;
                    }
                }
                tokio::time::sleep(options.reconnect_delay).await;
            }
        });

        Self { tx }
    }
}

async fn write_line(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(frame).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await
}

impl FunnelSender for TcpPusher {
    fn push(&self, payload: Bytes) -> Result<(), NetworkError> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::ChannelClosed,
        })
    }
}
