//! SmartSDR control-channel session.
//!
//! [`ControlConnection`] manages one TCP (LAN) or TLS (WAN) session to
//! the radio's command port: the V/H handshake, sequence-numbered
//! command/response correlation, unsolicited status dispatch, and the
//! ping keepalive. It is a pure session machine -- subscription
//! choreography and state merging live in [`crate::radio`].
//!
//! Status lines and lifecycle changes are forwarded to the owner through
//! an mpsc event stream. Every event carries the connection's epoch
//! number so the owner can discard stragglers from a torn-down session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use flexlink_core::error::{Error, Result};
use flexlink_core::types::{ConnectionKind, ConnectionState};
use flexlink_transport::NetStream;
use flexlink_transport::{tcp, tls};

use crate::codec::{self, CommandResponse, ControlMessage, StatusMessage};

/// Time allowed from `Connecting` to the `H` handshake line.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Keepalive ping cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Default wait for an individual command response.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the control event stream to the owner.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for a control session.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// Deadline for connect + handshake.
    pub connect_timeout: Duration,
    /// Timeout for individual command responses.
    pub command_timeout: Duration,
    /// Keepalive ping interval.
    pub keepalive_interval: Duration,
}

impl Default for ControlOptions {
    fn default() -> Self {
        ControlOptions {
            connect_timeout: CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }
}

/// Where to reach the radio's command port.
#[derive(Debug, Clone)]
pub struct ControlEndpoint {
    /// Host or IP address.
    pub host: String,
    /// TCP port (4992 LAN) or TLS port (typically 4994 WAN).
    pub port: u16,
    /// LAN (plain TCP) or WAN (TLS, accept-all trust).
    pub kind: ConnectionKind,
}

/// Events forwarded from the session to its owner.
///
/// Each event carries the epoch the emitting connection was created
/// with; the owner drops events whose epoch is not current.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Connection lifecycle change.
    StateChanged {
        /// Emitting connection's epoch.
        epoch: u64,
        /// The new state.
        state: ConnectionState,
    },
    /// An unsolicited status line.
    Status {
        /// Emitting connection's epoch.
        epoch: u64,
        /// Handle and raw body; tokenization is the owner's job.
        message: StatusMessage,
    },
    /// A raw meter frame, opaque to the session.
    Meter {
        /// Emitting connection's epoch.
        epoch: u64,
        /// The line as received.
        raw: String,
    },
}

/// Create the event channel a [`ControlConnection`] reports into.
pub fn event_channel() -> (mpsc::Sender<ControlEvent>, mpsc::Receiver<ControlEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// One SmartSDR control session.
///
/// Constructed connected; a new connection (with a new epoch) is built
/// for every connect attempt, so sequence numbers restart at 1 each
/// session.
pub struct ControlConnection {
    /// Write half of the stream, `None` after teardown.
    writer: Arc<Mutex<Option<WriteHalf<NetStream>>>>,
    /// Next command sequence number (starts at 1).
    next_seq: Arc<Mutex<u32>>,
    /// Pending completions keyed by sequence number. Inserted before a
    /// command is written; removed on response or teardown.
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<CommandResponse>>>>,
    /// Firmware version from the `V` handshake line.
    version: String,
    /// Client handle from the `H` handshake line.
    handle: String,
    /// LAN or WAN.
    kind: ConnectionKind,
    /// Epoch stamped into every event from this connection.
    epoch: u64,
    /// Connection liveness flag (lock-free reads on the send path).
    connected: Arc<AtomicBool>,
    /// Background read loop.
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Background keepalive loop.
    keepalive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Event stream to the owner.
    event_tx: mpsc::Sender<ControlEvent>,
    /// Per-command response timeout.
    command_timeout: Duration,
}

impl ControlConnection {
    /// Connect and complete the V/H handshake.
    ///
    /// Emits `Connecting` immediately and `Connected` once the `H` line
    /// arrives. The whole sequence (TCP/TLS setup plus handshake lines)
    /// must finish within `options.connect_timeout`.
    pub async fn connect(
        endpoint: &ControlEndpoint,
        epoch: u64,
        options: ControlOptions,
        event_tx: mpsc::Sender<ControlEvent>,
    ) -> Result<Self> {
        let _ = event_tx
            .send(ControlEvent::StateChanged {
                epoch,
                state: ConnectionState::Connecting,
            })
            .await;

        let deadline = Instant::now() + options.connect_timeout;
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        tracing::debug!(addr = %addr, kind = ?endpoint.kind, epoch, "Connecting to radio");

        let connect_result = async {
            let stream = match endpoint.kind {
                ConnectionKind::Lan => NetStream::Tcp(
                    tcp::connect(&addr, options.connect_timeout).await?,
                ),
                ConnectionKind::Wan => NetStream::Tls(Box::new(
                    tls::connect_vendor(&endpoint.host, endpoint.port, options.connect_timeout)
                        .await?,
                )),
            };

            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);
            let (version, handle) = read_handshake(&mut reader, deadline).await?;
            Ok::<_, Error>((reader, write_half, version, handle))
        }
        .await;

        let (reader, write_half, version, handle) = match connect_result {
            Ok(parts) => parts,
            Err(e) => {
                let _ = event_tx
                    .send(ControlEvent::StateChanged {
                        epoch,
                        state: ConnectionState::Disconnected,
                    })
                    .await;
                return Err(e);
            }
        };

        tracing::debug!(version = %version, handle = %handle, epoch, "Handshake complete");

        let pending: Arc<Mutex<HashMap<u32, oneshot::Sender<CommandResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let writer = Arc::new(Mutex::new(Some(write_half)));
        let next_seq = Arc::new(Mutex::new(1u32));

        let read_task = {
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                read_loop(reader, pending, connected, event_tx, epoch).await;
            })
        };

        let keepalive_task = {
            let writer = Arc::clone(&writer);
            let next_seq = Arc::clone(&next_seq);
            let connected = Arc::clone(&connected);
            let interval = options.keepalive_interval;
            tokio::spawn(async move {
                keepalive_loop(writer, next_seq, connected, interval).await;
            })
        };

        let conn = ControlConnection {
            writer,
            next_seq,
            pending,
            version,
            handle,
            kind: endpoint.kind,
            epoch,
            connected,
            read_task: Mutex::new(Some(read_task)),
            keepalive_task: Mutex::new(Some(keepalive_task)),
            event_tx,
            command_timeout: options.command_timeout,
        };

        let _ = conn
            .event_tx
            .send(ControlEvent::StateChanged {
                epoch,
                state: ConnectionState::Connected,
            })
            .await;

        Ok(conn)
    }

    /// Firmware version reported during the handshake.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Client handle assigned by the radio.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// LAN or WAN session.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// This connection's epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the session is live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a command and await its response.
    ///
    /// Allocates the next sequence number, registers the completion
    /// *before* transmission, then writes `C<seq>|<body>\n`. On success
    /// returns the response message (often empty); a failure result code
    /// maps to [`Error::Response`].
    pub async fn send(&self, body: &str) -> Result<String> {
        let response = self.send_raw(body).await?;
        if response.is_success() {
            Ok(response.message)
        } else {
            Err(Error::Response {
                code: response.result,
                message: response.message,
            })
        }
    }

    /// Send a command and return the raw response, success or failure.
    pub async fn send_raw(&self, body: &str) -> Result<CommandResponse> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let seq = self.allocate_seq().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(seq, tx);
        }

        if let Err(e) = self.write_command(seq, body).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                tracing::trace!(
                    seq,
                    result = %response.result,
                    message = %response.message,
                    "Response received"
                );
                Ok(response)
            }
            Ok(Err(_)) => {
                // Sender dropped: the session went away underneath us.
                let mut pending = self.pending.lock().await;
                pending.remove(&seq);
                Err(Error::ConnectionLost)
            }
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&seq);
                Err(Error::Timeout)
            }
        }
    }

    /// Send a command without registering a completion.
    ///
    /// A response arriving for it is logged and discarded by the read
    /// loop.
    pub async fn send_no_wait(&self, body: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let seq = self.allocate_seq().await;
        self.write_command(seq, body).await
    }

    /// Tear down and emit `Disconnected`. Idempotent: disconnecting an
    /// already-disconnected session is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(epoch = self.epoch, "Disconnecting control session");
        self.teardown().await;
        let _ = self
            .event_tx
            .send(ControlEvent::StateChanged {
                epoch: self.epoch,
                state: ConnectionState::Disconnected,
            })
            .await;
        Ok(())
    }

    /// Tear down without a status callback. Used during reconnect
    /// attempts where the owner replaces this connection immediately.
    pub async fn teardown_silent(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.teardown().await;
    }

    async fn allocate_seq(&self) -> u32 {
        let mut next = self.next_seq.lock().await;
        let seq = *next;
        *next = next.wrapping_add(1);
        seq
    }

    async fn write_command(&self, seq: u32, body: &str) -> Result<()> {
        let encoded = codec::encode_command(seq, body);
        tracing::trace!(seq, command = %redact(body), "Sending command");

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(Error::NotConnected)?;
        w.write_all(&encoded)
            .await
            .map_err(|e| Error::Transport(format!("failed to send command: {e}")))?;
        w.flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush command: {e}")))?;
        Ok(())
    }

    async fn teardown(&self) {
        // Close the writer so the radio sees EOF.
        {
            let mut writer = self.writer.lock().await;
            if let Some(mut w) = writer.take() {
                let _ = w.shutdown().await;
            }
        }
        {
            let mut task = self.read_task.lock().await;
            if let Some(t) = task.take() {
                t.abort();
            }
        }
        {
            let mut task = self.keepalive_task.lock().await;
            if let Some(t) = task.take() {
                t.abort();
            }
        }
        // Drop pending completions without invocation; awaiting callers
        // observe ConnectionLost through the dropped oneshot.
        let mut pending = self.pending.lock().await;
        pending.clear();
    }
}

/// Redact sensitive command bodies before they reach the logs.
fn redact(body: &str) -> &str {
    if body.contains("wan validate") {
        "wan validate handle=<redacted>"
    } else {
        body
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Read lines until both the `V` and `H` handshake lines have arrived.
///
/// The radio sends them unsolicited right after accept. Other lines
/// (e.g. early meter frames) are skipped. Returns `(version, handle)`.
async fn read_handshake(
    reader: &mut BufReader<ReadHalf<NetStream>>,
    deadline: Instant,
) -> Result<(String, String)> {
    let mut version = String::new();

    loop {
        let mut line = String::new();
        let n = tokio::time::timeout_at(deadline, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("handshake read error: {e}")))?;
        if n == 0 {
            return Err(Error::ConnectionLost);
        }

        let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
        if trimmed.is_empty() {
            continue;
        }

        match codec::parse_line(trimmed) {
            Ok(ControlMessage::Version(v)) => version = v,
            Ok(ControlMessage::Handle(h)) => return Ok((version, h)),
            Ok(other) => {
                tracing::trace!(line = ?other, "Skipping non-handshake line");
            }
            Err(e) => {
                tracing::trace!(error = %e, line = %trimmed, "Unparseable handshake line");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Background task: read lines, correlate responses, forward status.
async fn read_loop(
    mut reader: BufReader<ReadHalf<NetStream>>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<CommandResponse>>>>,
    connected: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ControlEvent>,
    epoch: u64,
) {
    let mut line_buf = String::new();

    loop {
        line_buf.clear();
        match reader.read_line(&mut line_buf).await {
            Ok(0) => {
                tracing::debug!(epoch, "Control connection closed by radio");
                break;
            }
            Ok(_) => {
                let trimmed = line_buf.trim_end_matches('\n').trim_end_matches('\r');
                if trimmed.is_empty() {
                    continue;
                }

                match codec::parse_line(trimmed) {
                    Ok(ControlMessage::Response(response)) => {
                        let seq = response.sequence;
                        let sender = {
                            let mut p = pending.lock().await;
                            p.remove(&seq)
                        };
                        match sender {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                tracing::trace!(
                                    seq,
                                    result = %response.result,
                                    "Response with no registered completion"
                                );
                            }
                        }
                    }
                    Ok(ControlMessage::Status(message)) => {
                        let _ = event_tx
                            .send(ControlEvent::Status { epoch, message })
                            .await;
                    }
                    Ok(ControlMessage::Meter(raw)) => {
                        let _ = event_tx.send(ControlEvent::Meter { epoch, raw }).await;
                    }
                    Ok(ControlMessage::Version(v)) => {
                        tracing::warn!(version = %v, "Unexpected version line after handshake");
                    }
                    Ok(ControlMessage::Handle(h)) => {
                        tracing::warn!(handle = %h, "Unexpected handle line after handshake");
                    }
                    Ok(ControlMessage::Ignored(line)) => {
                        tracing::trace!(line = %line, "Ignoring unknown line");
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, line = %trimmed, "Failed to parse line");
                    }
                }
            }
            Err(e) => {
                tracing::debug!(epoch, error = %e, "Control read error");
                break;
            }
        }
    }

    // Session over: flip the flag, drop completions, tell the owner.
    connected.store(false, Ordering::SeqCst);
    {
        let mut p = pending.lock().await;
        p.clear();
    }
    let _ = event_tx
        .send(ControlEvent::StateChanged {
            epoch,
            state: ConnectionState::Disconnected,
        })
        .await;
}

// ---------------------------------------------------------------------------
// Keepalive
// ---------------------------------------------------------------------------

/// Background task: write `ping` on a fixed cadence.
///
/// No completion is registered; any response is discarded by the read
/// loop. General read-loop liveness covers failure detection.
async fn keepalive_loop(
    writer: Arc<Mutex<Option<WriteHalf<NetStream>>>>,
    next_seq: Arc<Mutex<u32>>,
    connected: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    // The immediate first tick would ping right after the handshake.
    tick.tick().await;

    loop {
        tick.tick().await;
        if !connected.load(Ordering::SeqCst) {
            break;
        }

        let seq = {
            let mut next = next_seq.lock().await;
            let seq = *next;
            *next = next.wrapping_add(1);
            seq
        };
        let encoded = codec::encode_command(seq, &codec::cmd_ping());

        let mut w = writer.lock().await;
        let Some(stream) = w.as_mut() else { break };
        if let Err(e) = stream.write_all(&encoded).await {
            tracing::debug!(error = %e, "Keepalive write failed");
            break;
        }
        let _ = stream.flush().await;
        tracing::trace!(seq, "Keepalive ping sent");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
