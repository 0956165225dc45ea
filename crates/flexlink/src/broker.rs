//! SmartLink broker client for WAN sessions.
//!
//! The broker arbitrates remote access to radios: a client registers
//! with a bearer token, receives the owner's radio inventory as
//! unsolicited `radio list` lines, and asks the broker to set up a WAN
//! session with `application connect`. The broker answers with
//! `radio connect_ready handle=<hex>`, a one-time nonce the client then
//! presents to the radio itself via `wan validate` on the TLS control
//! channel. Once the handle is delivered the broker plays no further
//! part; streaming runs directly against the radio.
//!
//! The wire protocol is the same line-framed ASCII scheme as the control
//! channel, with its own vocabulary and no `C<seq>|` framing.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use flexlink_core::error::{Error, Result};
use flexlink_core::types::{DiscoveredRadio, RadioSource, WanEndpoints};
use flexlink_transport::NetStream;
use flexlink_transport::tls;

/// The vendor broker endpoint.
pub const BROKER_HOST: &str = "smartlink.flexradio.com";

/// The broker's TLS port.
pub const BROKER_PORT: u16 = 443;

/// Default connect timeout for the broker session.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Capacity of the broker event stream.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registration parameters for `application register`.
#[derive(Debug, Clone)]
pub struct BrokerRegistration {
    /// Application name reported to the broker.
    pub app_name: String,
    /// Host platform tag (e.g. `"macos"`, `"linux"`).
    pub platform: String,
    /// OAuth bearer token. Redacted in logs.
    pub token: String,
}

/// Events emitted by the broker session.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// The broker reported one of the account's radios.
    RadioListed(DiscoveredRadio),
    /// The broker authorized a WAN session: present `wan_handle` to the
    /// radio via `wan validate`.
    ConnectReady {
        /// One-time nonce for the TLS control channel.
        wan_handle: String,
        /// Serial of the radio the handle is for, when reported.
        serial: String,
    },
    /// The broker session ended.
    Closed {
        /// Present when the session ended on an error.
        error: Option<String>,
    },
}

/// A live session to the SmartLink broker.
pub struct BrokerClient {
    writer: Arc<Mutex<WriteHalf<NetStream>>>,
    cancel: CancellationToken,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BrokerClient {
    /// Connect to the vendor broker, register, and start the read loop.
    ///
    /// Returns the client plus the event stream carrying radio-list and
    /// connect-ready notifications.
    pub async fn connect(
        registration: BrokerRegistration,
    ) -> Result<(Self, mpsc::Receiver<BrokerEvent>)> {
        let stream = tls::connect_vendor(BROKER_HOST, BROKER_PORT, CONNECT_TIMEOUT).await?;
        Self::from_stream(NetStream::Tls(Box::new(stream)), registration).await
    }

    /// Build a broker session over an already-established stream.
    ///
    /// This is the test entry point: a mock broker over loopback TCP
    /// exercises the full line protocol without TLS.
    pub async fn from_stream(
        stream: NetStream,
        registration: BrokerRegistration,
    ) -> Result<(Self, mpsc::Receiver<BrokerEvent>)> {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write_half));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let read_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                read_loop(read_half, event_tx, cancel).await;
            })
        };

        let client = BrokerClient {
            writer,
            cancel,
            read_task: Mutex::new(Some(read_task)),
        };

        // Register immediately on transport-ready.
        tracing::debug!(
            app = %registration.app_name,
            platform = %registration.platform,
            "Registering with broker (token redacted)"
        );
        client
            .send_line(&format!(
                "application register name={} platform={} token={}",
                registration.app_name, registration.platform, registration.token
            ))
            .await?;

        Ok((client, event_rx))
    }

    /// Ask the broker to authorize a WAN session with a radio.
    ///
    /// The answer arrives as [`BrokerEvent::ConnectReady`].
    pub async fn request_connect(&self, serial: &str) -> Result<()> {
        tracing::debug!(serial = %serial, "Requesting WAN connect");
        self.send_line(&format!(
            "application connect serial={serial} hole_punch_port=0"
        ))
        .await
    }

    /// Close the broker session.
    pub async fn close(&self) {
        self.cancel.cancel();
        {
            let mut w = self.writer.lock().await;
            let _ = w.shutdown().await;
        }
        let mut task = self.read_task.lock().await;
        if let Some(t) = task.take() {
            let _ = t.await;
        }
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("broker send failed: {e}")))?;
        w.write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(format!("broker send failed: {e}")))?;
        w.flush()
            .await
            .map_err(|e| Error::Transport(format!("broker flush failed: {e}")))?;
        Ok(())
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background task: read broker lines until cancellation or EOF.
async fn read_loop(
    read_half: ReadHalf<NetStream>,
    event_tx: mpsc::Sender<BrokerEvent>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    let mut line_buf = String::new();

    loop {
        line_buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = event_tx.send(BrokerEvent::Closed { error: None }).await;
                return;
            }
            read = reader.read_line(&mut line_buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("Broker closed the connection");
                let _ = event_tx.send(BrokerEvent::Closed { error: None }).await;
                return;
            }
            Ok(_) => {
                let trimmed = line_buf.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(event) = parse_broker_line(trimmed) {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Broker read error");
                let _ = event_tx
                    .send(BrokerEvent::Closed {
                        error: Some(e.to_string()),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Parse one broker line into an event, `None` for chatter we ignore.
fn parse_broker_line(line: &str) -> Option<BrokerEvent> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["radio", "list", rest @ ..] => {
            let kv = key_values(rest);
            parse_broker_radio(&kv).map(BrokerEvent::RadioListed)
        }
        ["radio", "connect_ready", rest @ ..] => {
            let kv = key_values(rest);
            let wan_handle = kv
                .iter()
                .find(|(k, _)| k == "handle")
                .map(|(_, v)| v.to_string())?;
            let serial = kv
                .iter()
                .find(|(k, _)| k == "serial")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            Some(BrokerEvent::ConnectReady { wan_handle, serial })
        }
        _ => {
            tracing::trace!(line = %line, "Ignoring broker line");
            None
        }
    }
}

/// Split tokens once on `=`, lowercasing keys.
fn key_values<'a>(tokens: &[&'a str]) -> Vec<(String, &'a str)> {
    tokens
        .iter()
        .filter_map(|token| {
            token
                .find('=')
                .map(|pos| (token[..pos].to_lowercase(), &token[pos + 1..]))
        })
        .collect()
}

/// Build a broker-sourced [`DiscoveredRadio`] from `radio list` fields.
fn parse_broker_radio(kv: &[(String, &str)]) -> Option<DiscoveredRadio> {
    let get = |key: &str| kv.iter().find(|(k, _)| k == key).map(|(_, v)| *v);

    let serial = get("serial").filter(|s| !s.is_empty())?.to_string();
    let public_ip = get("publicip").unwrap_or_default().to_string();

    Some(DiscoveredRadio {
        serial,
        model: get("model")
            .or_else(|| get("radio_type"))
            .unwrap_or("FlexRadio")
            .to_string(),
        callsign: get("callsign")
            .or_else(|| get("nickname"))
            .unwrap_or_default()
            .to_string(),
        // The broker path reaches the radio via its public endpoints; the
        // LAN address is unknown and recorded as unspecified.
        ip: get("ip")
            .and_then(|s| s.parse().ok())
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        port: get("port").and_then(|p| p.parse().ok()).unwrap_or(4992),
        version: get("version").unwrap_or_default().to_string(),
        source: RadioSource::Broker,
        wan: Some(WanEndpoints {
            public_ip,
            public_tls_port: get("publictlsport")
                .and_then(|p| p.parse().ok())
                .unwrap_or(4994),
            public_udp_port: get("publicudpport")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            wan_connected: get("wanconnected").map(|v| v == "1").unwrap_or(false),
        }),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
