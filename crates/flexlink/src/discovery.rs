//! LAN discovery of FlexRadio units via VITA-49 UDP broadcasts.
//!
//! Radios announce themselves roughly once per second with a VITA-49
//! beacon (stream ID `0x0000_0800`, vendor OUI `0x001C2D`) broadcast to
//! UDP port 4992. [`DiscoveryListener`] maintains a serial-keyed
//! inventory of radios: LAN entries are evicted after 5 seconds without
//! a refresh, while broker-reported and manually-added entries stay
//! until explicitly removed.
//!
//! The discovery socket is bound with address- and port-reuse plus
//! broadcast receive, so several SmartSDR clients on one host can listen
//! concurrently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use flexlink_core::error::{Error, Result};
use flexlink_core::types::{DiscoveredRadio, RadioSource, WanEndpoints};

use crate::vita49;

/// The well-known discovery broadcast port.
pub const DISCOVERY_PORT: u16 = 4992;

/// LAN entries disappear after this long without a beacon.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

/// Eviction sweep cadence. Beacons arrive about once per second, so a
/// one-second sweep bounds staleness overshoot to one beacon period.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Broadcast capacity for discovery events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change to the discovery inventory.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A radio entered the inventory.
    Added(DiscoveredRadio),
    /// An existing entry was refreshed.
    Updated(DiscoveredRadio),
    /// An entry was evicted (stale LAN radio) or explicitly removed.
    Removed(String),
}

/// One inventory slot with its freshness stamp.
#[derive(Debug, Clone)]
struct Entry {
    radio: DiscoveredRadio,
    last_seen: Instant,
}

/// Continuously listening discovery inventory.
///
/// Owns two background tasks: a receive loop on the discovery socket and
/// a one-second eviction sweep. Both stop when [`stop`](Self::stop) is
/// called or the listener is dropped.
pub struct DiscoveryListener {
    inventory: Arc<Mutex<HashMap<String, Entry>>>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    recv_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl DiscoveryListener {
    /// Bind the discovery port and start listening.
    pub fn start() -> Result<Self> {
        Self::start_on_port(DISCOVERY_PORT)
    }

    /// Bind a specific port and start listening.
    ///
    /// Tests use this with an ephemeral port and loopback beacons.
    pub fn start_on_port(port: u16) -> Result<Self> {
        let socket = flexlink_transport::UdpTransport::bind_reuse(port)?;
        tracing::debug!(port = socket.local_addr().port(), "Discovery listener started");

        let inventory: Arc<Mutex<HashMap<String, Entry>>> = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let recv_task = {
            let inventory = Arc::clone(&inventory);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, src)) => {
                            match parse_beacon(&buf[..n], src.ip()) {
                                Ok(radio) => {
                                    upsert(&inventory, &event_tx, radio, true).await;
                                }
                                Err(e) => {
                                    // Not a beacon, or malformed. Drop it.
                                    tracing::trace!(error = %e, from = %src, "Ignoring datagram");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Discovery recv error, listener exiting");
                            break;
                        }
                    }
                }
            })
        };

        let sweep_task = {
            let inventory = Arc::clone(&inventory);
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(SWEEP_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    let now = Instant::now();
                    let mut inv = inventory.lock().await;
                    let stale: Vec<String> = inv
                        .iter()
                        .filter(|(_, entry)| {
                            entry.radio.source == RadioSource::Lan
                                && now.duration_since(entry.last_seen) > STALE_AFTER
                        })
                        .map(|(serial, _)| serial.clone())
                        .collect();
                    for serial in stale {
                        inv.remove(&serial);
                        tracing::debug!(serial = %serial, "Evicting stale radio");
                        let _ = event_tx.send(DiscoveryEvent::Removed(serial));
                    }
                }
            })
        };

        Ok(DiscoveryListener {
            inventory,
            event_tx,
            recv_task,
            sweep_task,
        })
    }

    /// Snapshot of the current inventory.
    pub async fn radios(&self) -> Vec<DiscoveredRadio> {
        let inv = self.inventory.lock().await;
        inv.values().map(|e| e.radio.clone()).collect()
    }

    /// Look up one radio by serial.
    pub async fn radio(&self, serial: &str) -> Option<DiscoveredRadio> {
        let inv = self.inventory.lock().await;
        inv.get(serial).map(|e| e.radio.clone())
    }

    /// Subscribe to inventory change events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Insert or refresh a broker-reported or manually-entered radio.
    ///
    /// Entries added this way are never staleness-evicted; remove them
    /// with [`remove`](Self::remove).
    pub async fn upsert(&self, radio: DiscoveredRadio) {
        upsert(&self.inventory, &self.event_tx, radio, false).await;
    }

    /// Explicitly remove an entry regardless of source.
    pub async fn remove(&self, serial: &str) -> bool {
        let removed = {
            let mut inv = self.inventory.lock().await;
            inv.remove(serial).is_some()
        };
        if removed {
            let _ = self.event_tx.send(DiscoveryEvent::Removed(serial.to_string()));
        }
        removed
    }

    /// Stop both background tasks.
    pub fn stop(&self) {
        self.recv_task.abort();
        self.sweep_task.abort();
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Insert or refresh an inventory entry and emit the matching event.
///
/// An update refreshes the freshness stamp and the descriptive fields
/// but never changes the existing entry's source tag.
async fn upsert(
    inventory: &Arc<Mutex<HashMap<String, Entry>>>,
    event_tx: &broadcast::Sender<DiscoveryEvent>,
    mut radio: DiscoveredRadio,
    from_beacon: bool,
) {
    let event = {
        let mut inv = inventory.lock().await;
        match inv.get_mut(&radio.serial) {
            Some(entry) => {
                radio.source = entry.radio.source;
                entry.radio = radio.clone();
                entry.last_seen = Instant::now();
                DiscoveryEvent::Updated(radio)
            }
            None => {
                if from_beacon {
                    tracing::debug!(
                        serial = %radio.serial,
                        model = %radio.model,
                        ip = %radio.ip,
                        "Discovered radio"
                    );
                }
                inv.insert(
                    radio.serial.clone(),
                    Entry {
                        radio: radio.clone(),
                        last_seen: Instant::now(),
                    },
                );
                DiscoveryEvent::Added(radio)
            }
        }
    };
    let _ = event_tx.send(event);
}

/// Parse a single UDP datagram as a discovery beacon.
///
/// Requires the discovery stream ID, a context-flavored packet type, the
/// FlexRadio OUI when a class ID is present, and non-empty `serial` and
/// `ip` keys in the payload.
pub fn parse_beacon(data: &[u8], src_ip: IpAddr) -> Result<DiscoveredRadio> {
    let packet = vita49::parse_packet(data)?;
    if !packet.is_discovery() {
        return Err(Error::Protocol("not a discovery beacon".into()));
    }

    let kv = vita49::parse_discovery_payload(packet.payload)?;

    let serial = kv
        .get("serial")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Protocol("beacon missing serial".into()))?
        .clone();
    let ip_text = kv
        .get("ip")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Protocol("beacon missing ip".into()))?;
    let ip: IpAddr = ip_text.parse().unwrap_or(src_ip);

    let model = kv
        .get("model")
        .or_else(|| kv.get("radio_type"))
        .cloned()
        .unwrap_or_else(|| "FlexRadio".to_string());
    let callsign = kv
        .get("callsign")
        .or_else(|| kv.get("nickname"))
        .cloned()
        .unwrap_or_default();
    let port = kv
        .get("port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DISCOVERY_PORT);
    let version = kv.get("version").cloned().unwrap_or_default();

    let wan = match (kv.get("publicip"), kv.get("publictlsport"), kv.get("publicudpport")) {
        (Some(public_ip), tls_port, udp_port) => Some(WanEndpoints {
            public_ip: public_ip.clone(),
            public_tls_port: tls_port.and_then(|p| p.parse().ok()).unwrap_or(4994),
            public_udp_port: udp_port.and_then(|p| p.parse().ok()).unwrap_or(0),
            wan_connected: kv.get("wanconnected").map(|v| v == "1").unwrap_or(false),
        }),
        _ => None,
    };

    Ok(DiscoveredRadio {
        serial,
        model,
        callsign,
        ip,
        port,
        version,
        source: RadioSource::Lan,
        wan,
    })
}

/// Collect beacons for a fixed window and return the deduplicated set.
///
/// A convenience for one-shot "what's on the network" queries; the
/// continuous [`DiscoveryListener`] is the primary interface.
pub async fn discover(timeout: Duration) -> Result<Vec<DiscoveredRadio>> {
    discover_on_port(DISCOVERY_PORT, timeout).await
}

/// One-shot discovery on a specific port.
pub async fn discover_on_port(port: u16, timeout: Duration) -> Result<Vec<DiscoveredRadio>> {
    let socket = flexlink_transport::UdpTransport::bind_reuse(port)?;
    let mut radios: HashMap<String, DiscoveredRadio> = HashMap::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match socket.recv_timeout(&mut buf, remaining).await {
            Ok(n) => {
                // One-shot discovery has no useful source fallback target,
                // so reuse the local address family placeholder.
                if let Ok(radio) = parse_beacon(&buf[..n], socket.local_addr().ip()) {
                    radios.entry(radio.serial.clone()).or_insert(radio);
                }
            }
            Err(Error::Timeout) => break,
            Err(e) => {
                tracing::trace!(error = %e, "One-shot discovery recv error");
            }
        }
    }

    Ok(radios.into_values().collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
