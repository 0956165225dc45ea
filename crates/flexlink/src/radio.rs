//! The observable radio: state model, choreography, and command surface.
//!
//! [`Radio`] owns one [`ControlConnection`], optionally a
//! [`BrokerClient`] for WAN sessions, and the DAX pipelines. It merges
//! three event sources -- command responses, unsolicited status lines,
//! and audio statistics -- into a single [`RadioModel`] and re-emits
//! typed [`RadioEvent`]s on a broadcast bus for the GUI collaborator.
//!
//! All control events funnel through one merge task per connection.
//! Events carry the epoch of the connection that produced them; the
//! merge task discards anything from a superseded epoch, so callbacks
//! from a torn-down session can never corrupt the model.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};

use flexlink_core::audio::{AudioReceiver, NoiseReduction, Passthrough};
use flexlink_core::auth::TokenProvider;
use flexlink_core::error::{Error, Result};
use flexlink_core::events::RadioEvent;
use flexlink_core::types::{
    ConnectionKind, ConnectionState, DiscoveredRadio, EqType, SliceMode,
};

use crate::broker::{BrokerClient, BrokerEvent, BrokerRegistration};
use crate::codec;
use crate::control::{
    ControlConnection, ControlEndpoint, ControlEvent, ControlOptions, event_channel,
};
use crate::dax_rx::{DAX_RX_PORT, DaxRxOptions, DaxRxStream};
use crate::dax_tx::{DaxTxOptions, MicTxHandle, MicTxPipeline};
use crate::state::{RadioModel, SliceState};

/// Frequency for the slice auto-created when the radio has none.
const DEFAULT_SLICE_FREQ_HZ: u64 = 14_225_000;

/// Antenna for the auto-created slice.
const DEFAULT_SLICE_ANT: &str = "ANT1";

/// Pause between `wan validate` and the first subscription command,
/// giving the radio time to process the handle.
const WAN_VALIDATE_SETTLE: Duration = Duration::from_millis(200);

/// How long to wait for the broker's `connect_ready` answer.
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Broadcast capacity for the radio event bus.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for a [`Radio`].
#[derive(Debug, Clone)]
pub struct RadioOptions {
    /// Client program name registered with the radio.
    pub client_name: String,
    /// Platform tag for broker registration.
    pub platform: String,
    /// Control-channel options (timeouts, keepalive).
    pub control: ControlOptions,
    /// DAX channel for the RX audio stream.
    pub dax_channel: u8,
    /// UDP port the RX pipeline binds on the LAN. Tests override this
    /// with 0 for an ephemeral port.
    pub dax_rx_port: u16,
    /// Start the mic TX pipeline on PTT-down.
    pub mic_tx_enabled: bool,
    /// Sample rate of the host microphone capture.
    pub mic_input_rate: u32,
}

impl Default for RadioOptions {
    fn default() -> Self {
        RadioOptions {
            client_name: "flexlink".to_string(),
            platform: std::env::consts::OS.to_string(),
            control: ControlOptions::default(),
            dax_channel: 1,
            dax_rx_port: DAX_RX_PORT,
            mic_tx_enabled: false,
            mic_input_rate: 24_000,
        }
    }
}

/// Where the radio's streaming endpoint lives for the current session.
#[derive(Debug, Clone)]
struct StreamingTarget {
    /// Radio IP (LAN address or WAN public IP).
    ip: IpAddr,
    /// UDP port on the radio side (4991 LAN, broker-reported WAN).
    udp_port: u16,
    /// Port the local RX pipeline should bind.
    local_udp_port: u16,
    /// WAN session: Opus payloads, TLS control.
    wan: bool,
}

/// The observable radio engine.
pub struct Radio {
    inner: Arc<Inner>,
}

struct Inner {
    options: RadioOptions,
    model: Mutex<RadioModel>,
    event_tx: broadcast::Sender<RadioEvent>,
    conn: Mutex<Option<Arc<ControlConnection>>>,
    broker: Mutex<Option<BrokerClient>>,
    dax_rx: Mutex<Option<DaxRxStream>>,
    dax_tx: Mutex<Option<MicTxPipeline>>,
    target: Mutex<Option<StreamingTarget>>,
    /// Noise-reduction backend applied to RX audio; passthrough unless
    /// the application installs one.
    noise_reduction: Mutex<Arc<dyn NoiseReduction>>,
    /// Current connection epoch; merge tasks drop events from others.
    epoch: AtomicU64,
}

impl Radio {
    /// Create a radio engine with the given options.
    pub fn new(options: RadioOptions) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Radio {
            inner: Arc::new(Inner {
                options,
                model: Mutex::new(RadioModel::default()),
                event_tx,
                conn: Mutex::new(None),
                broker: Mutex::new(None),
                dax_rx: Mutex::new(None),
                dax_tx: Mutex::new(None),
                target: Mutex::new(None),
                noise_reduction: Mutex::new(Arc::new(Passthrough)),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to the radio event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Install a noise-reduction backend for RX audio.
    ///
    /// Takes effect the next time DAX starts.
    pub async fn set_noise_reduction(&self, nr: Arc<dyn NoiseReduction>) {
        *self.inner.noise_reduction.lock().await = nr;
    }

    /// Snapshot of the current model.
    pub async fn model(&self) -> RadioModel {
        self.inner.model.lock().await.clone()
    }

    /// Connect to a radio on the LAN by address.
    pub async fn connect_lan(&self, host: IpAddr, port: u16) -> Result<()> {
        let target = StreamingTarget {
            ip: host,
            udp_port: DAX_RX_PORT,
            local_udp_port: self.inner.options.dax_rx_port,
            wan: false,
        };
        let endpoint = ControlEndpoint {
            host: host.to_string(),
            port,
            kind: ConnectionKind::Lan,
        };
        self.connect_control(endpoint, target, None).await
    }

    /// Connect to a discovered LAN radio.
    pub async fn connect_radio(&self, radio: &DiscoveredRadio) -> Result<()> {
        self.connect_lan(radio.ip, radio.port).await
    }

    /// Connect to a WAN radio through the SmartLink broker.
    ///
    /// Choreography: acquire a bearer token, register with the broker,
    /// request a connection, wait for the one-time `wanHandle`, then
    /// bring up the TLS control session and thread the handle into its
    /// early post-handshake phase.
    pub async fn connect_wan(
        &self,
        radio: &DiscoveredRadio,
        tokens: &dyn TokenProvider,
    ) -> Result<()> {
        let wan = radio
            .wan
            .clone()
            .ok_or_else(|| Error::InvalidParameter("radio has no WAN endpoints".into()))?;

        let token = tokens.ensure_valid_token().await?;

        let (broker, mut broker_events) = BrokerClient::connect(BrokerRegistration {
            app_name: self.inner.options.client_name.clone(),
            platform: self.inner.options.platform.clone(),
            token,
        })
        .await?;
        broker.request_connect(&radio.serial).await?;

        let wan_handle = wait_for_handle(&mut broker_events, &radio.serial).await?;

        // Keep the broker session for radio-list updates; it plays no
        // further part in this connection.
        {
            let mut slot = self.inner.broker.lock().await;
            if let Some(old) = slot.replace(broker) {
                old.close().await;
            }
        }
        // Forward subsequent broker events into the discovery layer via
        // the radio event bus.
        let event_tx = self.inner.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = broker_events.recv().await {
                if let BrokerEvent::RadioListed(radio) = event {
                    let _ = event_tx.send(RadioEvent::RadioUpdated { radio });
                }
            }
        });

        let public_ip: IpAddr = wan
            .public_ip
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid public IP: {}", wan.public_ip)))?;

        let target = StreamingTarget {
            ip: public_ip,
            udp_port: wan.public_udp_port,
            local_udp_port: wan.public_udp_port,
            wan: true,
        };
        let endpoint = ControlEndpoint {
            host: wan.public_ip.clone(),
            port: wan.public_tls_port,
            kind: ConnectionKind::Wan,
        };
        self.connect_control(endpoint, target, Some(wan_handle)).await
    }

    /// Bring up the control session and run the post-connect
    /// choreography (WAN validation, subscriptions, slice selection).
    async fn connect_control(
        &self,
        endpoint: ControlEndpoint,
        target: StreamingTarget,
        wan_handle: Option<String>,
    ) -> Result<()> {
        // Replace any existing session silently before reconnecting.
        if let Some(old) = self.inner.conn.lock().await.take() {
            old.teardown_silent().await;
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (control_tx, control_rx) = event_channel();

        // The merge task must be listening before the connection emits
        // its first lifecycle event.
        let merge = tokio::spawn(merge_loop(Arc::clone(&self.inner), control_rx, epoch));
        let _ = merge; // detached; exits when the channel closes

        let conn = match ControlConnection::connect(
            &endpoint,
            epoch,
            self.inner.options.control.clone(),
            control_tx,
        )
        .await
        {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                let mut model = self.inner.model.lock().await;
                model.log_error(format!("connect to {}:{} failed: {e}", endpoint.host, endpoint.port));
                let _ = self.inner.event_tx.send(RadioEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        {
            let mut model = self.inner.model.lock().await;
            model.version = conn.version().to_string();
            model.handle = conn.handle().to_string();
            model.kind = Some(endpoint.kind);
        }
        {
            let mut slot = self.inner.conn.lock().await;
            *slot = Some(Arc::clone(&conn));
        }
        {
            let mut slot = self.inner.target.lock().await;
            *slot = Some(target.clone());
        }

        // WAN coda: present the broker handle, then give the radio a
        // moment before the first subscription.
        if let Some(handle) = wan_handle {
            conn.send_no_wait(&codec::cmd_wan_validate(&handle)).await?;
            tokio::time::sleep(WAN_VALIDATE_SETTLE).await;
        }

        self.run_subscriptions(&conn, &target).await?;
        Ok(())
    }

    /// Post-handshake subscription sequence, in protocol order.
    async fn run_subscriptions(
        &self,
        conn: &ControlConnection,
        target: &StreamingTarget,
    ) -> Result<()> {
        let options = &self.inner.options;

        conn.send_no_wait(&codec::cmd_client_program(&options.client_name))
            .await?;
        conn.send_no_wait(&codec::cmd_client_udpport(target.local_udp_port))
            .await?;
        if target.wan {
            conn.send_no_wait(&codec::cmd_client_ip()).await?;
        }
        for sub in ["radio", "slice all", "meter list", "audio stream"] {
            conn.send_no_wait(&codec::cmd_subscribe(sub)).await?;
        }
        conn.send_no_wait(&codec::cmd_eq_info(EqType::Rx)).await?;
        conn.send_no_wait(&codec::cmd_eq_info(EqType::Tx)).await?;

        // Pick the first existing slice, or create one.
        let list = conn.send(&codec::cmd_slice_list()).await?;
        let index = match first_slice_index(&list) {
            Some(index) => index,
            None => {
                let created = conn
                    .send(&codec::cmd_slice_create(
                        DEFAULT_SLICE_FREQ_HZ,
                        DEFAULT_SLICE_ANT,
                        SliceMode::Usb,
                    ))
                    .await?;
                created
                    .trim()
                    .trim_end_matches('|')
                    .trim()
                    .parse::<u8>()
                    .unwrap_or(0)
            }
        };

        let mut model = self.inner.model.lock().await;
        model.slice = Some(SliceState {
            index,
            ..SliceState::default()
        });
        Ok(())
    }

    /// Disconnect and tear everything down. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.teardown_dax().await;

        if let Some(broker) = self.inner.broker.lock().await.take() {
            broker.close().await;
        }

        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.disconnect().await?;
        }

        let mut model = self.inner.model.lock().await;
        model.reset_session();
        Ok(())
    }

    /// Whether the control session is live.
    pub async fn is_connected(&self) -> bool {
        match self.inner.conn.lock().await.as_ref() {
            Some(conn) => conn.is_connected(),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Slice and EQ commands
    // -----------------------------------------------------------------------

    /// Tune the active slice.
    pub async fn tune(&self, freq_hz: u64) -> Result<()> {
        let (conn, index) = self.conn_and_slice().await?;
        conn.send(&codec::cmd_slice_tune(index, freq_hz)).await?;
        Ok(())
    }

    /// Set the active slice's mode.
    pub async fn set_mode(&self, mode: SliceMode) -> Result<()> {
        self.slice_set("mode", mode.as_str()).await
    }

    /// Set the active slice's filter edges.
    pub async fn set_filter(&self, lo: i32, hi: i32) -> Result<()> {
        let (conn, index) = self.conn_and_slice().await?;
        conn.send(&format!("slice set {index} filter_lo={lo} filter_hi={hi}"))
            .await?;
        Ok(())
    }

    /// Set one key on the active slice (`nr`, `nb`, `anf`, `agc_mode`,
    /// `agc_threshold`, `rfgain`, `audio_level`, `rxant`...).
    pub async fn slice_set(&self, key: &str, value: &str) -> Result<()> {
        let (conn, index) = self.conn_and_slice().await?;
        conn.send(&codec::cmd_slice_set(index, key, value)).await?;
        Ok(())
    }

    /// Remove the active slice from the radio.
    pub async fn remove_slice(&self) -> Result<()> {
        let (conn, index) = self.conn_and_slice().await?;
        conn.send(&codec::cmd_slice_remove(index)).await?;
        let mut model = self.inner.model.lock().await;
        model.slice = None;
        Ok(())
    }

    /// Enable or disable an equalizer.
    pub async fn set_eq_enabled(&self, eq: EqType, enabled: bool) -> Result<()> {
        let conn = self.require_conn().await?;
        conn.send(&codec::cmd_eq_mode(eq, enabled)).await?;
        let mut model = self.inner.model.lock().await;
        let state = match eq {
            EqType::Rx => &mut model.rx_eq,
            EqType::Tx => &mut model.tx_eq,
        };
        state.enabled = enabled;
        let _ = self.inner.event_tx.send(RadioEvent::EqUpdated { eq });
        Ok(())
    }

    /// Set a single equalizer band, in dB.
    pub async fn set_eq_band(&self, eq: EqType, band_hz: u16, value: i32) -> Result<()> {
        let index = crate::state::EqualizerState::band_index(band_hz)
            .ok_or_else(|| Error::InvalidParameter(format!("no EQ band at {band_hz} Hz")))?;
        let value = value.clamp(-10, 10);

        let conn = self.require_conn().await?;
        conn.send(&codec::cmd_eq_band(eq, band_hz, value)).await?;

        let mut model = self.inner.model.lock().await;
        let state = match eq {
            EqType::Rx => &mut model.rx_eq,
            EqType::Tx => &mut model.tx_eq,
        };
        state.bands[index] = value;
        let _ = self.inner.event_tx.send(RadioEvent::EqUpdated { eq });
        Ok(())
    }

    /// Zero all eight bands of an equalizer with one command.
    pub async fn eq_flat(&self, eq: EqType) -> Result<()> {
        let conn = self.require_conn().await?;
        conn.send(&codec::cmd_eq_flat(eq)).await?;
        let mut model = self.inner.model.lock().await;
        let state = match eq {
            EqType::Rx => &mut model.rx_eq,
            EqType::Tx => &mut model.tx_eq,
        };
        state.bands = [0; 8];
        let _ = self.inner.event_tx.send(RadioEvent::EqUpdated { eq });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DAX audio
    // -----------------------------------------------------------------------

    /// Start DAX audio: bind the RX port, create both streams, install
    /// the RX filter, and return the decoded-audio receiver.
    pub async fn start_dax(&self) -> Result<AudioReceiver> {
        let conn = self.require_conn().await?;
        let target = self
            .inner
            .target
            .lock()
            .await
            .clone()
            .ok_or(Error::NotConnected)?;

        // Bind the UDP port before asking the radio to stream to it.
        let (audio_tx, audio_rx) = mpsc::channel(64);
        let nr = self.inner.noise_reduction.lock().await.clone();
        let rx_stream = DaxRxStream::start(
            DaxRxOptions {
                port: target.local_udp_port,
                wan: target.wan,
            },
            nr,
            audio_tx,
            self.inner.event_tx.clone(),
        )?;

        // Re-register the actually-bound port (it differs when the
        // configured port was 0).
        conn.send_no_wait(&codec::cmd_client_udpport(rx_stream.local_port()))
            .await?;
        if target.wan {
            conn.send_no_wait(&codec::cmd_client_udp_register(conn.handle()))
                .await?;
        }

        let rx_message = conn
            .send(&codec::cmd_stream_create_dax_rx(self.inner.options.dax_channel))
            .await?;
        let rx_id = codec::parse_stream_id(&rx_message)?;
        rx_stream.set_stream_id(rx_id);

        let tx_message = conn.send(&codec::cmd_stream_create_dax_tx()).await?;
        let tx_id = codec::parse_stream_id(&tx_message)?;

        {
            let mut model = self.inner.model.lock().await;
            model.streams.rx = Some(rx_id);
            model.streams.tx = Some(tx_id);
        }
        {
            let mut slot = self.inner.dax_rx.lock().await;
            if let Some(old) = slot.replace(rx_stream) {
                old.stop();
            }
        }

        // Legacy slice-DAX assignment for old firmware; the radio
        // ignores whichever mechanism does not apply.
        if let Ok((conn, index)) = self.conn_and_slice().await {
            let _ = conn
                .send_no_wait(&codec::cmd_slice_set(index, "dax", "1"))
                .await;
        }

        let _ = self.inner.event_tx.send(RadioEvent::AudioStarted);
        Ok(AudioReceiver::new(audio_rx))
    }

    /// Stop DAX audio: remove the streams on the radio, tear down both
    /// pipelines, clear counters and stream IDs.
    pub async fn stop_dax(&self) -> Result<()> {
        let streams = {
            let model = self.inner.model.lock().await;
            model.streams
        };

        // Best-effort removal while still connected.
        if let Some(conn) = self.inner.conn.lock().await.as_ref() {
            if conn.is_connected() {
                for id in [streams.rx, streams.tx].into_iter().flatten() {
                    let _ = conn.send_no_wait(&codec::cmd_stream_remove(id)).await;
                }
                if let Some(index) = {
                    let model = self.inner.model.lock().await;
                    model.slice.as_ref().map(|s| s.index)
                } {
                    let _ = conn
                        .send_no_wait(&codec::cmd_slice_set(index, "dax", "0"))
                        .await;
                }
            }
        }

        self.teardown_dax().await;

        let mut model = self.inner.model.lock().await;
        model.streams.clear();
        model.rx_packets = 0;
        let _ = self.inner.event_tx.send(RadioEvent::AudioStopped);
        Ok(())
    }

    /// Key or unkey the transmitter.
    ///
    /// Optimistically updates the TX flag; a later slice status `tx=`
    /// reconciles. With mic TX enabled, PTT-down starts the mic pipeline
    /// and returns the realtime handle for the host audio unit; PTT-up
    /// stops it.
    pub async fn set_ptt(&self, on: bool) -> Result<Option<MicTxHandle>> {
        let conn = self.require_conn().await?;
        conn.send_no_wait(&codec::cmd_xmit(on)).await?;

        {
            let mut model = self.inner.model.lock().await;
            model.transmitting = on;
        }
        let _ = self.inner.event_tx.send(RadioEvent::PttChanged { on });

        if !self.inner.options.mic_tx_enabled {
            return Ok(None);
        }

        if on {
            let (tx_id, target) = {
                let model = self.inner.model.lock().await;
                let target = self.inner.target.lock().await.clone();
                (model.streams.tx, target)
            };
            let Some(tx_id) = tx_id else {
                let mut model = self.inner.model.lock().await;
                model.log_error("PTT with mic TX but no TX stream; start DAX first");
                return Ok(None);
            };
            let Some(target) = target else {
                return Err(Error::NotConnected);
            };

            let (pipeline, handle) = MicTxPipeline::start(DaxTxOptions {
                dest: std::net::SocketAddr::new(target.ip, target.udp_port),
                stream_id: tx_id,
                input_rate: self.inner.options.mic_input_rate,
            })?;
            let mut slot = self.inner.dax_tx.lock().await;
            if let Some(mut old) = slot.replace(pipeline) {
                old.stop();
            }
            Ok(Some(handle))
        } else {
            let mut slot = self.inner.dax_tx.lock().await;
            if let Some(mut pipeline) = slot.take() {
                pipeline.stop();
            }
            Ok(None)
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn require_conn(&self) -> Result<Arc<ControlConnection>> {
        let slot = self.inner.conn.lock().await;
        match slot.as_ref() {
            Some(conn) if conn.is_connected() => Ok(Arc::clone(conn)),
            _ => Err(Error::NotConnected),
        }
    }

    async fn conn_and_slice(&self) -> Result<(Arc<ControlConnection>, u8)> {
        let conn = self.require_conn().await?;
        let model = self.inner.model.lock().await;
        let index = model
            .slice
            .as_ref()
            .map(|s| s.index)
            .ok_or_else(|| Error::InvalidParameter("no active slice".into()))?;
        Ok((conn, index))
    }

    async fn teardown_dax(&self) {
        if let Some(rx) = self.inner.dax_rx.lock().await.take() {
            rx.stop();
        }
        if let Some(mut tx) = self.inner.dax_tx.lock().await.take() {
            tx.stop();
        }
    }
}

/// Wait for the broker's `connect_ready` for the requested radio.
async fn wait_for_handle(
    events: &mut mpsc::Receiver<BrokerEvent>,
    serial: &str,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + BROKER_CONNECT_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or_else(|| Error::Auth("broker session closed before connect_ready".into()))?;
        match event {
            BrokerEvent::ConnectReady { wan_handle, serial: s }
                if s.is_empty() || s == serial =>
            {
                return Ok(wan_handle);
            }
            BrokerEvent::Closed { error } => {
                return Err(Error::Auth(format!(
                    "broker session closed: {}",
                    error.unwrap_or_else(|| "no error".into())
                )));
            }
            _ => continue,
        }
    }
}

/// Parse the first slice index out of a `slice list` response message.
fn first_slice_index(message: &str) -> Option<u8> {
    message
        .trim()
        .trim_end_matches('|')
        .split_whitespace()
        .find_map(|token| token.parse::<u8>().ok())
}

// ---------------------------------------------------------------------------
// Event merge task
// ---------------------------------------------------------------------------

/// Consume control events for one connection epoch and fold them into
/// the model. Exits when the channel closes.
async fn merge_loop(
    inner: Arc<Inner>,
    mut control_rx: mpsc::Receiver<ControlEvent>,
    epoch: u64,
) {
    while let Some(event) = control_rx.recv().await {
        // Stale-epoch events are dropped wholesale.
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            tracing::trace!(epoch, "Dropping event from superseded connection");
            continue;
        }

        match event {
            ControlEvent::StateChanged { state, .. } => {
                {
                    let mut model = inner.model.lock().await;
                    model.connection = state;
                }
                let _ = inner
                    .event_tx
                    .send(RadioEvent::ConnectionChanged { state });

                if state == ConnectionState::Disconnected {
                    // Stream state dies with the session.
                    if let Some(rx) = inner.dax_rx.lock().await.take() {
                        rx.stop();
                    }
                    if let Some(mut tx) = inner.dax_tx.lock().await.take() {
                        tx.stop();
                    }
                    let mut model = inner.model.lock().await;
                    model.streams.clear();
                    model.transmitting = false;
                }
            }
            ControlEvent::Status { message, .. } => {
                apply_status(&inner, &message.body).await;
            }
            ControlEvent::Meter { raw, .. } => {
                let _ = inner.event_tx.send(RadioEvent::MeterFrame { raw });
            }
        }
    }
}

/// Route one status body into the model.
async fn apply_status(inner: &Arc<Inner>, body: &str) {
    let status = match codec::parse_status_body(body) {
        Ok(status) => status,
        Err(e) => {
            tracing::trace!(error = %e, body = %body, "Unparseable status body");
            return;
        }
    };

    match status.kind {
        codec::StatusKind::Slice => {
            let index = status.slice_index.unwrap_or(0);
            let mut ptt_change = None;
            {
                let mut model = inner.model.lock().await;
                let Some(slice) = model.slice.as_mut() else {
                    return;
                };
                // Only the active slice is merged; others are a
                // higher-layer concern.
                if slice.index != index {
                    return;
                }
                for (key, value) in &status.props {
                    slice.apply(key, value);
                }
                if status.props.iter().any(|(k, _)| k == "tx") {
                    let tx = model.slice.as_ref().map(|s| s.tx).unwrap_or(false);
                    if model.transmitting != tx {
                        model.transmitting = tx;
                        ptt_change = Some(tx);
                    }
                }
            }
            let _ = inner.event_tx.send(RadioEvent::SliceUpdated { index });
            if let Some(on) = ptt_change {
                let _ = inner.event_tx.send(RadioEvent::PttChanged { on });
            }
        }
        codec::StatusKind::Eq => {
            let Some(eq) = status.eq else { return };
            {
                let mut model = inner.model.lock().await;
                let state = match eq {
                    EqType::Rx => &mut model.rx_eq,
                    EqType::Tx => &mut model.tx_eq,
                };
                state.apply(&status.props);
            }
            let _ = inner.event_tx.send(RadioEvent::EqUpdated { eq });
        }
        codec::StatusKind::AudioStream => {
            // Late `in_use=0` may precede straggler data packets; the
            // stream-ID filter already discards those.
            tracing::trace!(body = %body, "Audio stream status");
        }
        codec::StatusKind::Radio
        | codec::StatusKind::Meter
        | codec::StatusKind::Display
        | codec::StatusKind::SliceList
        | codec::StatusKind::Other => {
            tracing::trace!(object = %status.object, "Unhandled status object");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// Scripted SmartSDR mock: handshakes, answers every command with a
    /// success response (stream creates get stream IDs, `slice list`
    /// gets a configurable body), records command bodies, and forwards
    /// injected status lines.
    struct MockRadio {
        port: u16,
        commands: Arc<StdMutex<Vec<String>>>,
        inject_tx: mpsc::Sender<String>,
        task: tokio::task::JoinHandle<()>,
    }

    impl MockRadio {
        async fn start(slice_list: &'static str) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let commands: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
            let (inject_tx, mut inject_rx) = mpsc::channel::<String>(16);

            let recorded = Arc::clone(&commands);
            let task = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                write_half.write_all(b"V3.6.12\nH12AB\n").await.unwrap();
                write_half.flush().await.unwrap();

                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                loop {
                    line.clear();
                    tokio::select! {
                        Some(status) = inject_rx.recv() => {
                            write_half.write_all(status.as_bytes()).await.unwrap();
                            write_half.write_all(b"\n").await.unwrap();
                            write_half.flush().await.unwrap();
                        }
                        read = reader.read_line(&mut line) => {
                            if read.unwrap_or(0) == 0 {
                                break;
                            }
                            let trimmed = line.trim();
                            let Some(pipe) = trimmed.find('|') else { continue };
                            let seq = &trimmed[1..pipe];
                            let body = trimmed[pipe + 1..].to_string();
                            recorded.lock().unwrap().push(body.clone());

                            let reply = if body.starts_with("slice list") {
                                format!("R{seq}|0|{slice_list}\n")
                            } else if body.starts_with("stream create type=dax_rx") {
                                format!("R{seq}|0|0x40000009|\n")
                            } else if body.starts_with("stream create type=dax_tx") {
                                format!("R{seq}|0|0xC0000002|\n")
                            } else if body.starts_with("slice create") {
                                format!("R{seq}|0|0\n")
                            } else {
                                format!("R{seq}|00000000|\n")
                            };
                            write_half.write_all(reply.as_bytes()).await.unwrap();
                            write_half.flush().await.unwrap();
                        }
                    }
                }
            });

            MockRadio {
                port,
                commands,
                inject_tx,
                task,
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        async fn inject_status(&self, body: &str) {
            self.inject_tx
                .send(format!("S12AB|{body}"))
                .await
                .unwrap();
        }
    }

    fn test_options() -> RadioOptions {
        RadioOptions {
            dax_rx_port: 0,
            ..RadioOptions::default()
        }
    }

    async fn connected_radio(mock: &MockRadio) -> Radio {
        let radio = Radio::new(test_options());
        radio
            .connect_lan("127.0.0.1".parse().unwrap(), mock.port)
            .await
            .unwrap();
        radio
    }

    /// Wait until the mock has recorded a command matching `needle`.
    async fn wait_for_command(mock: &MockRadio, needle: &str) {
        for _ in 0..50 {
            if mock.commands().iter().any(|c| c.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("command {needle:?} never sent; saw {:?}", mock.commands());
    }

    #[tokio::test]
    async fn connect_runs_subscription_sequence_in_order() {
        let mock = MockRadio::start("0 1").await;
        let radio = connected_radio(&mock).await;

        wait_for_command(&mock, "slice list").await;
        let commands = mock.commands();

        let expected_prefix = [
            "client program flexlink",
            "client udpport 0",
            "sub radio",
            "sub slice all",
            "sub meter list",
            "sub audio stream",
            "eq rxsc info",
            "eq txsc info",
            "slice list",
        ];
        assert_eq!(commands.len(), expected_prefix.len());
        for (command, expected) in commands.iter().zip(expected_prefix) {
            assert_eq!(command, expected);
        }

        // First listed slice becomes the active one; no create issued.
        let model = radio.model().await;
        assert_eq!(model.slice.as_ref().map(|s| s.index), Some(0));
        assert_eq!(model.version, "3.6.12");
        assert_eq!(model.handle, "12AB");

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn empty_slice_list_creates_default_slice() {
        let mock = MockRadio::start("").await;
        let radio = connected_radio(&mock).await;

        wait_for_command(&mock, "slice create").await;
        let commands = mock.commands();
        assert!(
            commands
                .iter()
                .any(|c| c == "slice create freq=14.225000 ant=ANT1 mode=USB"),
            "saw {commands:?}"
        );
        assert_eq!(radio.model().await.slice.map(|s| s.index), Some(0));

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn slice_status_merges_into_active_slice() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;
        let mut events = radio.subscribe();

        mock.inject_status(
            "slice 0 rf_frequency=14.225000 mode=USB nr=1 filter_lo=200 filter_hi=2700",
        )
        .await;

        // Wait for the SliceUpdated event.
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for SliceUpdated")
                .unwrap()
            {
                RadioEvent::SliceUpdated { index } => {
                    assert_eq!(index, 0);
                    break;
                }
                _ => continue,
            }
        }

        let model = radio.model().await;
        let slice = model.slice.unwrap();
        assert_eq!(slice.frequency_hz, 14_225_000);
        assert_eq!(slice.mode, Some(SliceMode::Usb));
        assert!(slice.nr);
        assert_eq!(slice.filter_lo, 200);
        assert_eq!(slice.filter_hi, 2700);

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn other_slice_status_ignored() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;
        let mut events = radio.subscribe();

        mock.inject_status("slice 3 rf_frequency=7.074000").await;
        mock.inject_status("slice 0 rf_frequency=14.225000").await;

        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                RadioEvent::SliceUpdated { .. } => break,
                _ => continue,
            }
        }

        let model = radio.model().await;
        // Slice 3's frequency never landed on the active slice.
        assert_eq!(model.slice.unwrap().frequency_hz, 14_225_000);

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn eq_status_round_trip() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;
        let mut events = radio.subscribe();

        // Command side: capital Hz.
        radio.set_eq_band(EqType::Rx, 63, 3).await.unwrap();
        wait_for_command(&mock, "eq rxsc 63Hz=3").await;

        // Status side: lowercase hz, full band set.
        mock.inject_status("eq rxsc mode=1 63hz=3 125hz=0 250hz=0 500hz=0 1000hz=0 2000hz=0 4000hz=0 8000hz=0")
            .await;

        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                RadioEvent::EqUpdated { eq: EqType::Rx } => break,
                _ => continue,
            }
        }

        // There may be two EqUpdated events (local + status); the model
        // must settle on the status values.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let model = radio.model().await;
        assert!(model.rx_eq.enabled);
        assert_eq!(model.rx_eq.bands, [3, 0, 0, 0, 0, 0, 0, 0]);

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn dax_start_creates_streams_and_filters() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;

        let _audio = radio.start_dax().await.unwrap();

        let model = radio.model().await;
        assert_eq!(model.streams.rx, Some(0x4000_0009));
        assert_eq!(model.streams.tx, Some(0xC000_0002));

        let commands = mock.commands();
        assert!(commands
            .iter()
            .any(|c| c == "stream create type=dax_rx dax_channel=1"));
        assert!(commands.iter().any(|c| c == "stream create type=dax_tx"));
        wait_for_command(&mock, "slice set 0 dax=1").await;

        radio.stop_dax().await.unwrap();
        wait_for_command(&mock, "stream remove 0x40000009").await;
        wait_for_command(&mock, "stream remove 0xC0000002").await;
        wait_for_command(&mock, "slice set 0 dax=0").await;

        let model = radio.model().await;
        assert_eq!(model.streams.rx, None);
        assert_eq!(model.streams.tx, None);

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn ptt_optimistic_then_reconciled() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;

        let handle = radio.set_ptt(true).await.unwrap();
        assert!(handle.is_none(), "mic TX disabled by default");
        wait_for_command(&mock, "xmit 1").await;
        assert!(radio.model().await.transmitting, "optimistic TX flag");

        // The radio reports the slice is no longer transmitting.
        let mut events = radio.subscribe();
        mock.inject_status("slice 0 tx=0").await;
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                RadioEvent::PttChanged { on } => {
                    assert!(!on);
                    break;
                }
                _ => continue,
            }
        }
        assert!(!radio.model().await.transmitting, "reconciled from status");

        radio.set_ptt(false).await.unwrap();
        wait_for_command(&mock, "xmit 0").await;

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn mic_tx_starts_on_ptt_down() {
        let mock = MockRadio::start("0").await;
        let radio = Radio::new(RadioOptions {
            mic_tx_enabled: true,
            ..test_options()
        });
        radio
            .connect_lan("127.0.0.1".parse().unwrap(), mock.port)
            .await
            .unwrap();

        // Without DAX, PTT-down cannot start mic TX and logs instead.
        let handle = radio.set_ptt(true).await.unwrap();
        assert!(handle.is_none());
        assert_eq!(radio.model().await.errors.len(), 1);
        radio.set_ptt(false).await.unwrap();

        let _audio = radio.start_dax().await.unwrap();
        let handle = radio.set_ptt(true).await.unwrap();
        assert!(handle.is_some(), "mic handle returned on PTT-down");

        radio.set_ptt(false).await.unwrap();
        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;

        radio.disconnect().await.unwrap();
        assert!(!radio.is_connected().await);
        let model = radio.model().await;
        assert_eq!(model.connection, ConnectionState::Disconnected);
        assert!(model.handle.is_empty());

        // Again: no-op.
        radio.disconnect().await.unwrap();

        // Commands now fail fast.
        assert!(matches!(radio.tune(14_250_000).await, Err(Error::NotConnected)));

        mock.task.abort();
    }

    #[tokio::test]
    async fn meter_frames_surface_as_events() {
        let mock = MockRadio::start("0").await;
        let radio = connected_radio(&mock).await;
        let mut events = radio.subscribe();

        mock.inject_tx
            .send("M10000001|opaque meter payload".to_string())
            .await
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for meter frame")
                .unwrap()
            {
                RadioEvent::MeterFrame { raw } => {
                    assert!(raw.starts_with("M10000001"));
                    break;
                }
                _ => continue,
            }
        }

        radio.disconnect().await.unwrap();
        mock.task.abort();
    }

    #[test]
    fn slice_list_parsing() {
        assert_eq!(first_slice_index("0 1 2"), Some(0));
        assert_eq!(first_slice_index("  3 |"), Some(3));
        assert_eq!(first_slice_index(""), None);
        assert_eq!(first_slice_index("   "), None);
    }

    #[tokio::test]
    async fn wait_for_handle_matches_serial() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(BrokerEvent::RadioListed(DiscoveredRadio {
            serial: "OTHER".into(),
            model: "FLEX-6400".into(),
            callsign: String::new(),
            ip: "0.0.0.0".parse().unwrap(),
            port: 4992,
            version: String::new(),
            source: flexlink_core::types::RadioSource::Broker,
            wan: None,
        }))
        .await
        .unwrap();
        tx.send(BrokerEvent::ConnectReady {
            wan_handle: "AB12".into(),
            serial: "1234-5678".into(),
        })
        .await
        .unwrap();

        let handle = wait_for_handle(&mut rx, "1234-5678").await.unwrap();
        assert_eq!(handle, "AB12");
    }

    #[tokio::test]
    async fn wait_for_handle_broker_closed_is_auth_error() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(BrokerEvent::Closed {
            error: Some("rejected".into()),
        })
        .await
        .unwrap();

        let result = wait_for_handle(&mut rx, "X").await;
        assert!(matches!(result, Err(Error::Auth(_))));
    }
}
