//! Cached radio state assembled from status lines and stream events.
//!
//! SmartSDR pushes state changes continuously after subscription, so the
//! observable model can answer queries with zero latency. This module
//! defines the state structures; the merge logic lives in
//! [`crate::radio`].

use std::collections::HashMap;

use flexlink_core::types::{AgcMode, ConnectionKind, ConnectionState, EqType, SliceMode};

use crate::codec::{self, EQ_BAND_HZ};

/// Capacity of the bounded error log.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// State of a single slice receiver.
///
/// Populated from `slice` status lines; mutated optimistically by local
/// commands, which the radio then echoes back via status. Unknown status
/// keys are retained verbatim in [`extras`](SliceState::extras) for
/// diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SliceState {
    /// Slice index (0..N).
    pub index: u8,
    /// Frequency in Hz.
    pub frequency_hz: u64,
    /// Demodulation mode.
    pub mode: Option<SliceMode>,
    /// Lower filter edge in Hz (signed; below carrier for LSB modes).
    pub filter_lo: i32,
    /// Upper filter edge in Hz.
    pub filter_hi: i32,
    /// Noise reduction enabled.
    pub nr: bool,
    /// Noise blanker enabled.
    pub nb: bool,
    /// Automatic notch filter enabled.
    pub anf: bool,
    /// AGC mode.
    pub agc_mode: AgcMode,
    /// AGC threshold, 0..100.
    pub agc_threshold: u8,
    /// RF gain in dB.
    pub rf_gain: i32,
    /// Audio level, 0..100.
    pub audio_level: u8,
    /// Selected RX antenna.
    pub rx_ant: String,
    /// Antennas available to this slice.
    pub ant_list: Vec<String>,
    /// Whether this slice is the TX slice.
    pub tx: bool,
    /// Unrecognized status keys, kept verbatim.
    pub extras: HashMap<String, String>,
}

impl SliceState {
    /// Apply one status key=value pair to this slice.
    ///
    /// Recognized keys set their field; anything else lands in `extras`.
    /// Malformed values for recognized keys are ignored rather than
    /// clearing the field.
    pub fn apply(&mut self, key: &str, value: &str) {
        match key {
            "rf_frequency" => {
                if let Ok(mhz) = value.parse::<f64>() {
                    self.frequency_hz = codec::mhz_to_hz(mhz);
                }
            }
            "mode" => {
                if let Ok(mode) = value.parse::<SliceMode>() {
                    self.mode = Some(mode);
                }
            }
            "filter_lo" => {
                if let Ok(v) = value.parse::<i32>() {
                    self.filter_lo = v;
                }
            }
            "filter_hi" => {
                if let Ok(v) = value.parse::<i32>() {
                    self.filter_hi = v;
                }
            }
            "nr" => self.nr = value == "1",
            "nb" => self.nb = value == "1",
            "anf" => self.anf = value == "1",
            "agc_mode" => {
                if let Ok(agc) = value.parse::<AgcMode>() {
                    self.agc_mode = agc;
                }
            }
            "agc_threshold" => {
                if let Ok(v) = value.parse::<u8>() {
                    self.agc_threshold = v.min(100);
                }
            }
            "rfgain" => {
                if let Ok(v) = value.parse::<i32>() {
                    self.rf_gain = v;
                }
            }
            "audio_level" => {
                if let Ok(v) = value.parse::<u8>() {
                    self.audio_level = v.min(100);
                }
            }
            "rxant" => self.rx_ant = value.to_string(),
            "ant_list" => {
                self.ant_list = value.split(',').map(str::to_string).collect();
            }
            "tx" => self.tx = value == "1",
            _ => {
                self.extras.insert(key.to_string(), value.to_string());
            }
        }
    }
}

/// One of the two radio equalizers.
///
/// The band map is fixed: exactly eight entries keyed by
/// [`EQ_BAND_HZ`], values in `[-10, +10]` dB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqualizerState {
    /// Which equalizer this is.
    pub eq: EqType,
    /// Whether the equalizer is engaged.
    pub enabled: bool,
    /// Band gains in dB, indexed in [`EQ_BAND_HZ`] order.
    pub bands: [i32; 8],
}

impl EqualizerState {
    /// A flat, disabled equalizer.
    pub fn new(eq: EqType) -> Self {
        EqualizerState {
            eq,
            enabled: false,
            bands: [0; 8],
        }
    }

    /// Band index for a center frequency, if canonical.
    pub fn band_index(hz: u16) -> Option<usize> {
        EQ_BAND_HZ.iter().position(|&b| b == hz)
    }

    /// Apply parsed status properties: the `mode` flag plus any bands
    /// present. Bands absent from the properties are left unchanged.
    pub fn apply(&mut self, props: &[(String, String)]) {
        for (key, value) in props {
            if key == "mode" {
                self.enabled = value == "1";
            }
        }
        let bands = codec::parse_eq_bands(props);
        for (i, band) in bands.iter().enumerate() {
            if let Some(v) = band {
                self.bands[i] = (*v).clamp(-10, 10);
            }
        }
    }
}

/// The two DAX stream IDs active in a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamBinding {
    /// RX DAX stream ID assigned by the radio, if created.
    pub rx: Option<u32>,
    /// TX DAX stream ID assigned by the radio, if created.
    pub tx: Option<u32>,
}

impl StreamBinding {
    /// Forget both stream IDs (DAX stop, disconnect).
    pub fn clear(&mut self) {
        self.rx = None;
        self.tx = None;
    }
}

/// One entry in the bounded error log.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    /// Monotonic entry number, 1-based.
    pub number: u64,
    /// Human-readable description of the failure.
    pub message: String,
}

/// The complete observable radio model.
///
/// Mutated by the radio's event-merge task and (for optimistic updates)
/// by command APIs; both take the model lock briefly and never across
/// I/O.
#[derive(Debug, Clone)]
pub struct RadioModel {
    /// Control connection lifecycle state.
    pub connection: ConnectionState,
    /// LAN or WAN session, once known.
    pub kind: Option<ConnectionKind>,
    /// Firmware version from the `V` handshake line.
    pub version: String,
    /// Client handle from the `H` handshake line (hex text).
    pub handle: String,
    /// The slice this client is operating.
    pub slice: Option<SliceState>,
    /// Receive equalizer.
    pub rx_eq: EqualizerState,
    /// Transmit equalizer.
    pub tx_eq: EqualizerState,
    /// Active DAX stream IDs.
    pub streams: StreamBinding,
    /// Whether the transmitter is keyed (optimistic on command, then
    /// reconciled from `tx=` status).
    pub transmitting: bool,
    /// RX audio packets admitted since DAX start.
    pub rx_packets: u64,
    /// Bounded log of the last user-visible failures.
    pub errors: std::collections::VecDeque<ErrorEntry>,
    /// Total errors ever logged (drives `ErrorEntry::number`).
    pub error_count: u64,
}

impl Default for RadioModel {
    fn default() -> Self {
        RadioModel {
            connection: ConnectionState::Disconnected,
            kind: None,
            version: String::new(),
            handle: String::new(),
            slice: None,
            rx_eq: EqualizerState::new(EqType::Rx),
            tx_eq: EqualizerState::new(EqType::Tx),
            streams: StreamBinding::default(),
            transmitting: false,
            rx_packets: 0,
            errors: std::collections::VecDeque::new(),
            error_count: 0,
        }
    }
}

impl RadioModel {
    /// Record a user-visible failure, evicting the oldest entry once the
    /// log holds [`ERROR_LOG_CAPACITY`] entries.
    pub fn log_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        if self.errors.len() == ERROR_LOG_CAPACITY {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorEntry {
            number: self.error_count,
            message: message.into(),
        });
    }

    /// Reset per-session state on disconnect. The error log survives.
    pub fn reset_session(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.kind = None;
        self.version.clear();
        self.handle.clear();
        self.slice = None;
        self.rx_eq = EqualizerState::new(EqType::Rx);
        self.tx_eq = EqualizerState::new(EqType::Tx);
        self.streams.clear();
        self.transmitting = false;
        self.rx_packets = 0;
    }
}
