//! Observable radio events.
//!
//! Events are emitted by the engine through a [`tokio::sync::broadcast`]
//! channel whenever the radio model changes: connection lifecycle, slice
//! and equalizer updates, discovery inventory changes, audio stream
//! lifecycle, and surfaced errors. A GUI or logger subscribes to the
//! stream instead of polling the model.

use crate::types::{ConnectionState, DiscoveredRadio, EqType};

/// An event emitted when observable radio state changes.
///
/// Events are delivered on a best-effort basis through a bounded broadcast
/// channel; slow consumers may miss events under heavy load (e.g. rapid
/// status bursts while tuning).
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// The control connection changed lifecycle state.
    ConnectionChanged {
        /// The new state.
        state: ConnectionState,
    },

    /// A radio entered the discovery inventory.
    RadioDiscovered {
        /// The new inventory entry.
        radio: DiscoveredRadio,
    },

    /// An existing inventory entry was refreshed by a beacon or broker
    /// report.
    RadioUpdated {
        /// The updated entry.
        radio: DiscoveredRadio,
    },

    /// A LAN radio went stale and was evicted, or an entry was explicitly
    /// removed.
    RadioLost {
        /// Serial number of the removed radio.
        serial: String,
    },

    /// A slice's cached state changed (frequency, mode, filter, flags...).
    SliceUpdated {
        /// Index of the slice that changed.
        index: u8,
    },

    /// One of the two equalizers changed (enable flag or band values).
    EqUpdated {
        /// Which equalizer changed.
        eq: EqType,
    },

    /// DAX audio streams were created and the RX pipeline is delivering.
    AudioStarted,

    /// DAX audio streams were removed and the pipelines torn down.
    AudioStopped,

    /// Periodic RX packet statistics, surfaced at most every 100 packets.
    RxAudioStats {
        /// Total packets admitted since the stream started.
        packets: u64,
    },

    /// Push-to-talk state changed (locally commanded or radio-reported).
    PttChanged {
        /// `true` if transmitting.
        on: bool,
    },

    /// A raw meter frame (`M...`) arrived. The engine does not decode
    /// these; a higher layer may.
    MeterFrame {
        /// The line as received, without the trailing newline.
        raw: String,
    },

    /// A user-visible failure was recorded in the error log.
    Error {
        /// Human-readable description.
        message: String,
    },
}
