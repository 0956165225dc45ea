//! flexlink: SmartSDR protocol engine for FlexRadio 6000-series
//! transceivers.
//!
//! A FlexRadio exposes three surfaces over IP: a line-oriented ASCII
//! control channel (TCP on the LAN, TLS on the WAN), a binary VITA-49
//! streaming channel (UDP) for DAX audio and discovery, and the
//! SmartLink broker (TLS) that arbitrates WAN sessions. This crate
//! negotiates all three concurrently and presents a single observable
//! radio-state model:
//!
//! - **Protocol codec** ([`codec`]) -- command builders and `V/H/R/S/M`
//!   line parsing with key=value status bodies.
//! - **VITA-49 codec** ([`vita49`]) -- flag-driven header parse, DAX TX
//!   packet emission, discovery payload decoding.
//! - **Discovery** ([`discovery`]) -- staleness-evicted LAN inventory
//!   fed by broadcast beacons on UDP 4992.
//! - **Control connection** ([`control`]) -- handshake, sequenced
//!   request/response correlation, status dispatch, keepalive.
//! - **Broker client** ([`broker`]) -- SmartLink registration, WAN
//!   radio inventory, and `wanHandle` delivery.
//! - **DAX RX** ([`dax_rx`]) -- stream-ID-filtered UDP receive with
//!   float (LAN) and Opus (WAN) decode paths, delivered as 48 kHz mono.
//! - **Mic TX** ([`dax_tx`]) -- lock-free realtime handoff, 20 ms frame
//!   assembly, VITA-49 packetization.
//! - **Radio** ([`radio`]) -- the observable model fusing responses,
//!   status lines, and stream events, with the connect/DAX/PTT
//!   choreography.
//!
//! # Example
//!
//! ```no_run
//! use flexlink::discovery;
//! use flexlink::radio::{Radio, RadioOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> flexlink_core::Result<()> {
//! let radios = discovery::discover(Duration::from_secs(3)).await?;
//! if let Some(found) = radios.first() {
//!     let radio = Radio::new(RadioOptions::default());
//!     radio.connect_radio(found).await?;
//!     let mut audio = radio.start_dax().await?;
//!     while let Some(buffer) = audio.recv().await {
//!         // 48 kHz mono f32, ready for playback.
//!         let _ = buffer;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod control;
pub mod dax_rx;
pub mod dax_tx;
pub mod discovery;
pub mod radio;
pub mod resample;
pub mod state;
pub mod vita49;

pub use broker::{BrokerClient, BrokerEvent, BrokerRegistration};
pub use control::{ControlConnection, ControlEndpoint, ControlOptions};
pub use dax_rx::{DaxRxOptions, DaxRxStream};
pub use dax_tx::{DaxTxOptions, MicTxHandle, MicTxPipeline};
pub use discovery::{DiscoveryEvent, DiscoveryListener};
pub use radio::{Radio, RadioOptions};
pub use state::{EqualizerState, RadioModel, SliceState, StreamBinding};

// Re-export the shared vocabulary so applications can depend on this
// crate alone.
pub use flexlink_core::{
    AudioBuffer, AudioReceiver, DiscoveredRadio, Error, RadioEvent, Result, SliceMode,
};
