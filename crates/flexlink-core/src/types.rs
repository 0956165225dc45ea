//! Core types used throughout flexlink.
//!
//! These are the domain types shared by the protocol codec, the discovery
//! inventory, and the observable radio model: demodulation modes, AGC
//! settings, equalizer identity, connection lifecycle states, and the
//! discovered-radio record.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;

/// Demodulation mode of a slice receiver.
///
/// These are the mode strings SmartSDR uses on the wire (`slice set <n>
/// mode=USB`, status key `mode=...`), always uppercase ASCII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceMode {
    /// Lower sideband voice.
    Lsb,
    /// Upper sideband voice.
    Usb,
    /// CW with upper sideband offset.
    Cw,
    /// CW with lower sideband offset.
    Cwl,
    /// Amplitude modulation.
    Am,
    /// Synchronous AM.
    Sam,
    /// Frequency modulation.
    Fm,
    /// Narrow FM.
    Nfm,
    /// Digital mode, upper sideband.
    Digu,
    /// Digital mode, lower sideband.
    Digl,
    /// Radio teletype.
    Rtty,
}

impl SliceMode {
    /// The wire string for this mode, as SmartSDR expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceMode::Lsb => "LSB",
            SliceMode::Usb => "USB",
            SliceMode::Cw => "CW",
            SliceMode::Cwl => "CWL",
            SliceMode::Am => "AM",
            SliceMode::Sam => "SAM",
            SliceMode::Fm => "FM",
            SliceMode::Nfm => "NFM",
            SliceMode::Digu => "DIGU",
            SliceMode::Digl => "DIGL",
            SliceMode::Rtty => "RTTY",
        }
    }
}

impl fmt::Display for SliceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SliceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LSB" => Ok(SliceMode::Lsb),
            "USB" => Ok(SliceMode::Usb),
            "CW" => Ok(SliceMode::Cw),
            "CWL" => Ok(SliceMode::Cwl),
            "AM" => Ok(SliceMode::Am),
            "SAM" => Ok(SliceMode::Sam),
            "FM" => Ok(SliceMode::Fm),
            "NFM" => Ok(SliceMode::Nfm),
            "DIGU" => Ok(SliceMode::Digu),
            "DIGL" => Ok(SliceMode::Digl),
            "RTTY" => Ok(SliceMode::Rtty),
            other => Err(Error::Protocol(format!("unknown slice mode: {other}"))),
        }
    }
}

/// AGC mode of a slice receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgcMode {
    /// AGC disabled.
    Off,
    /// Slow decay.
    Slow,
    /// Medium decay.
    #[default]
    Med,
    /// Fast decay.
    Fast,
}

impl AgcMode {
    /// The wire string for this AGC mode (lowercase, as SmartSDR uses it).
    pub fn as_str(&self) -> &'static str {
        match self {
            AgcMode::Off => "off",
            AgcMode::Slow => "slow",
            AgcMode::Med => "med",
            AgcMode::Fast => "fast",
        }
    }
}

impl fmt::Display for AgcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(AgcMode::Off),
            "slow" => Ok(AgcMode::Slow),
            "med" | "medium" => Ok(AgcMode::Med),
            "fast" => Ok(AgcMode::Fast),
            other => Err(Error::Protocol(format!("unknown AGC mode: {other}"))),
        }
    }
}

/// Which of the two radio equalizers a command or status line addresses.
///
/// SmartSDR names them `rxsc` (receive) and `txsc` (transmit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EqType {
    /// Receive equalizer (`rxsc`).
    Rx,
    /// Transmit equalizer (`txsc`).
    Tx,
}

impl EqType {
    /// The wire token for this equalizer.
    pub fn as_str(&self) -> &'static str {
        match self {
            EqType::Rx => "rxsc",
            EqType::Tx => "txsc",
        }
    }
}

impl fmt::Display for EqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EqType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rxsc" | "rx" => Ok(EqType::Rx),
            "txsc" | "tx" => Ok(EqType::Tx),
            other => Err(Error::Protocol(format!("unknown equalizer: {other}"))),
        }
    }
}

/// Lifecycle state of the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection established.
    #[default]
    Disconnected,
    /// TCP/TLS connect and handshake in progress.
    Connecting,
    /// Handshake complete; commands may be sent.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        write!(f, "{s}")
    }
}

/// Whether a control session runs over the LAN (plain TCP) or the WAN
/// (TLS via a broker-issued handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Plain TCP on the local network, port 4992.
    Lan,
    /// TLS to the radio's public endpoint, brokered by SmartLink.
    Wan,
}

/// Where a discovery inventory entry came from.
///
/// Only LAN-sourced entries are subject to staleness eviction; broker and
/// manual entries stay until explicitly removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioSource {
    /// Seen via a LAN discovery broadcast.
    Lan,
    /// Reported by the SmartLink broker.
    Broker,
    /// Added by hand (direct IP entry).
    Manual,
}

/// Public endpoints for reaching a radio over the WAN.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WanEndpoints {
    /// Public IP address as reported by the broker or beacon.
    pub public_ip: String,
    /// TLS control port on the public address (default 4994).
    pub public_tls_port: u16,
    /// UDP streaming port on the public address.
    pub public_udp_port: u16,
    /// Whether the radio currently holds a WAN session.
    pub wan_connected: bool,
}

/// A radio known to the discovery inventory.
///
/// Identified by serial number: two `DiscoveredRadio` values compare equal
/// iff their serials match, regardless of how the rest of the record has
/// drifted between beacons.
#[derive(Debug, Clone)]
pub struct DiscoveredRadio {
    /// Radio serial number (the identity key).
    pub serial: String,
    /// Model name (e.g. "FLEX-6600"), or a generic label if unreported.
    pub model: String,
    /// Operator callsign or station nickname.
    pub callsign: String,
    /// LAN IP address of the radio.
    pub ip: IpAddr,
    /// TCP command port (typically 4992).
    pub port: u16,
    /// Firmware version string.
    pub version: String,
    /// How this entry entered the inventory.
    pub source: RadioSource,
    /// WAN endpoints, when known (broker entries and WAN-enabled beacons).
    pub wan: Option<WanEndpoints>,
}

impl PartialEq for DiscoveredRadio {
    fn eq(&self, other: &Self) -> bool {
        self.serial == other.serial
    }
}

impl Eq for DiscoveredRadio {}

impl std::hash::Hash for DiscoveredRadio {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.serial.hash(state);
    }
}

impl fmt::Display for DiscoveredRadio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}:{}", self.model, self.serial, self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_mode_round_trip() {
        let modes = [
            SliceMode::Lsb,
            SliceMode::Usb,
            SliceMode::Cw,
            SliceMode::Cwl,
            SliceMode::Am,
            SliceMode::Sam,
            SliceMode::Fm,
            SliceMode::Nfm,
            SliceMode::Digu,
            SliceMode::Digl,
            SliceMode::Rtty,
        ];
        for mode in modes {
            let s = mode.as_str();
            assert_eq!(s.parse::<SliceMode>().unwrap(), mode, "mode {s}");
        }
    }

    #[test]
    fn slice_mode_case_insensitive() {
        assert_eq!("usb".parse::<SliceMode>().unwrap(), SliceMode::Usb);
        assert_eq!("DigU".parse::<SliceMode>().unwrap(), SliceMode::Digu);
    }

    #[test]
    fn slice_mode_unknown() {
        assert!("WFM".parse::<SliceMode>().is_err());
        assert!("".parse::<SliceMode>().is_err());
    }

    #[test]
    fn agc_mode_round_trip() {
        for agc in [AgcMode::Off, AgcMode::Slow, AgcMode::Med, AgcMode::Fast] {
            assert_eq!(agc.as_str().parse::<AgcMode>().unwrap(), agc);
        }
    }

    #[test]
    fn agc_mode_medium_alias() {
        assert_eq!("medium".parse::<AgcMode>().unwrap(), AgcMode::Med);
    }

    #[test]
    fn eq_type_tokens() {
        assert_eq!(EqType::Rx.as_str(), "rxsc");
        assert_eq!(EqType::Tx.as_str(), "txsc");
        assert_eq!("rxsc".parse::<EqType>().unwrap(), EqType::Rx);
        assert_eq!("txsc".parse::<EqType>().unwrap(), EqType::Tx);
        assert!("mic".parse::<EqType>().is_err());
    }

    #[test]
    fn connection_state_default() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn discovered_radio_equality_by_serial() {
        let a = DiscoveredRadio {
            serial: "ABC123".into(),
            model: "FLEX-6600".into(),
            callsign: "W9XYZ".into(),
            ip: "192.168.1.20".parse().unwrap(),
            port: 4992,
            version: "3.6.12".into(),
            source: RadioSource::Lan,
            wan: None,
        };
        let mut b = a.clone();
        b.model = "FLEX-6400".into();
        b.ip = "10.0.0.7".parse().unwrap();
        b.source = RadioSource::Broker;

        assert_eq!(a, b, "same serial must compare equal");

        let mut c = a.clone();
        c.serial = "XYZ999".into();
        assert_ne!(a, c);
    }

    #[test]
    fn discovered_radio_display() {
        let r = DiscoveredRadio {
            serial: "1234-5678".into(),
            model: "FLEX-6400".into(),
            callsign: "".into(),
            ip: "192.168.1.5".parse().unwrap(),
            port: 4992,
            version: "3.5.1".into(),
            source: RadioSource::Manual,
            wan: None,
        };
        assert_eq!(r.to_string(), "FLEX-6400 (1234-5678) at 192.168.1.5:4992");
    }
}
