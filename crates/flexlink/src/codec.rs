//! SmartSDR TCP command/response/status encoding and decoding.
//!
//! The SmartSDR text protocol uses newline-terminated ASCII lines over the
//! control channel. Commands flow from client to radio; responses, status
//! messages, meter frames, and handshake lines flow from radio to client.
//!
//! # Line formats
//!
//! ```text
//! Command:   C<seq>|<command_text>\n
//! Response:  R<seq>|<result_code>[|<message>]\n
//! Status:    S<hex_handle>|<object> [<index>] <key>=<value> ...\n
//! Meter:     M...\n                (opaque to this crate)
//! Version:   V<version_string>\n
//! Handle:    H<hex_handle>\n
//! ```
//!
//! All encoding/decoding in this module is pure parsing -- no I/O is
//! performed.

use std::str::FromStr;

use flexlink_core::error::{Error, Result};
use flexlink_core::types::{EqType, SliceMode};

/// Result code for a successful command.
pub const SUCCESS_CODE: &str = "00000000";

/// The eight canonical equalizer band center frequencies in Hz.
pub const EQ_BAND_HZ: [u16; 8] = [63, 125, 250, 500, 1000, 2000, 4000, 8000];

/// Synthetic property key under which an `audio_stream` status line's
/// leading `0x...` stream ID token is retained.
pub const STREAM_ID_KEY: &str = "stream_id";

// ---------------------------------------------------------------------------
// Frequency conversion helpers
// ---------------------------------------------------------------------------

/// Convert frequency in Hz (`u64`) to MHz (`f64`) for SmartSDR commands.
pub fn hz_to_mhz(hz: u64) -> f64 {
    hz as f64 / 1_000_000.0
}

/// Convert frequency in MHz (`f64`) to Hz (`u64`).
pub fn mhz_to_hz(mhz: f64) -> u64 {
    (mhz * 1_000_000.0).round() as u64
}

// ---------------------------------------------------------------------------
// Command encoding
// ---------------------------------------------------------------------------

/// Frame a command body with a sequence number: `C<seq>|<body>\n`.
pub fn encode_command(seq: u32, body: &str) -> Vec<u8> {
    format!("C{seq}|{body}\n").into_bytes()
}

// ---------------------------------------------------------------------------
// Command builders
//
// Each builder returns the command body WITHOUT the `C<seq>|` prefix. The
// prefix is added by the control connection when it assigns a sequence
// number.
// ---------------------------------------------------------------------------

/// `client program <name>` -- register the client program name.
pub fn cmd_client_program(name: &str) -> String {
    format!("client program {name}")
}

/// `client udp_register handle=<hex>` -- register the client handle for
/// UDP stream routing.
pub fn cmd_client_udp_register(handle: &str) -> String {
    format!("client udp_register handle={handle}")
}

/// `client udpport <port>` -- tell the radio which local UDP port we
/// listen on for DAX streams.
pub fn cmd_client_udpport(port: u16) -> String {
    format!("client udpport {port}")
}

/// `client ip` -- ask the radio for our apparent IP (WAN sessions).
pub fn cmd_client_ip() -> String {
    "client ip".to_string()
}

/// `ping` -- keepalive.
pub fn cmd_ping() -> String {
    "ping".to_string()
}

/// `wan validate handle=<hex>` -- present the broker-issued one-time
/// handle over the TLS control channel.
pub fn cmd_wan_validate(wan_handle: &str) -> String {
    format!("wan validate handle={wan_handle}")
}

/// `sub <object>` -- subscribe to status updates for an object class
/// (e.g. `"radio"`, `"slice all"`, `"meter list"`, `"audio stream"`).
pub fn cmd_subscribe(object: &str) -> String {
    format!("sub {object}")
}

/// `slice create freq=<MHz> ant=<name> mode=<mode>`.
pub fn cmd_slice_create(freq_hz: u64, ant: &str, mode: SliceMode) -> String {
    format!(
        "slice create freq={:.6} ant={} mode={}",
        hz_to_mhz(freq_hz),
        ant,
        mode
    )
}

/// `slice t <idx> <MHz>` -- tune a slice.
pub fn cmd_slice_tune(slice_index: u8, freq_hz: u64) -> String {
    format!("slice t {} {:.6}", slice_index, hz_to_mhz(freq_hz))
}

/// `slice set <idx> <key>=<value>` -- set a single slice property.
///
/// Recognized keys include `mode`, `nr`, `nb`, `anf`, `agc_mode`,
/// `agc_threshold`, `rfgain`, `audio_level`, `rxant`, `dax`, `dax_tx`,
/// `filter_lo`, `filter_hi`.
pub fn cmd_slice_set(slice_index: u8, key: &str, value: &str) -> String {
    format!("slice set {slice_index} {key}={value}")
}

/// `slice r <idx>` -- remove a slice.
pub fn cmd_slice_remove(slice_index: u8) -> String {
    format!("slice r {slice_index}")
}

/// `slice list` -- list existing slice indices.
pub fn cmd_slice_list() -> String {
    "slice list".to_string()
}

/// `xmit 1` / `xmit 0` -- key or unkey the transmitter.
pub fn cmd_xmit(on: bool) -> String {
    format!("xmit {}", if on { "1" } else { "0" })
}

/// `eq <rxsc|txsc> mode=<0|1>` -- enable or disable an equalizer.
pub fn cmd_eq_mode(eq: EqType, enabled: bool) -> String {
    format!("eq {} mode={}", eq, if enabled { "1" } else { "0" })
}

/// `eq <rxsc|txsc> <hz>Hz=<v>` -- set a single equalizer band.
///
/// Note the capital `Hz` on the outbound form; inbound status lines use
/// lowercase `hz`.
pub fn cmd_eq_band(eq: EqType, band_hz: u16, value: i32) -> String {
    format!("eq {eq} {band_hz}Hz={value}")
}

/// Set all eight bands of an equalizer to 0 dB in a single command.
pub fn cmd_eq_flat(eq: EqType) -> String {
    let mut body = format!("eq {eq}");
    for hz in EQ_BAND_HZ {
        body.push_str(&format!(" {hz}Hz=0"));
    }
    body
}

/// `eq <rxsc|txsc> info` -- request the current equalizer state.
pub fn cmd_eq_info(eq: EqType) -> String {
    format!("eq {eq} info")
}

/// `stream create type=dax_rx dax_channel=<n>` -- create a DAX RX audio
/// stream. The radio answers with the stream ID in the response message.
pub fn cmd_stream_create_dax_rx(dax_channel: u8) -> String {
    format!("stream create type=dax_rx dax_channel={dax_channel}")
}

/// `stream create type=dax_tx` -- create the DAX TX audio stream.
pub fn cmd_stream_create_dax_tx() -> String {
    "stream create type=dax_tx".to_string()
}

/// `stream remove <hex>` -- remove an active stream by its ID.
pub fn cmd_stream_remove(stream_id: u32) -> String {
    format!("stream remove 0x{stream_id:08X}")
}

// ---------------------------------------------------------------------------
// Received line types
// ---------------------------------------------------------------------------

/// A decoded response to a previously-sent command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Sequence number correlating this response to its command.
    pub sequence: u32,
    /// Result code, kept verbatim. `"00000000"` (or the short form `"0"`)
    /// is success; codes starting with `5` are failures.
    pub result: String,
    /// Free-form message payload. May contain embedded `|` separators,
    /// which are kept verbatim as part of one string.
    pub message: String,
}

impl CommandResponse {
    /// Whether the result code denotes success (numeric value zero).
    pub fn is_success(&self) -> bool {
        u32::from_str_radix(&self.result, 16) == Ok(0)
    }
}

/// A decoded unsolicited status line (`S<handle>|<body>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    /// The client handle the status was addressed to, as hex text.
    pub handle: String,
    /// The raw body after the pipe, before tokenization.
    pub body: String,
}

/// Lines received from the SmartSDR control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Handshake firmware version line: `V3.6.12`.
    Version(String),
    /// Handshake client handle: `H12AB`.
    Handle(String),
    /// Response to a command.
    Response(CommandResponse),
    /// Unsolicited status update.
    Status(StatusMessage),
    /// Meter frame, opaque to the engine. The raw line is retained.
    Meter(String),
    /// Any line with an unrecognized prefix. Ignored by the engine.
    Ignored(String),
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// Parse a single line received from the control channel.
///
/// The line should NOT include the trailing `\n`. Leading/trailing
/// whitespace is stripped for robustness.
pub fn parse_line(line: &str) -> Result<ControlMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty line".into()));
    }

    match line.as_bytes()[0] {
        b'V' => Ok(ControlMessage::Version(line[1..].trim().to_string())),
        b'H' => parse_handle(line),
        b'R' => parse_response(line),
        b'S' => parse_status(line),
        b'M' => Ok(ControlMessage::Meter(line.to_string())),
        _ => Ok(ControlMessage::Ignored(line.to_string())),
    }
}

/// Parse a handle line: `H<hex_digits>`. The handle is validated as hex
/// but kept as text, since it is echoed verbatim into later commands.
fn parse_handle(line: &str) -> Result<ControlMessage> {
    let body = line[1..].trim();
    if body.is_empty() || u32::from_str_radix(body, 16).is_err() {
        return Err(Error::Protocol(format!("invalid hex handle: {body}")));
    }
    Ok(ControlMessage::Handle(body.to_string()))
}

/// Parse a response line: `R<seq>|<result>[|<message>]`.
fn parse_response(line: &str) -> Result<ControlMessage> {
    let body = &line[1..];
    let parts: Vec<&str> = body.splitn(3, '|').collect();
    if parts.len() < 2 {
        return Err(Error::Protocol(format!(
            "malformed response (need at least seq|result): {line}"
        )));
    }

    let sequence = parts[0]
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("invalid response sequence: {}", parts[0])))?;

    let result = parts[1];
    if result.is_empty() || u32::from_str_radix(result, 16).is_err() {
        return Err(Error::Protocol(format!(
            "invalid response result code: {result}"
        )));
    }

    // Everything after the second pipe is the message, verbatim --
    // including any further pipe-separated fragments.
    let message = parts.get(2).copied().unwrap_or("").to_string();

    Ok(ControlMessage::Response(CommandResponse {
        sequence,
        result: result.to_string(),
        message,
    }))
}

/// Parse a status line: `S<hex_handle>|<body>`.
fn parse_status(line: &str) -> Result<ControlMessage> {
    let body = &line[1..];
    let pipe_pos = body
        .find('|')
        .ok_or_else(|| Error::Protocol(format!("malformed status (no pipe): {line}")))?;

    let handle = &body[..pipe_pos];
    if handle.is_empty() || u32::from_str_radix(handle, 16).is_err() {
        return Err(Error::Protocol(format!("invalid status handle: {handle}")));
    }

    Ok(ControlMessage::Status(StatusMessage {
        handle: handle.to_string(),
        body: body[pipe_pos + 1..].to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Status body parsing
// ---------------------------------------------------------------------------

/// Object classes recognized in status bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKind {
    /// `slice <idx> ...`
    Slice,
    /// `eq <rxsc|txsc> ...`
    Eq,
    /// `radio ...`
    Radio,
    /// `audio_stream`, `dax_audio`, or `audio` status.
    AudioStream,
    /// `meter ...`
    Meter,
    /// `panadapter` or `waterfall` status.
    Display,
    /// `slice_list` status.
    SliceList,
    /// Unrecognized object type.
    Other,
}

/// A tokenized status body.
///
/// `object` retains the original (lowercased) object-type token so the
/// body can be re-serialized by [`status_body`] without information loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBody {
    /// Which subsystem this status addresses.
    pub kind: StatusKind,
    /// The original object-type token, lowercased.
    pub object: String,
    /// Slice index for `Slice` statuses. Defaults to 0 when the second
    /// token is not an integer.
    pub slice_index: Option<u8>,
    /// Which equalizer, for `Eq` statuses.
    pub eq: Option<EqType>,
    /// Key-value pairs in line order. Keys are lowercased, values kept
    /// verbatim. An `audio_stream` body's leading `0x...` token is
    /// retained under [`STREAM_ID_KEY`].
    pub props: Vec<(String, String)>,
}

impl StatusBody {
    /// Look up a property value by (lowercase) key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Tokenize a status body into object type, index, and key=value pairs.
///
/// Position-dependent rules:
/// - `slice`: the second token, if parseable as an integer, is the slice
///   index; otherwise the index defaults to 0 and the token stream
///   continues with key=value pairs.
/// - `eq`: the second token selects the equalizer (`rxsc` vs `txsc`).
/// - `audio_stream`: a second token beginning with `0x`/`0X` is the
///   stream ID and is retained under [`STREAM_ID_KEY`].
///
/// Remaining tokens are split once on `=`; the key is lowercased and the
/// value kept verbatim. Tokens without `=` are ignored.
pub fn parse_status_body(body: &str) -> Result<StatusBody> {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(Error::Protocol("empty status body".into()));
    }

    let object = tokens[0].to_lowercase();
    let kind = match object.as_str() {
        "slice" => StatusKind::Slice,
        "eq" => StatusKind::Eq,
        "radio" => StatusKind::Radio,
        "audio_stream" | "dax_audio" | "audio" => StatusKind::AudioStream,
        "meter" => StatusKind::Meter,
        "panadapter" | "waterfall" => StatusKind::Display,
        "slice_list" => StatusKind::SliceList,
        _ => StatusKind::Other,
    };

    let mut slice_index = None;
    let mut eq = None;
    let mut props: Vec<(String, String)> = Vec::new();
    let mut rest = 1;

    match kind {
        StatusKind::Slice => {
            slice_index = Some(0);
            if let Some(token) = tokens.get(1) {
                if let Ok(idx) = token.parse::<u8>() {
                    slice_index = Some(idx);
                    rest = 2;
                }
            }
        }
        StatusKind::Eq => {
            let which = *tokens
                .get(1)
                .ok_or_else(|| Error::Protocol(format!("eq status missing target: {body}")))?;
            eq = Some(EqType::from_str(which)?);
            rest = 2;
        }
        StatusKind::AudioStream => {
            if let Some(token) = tokens.get(1) {
                if token.starts_with("0x") || token.starts_with("0X") {
                    props.push((STREAM_ID_KEY.to_string(), token.to_string()));
                    rest = 2;
                }
            }
        }
        _ => {}
    }

    for token in &tokens[rest..] {
        if let Some(eq_pos) = token.find('=') {
            let key = token[..eq_pos].to_lowercase();
            let value = token[eq_pos + 1..].to_string();
            props.push((key, value));
        }
        // Tokens without '=' after the object prefix are ignored. Real
        // SmartSDR output occasionally contains stray flags here.
    }

    Ok(StatusBody {
        kind,
        object,
        slice_index,
        eq,
        props,
    })
}

/// Re-serialize a tokenized status body.
///
/// The inverse of [`parse_status_body`]: object type, index, and the key
/// set survive a round trip unchanged. The synthetic [`STREAM_ID_KEY`]
/// entry is emitted back as the bare `0x...` token it came from.
pub fn status_body(status: &StatusBody) -> String {
    let mut out = status.object.clone();

    if status.kind == StatusKind::Slice {
        if let Some(idx) = status.slice_index {
            out.push_str(&format!(" {idx}"));
        }
    }
    if let Some(eq) = status.eq {
        out.push_str(&format!(" {eq}"));
    }

    for (key, value) in &status.props {
        if key == STREAM_ID_KEY && status.kind == StatusKind::AudioStream {
            out.push_str(&format!(" {value}"));
        } else {
            out.push_str(&format!(" {key}={value}"));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Equalizer band extraction
// ---------------------------------------------------------------------------

/// Extract the eight equalizer band values from a property list.
///
/// Inbound keys are lowercase (`63hz` .. `8000hz`). A band absent from
/// the properties yields `None` and is left unchanged by the caller.
pub fn parse_eq_bands(props: &[(String, String)]) -> [Option<i32>; 8] {
    let mut bands = [None; 8];
    for (i, hz) in EQ_BAND_HZ.iter().enumerate() {
        let key = format!("{hz}hz");
        if let Some((_, value)) = props.iter().find(|(k, _)| *k == key) {
            if let Ok(v) = value.parse::<i32>() {
                bands[i] = Some(v);
            }
        }
    }
    bands
}

/// Serialize an equalizer state as an inbound-style status body.
///
/// Produces `eq <rxsc|txsc> mode=<0|1> 63hz=<v> ... 8000hz=<v>`, the
/// form [`parse_status_body`] + [`parse_eq_bands`] can read back.
pub fn eq_status_body(eq: EqType, enabled: bool, bands: &[i32; 8]) -> String {
    let mut out = format!("eq {} mode={}", eq, if enabled { "1" } else { "0" });
    for (i, hz) in EQ_BAND_HZ.iter().enumerate() {
        out.push_str(&format!(" {hz}hz={}", bands[i]));
    }
    out
}

// ---------------------------------------------------------------------------
// Stream ID extraction
// ---------------------------------------------------------------------------

/// Parse a stream ID out of a `stream create` success message.
///
/// The radio answers with the hex stream ID in the message field, often
/// with surrounding whitespace and a trailing `|`. Accepts `0x`-prefixed
/// or bare hex.
pub fn parse_stream_id(message: &str) -> Result<u32> {
    let trimmed = message.trim().trim_end_matches('|').trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    u32::from_str_radix(hex, 16)
        .map_err(|_| Error::Protocol(format!("invalid stream ID in response: {message:?}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
