//! VITA-49 binary frame parser and builder for SmartSDR streaming.
//!
//! FlexRadio streams real-time data (DAX audio, discovery beacons) as
//! VITA-49 packets over UDP. This module is a pure codec with no I/O:
//! all functions operate on byte slices and return parsed structures or
//! errors.
//!
//! # Header layout (big-endian 32-bit words)
//!
//! ```text
//! Word 0:  type[31:28] | classID[27] | trailer[26] | TSI[25:22] |
//!          TSF[21:20] | count[19:16] | sizeWords[15:0]
//! Word 1:  stream ID                 (types 1, 3, 4, 5)
//! +2 words: class ID (OUI, class codes)   when classID flag set
//! +1 word:  integer timestamp             when TSI != 0
//! +2 words: fractional timestamp          when TSF != 0
//! payload ... optional trailer (1 word)   when trailer flag set
//! ```
//!
//! Audio receive accepts packet types 1 (IF data) and 3 (extension data).
//! Discovery accepts types 3, 4, and 5 carrying the sentinel stream ID
//! [`DISCOVERY_STREAM_ID`] and the vendor OUI [`FLEX_OUI`].

use std::collections::HashMap;

use bytes::BufMut;

use flexlink_core::error::{Error, Result};

/// Stream ID carried by every discovery beacon.
pub const DISCOVERY_STREAM_ID: u32 = 0x0000_0800;

/// FlexRadio OUI (Organizationally Unique Identifier).
pub const FLEX_OUI: u32 = 0x001C_2D;

/// Minimum parseable datagram: header word plus stream ID.
pub const MIN_PACKET_LEN: usize = 8;

/// Mono samples per transmitted DAX TX packet (20 ms at 24 kHz).
pub const TX_SAMPLES_PER_PACKET: usize = 480;

/// VITA-49 packet type: IF data with stream ID.
pub const TYPE_IF_DATA: u8 = 1;

/// VITA-49 packet type: extension data with stream ID.
pub const TYPE_EXT_DATA: u8 = 3;

/// VITA-49 packet type: context.
pub const TYPE_CONTEXT: u8 = 4;

/// VITA-49 packet type: extension context (discovery flavor).
pub const TYPE_EXT_CONTEXT: u8 = 5;

/// Parsed class ID field (present when the header flag is set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassId {
    /// 24-bit vendor OUI. [`FLEX_OUI`] for FlexRadio packets.
    pub oui: u32,
    /// Information class code.
    pub info_code: u16,
    /// Packet class code.
    pub packet_code: u16,
}

/// A parsed VITA-49 packet: header fields plus a payload slice into the
/// original buffer (no copying).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vita49Packet<'a> {
    /// Packet type from bits 31-28.
    pub packet_type: u8,
    /// Whether a trailer word follows the payload.
    pub trailer_present: bool,
    /// Integer-timestamp mode field (TSI). Nonzero means a timestamp
    /// word is present.
    pub tsi: u8,
    /// Fractional-timestamp mode field (TSF). Nonzero means two
    /// fractional words are present.
    pub tsf: u8,
    /// 4-bit rolling packet counter.
    pub packet_count: u8,
    /// Total packet size in 32-bit words, including header and trailer.
    pub size_words: u16,
    /// Stream ID, present for packet types 1, 3, 4, and 5.
    pub stream_id: Option<u32>,
    /// Class ID, when the header flag is set.
    pub class_id: Option<ClassId>,
    /// Integer timestamp (seconds) when TSI != 0.
    pub timestamp_int: Option<u32>,
    /// Fractional timestamp when TSF != 0. For DAX TX packets this is a
    /// cumulative sample count.
    pub timestamp_frac: Option<u64>,
    /// Payload bytes between the header and the optional trailer.
    pub payload: &'a [u8],
}

impl Vita49Packet<'_> {
    /// Whether this packet is a discovery beacon: sentinel stream ID,
    /// context-flavored type, and (when a class ID is present) the
    /// FlexRadio OUI. Beacons without a class ID are accepted.
    pub fn is_discovery(&self) -> bool {
        if self.stream_id != Some(DISCOVERY_STREAM_ID) {
            return false;
        }
        if !matches!(
            self.packet_type,
            TYPE_EXT_DATA | TYPE_CONTEXT | TYPE_EXT_CONTEXT
        ) {
            return false;
        }
        match self.class_id {
            Some(class) => class.oui == FLEX_OUI,
            None => true,
        }
    }
}

/// Parse a VITA-49 packet from a raw UDP datagram.
///
/// Datagrams shorter than [`MIN_PACKET_LEN`] are rejected. The declared
/// `size_words` is validated against the buffer: it must cover the whole
/// header (and trailer, when flagged) and must not exceed the buffer.
/// Trailing bytes beyond the declared size are ignored.
pub fn parse_packet(data: &[u8]) -> Result<Vita49Packet<'_>> {
    if data.len() < MIN_PACKET_LEN {
        return Err(Error::Protocol(format!(
            "VITA-49 datagram too short: {} bytes",
            data.len()
        )));
    }

    let word0 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let packet_type = ((word0 >> 28) & 0x0F) as u8;
    let class_id_present = (word0 >> 27) & 1 == 1;
    let trailer_present = (word0 >> 26) & 1 == 1;
    let tsi = ((word0 >> 22) & 0x0F) as u8;
    let tsf = ((word0 >> 20) & 0x03) as u8;
    let packet_count = ((word0 >> 16) & 0x0F) as u8;
    let size_words = (word0 & 0xFFFF) as u16;

    let size_bytes = size_words as usize * 4;
    if size_bytes > data.len() {
        return Err(Error::Protocol(format!(
            "VITA-49 size ({size_words} words) exceeds datagram ({} bytes)",
            data.len()
        )));
    }

    let mut offset = 4usize;

    let read_word = |data: &[u8], offset: usize| -> Result<u32> {
        if offset + 4 > size_bytes {
            return Err(Error::Protocol(
                "VITA-49 header fields exceed declared size".into(),
            ));
        }
        Ok(u32::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]))
    };

    let stream_id = if matches!(
        packet_type,
        TYPE_IF_DATA | TYPE_EXT_DATA | TYPE_CONTEXT | TYPE_EXT_CONTEXT
    ) {
        let id = read_word(data, offset)?;
        offset += 4;
        Some(id)
    } else {
        None
    };

    let class_id = if class_id_present {
        let w0 = read_word(data, offset)?;
        let w1 = read_word(data, offset + 4)?;
        offset += 8;
        Some(ClassId {
            oui: w0 & 0x00FF_FFFF,
            info_code: ((w1 >> 16) & 0xFFFF) as u16,
            packet_code: (w1 & 0xFFFF) as u16,
        })
    } else {
        None
    };

    let timestamp_int = if tsi != 0 {
        let ts = read_word(data, offset)?;
        offset += 4;
        Some(ts)
    } else {
        None
    };

    let timestamp_frac = if tsf != 0 {
        let hi = read_word(data, offset)?;
        let lo = read_word(data, offset + 4)?;
        offset += 8;
        Some(((hi as u64) << 32) | lo as u64)
    } else {
        None
    };

    // The trailer, when present, occupies the last word of the declared
    // packet size and is not part of the payload.
    let payload_end = if trailer_present {
        size_bytes.checked_sub(4).filter(|end| *end >= offset).ok_or_else(|| {
            Error::Protocol("VITA-49 trailer overlaps header".into())
        })?
    } else {
        size_bytes
    };

    if payload_end < offset {
        return Err(Error::Protocol(
            "VITA-49 payload region is negative".into(),
        ));
    }

    Ok(Vita49Packet {
        packet_type,
        trailer_present,
        tsi,
        tsf,
        packet_count,
        size_words,
        stream_id,
        class_id,
        timestamp_int,
        timestamp_frac,
        payload: &data[offset..payload_end],
    })
}

// ---------------------------------------------------------------------------
// TX audio packet emission
// ---------------------------------------------------------------------------

/// Build a DAX TX audio packet.
///
/// Produces a type-1 IF-data packet with no class ID, TSI=1 carrying
/// `timestamp_secs` (Unix seconds mod 2^32), and TSF=3 carrying the
/// 64-bit cumulative 24 kHz sample count. Each mono input sample is
/// duplicated into a big-endian stereo float pair. `packet_count` is
/// masked to its low 4 bits by the header encoding.
pub fn build_tx_audio_packet(
    stream_id: u32,
    packet_count: u8,
    timestamp_secs: u32,
    sample_count: u64,
    samples: &[f32],
) -> Vec<u8> {
    // header + stream ID + int timestamp + frac timestamp, then two words
    // (L and R float) per mono sample.
    let size_words = 5 + samples.len() * 2;
    let mut buf = Vec::with_capacity(size_words * 4);

    let mut word0: u32 = 0;
    word0 |= (TYPE_IF_DATA as u32) << 28;
    word0 |= 1 << 22; // TSI = 1 (UTC integer seconds)
    word0 |= 3 << 20; // TSF = 3 (free-running sample count)
    word0 |= ((packet_count & 0x0F) as u32) << 16;
    word0 |= size_words as u32 & 0xFFFF;

    buf.put_u32(word0);
    buf.put_u32(stream_id);
    buf.put_u32(timestamp_secs);
    buf.put_u64(sample_count);

    for &sample in samples {
        buf.put_f32(sample); // left
        buf.put_f32(sample); // right (duplicated)
    }

    buf
}

// ---------------------------------------------------------------------------
// Discovery payload
// ---------------------------------------------------------------------------

/// Parse a discovery beacon payload into key=value pairs.
///
/// The payload is UTF-8, space-separated `key=value` tokens, possibly
/// padded with spaces or NULs to a word boundary. Keys are lowercased;
/// values are kept verbatim. Tokens without `=` are skipped.
pub fn parse_discovery_payload(payload: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Protocol("discovery payload is not valid UTF-8".into()))?;

    let mut kv = HashMap::new();
    for token in text.trim_matches(['\0', ' ']).split_whitespace() {
        if let Some(eq_pos) = token.find('=') {
            let key = token[..eq_pos].to_lowercase();
            let value = token[eq_pos + 1..].to_string();
            kv.insert(key, value);
        }
    }
    Ok(kv)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Flexible test packet builder mirroring the parser's layout rules.
    struct PacketParams {
        packet_type: u8,
        class_id: Option<ClassId>,
        trailer: bool,
        tsi: u8,
        tsf: u8,
        count: u8,
        stream_id: u32,
        timestamp_int: u32,
        timestamp_frac: u64,
        payload: Vec<u8>,
    }

    impl Default for PacketParams {
        fn default() -> Self {
            PacketParams {
                packet_type: TYPE_EXT_DATA,
                class_id: Some(ClassId {
                    oui: FLEX_OUI,
                    info_code: 0x534C,
                    packet_code: 0x03E3,
                }),
                trailer: false,
                tsi: 1,
                tsf: 1,
                count: 0,
                stream_id: 0x4000_0001,
                timestamp_int: 1_700_000_000,
                timestamp_frac: 0,
                payload: Vec::new(),
            }
        }
    }

    fn build(params: &PacketParams) -> Vec<u8> {
        let mut words = 2usize; // header + stream id (all test types carry one)
        if params.class_id.is_some() {
            words += 2;
        }
        if params.tsi != 0 {
            words += 1;
        }
        if params.tsf != 0 {
            words += 2;
        }
        assert_eq!(params.payload.len() % 4, 0, "payload must be word aligned");
        words += params.payload.len() / 4;
        if params.trailer {
            words += 1;
        }

        let mut buf = Vec::with_capacity(words * 4);
        let mut word0: u32 = 0;
        word0 |= (params.packet_type as u32) << 28;
        word0 |= (params.class_id.is_some() as u32) << 27;
        word0 |= (params.trailer as u32) << 26;
        word0 |= ((params.tsi & 0x0F) as u32) << 22;
        word0 |= ((params.tsf & 0x03) as u32) << 20;
        word0 |= ((params.count & 0x0F) as u32) << 16;
        word0 |= words as u32 & 0xFFFF;
        buf.put_u32(word0);
        buf.put_u32(params.stream_id);
        if let Some(class) = params.class_id {
            buf.put_u32(class.oui);
            buf.put_u32(((class.info_code as u32) << 16) | class.packet_code as u32);
        }
        if params.tsi != 0 {
            buf.put_u32(params.timestamp_int);
        }
        if params.tsf != 0 {
            buf.put_u64(params.timestamp_frac);
        }
        buf.extend_from_slice(&params.payload);
        if params.trailer {
            buf.put_u32(0);
        }
        buf
    }

    // -- parse_packet: valid layouts ----------------------------------------

    #[test]
    fn parse_full_header() {
        let params = PacketParams {
            payload: vec![1, 2, 3, 4, 5, 6, 7, 8],
            count: 9,
            timestamp_frac: 480 * 7,
            ..PacketParams::default()
        };
        let pkt = build(&params);
        let parsed = parse_packet(&pkt).unwrap();

        assert_eq!(parsed.packet_type, TYPE_EXT_DATA);
        assert_eq!(parsed.packet_count, 9);
        assert_eq!(parsed.stream_id, Some(0x4000_0001));
        assert_eq!(
            parsed.class_id,
            Some(ClassId {
                oui: FLEX_OUI,
                info_code: 0x534C,
                packet_code: 0x03E3,
            })
        );
        assert_eq!(parsed.timestamp_int, Some(1_700_000_000));
        assert_eq!(parsed.timestamp_frac, Some(480 * 7));
        assert_eq!(parsed.payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn parse_no_class_no_timestamps() {
        let params = PacketParams {
            class_id: None,
            tsi: 0,
            tsf: 0,
            payload: vec![0xAA; 12],
            ..PacketParams::default()
        };
        let parsed_buf = build(&params);
        let parsed = parse_packet(&parsed_buf).unwrap();

        assert_eq!(parsed.class_id, None);
        assert_eq!(parsed.timestamp_int, None);
        assert_eq!(parsed.timestamp_frac, None);
        assert_eq!(parsed.payload.len(), 12);
    }

    #[test]
    fn trailer_consumes_one_word_of_payload_region() {
        let with_trailer = build(&PacketParams {
            trailer: true,
            payload: vec![0x11; 16],
            ..PacketParams::default()
        });
        let without_trailer = build(&PacketParams {
            trailer: false,
            payload: vec![0x11; 16],
            ..PacketParams::default()
        });

        let a = parse_packet(&with_trailer).unwrap();
        let b = parse_packet(&without_trailer).unwrap();
        assert_eq!(a.payload.len(), 16);
        assert_eq!(b.payload.len(), 16);
        assert_eq!(a.size_words, b.size_words + 1);
    }

    #[test]
    fn packet_count_masked_to_four_bits() {
        for count in 0..16u8 {
            let pkt = build(&PacketParams {
                count,
                ..PacketParams::default()
            });
            assert_eq!(parse_packet(&pkt).unwrap().packet_count, count);
        }
    }

    #[test]
    fn trailing_garbage_beyond_declared_size_ignored() {
        let mut pkt = build(&PacketParams {
            payload: vec![0x22; 8],
            ..PacketParams::default()
        });
        let declared = parse_packet(&pkt).unwrap().payload.len();
        pkt.extend_from_slice(&[0xFF; 32]);
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.payload.len(), declared);
    }

    // -- parse_packet: error cases ------------------------------------------

    #[test]
    fn reject_short_datagram() {
        assert!(parse_packet(&[]).is_err());
        assert!(parse_packet(&[0u8; 7]).is_err());
    }

    #[test]
    fn reject_size_exceeding_buffer() {
        let mut pkt = build(&PacketParams::default());
        // Inflate the declared size without providing the bytes.
        let word0 = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        let inflated = (word0 & 0xFFFF_0000) | 0x0100;
        pkt[0..4].copy_from_slice(&inflated.to_be_bytes());

        let err = parse_packet(&pkt).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn reject_header_fields_beyond_declared_size() {
        // Declare only 2 words but set flags requiring class + timestamps.
        let full = build(&PacketParams::default());
        let mut pkt = full.clone();
        let word0 = u32::from_be_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        let shrunk = (word0 & 0xFFFF_0000) | 2;
        pkt[0..4].copy_from_slice(&shrunk.to_be_bytes());

        assert!(parse_packet(&pkt).is_err());
    }

    // -- discovery detection ------------------------------------------------

    #[test]
    fn discovery_beacon_detected() {
        let params = PacketParams {
            packet_type: TYPE_EXT_CONTEXT,
            stream_id: DISCOVERY_STREAM_ID,
            class_id: Some(ClassId {
                oui: FLEX_OUI,
                info_code: 0x534C,
                packet_code: 0xFFFF,
            }),
            payload: b"serial=ABC123 ip=192.168.1.20    ".to_vec(),
            ..PacketParams::default()
        };
        // Pad to word boundary handled by the literal above (33 -> pad).
        let mut payload = params.payload.clone();
        while payload.len() % 4 != 0 {
            payload.push(b' ');
        }
        let params = PacketParams { payload, ..params };

        let pkt = build(&params);
        let parsed = parse_packet(&pkt).unwrap();
        assert!(parsed.is_discovery());
    }

    #[test]
    fn discovery_without_class_id_accepted() {
        let params = PacketParams {
            packet_type: TYPE_EXT_CONTEXT,
            stream_id: DISCOVERY_STREAM_ID,
            class_id: None,
            ..PacketParams::default()
        };
        let parsed_buf = build(&params);
        assert!(parse_packet(&parsed_buf).unwrap().is_discovery());
    }

    #[test]
    fn discovery_wrong_oui_rejected() {
        let params = PacketParams {
            packet_type: TYPE_EXT_CONTEXT,
            stream_id: DISCOVERY_STREAM_ID,
            class_id: Some(ClassId {
                oui: 0x00AB_CDEF,
                info_code: 0,
                packet_code: 0,
            }),
            ..PacketParams::default()
        };
        let parsed_buf = build(&params);
        assert!(!parse_packet(&parsed_buf).unwrap().is_discovery());
    }

    #[test]
    fn discovery_wrong_stream_id_rejected() {
        let params = PacketParams {
            packet_type: TYPE_EXT_CONTEXT,
            stream_id: 0x4000_0001,
            ..PacketParams::default()
        };
        let parsed_buf = build(&params);
        assert!(!parse_packet(&parsed_buf).unwrap().is_discovery());
    }

    #[test]
    fn discovery_if_data_type_rejected() {
        let params = PacketParams {
            packet_type: TYPE_IF_DATA,
            stream_id: DISCOVERY_STREAM_ID,
            ..PacketParams::default()
        };
        let parsed_buf = build(&params);
        assert!(!parse_packet(&parsed_buf).unwrap().is_discovery());
    }

    // -- TX audio emission --------------------------------------------------

    #[test]
    fn tx_audio_round_trip() {
        let samples: Vec<f32> = (0..TX_SAMPLES_PER_PACKET)
            .map(|i| (i as f32 / 480.0) - 0.5)
            .collect();
        let sample_count = 480 * 41;

        let pkt = build_tx_audio_packet(0xC000_0002, 7, 1_700_000_123, sample_count, &samples);
        let parsed = parse_packet(&pkt).unwrap();

        assert_eq!(parsed.packet_type, TYPE_IF_DATA);
        assert_eq!(parsed.class_id, None);
        assert!(!parsed.trailer_present);
        assert_eq!(parsed.tsi, 1);
        assert_eq!(parsed.tsf, 3);
        assert_eq!(parsed.packet_count, 7);
        assert_eq!(parsed.stream_id, Some(0xC000_0002));
        assert_eq!(parsed.timestamp_int, Some(1_700_000_123));
        assert_eq!(parsed.timestamp_frac, Some(sample_count));
        assert_eq!(parsed.payload.len(), TX_SAMPLES_PER_PACKET * 8);

        // Each mono sample appears as an identical big-endian L/R pair.
        for (i, &expected) in samples.iter().enumerate() {
            let off = i * 8;
            let left = f32::from_be_bytes([
                parsed.payload[off],
                parsed.payload[off + 1],
                parsed.payload[off + 2],
                parsed.payload[off + 3],
            ]);
            let right = f32::from_be_bytes([
                parsed.payload[off + 4],
                parsed.payload[off + 5],
                parsed.payload[off + 6],
                parsed.payload[off + 7],
            ]);
            assert_eq!(left, expected, "sample {i} left");
            assert_eq!(right, expected, "sample {i} right");
        }
    }

    #[test]
    fn tx_audio_size_words_matches_datagram() {
        let samples = vec![0.0f32; TX_SAMPLES_PER_PACKET];
        let pkt = build_tx_audio_packet(0x1, 0, 0, 0, &samples);
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.size_words as usize * 4, pkt.len());
        assert_eq!(parsed.size_words, 965);
    }

    #[test]
    fn tx_audio_packet_count_wraps() {
        let samples = vec![0.0f32; 4];
        let pkt = build_tx_audio_packet(0x1, 0x1F, 0, 0, &samples);
        // Low four bits only.
        assert_eq!(parse_packet(&pkt).unwrap().packet_count, 0x0F);
    }

    // -- discovery payload --------------------------------------------------

    #[test]
    fn discovery_payload_parsed_lowercase_keys() {
        let kv = parse_discovery_payload(
            b"Serial=ABC123 IP=192.168.1.20 model=FLEX-6600 callsign=W9XYZ  ",
        )
        .unwrap();
        assert_eq!(kv.get("serial").map(String::as_str), Some("ABC123"));
        assert_eq!(kv.get("ip").map(String::as_str), Some("192.168.1.20"));
        assert_eq!(kv.get("model").map(String::as_str), Some("FLEX-6600"));
        assert_eq!(kv.get("callsign").map(String::as_str), Some("W9XYZ"));
    }

    #[test]
    fn discovery_payload_ignores_bare_tokens() {
        let kv = parse_discovery_payload(b"serial=X stray ip=1.2.3.4").unwrap();
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn discovery_payload_rejects_invalid_utf8() {
        assert!(parse_discovery_payload(&[0xFF, 0xFE, 0x01]).is_err());
    }

    #[test]
    fn discovery_payload_empty() {
        let kv = parse_discovery_payload(b"").unwrap();
        assert!(kv.is_empty());
    }
}
