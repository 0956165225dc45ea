//! DAX RX audio pipeline: VITA-49 UDP receive, decode, deliver.
//!
//! Binds the DAX UDP port (4991 on the LAN, the broker-advertised public
//! port on the WAN) and runs one receive worker. Per datagram:
//!
//! 1. Parse VITA-49; require packet type 1 or 3 and a stream ID equal to
//!    the expected RX-DAX value. Anything else is dropped silently.
//! 2. **LAN**: payload is big-endian float32 stereo interleaved. Downmix
//!    to mono; when the packet holds at most 160 stereo pairs (24 kHz
//!    framing) apply 2x linear upsampling to 48 kHz, otherwise pass
//!    through.
//! 3. **WAN**: payload is one Opus frame; decode to 480 mono samples at
//!    48 kHz.
//!
//! Decoded mono 48 kHz buffers are delivered over a bounded channel; a
//! slow consumer drops buffers rather than stalling the socket. Packet
//! statistics are surfaced at most every [`STATS_BATCH`] packets.
//!
//! The expected stream ID is a plain atomic written by the radio layer
//! when the `stream create` response arrives and read here per packet;
//! the brief window before it is set at worst discards a few packets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use flexlink_core::audio::{AudioBuffer, NoiseReduction};
use flexlink_core::error::{Error, Result};
use flexlink_core::events::RadioEvent;
use flexlink_transport::UdpTransport;

use crate::resample::{LinearUpsampler, downmix_stereo};
use crate::vita49;

/// Well-known DAX UDP port on the LAN.
pub const DAX_RX_PORT: u16 = 4991;

/// Output sample rate after decode/upsample.
pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;

/// LAN packets holding at most this many stereo pairs carry 24 kHz audio
/// and are upsampled 2x; larger packets pass through.
pub const LAN_UPSAMPLE_THRESHOLD: usize = 160;

/// Packet statistics are surfaced at most every this many packets.
pub const STATS_BATCH: u64 = 100;

/// Samples per decoded Opus frame (10 ms at 48 kHz mono).
const OPUS_FRAME_SAMPLES: usize = 480;

/// Options for the RX pipeline.
#[derive(Debug, Clone)]
pub struct DaxRxOptions {
    /// UDP port to bind. 0 picks an ephemeral port (tests).
    pub port: u16,
    /// WAN session: payload is Opus instead of raw float.
    pub wan: bool,
}

impl Default for DaxRxOptions {
    fn default() -> Self {
        DaxRxOptions {
            port: DAX_RX_PORT,
            wan: false,
        }
    }
}

/// A running DAX RX stream.
pub struct DaxRxStream {
    /// Expected RX stream ID; 0 means "not yet assigned, drop everything".
    stream_id: Arc<AtomicU32>,
    /// Port the socket actually bound (differs from options when 0).
    local_port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl DaxRxStream {
    /// Bind the UDP port and start the receive worker.
    ///
    /// Decoded audio runs through `nr` (pass [`Passthrough`] when no
    /// backend is configured) and goes to `audio_tx`; statistics events
    /// go to `event_tx`. For WAN sessions the Opus decoder is created
    /// here and a failure surfaces as [`Error::Resource`] without any
    /// socket left behind.
    ///
    /// [`Passthrough`]: flexlink_core::audio::Passthrough
    pub fn start(
        options: DaxRxOptions,
        nr: Arc<dyn NoiseReduction>,
        audio_tx: mpsc::Sender<AudioBuffer>,
        event_tx: broadcast::Sender<RadioEvent>,
    ) -> Result<Self> {
        let socket = UdpTransport::bind_reuse(options.port)?;
        let local_port = socket.local_addr().port();

        let decoder = if options.wan {
            Some(
                opus::Decoder::new(OUTPUT_SAMPLE_RATE, opus::Channels::Mono)
                    .map_err(|e| Error::Resource(format!("Opus decoder init failed: {e}")))?,
            )
        } else {
            None
        };

        let stream_id = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let stream_id = Arc::clone(&stream_id);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                recv_loop(socket, stream_id, decoder, nr, audio_tx, event_tx, cancel).await;
            })
        };

        tracing::debug!(port = local_port, wan = options.wan, "DAX RX stream started");

        Ok(DaxRxStream {
            stream_id,
            local_port,
            cancel,
            task,
        })
    }

    /// The UDP port the stream is listening on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Install the expected RX stream ID.
    ///
    /// Called by the radio layer once the `stream create type=dax_rx`
    /// response delivers the ID. The worker reads it on the next packet.
    pub fn set_stream_id(&self, id: u32) {
        self.stream_id.store(id, Ordering::Relaxed);
        tracing::debug!(stream_id = format!("0x{id:08X}"), "RX stream filter set");
    }

    /// Stop the worker and release the socket.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl Drop for DaxRxStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The receive worker.
async fn recv_loop(
    socket: UdpTransport,
    expected_id: Arc<AtomicU32>,
    mut decoder: Option<opus::Decoder>,
    nr: Arc<dyn NoiseReduction>,
    audio_tx: mpsc::Sender<AudioBuffer>,
    event_tx: broadcast::Sender<RadioEvent>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 8192];
    let mut mono = Vec::with_capacity(1024);
    let mut upsampled = Vec::with_capacity(2048);
    let mut opus_out = vec![0.0f32; OPUS_FRAME_SAMPLES];
    let mut upsampler = LinearUpsampler::new();
    let mut packets: u64 = 0;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let n = match received {
            Ok((n, _src)) => n,
            Err(e) => {
                // Socket closed or failed: treated as normal shutdown.
                tracing::debug!(error = %e, "DAX RX recv ended");
                break;
            }
        };

        let Ok(packet) = vita49::parse_packet(&buf[..n]) else {
            continue;
        };
        if !matches!(
            packet.packet_type,
            vita49::TYPE_IF_DATA | vita49::TYPE_EXT_DATA
        ) {
            continue;
        }
        let expected = expected_id.load(Ordering::Relaxed);
        if expected == 0 || packet.stream_id != Some(expected) {
            // Wrong or not-yet-known stream: drop silently.
            continue;
        }

        let mut samples = match decoder.as_mut() {
            Some(decoder) => {
                // WAN: one Opus frame per datagram.
                match decoder.decode_float(packet.payload, &mut opus_out, false) {
                    Ok(decoded) => opus_out[..decoded].to_vec(),
                    Err(e) => {
                        tracing::trace!(error = %e, "Opus decode failed, dropping frame");
                        continue;
                    }
                }
            }
            None => {
                // LAN: big-endian float32 stereo pairs.
                let pairs = packet.payload.len() / 8;
                let mut stereo = Vec::with_capacity(pairs * 2);
                for chunk in packet.payload.chunks_exact(4) {
                    stereo.push(f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                if stereo.len() % 2 != 0 {
                    stereo.pop();
                }
                downmix_stereo(&stereo, &mut mono);

                if pairs <= LAN_UPSAMPLE_THRESHOLD {
                    upsampled.clear();
                    upsampler.upsample_into(&mono, &mut upsampled);
                    upsampled.clone()
                } else {
                    mono.clone()
                }
            }
        };

        nr.process(&mut samples);

        packets += 1;
        if packets % STATS_BATCH == 0 {
            let _ = event_tx.send(RadioEvent::RxAudioStats { packets });
        }

        let buffer = AudioBuffer::new(samples, 1, OUTPUT_SAMPLE_RATE);
        if audio_tx.try_send(buffer).is_err() {
            tracing::trace!("RX audio buffer dropped (consumer too slow)");
        }
    }

    tracing::debug!(packets, "DAX RX worker exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use flexlink_core::audio::Passthrough;

    const STREAM_ID: u32 = 0x4000_0009;

    async fn start_lan() -> (DaxRxStream, mpsc::Receiver<AudioBuffer>, SocketAddr) {
        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(16);
        let stream = DaxRxStream::start(
            DaxRxOptions {
                port: 0,
                wan: false,
            },
            Arc::new(Passthrough),
            audio_tx,
            event_tx,
        )
        .unwrap();
        stream.set_stream_id(STREAM_ID);
        let dest = format!("127.0.0.1:{}", stream.local_port()).parse().unwrap();
        (stream, audio_rx, dest)
    }

    /// A LAN audio packet: type 1, BE float stereo pairs (the TX builder
    /// emits exactly this shape).
    fn lan_packet(stream_id: u32, mono: &[f32]) -> Vec<u8> {
        vita49::build_tx_audio_packet(stream_id, 0, 0, 0, mono)
    }

    #[tokio::test]
    async fn small_lan_packet_is_upsampled() {
        let (stream, mut audio_rx, dest) = start_lan().await;
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        // 160 stereo pairs of identical L/R: downmix is the identity, and
        // 2x upsampling yields 320 samples.
        let mono: Vec<f32> = (0..160).map(|i| i as f32 / 160.0).collect();
        sender.send_to(&lan_packet(STREAM_ID, &mono), dest).await.unwrap();

        let buffer = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .expect("timed out waiting for audio")
            .unwrap();
        assert_eq!(buffer.channels, 1);
        assert_eq!(buffer.sample_rate, OUTPUT_SAMPLE_RATE);
        assert_eq!(buffer.samples.len(), 320);
        // Every second output sample is the original.
        for (i, &expected) in mono.iter().enumerate() {
            assert_eq!(buffer.samples[i * 2 + 1], expected, "sample {i}");
        }

        stream.stop();
    }

    #[tokio::test]
    async fn large_lan_packet_passes_through() {
        let (stream, mut audio_rx, dest) = start_lan().await;
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let mono: Vec<f32> = (0..240).map(|i| (i as f32 * 0.01).sin()).collect();
        sender.send_to(&lan_packet(STREAM_ID, &mono), dest).await.unwrap();

        let buffer = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buffer.samples.len(), 240);
        for (i, &expected) in mono.iter().enumerate() {
            assert_eq!(buffer.samples[i], expected, "sample {i}");
        }

        stream.stop();
    }

    #[tokio::test]
    async fn upsampler_carries_across_packets() {
        let (stream, mut audio_rx, dest) = start_lan().await;
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(&lan_packet(STREAM_ID, &[1.0, 3.0]), dest)
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.samples, vec![1.0, 1.0, 2.0, 3.0]);

        sender
            .send_to(&lan_packet(STREAM_ID, &[5.0]), dest)
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .unwrap()
            .unwrap();
        // First output of the new packet is (last(A) + B[0]) / 2.
        assert_eq!(second.samples, vec![4.0, 5.0]);

        stream.stop();
    }

    #[tokio::test]
    async fn mismatched_stream_id_dropped_silently() {
        let (stream, mut audio_rx, dest) = start_lan().await;
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(&lan_packet(0xC000_0002, &[0.5; 16]), dest)
            .await
            .unwrap();
        sender
            .send_to(&lan_packet(STREAM_ID, &[0.25; 16]), dest)
            .await
            .unwrap();

        // Only the matching packet is delivered.
        let buffer = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(buffer.samples.iter().all(|&s| s == 0.25));
        assert!(audio_rx.try_recv().is_err());

        stream.stop();
    }

    #[tokio::test]
    async fn packets_dropped_before_stream_id_set() {
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        let stream = DaxRxStream::start(
            DaxRxOptions {
                port: 0,
                wan: false,
            },
            Arc::new(Passthrough),
            audio_tx,
            event_tx,
        )
        .unwrap();
        let dest: SocketAddr = format!("127.0.0.1:{}", stream.local_port()).parse().unwrap();
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        // No filter installed yet: even a plausible packet is dropped.
        sender
            .send_to(&lan_packet(STREAM_ID, &[0.5; 16]), dest)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(audio_rx.try_recv().is_err());

        stream.stop();
    }

    #[tokio::test]
    async fn non_audio_datagrams_ignored() {
        let (stream, mut audio_rx, dest) = start_lan().await;
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        // Garbage, a truncated datagram, and a context-type packet.
        sender.send_to(b"not vita", dest).await.unwrap();
        sender.send_to(&[0u8; 4], dest).await.unwrap();

        let mut context = lan_packet(STREAM_ID, &[0.5; 4]);
        // Rewrite the packet type nibble to 5 (extension context).
        context[0] = (context[0] & 0x0F) | (vita49::TYPE_EXT_CONTEXT << 4);
        sender.send_to(&context, dest).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(audio_rx.try_recv().is_err());

        stream.stop();
    }

    #[tokio::test]
    async fn stats_event_every_hundred_packets() {
        let (audio_tx, mut audio_rx) = mpsc::channel(256);
        let (event_tx, mut events) = broadcast::channel(16);
        let stream = DaxRxStream::start(
            DaxRxOptions {
                port: 0,
                wan: false,
            },
            Arc::new(Passthrough),
            audio_tx,
            event_tx,
        )
        .unwrap();
        stream.set_stream_id(STREAM_ID);
        let dest: SocketAddr = format!("127.0.0.1:{}", stream.local_port()).parse().unwrap();
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        let pkt = lan_packet(STREAM_ID, &[0.1; 4]);
        for _ in 0..(STATS_BATCH as usize) {
            sender.send_to(&pkt, dest).await.unwrap();
            // Keep the bounded audio channel drained.
            while audio_rx.try_recv().is_ok() {}
        }

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for stats")
            .unwrap();
        match event {
            RadioEvent::RxAudioStats { packets } => assert_eq!(packets, STATS_BATCH),
            other => panic!("expected RxAudioStats, got {other:?}"),
        }

        stream.stop();
    }

    #[tokio::test]
    async fn noise_reduction_applied_to_delivered_audio() {
        /// Inverts every sample so invocation is observable.
        struct Inverter;
        impl NoiseReduction for Inverter {
            fn set_enabled(&self, _enabled: bool) {}
            fn process(&self, samples: &mut [f32]) {
                for s in samples {
                    *s = -*s;
                }
            }
        }

        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        let stream = DaxRxStream::start(
            DaxRxOptions {
                port: 0,
                wan: false,
            },
            Arc::new(Inverter),
            audio_tx,
            event_tx,
        )
        .unwrap();
        stream.set_stream_id(STREAM_ID);
        let dest: SocketAddr = format!("127.0.0.1:{}", stream.local_port()).parse().unwrap();
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(&lan_packet(STREAM_ID, &[0.5; 200]), dest)
            .await
            .unwrap();

        let buffer = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(buffer.samples.iter().all(|&s| s == -0.5));

        stream.stop();
    }

    #[tokio::test]
    async fn stop_closes_audio_channel() {
        let (stream, mut audio_rx, _dest) = start_lan().await;
        stream.stop();

        let closed = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .expect("timed out waiting for channel close");
        assert!(closed.is_none(), "audio channel should close on stop");
    }

    #[tokio::test]
    async fn wan_opus_frame_decoded() {
        let (audio_tx, mut audio_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        let stream = DaxRxStream::start(
            DaxRxOptions { port: 0, wan: true },
            Arc::new(Passthrough),
            audio_tx,
            event_tx,
        )
        .unwrap();
        stream.set_stream_id(STREAM_ID);
        let dest: SocketAddr = format!("127.0.0.1:{}", stream.local_port()).parse().unwrap();
        let sender = UdpTransport::bind("127.0.0.1:0").await.unwrap();

        // Encode one 10 ms frame of 48 kHz mono audio.
        let pcm: Vec<f32> = (0..OPUS_FRAME_SAMPLES)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        let mut encoder =
            opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Voip).unwrap();
        let mut opus_frame = vec![0u8; 1500];
        let len = encoder.encode_float(&pcm, &mut opus_frame).unwrap();
        opus_frame.truncate(len);
        // Pad the Opus payload to a word boundary for the VITA framing.
        while opus_frame.len() % 4 != 0 {
            opus_frame.push(0);
        }

        // Frame it as a type-3 packet with the expected stream ID.
        let mut pkt = Vec::new();
        use bytes::BufMut;
        let size_words = 2 + opus_frame.len() / 4;
        let mut word0: u32 = 0;
        word0 |= (vita49::TYPE_EXT_DATA as u32) << 28;
        word0 |= size_words as u32 & 0xFFFF;
        pkt.put_u32(word0);
        pkt.put_u32(STREAM_ID);
        pkt.extend_from_slice(&opus_frame);

        sender.send_to(&pkt, dest).await.unwrap();

        let buffer = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
            .await
            .expect("timed out waiting for decoded audio")
            .unwrap();
        assert_eq!(buffer.channels, 1);
        assert_eq!(buffer.sample_rate, OUTPUT_SAMPLE_RATE);
        assert_eq!(buffer.samples.len(), OPUS_FRAME_SAMPLES);

        stream.stop();
    }
}
