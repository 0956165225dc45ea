//! Mic TX pipeline: realtime capture handoff, framing, VITA-49 send.
//!
//! The host's audio unit calls [`MicTxHandle::push`] from its realtime
//! callback thread with mono float samples at whatever rate it captures.
//! The handle resamples to 24 kHz into a preallocated scratch buffer and
//! writes into a lock-free single-producer single-consumer ring -- no
//! allocation and no syscalls on the audio thread after start.
//!
//! A dedicated send-worker thread drains the ring, assembles fixed
//! 480-sample frames (20 ms at 24 kHz), stamps each with a monotonic
//! packet sequence and cumulative sample count, builds the VITA-49
//! packet, and issues a single `send_to` per frame.
//!
//! Preconditions: DAX RX is already running (so the radio knows our UDP
//! port) and the TX stream ID has been returned by `stream create
//! type=dax_tx`.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flexlink_core::error::{Error, Result};

use crate::resample::MicResampler;
use crate::vita49::{self, TX_SAMPLES_PER_PACKET};

/// Ring capacity: one second of 24 kHz audio.
const RING_CAPACITY: usize = 24_000;

/// Largest host callback buffer `push` accepts in one call.
const MAX_PUSH_SAMPLES: usize = 8_192;

/// Worker poll interval while the ring is starved. Frames span 20 ms,
/// so a 2 ms poll adds negligible latency.
const STARVED_POLL: Duration = Duration::from_millis(2);

/// Options for the TX pipeline.
#[derive(Debug, Clone)]
pub struct DaxTxOptions {
    /// Radio endpoint: `radio_ip:4991` on the LAN, the broker-reported
    /// public UDP port on the WAN.
    pub dest: SocketAddr,
    /// TX stream ID from `stream create type=dax_tx`.
    pub stream_id: u32,
    /// Sample rate the host capture delivers.
    pub input_rate: u32,
}

/// Realtime-side handle, moved into the host's audio callback.
///
/// Not `Clone`: exactly one producer exists per pipeline.
pub struct MicTxHandle {
    producer: rtrb::Producer<f32>,
    resampler: MicResampler,
    scratch: Vec<f32>,
}

impl MicTxHandle {
    /// Feed one callback's worth of mono samples.
    ///
    /// Bounded-time and allocation-free: resamples into the preallocated
    /// scratch buffer and writes whatever fits into the ring. Samples
    /// that do not fit (consumer stalled) are dropped. Buffers larger
    /// than the preallocated maximum are truncated.
    pub fn push(&mut self, samples: &[f32]) {
        let samples = if samples.len() > MAX_PUSH_SAMPLES {
            &samples[..MAX_PUSH_SAMPLES]
        } else {
            samples
        };

        self.scratch.clear();
        self.resampler.process_into(samples, &mut self.scratch);

        for &sample in &self.scratch {
            if self.producer.push(sample).is_err() {
                // Ring full: drop the remainder of this callback.
                break;
            }
        }
    }
}

/// The sending side of the mic TX path.
///
/// Owns the send-worker thread; [`stop`](Self::stop) (or drop) shuts it
/// down. Repeated start/stop cycles are safe -- each [`start`] builds a
/// fresh pipeline, ring, and socket.
///
/// [`start`]: MicTxPipeline::start
pub struct MicTxPipeline {
    running: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
    /// Packets sent since start.
    packets_sent: Arc<AtomicU64>,
}

impl MicTxPipeline {
    /// Create the socket, ring, and send worker.
    ///
    /// Returns the pipeline plus the realtime [`MicTxHandle`] to hand to
    /// the host audio unit.
    pub fn start(options: DaxTxOptions) -> Result<(Self, MicTxHandle)> {
        // Send-only socket; the OS picks the source port.
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| Error::Stream(format!("failed to open TX socket: {e}")))?;

        let (producer, consumer) = rtrb::RingBuffer::new(RING_CAPACITY);
        let resampler = MicResampler::new(options.input_rate);
        let scratch = Vec::with_capacity(resampler.max_output_len(MAX_PUSH_SAMPLES));

        let running = Arc::new(AtomicBool::new(true));
        let packets_sent = Arc::new(AtomicU64::new(0));

        let worker = {
            let running = Arc::clone(&running);
            let packets_sent = Arc::clone(&packets_sent);
            let dest = options.dest;
            let stream_id = options.stream_id;
            std::thread::Builder::new()
                .name("dax-tx-send".into())
                .spawn(move || {
                    send_worker(socket, consumer, dest, stream_id, running, packets_sent);
                })
                .map_err(|e| Error::Resource(format!("failed to spawn TX worker: {e}")))?
        };

        tracing::debug!(
            dest = %options.dest,
            stream_id = format!("0x{:08X}", options.stream_id),
            input_rate = options.input_rate,
            "Mic TX pipeline started"
        );

        Ok((
            MicTxPipeline {
                running,
                worker: Some(worker),
                packets_sent,
            },
            MicTxHandle {
                producer,
                resampler,
                scratch,
            },
        ))
    }

    /// Packets transmitted since start.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Stop the send worker and close the socket. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            tracing::debug!(
                packets = self.packets_sent(),
                "Mic TX pipeline stopped"
            );
        }
    }
}

impl Drop for MicTxPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The send worker: drain the ring, frame, packetize, send.
fn send_worker(
    socket: UdpSocket,
    mut consumer: rtrb::Consumer<f32>,
    dest: SocketAddr,
    stream_id: u32,
    running: Arc<AtomicBool>,
    packets_sent: Arc<AtomicU64>,
) {
    let mut frame = [0.0f32; TX_SAMPLES_PER_PACKET];
    let mut filled = 0usize;
    let mut packet_seq: u8 = 0;
    let mut sample_count: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match consumer.pop() {
            Ok(sample) => {
                frame[filled] = sample;
                filled += 1;
                if filled < TX_SAMPLES_PER_PACKET {
                    continue;
                }
                filled = 0;

                // Snapshot, then advance, the monotonic counters.
                let seq = packet_seq;
                let count = sample_count;
                packet_seq = packet_seq.wrapping_add(1);
                sample_count += TX_SAMPLES_PER_PACKET as u64;

                let secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                let packet = vita49::build_tx_audio_packet(stream_id, seq, secs, count, &frame);

                match socket.send_to(&packet, dest) {
                    Ok(_) => {
                        packets_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "TX send failed");
                    }
                }
            }
            Err(_) => {
                // Ring empty; partial frames wait for more samples.
                std::thread::sleep(STARVED_POLL);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
