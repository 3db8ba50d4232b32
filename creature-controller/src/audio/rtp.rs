// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The Opus-over-RTP receive path: two multicast sockets, two decoders,
//! two frame rings, and the mixer that feeds the sink.
//!
//! Each stream keeps its decoder on its own reader thread. A sender change
//! (new SSRC) resets that decoder; on the dialog stream it also clears the
//! sink queue so a previous speaker is cut off instantly. The clear races
//! the mixer's enqueue and clear wins: truncating a few ms of already
//! mixed audio is the intended effect.

use creature_common::{ControllerError, Result, StopFlag, Worker};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::ring::{FrameRing, FrameSamples};
use super::sink::AudioSink;
use super::{FRAME_MS, PREFILL_FRAMES, RTP_HEADER_LEN, SAMPLES_PER_FRAME, SAMPLE_RATE};

/// Datagrams larger than this cannot be a 20 ms Opus frame.
const MAX_PACKET: usize = 1500;
/// Reader readiness poll; short enough to keep decode latency negligible.
const RECV_POLL_TIMEOUT_MS: u16 = 5;

/// A valid packet has the RTP version bits set to 2 and at least one
/// payload byte after the 12-byte header.
pub fn validate_rtp(packet: &[u8]) -> bool {
    if packet.len() <= RTP_HEADER_LEN {
        return false;
    }
    (packet[0] >> 6) & 0x03 == 2
}

/// The 32-bit synchronization source from header bytes 8–11.
pub fn extract_ssrc(packet: &[u8]) -> u32 {
    u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Dialog,
    Bgm,
}

impl StreamKind {
    fn label(self) -> &'static str {
        match self {
            StreamKind::Dialog => "dialog",
            StreamKind::Bgm => "bgm",
        }
    }
}

/// Receive-side counters shared with the monitoring loop.
#[derive(Default)]
pub struct RtpStats {
    pub receiving: AtomicBool,
    pub dialog_packets: AtomicU64,
    pub bgm_packets: AtomicU64,
    pub ssrc_resets: AtomicU64,
}

impl RtpStats {
    pub fn packets_received(&self) -> u64 {
        self.dialog_packets.load(Ordering::Relaxed) + self.bgm_packets.load(Ordering::Relaxed)
    }
}

/// Per-stream decode state. Sockets live in the reader worker; this struct
/// holds everything the packet path needs, which keeps it testable without
/// a network.
pub struct StreamReader {
    kind: StreamKind,
    decoder: opus::Decoder,
    ring: Arc<FrameRing>,
    sink: Arc<dyn AudioSink>,
    stats: Arc<RtpStats>,
    last_ssrc: Option<u32>,
}

impl StreamReader {
    pub fn new(
        kind: StreamKind,
        ring: Arc<FrameRing>,
        sink: Arc<dyn AudioSink>,
        stats: Arc<RtpStats>,
    ) -> Result<StreamReader> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| ControllerError::Transport(format!("cannot create Opus decoder: {e}")))?;
        Ok(StreamReader {
            kind,
            decoder,
            ring,
            sink,
            stats,
            last_ssrc: None,
        })
    }

    /// Validates, tracks the sender, decodes, and publishes one datagram.
    pub fn handle_packet(&mut self, packet: &[u8]) {
        if !validate_rtp(packet) {
            warn!(stream = self.kind.label(), len = packet.len(), "rejecting invalid RTP packet");
            return;
        }
        self.note_ssrc(extract_ssrc(packet));
        self.decode_and_publish(&packet[RTP_HEADER_LEN..]);
    }

    /// First packet initializes the stream; any later SSRC change resets
    /// the decoder, and on dialog also clears the sink queue.
    fn note_ssrc(&mut self, ssrc: u32) {
        match self.last_ssrc {
            None => {
                info!(stream = self.kind.label(), ssrc, "stream initialized");
                self.last_ssrc = Some(ssrc);
            }
            Some(previous) if previous != ssrc => {
                info!(
                    stream = self.kind.label(),
                    from = previous,
                    to = ssrc,
                    "SSRC changed, resetting decoder"
                );
                if let Err(e) = self.decoder.reset_state() {
                    warn!(stream = self.kind.label(), %e, "decoder reset failed");
                }
                if self.kind == StreamKind::Dialog {
                    self.sink.clear();
                    debug!("cleared sink queue after dialog SSRC change");
                }
                self.last_ssrc = Some(ssrc);
                self.stats.ssrc_resets.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {}
        }
    }

    fn decode_and_publish(&mut self, payload: &[u8]) {
        let mut samples: FrameSamples = [0; SAMPLES_PER_FRAME];
        match self.decoder.decode(payload, &mut samples, false) {
            Ok(decoded) if decoded == SAMPLES_PER_FRAME => {
                self.count_packet();
            }
            Ok(decoded) => {
                // Shorter decode: the zero prefill is the padding.
                debug!(stream = self.kind.label(), decoded, "short decode, zero padding");
                self.count_packet();
            }
            Err(e) => {
                warn!(stream = self.kind.label(), %e, "decode failed, publishing silence");
                samples = [0; SAMPLES_PER_FRAME];
            }
        }
        self.ring.publish(&samples);
    }

    fn count_packet(&self) {
        let counter = match self.kind {
            StreamKind::Dialog => &self.stats.dialog_packets,
            StreamKind::Bgm => &self.stats.bgm_packets,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_ssrc(&self) -> Option<u32> {
        self.last_ssrc
    }
}

/// Opens one non-blocking multicast receive socket.
fn open_multicast_socket(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> Result<UdpSocket> {
    let fail = |what: &str, e: std::io::Error| {
        ControllerError::Transport(format!("{what} for group {group}:{port}: {e}"))
    };
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| fail("cannot create socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| fail("cannot set SO_REUSEADDR", e))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|e| fail("cannot set SO_REUSEPORT", e))?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| fail("cannot bind", e))?;
    socket
        .join_multicast_v4(&group, &interface)
        .map_err(|e| fail("cannot join multicast group", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| fail("cannot set non-blocking", e))?;
    debug!(%group, port, %interface, "joined multicast group");
    Ok(socket.into())
}

fn reader_loop(socket: UdpSocket, mut reader: StreamReader, stop: StopFlag) {
    let mut packet = [0u8; MAX_PACKET];
    while !stop.is_set() {
        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(RECV_POLL_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(stream = reader.kind.label(), %e, "poll failed, reader exiting");
                break;
            }
        }
        match socket.recv(&mut packet) {
            Ok(len) => reader.handle_packet(&packet[..len]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                error!(stream = reader.kind.label(), %e, "recv failed, reader exiting");
                break;
            }
        }
    }
    debug!(stream = reader.kind.label(), "stream reader stopped");
}

fn mixer_loop(
    dialog_ring: Arc<FrameRing>,
    bgm_ring: Arc<FrameRing>,
    sink: Arc<dyn AudioSink>,
    stop: StopFlag,
) {
    let frame_duration = Duration::from_millis(FRAME_MS);
    let mut next_tick = Instant::now() + frame_duration;
    let mut started = false;
    let mut dialog: FrameSamples = [0; SAMPLES_PER_FRAME];
    let mut bgm: FrameSamples = [0; SAMPLES_PER_FRAME];
    let mut mixed: FrameSamples = [0; SAMPLES_PER_FRAME];

    while !stop.is_set() {
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
        // Drift-free cadence: the next deadline advances by exactly one
        // frame regardless of when we actually woke.
        next_tick += frame_duration;

        let has_dialog = dialog_ring.consume(&mut dialog);
        let has_bgm = bgm_ring.consume(&mut bgm);

        mix_frames(
            has_dialog.then_some(&dialog),
            has_bgm.then_some(&bgm),
            &mut mixed,
        );
        sink.queue_samples(&mixed);

        if !started && sink.queued_samples() >= PREFILL_FRAMES * SAMPLES_PER_FRAME {
            sink.set_playing(true);
            started = true;
            info!(prefill_frames = PREFILL_FRAMES, "audio playback started");
        }
    }
    debug!("audio mixer stopped");
}

/// Sample-wise addition with saturation; a missing stream contributes
/// silence.
pub fn mix_frames(
    dialog: Option<&FrameSamples>,
    bgm: Option<&FrameSamples>,
    out: &mut FrameSamples,
) {
    for i in 0..SAMPLES_PER_FRAME {
        let d = dialog.map_or(0i32, |f| i32::from(f[i]));
        let b = bgm.map_or(0i32, |f| i32::from(f[i]));
        out[i] = (d + b).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    }
}

/// The assembled receive path: two reader workers and the mixer.
pub struct OpusRtpReceiver {
    stats: Arc<RtpStats>,
    workers: Vec<Worker>,
}

impl OpusRtpReceiver {
    /// Opens both multicast sockets and starts the three workers. Any
    /// socket or decoder failure aborts the whole receiver; the audio
    /// subsystem reports "not receiving" and the rest of the controller
    /// carries on.
    pub fn open(
        dialog_group: Ipv4Addr,
        bgm_group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
        sink: Arc<dyn AudioSink>,
    ) -> Result<OpusRtpReceiver> {
        let stats = Arc::new(RtpStats::default());
        let dialog_ring = Arc::new(FrameRing::new());
        let bgm_ring = Arc::new(FrameRing::new());

        let dialog_socket = open_multicast_socket(dialog_group, port, interface)?;
        let bgm_socket = open_multicast_socket(bgm_group, port, interface)?;

        let dialog_reader = StreamReader::new(
            StreamKind::Dialog,
            Arc::clone(&dialog_ring),
            Arc::clone(&sink),
            Arc::clone(&stats),
        )?;
        let bgm_reader = StreamReader::new(
            StreamKind::Bgm,
            Arc::clone(&bgm_ring),
            Arc::clone(&sink),
            Arc::clone(&stats),
        )?;

        let mut workers = Vec::with_capacity(3);
        workers.push(
            Worker::spawn("rtp-dialog", move |stop| {
                reader_loop(dialog_socket, dialog_reader, stop)
            })
            .map_err(|e| ControllerError::Transport(e.to_string()))?,
        );
        workers.push(
            Worker::spawn("rtp-bgm", move |stop| {
                reader_loop(bgm_socket, bgm_reader, stop)
            })
            .map_err(|e| ControllerError::Transport(e.to_string()))?,
        );
        let mixer_sink = Arc::clone(&sink);
        workers.push(
            Worker::spawn("audio-mixer", move |stop| {
                mixer_loop(dialog_ring, bgm_ring, mixer_sink, stop)
            })
            .map_err(|e| ControllerError::Transport(e.to_string()))?,
        );

        stats.receiving.store(true, Ordering::Release);
        info!(%dialog_group, %bgm_group, port, "RTP receiver running");
        Ok(OpusRtpReceiver { stats, workers })
    }

    pub fn stats(&self) -> &Arc<RtpStats> {
        &self.stats
    }

    pub fn is_receiving(&self) -> bool {
        self.stats.receiving.load(Ordering::Acquire)
    }

    pub fn shutdown(&mut self) {
        self.stats.receiving.store(false, Ordering::Release);
        for worker in &self.workers {
            worker.request_stop();
        }
        for worker in &mut self.workers {
            worker.join_timeout(Duration::from_millis(500));
        }
        self.workers.clear();
    }
}

impl Drop for OpusRtpReceiver {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;

    fn rtp_packet(ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; RTP_HEADER_LEN];
        packet[0] = 0x80; // version 2, no padding, no extensions
        packet[1] = 0x60; // payload type
        packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn reader(kind: StreamKind) -> (StreamReader, Arc<FrameRing>, Arc<MemorySink>, Arc<RtpStats>) {
        let ring = Arc::new(FrameRing::new());
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(RtpStats::default());
        let reader = StreamReader::new(
            kind,
            Arc::clone(&ring),
            Arc::clone(&sink) as Arc<dyn AudioSink>,
            Arc::clone(&stats),
        )
        .unwrap();
        (reader, ring, sink, stats)
    }

    #[test]
    fn header_only_packet_is_rejected() {
        assert!(!validate_rtp(&rtp_packet(1, &[])));
    }

    #[test]
    fn thirteen_bytes_is_enough() {
        assert!(validate_rtp(&rtp_packet(1, &[0u8])));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut packet = rtp_packet(1, &[0u8]);
        packet[0] = 0x40; // version 1
        assert!(!validate_rtp(&packet));
        packet[0] = 0xC0; // version 3
        assert!(!validate_rtp(&packet));
    }

    #[test]
    fn short_packets_are_rejected() {
        assert!(!validate_rtp(&[]));
        assert!(!validate_rtp(&[0x80; 11]));
        assert!(!validate_rtp(&[0x80; 12]));
    }

    #[test]
    fn ssrc_is_big_endian_bytes_8_to_11() {
        let packet = rtp_packet(0xAABBCCDD, &[0u8]);
        assert_eq!(extract_ssrc(&packet), 0xAABBCCDD);
    }

    #[test]
    fn first_packet_initializes_without_reset_or_clear() {
        let (mut reader, _ring, sink, stats) = reader(StreamKind::Dialog);
        sink.queue_samples(&[1, 2, 3]);

        reader.handle_packet(&rtp_packet(0xAAAA, &[0u8; 20]));

        assert_eq!(reader.last_ssrc(), Some(0xAAAA));
        assert_eq!(stats.ssrc_resets.load(Ordering::Relaxed), 0);
        // The sink was not cleared on initialization.
        assert_eq!(sink.queued_samples(), 3);
    }

    #[test]
    fn dialog_ssrc_change_resets_and_clears_the_sink() {
        let (mut reader, _ring, sink, stats) = reader(StreamKind::Dialog);

        for _ in 0..4 {
            reader.handle_packet(&rtp_packet(0xAAAA, &[0u8; 20]));
        }
        sink.queue_samples(&[5; 960]);

        reader.handle_packet(&rtp_packet(0xBBBB, &[0u8; 20]));

        assert_eq!(reader.last_ssrc(), Some(0xBBBB));
        assert_eq!(stats.ssrc_resets.load(Ordering::Relaxed), 1);
        assert_eq!(sink.queued_samples(), 0);
    }

    #[test]
    fn bgm_ssrc_change_resets_but_leaves_the_sink_alone() {
        let (mut reader, _ring, sink, stats) = reader(StreamKind::Bgm);
        reader.handle_packet(&rtp_packet(0x1111, &[0u8; 20]));
        sink.queue_samples(&[5; 480]);

        reader.handle_packet(&rtp_packet(0x2222, &[0u8; 20]));

        assert_eq!(stats.ssrc_resets.load(Ordering::Relaxed), 1);
        assert_eq!(sink.queued_samples(), 480);
    }

    #[test]
    fn garbage_payload_publishes_silence() {
        let (mut reader, ring, _sink, stats) = reader(StreamKind::Dialog);
        // A code-3 packet with a zero frame count is invalid by
        // definition; the decoder must refuse it.
        reader.handle_packet(&rtp_packet(0xAAAA, &[0x03, 0x00]));

        let mut out: FrameSamples = [7; SAMPLES_PER_FRAME];
        assert!(ring.consume(&mut out));
        assert!(out.iter().all(|&s| s == 0));
        // Failed decodes do not count as received packets.
        assert_eq!(stats.packets_received(), 0);
    }

    #[test]
    fn mix_is_saturating_addition() {
        let loud: FrameSamples = [20_000; SAMPLES_PER_FRAME];
        let quiet: FrameSamples = [-5_000; SAMPLES_PER_FRAME];
        let mut out: FrameSamples = [0; SAMPLES_PER_FRAME];

        mix_frames(Some(&loud), Some(&quiet), &mut out);
        assert!(out.iter().all(|&s| s == 15_000));

        mix_frames(Some(&loud), Some(&loud), &mut out);
        assert!(out.iter().all(|&s| s == i16::MAX));

        let low: FrameSamples = [-20_000; SAMPLES_PER_FRAME];
        mix_frames(Some(&low), Some(&low), &mut out);
        assert!(out.iter().all(|&s| s == i16::MIN));
    }

    #[test]
    fn missing_streams_mix_as_silence() {
        let tone: FrameSamples = [100; SAMPLES_PER_FRAME];
        let mut out: FrameSamples = [1; SAMPLES_PER_FRAME];
        mix_frames(None, None, &mut out);
        assert!(out.iter().all(|&s| s == 0));
        mix_frames(Some(&tone), None, &mut out);
        assert!(out.iter().all(|&s| s == 100));
    }
}
