// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The audio subsystem: synchronized multicast Opus reception, mixing, and
//! local playback.
//!
//! The show server transmits two RTP streams per creature: dialog on
//! `239.19.63.<channel>` (channels 1–16) and shared background music on
//! channel 17. Both carry 20 ms mono Opus at 48 kHz on the same port.

pub mod ring;
pub mod rtp;
pub mod sink;

use creature_common::{ControllerError, Result, Worker};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use self::rtp::OpusRtpReceiver;
use self::sink::AudioSink;

// Network (must match the server side).
pub const DIALOG_GROUP_BASE: &str = "239.19.63.";
pub const BGM_GROUP: &str = "239.19.63.17";
pub const RTP_PORT: u16 = 5004;

// Opus framing.
pub const SAMPLE_RATE: u32 = 48_000;
pub const FRAME_MS: u64 = 20;
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize * FRAME_MS as usize) / 1000;
pub const RTP_HEADER_LEN: usize = 12;

// Buffering and monitoring.
pub const PREFILL_FRAMES: usize = 3;
pub const BUF_HIGH_WATERMARK: f32 = 0.8;
pub const BUF_LOW_WATERMARK: f32 = 0.1;
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the RTP receiver and a low-rate monitor of the sink backlog.
pub struct AudioSubsystem {
    dialog_group: Ipv4Addr,
    bgm_group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
    sink: Arc<dyn AudioSink>,
    receiver: Option<OpusRtpReceiver>,
    monitor: Option<Worker>,
}

impl AudioSubsystem {
    /// Builds the subsystem for one creature channel (1–16).
    pub fn new(
        creature_channel: u8,
        interface_ip: &str,
        port: u16,
        sink: Arc<dyn AudioSink>,
    ) -> Result<AudioSubsystem> {
        if !(1..=16).contains(&creature_channel) {
            return Err(ControllerError::InvalidConfiguration(format!(
                "creature channel must be 1-16, got {creature_channel}"
            )));
        }
        let interface = Ipv4Addr::from_str(interface_ip).map_err(|_| {
            ControllerError::InvalidConfiguration(format!(
                "bad interface address: {interface_ip}"
            ))
        })?;
        let dialog_group = Ipv4Addr::from_str(&format!("{DIALOG_GROUP_BASE}{creature_channel}"))
            .map_err(|_| {
                ControllerError::InvalidConfiguration(format!(
                    "bad dialog group for channel {creature_channel}"
                ))
            })?;
        let bgm_group = Ipv4Addr::from_str(BGM_GROUP)
            .map_err(|_| ControllerError::InvalidConfiguration("bad bgm group".to_string()))?;

        info!(%dialog_group, %bgm_group, port, "audio subsystem configured");
        Ok(AudioSubsystem {
            dialog_group,
            bgm_group,
            port,
            interface,
            sink,
            receiver: None,
            monitor: None,
        })
    }

    /// Opens the sockets and starts the readers, the mixer, and the
    /// monitor. Failure here is fatal to the audio subsystem only; the
    /// caller logs it and the controller carries on deaf.
    pub fn start(&mut self) -> Result<()> {
        let receiver = OpusRtpReceiver::open(
            self.dialog_group,
            self.bgm_group,
            self.port,
            self.interface,
            Arc::clone(&self.sink),
        )?;
        let stats = Arc::clone(receiver.stats());
        let sink = Arc::clone(&self.sink);

        let monitor = Worker::spawn("audio-monitor", move |stop| {
            debug!("audio monitor running");
            let mut since_report = Duration::ZERO;
            let step = Duration::from_millis(100);
            while !stop.is_set() {
                std::thread::sleep(step);
                since_report += step;
                if since_report < STATS_INTERVAL {
                    continue;
                }
                since_report = Duration::ZERO;

                // Backlog as a fraction of one second of audio.
                let level = sink.queued_samples() as f32 / SAMPLE_RATE as f32;
                let receiving = stats.receiving.load(std::sync::atomic::Ordering::Acquire);
                info!(
                    packets = stats.packets_received(),
                    buffer_pct = level * 100.0,
                    receiving,
                    "audio stats"
                );
                if level > BUF_HIGH_WATERMARK {
                    warn!(buffer_pct = level * 100.0, "audio buffer level high");
                } else if level < BUF_LOW_WATERMARK && receiving {
                    warn!(buffer_pct = level * 100.0, "audio buffer level low");
                }
            }
            debug!("audio monitor stopped");
        })
        .map_err(|e| ControllerError::Transport(e.to_string()))?;

        self.receiver = Some(receiver);
        self.monitor = Some(monitor);
        Ok(())
    }

    pub fn is_receiving(&self) -> bool {
        self.receiver.as_ref().is_some_and(OpusRtpReceiver::is_receiving)
    }

    pub fn stats_line(&self) -> String {
        match &self.receiver {
            Some(receiver) => {
                let level = self.sink.queued_samples() as f32 / SAMPLE_RATE as f32;
                format!(
                    "packets received={}, buffer={:.1}%, receiving={}",
                    receiver.stats().packets_received(),
                    level * 100.0,
                    if receiver.is_receiving() { "yes" } else { "no" }
                )
            }
            None => "audio disabled".to_string(),
        }
    }

    pub fn shutdown(&mut self) {
        info!("shutting down audio subsystem");
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop(Duration::from_millis(500));
        }
        if let Some(mut receiver) = self.receiver.take() {
            receiver.shutdown();
        }
    }
}

impl Drop for AudioSubsystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
