// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The output side of the audio path.
//!
//! The mixer treats the sink as a sample queue: push a 20 ms block every
//! tick, watch the backlog, clear it when the dialog stream switches
//! speakers, and start playback once the prefill watermark is reached.
//! [`CpalSink`] puts a real output device behind that queue; the cpal
//! stream is `!Send` on some hosts, so it is built and kept on a dedicated
//! worker thread.

use creature_common::{ControllerError, Result, Worker};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

use super::SAMPLE_RATE;

pub trait AudioSink: Send + Sync {
    /// Appends samples to the playback queue.
    fn queue_samples(&self, samples: &[i16]);

    /// Samples queued but not yet played.
    fn queued_samples(&self) -> usize;

    /// Drops everything queued. Used to cut off a previous speaker the
    /// instant the dialog stream changes source.
    fn clear(&self);

    /// Gates actual output; until the first `set_playing(true)` the device
    /// emits silence while the queue fills.
    fn set_playing(&self, playing: bool);

    fn is_playing(&self) -> bool;
}

/// The queue itself, with no device attached. The cpal callback drains one
/// of these; tests use it directly.
#[derive(Default)]
pub struct MemorySink {
    queue: Mutex<VecDeque<i16>>,
    playing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves up to `out.len()` queued samples into `out`, zero-filling the
    /// remainder. Returns how many real samples were delivered.
    pub fn drain_into(&self, out: &mut [i16]) -> usize {
        let mut queue = self.lock_queue();
        let available = queue.len().min(out.len());
        for slot in out.iter_mut().take(available) {
            // The length check above guarantees a sample is present.
            *slot = queue.pop_front().unwrap_or(0);
        }
        for slot in out.iter_mut().skip(available) {
            *slot = 0;
        }
        available
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<i16>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AudioSink for MemorySink {
    fn queue_samples(&self, samples: &[i16]) {
        self.lock_queue().extend(samples.iter().copied());
    }

    fn queued_samples(&self) -> usize {
        self.lock_queue().len()
    }

    fn clear(&self) {
        self.lock_queue().clear();
    }

    fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

/// A [`MemorySink`] drained by a cpal output stream at 48 kHz mono.
pub struct CpalSink {
    inner: Arc<MemorySink>,
    worker: Option<Worker>,
}

impl CpalSink {
    /// Opens the default output device. Fails (to the audio subsystem
    /// only) when there is no usable device.
    pub fn open() -> Result<CpalSink> {
        let inner = Arc::new(MemorySink::new());
        let callback_sink = Arc::clone(&inner);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        let worker = Worker::spawn("audio-output", move |stop| {
            use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

            let host = cpal::default_host();
            let Some(device) = host.default_output_device() else {
                let _ = ready_tx.send(Err("no default audio output device".to_string()));
                return;
            };
            let config = cpal::StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(SAMPLE_RATE),
                buffer_size: cpal::BufferSize::Default,
            };
            let mut staging = vec![0i16; 4096];
            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _| {
                    if callback_sink.is_playing() {
                        if staging.len() < data.len() {
                            staging.resize(data.len(), 0);
                        }
                        callback_sink.drain_into(&mut staging[..data.len()]);
                        for (out, sample) in data.iter_mut().zip(staging.iter()) {
                            *out = f32::from(*sample) / 32768.0;
                        }
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| error!(%err, "audio output stream error"),
                None,
            );
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("cannot build output stream: {e}")));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(format!("cannot start output stream: {e}")));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            info!("audio output stream running");

            // The stream must stay on this thread; park until shutdown.
            while !stop.is_set() {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            debug!("audio output stream closed");
        })
        .map_err(|e| ControllerError::Transport(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(CpalSink {
                inner,
                worker: Some(worker),
            }),
            Ok(Err(message)) => Err(ControllerError::Transport(message)),
            Err(_) => Err(ControllerError::Transport(
                "timed out opening audio output device".to_string(),
            )),
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop(Duration::from_millis(500));
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AudioSink for CpalSink {
    fn queue_samples(&self, samples: &[i16]) {
        self.inner.queue_samples(samples);
    }

    fn queued_samples(&self) -> usize {
        self.inner.queued_samples()
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn set_playing(&self, playing: bool) {
        self.inner.set_playing(playing);
    }

    fn is_playing(&self) -> bool {
        self.inner.is_playing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_grows_and_clears() {
        let sink = MemorySink::new();
        sink.queue_samples(&[1, 2, 3]);
        sink.queue_samples(&[4, 5]);
        assert_eq!(sink.queued_samples(), 5);
        sink.clear();
        assert_eq!(sink.queued_samples(), 0);
    }

    #[test]
    fn drain_preserves_order_and_zero_fills() {
        let sink = MemorySink::new();
        sink.queue_samples(&[10, 20, 30]);
        let mut out = [99i16; 5];
        let delivered = sink.drain_into(&mut out);
        assert_eq!(delivered, 3);
        assert_eq!(out, [10, 20, 30, 0, 0]);
        assert_eq!(sink.queued_samples(), 0);
    }

    #[test]
    fn playing_flag_defaults_off() {
        let sink = MemorySink::new();
        assert!(!sink.is_playing());
        sink.set_playing(true);
        assert!(sink.is_playing());
    }
}
