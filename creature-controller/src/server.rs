// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The outbound server boundary.
//!
//! The WebSocket client proper lives outside this crate; here it is a
//! [`ServerTransport`] that accepts finished envelope strings. The writer
//! worker drains the notice mailbox whether or not sending is enabled;
//! a disabled sink must still consume the queue so nothing accumulates
//! forever.

use creature_common::{Mailbox, Result, Worker};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// A structured message bound for the show server.
#[derive(Debug, Clone)]
pub enum OutboundNotice {
    BoardSensorReport(Value),
    MotorSensorReport(Value),
    DynamixelSensorReport(Value),
    WatchdogWarning(Value),
    EmergencyStop(Value),
}

impl OutboundNotice {
    pub fn command_tag(&self) -> &'static str {
        match self {
            OutboundNotice::BoardSensorReport(_) => "board-sensor-report",
            OutboundNotice::MotorSensorReport(_) => "motor-sensor-report",
            OutboundNotice::DynamixelSensorReport(_) => "dynamixel-sensor-report",
            OutboundNotice::WatchdogWarning(_) => "watchdog-warning",
            OutboundNotice::EmergencyStop(_) => "emergency-stop",
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            OutboundNotice::BoardSensorReport(payload)
            | OutboundNotice::MotorSensorReport(payload)
            | OutboundNotice::DynamixelSensorReport(payload)
            | OutboundNotice::WatchdogWarning(payload)
            | OutboundNotice::EmergencyStop(payload) => payload,
        }
    }

    /// The wire envelope: `{"creature_id", "command", "payload"}`.
    pub fn to_envelope(&self, creature_id: &str) -> String {
        #[derive(Serialize)]
        struct Envelope<'a> {
            creature_id: &'a str,
            command: &'a str,
            payload: &'a Value,
        }
        let envelope = Envelope {
            creature_id,
            command: self.command_tag(),
            payload: self.payload(),
        };
        // Serialization of a Value + two strings cannot fail.
        serde_json::to_string(&envelope).unwrap_or_default()
    }
}

/// Where finished envelopes go. The production implementation wraps the
/// show-server WebSocket; tests capture strings.
pub trait ServerTransport: Send + Sync {
    fn send_text(&self, message: &str);
}

/// A transport that just logs. Used when the controller runs without a
/// show-server connection.
pub struct LoggingTransport;

impl ServerTransport for LoggingTransport {
    fn send_text(&self, message: &str) {
        debug!(%message, "outbound server message");
    }
}

/// Cloneable handle for publishing notices from anywhere in the controller.
#[derive(Clone)]
pub struct ServerHandle {
    queue: Arc<Mailbox<OutboundNotice>>,
}

impl ServerHandle {
    pub fn publish(&self, notice: OutboundNotice) {
        self.queue.push(notice);
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Owns the outbound queue and the worker that drains it.
pub struct ServerWriter {
    creature_id: String,
    transport: Arc<dyn ServerTransport>,
    queue: Arc<Mailbox<OutboundNotice>>,
    enabled: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl ServerWriter {
    pub fn new(
        creature_id: impl Into<String>,
        transport: Arc<dyn ServerTransport>,
        enabled: bool,
    ) -> Self {
        ServerWriter {
            creature_id: creature_id.into(),
            transport,
            queue: Arc::new(Mailbox::new()),
            enabled: Arc::new(AtomicBool::new(enabled)),
            worker: None,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn start(&mut self) -> Result<()> {
        let queue = Arc::clone(&self.queue);
        let enabled = Arc::clone(&self.enabled);
        let transport = Arc::clone(&self.transport);
        let creature_id = self.creature_id.clone();
        let worker = Worker::spawn("server-writer", move |stop| {
            info!("server writer running");
            while !stop.is_set() {
                let notice = match queue.pop_timed(Duration::from_millis(100)) {
                    Ok(Some(notice)) => notice,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                // Keep chewing the queue even when disabled so it never
                // grows without bound.
                if !enabled.load(Ordering::Acquire) {
                    debug!(command = notice.command_tag(), "dropping notice, writer disabled");
                    continue;
                }
                let envelope = notice.to_envelope(&creature_id);
                if envelope.is_empty() {
                    error!(command = notice.command_tag(), "failed to serialize notice");
                    continue;
                }
                transport.send_text(&envelope);
            }
            info!("server writer stopping");
        })
        .map_err(|e| creature_common::ControllerError::Transport(e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.queue.request_shutdown();
        if let Some(mut worker) = self.worker.take() {
            worker.stop(Duration::from_millis(200));
        }
        self.queue.clear();
    }
}

impl Drop for ServerWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures every envelope handed to the transport.
    #[derive(Default)]
    pub struct CapturingTransport {
        pub sent: Mutex<Vec<String>>,
    }

    impl ServerTransport for CapturingTransport {
        fn send_text(&self, message: &str) {
            self.sent.lock().unwrap().push(message.to_string());
        }
    }

    /// A handle with no writer behind it; the returned mailbox lets a test
    /// inspect everything published.
    pub fn detached_handle() -> (ServerHandle, Arc<Mailbox<OutboundNotice>>) {
        let queue = Arc::new(Mailbox::new());
        (
            ServerHandle {
                queue: Arc::clone(&queue),
            },
            queue,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CapturingTransport;
    use super::*;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn envelope_shape_matches_the_server_contract() {
        let notice = OutboundNotice::EmergencyStop(serde_json::json!({
            "reason": "temperature limit exceeded for too long",
            "timestamp": 1700000000123u64,
        }));
        let envelope: Value = serde_json::from_str(&notice.to_envelope("beaky")).unwrap();
        assert_eq!(envelope["creature_id"], "beaky");
        assert_eq!(envelope["command"], "emergency-stop");
        assert_eq!(
            envelope["payload"]["reason"],
            "temperature limit exceeded for too long"
        );
    }

    #[test]
    fn command_tags_are_stable() {
        let value = serde_json::json!({});
        assert_eq!(
            OutboundNotice::BoardSensorReport(value.clone()).command_tag(),
            "board-sensor-report"
        );
        assert_eq!(
            OutboundNotice::MotorSensorReport(value.clone()).command_tag(),
            "motor-sensor-report"
        );
        assert_eq!(
            OutboundNotice::DynamixelSensorReport(value.clone()).command_tag(),
            "dynamixel-sensor-report"
        );
        assert_eq!(
            OutboundNotice::WatchdogWarning(value.clone()).command_tag(),
            "watchdog-warning"
        );
        assert_eq!(
            OutboundNotice::EmergencyStop(value).command_tag(),
            "emergency-stop"
        );
    }

    #[test]
    fn enabled_writer_delivers_to_the_transport() {
        let transport = Arc::new(CapturingTransport::default());
        let mut writer = ServerWriter::new("beaky", Arc::clone(&transport) as _, true);
        writer.start().unwrap();
        writer
            .handle()
            .publish(OutboundNotice::WatchdogWarning(serde_json::json!({"v": 1})));
        wait_for("delivery", || !transport.sent.lock().unwrap().is_empty());
        writer.shutdown();
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("watchdog-warning"));
    }

    #[test]
    fn disabled_writer_drains_but_sends_nothing() {
        let transport = Arc::new(CapturingTransport::default());
        let mut writer = ServerWriter::new("beaky", Arc::clone(&transport) as _, false);
        let handle = writer.handle();
        writer.start().unwrap();
        for _ in 0..5 {
            handle.publish(OutboundNotice::EmergencyStop(serde_json::json!({})));
        }
        wait_for("drain", || handle.pending() == 0);
        assert!(transport.sent.lock().unwrap().is_empty());

        // Re-enabling starts delivery again without restarting anything.
        writer.set_enabled(true);
        handle.publish(OutboundNotice::EmergencyStop(serde_json::json!({})));
        wait_for("delivery after enable", || {
            !transport.sent.lock().unwrap().is_empty()
        });
        writer.shutdown();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }
}
