// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-module handler: one serial link, one message processor, and the
//! module's lifecycle state machine.
//!
//! The handler owns the processor and the link. The processor (and the
//! inbound message handlers it dispatches to) hold an `Arc<ModuleCore>`,
//! the interface surface the handler passes down at construction, valid for
//! the handler's whole lifetime.

use creature_common::{ControllerError, Mailbox, Result, Worker};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::CreatureConfig;
use crate::io::processor;
use crate::io::router::MessageRouter;
use crate::io::serial::{self, SerialLink};
use crate::protocol::commands::{ping_now, PositionCommand, ServoModuleConfiguration};
use crate::protocol::{
    Frame, HandlerState, ModuleId, ServoPosition, EXPECTED_FIRMWARE_VERSION,
};
use crate::server::ServerHandle;

/// The state and operations the message processor needs from its owning
/// handler.
pub struct ModuleCore {
    module: ModuleId,
    incoming: Arc<Mailbox<Frame>>,
    outgoing: Arc<Mailbox<Frame>>,
    router: Arc<MessageRouter>,
    server: ServerHandle,
    creature: Arc<CreatureConfig>,
    ready: AtomicBool,
    configured: AtomicBool,
    shutting_down: AtomicBool,
    firmware_version: AtomicU32,
    last_ping_sent: Mutex<Option<Instant>>,
}

impl ModuleCore {
    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    /// The firmware has checked in with its version and wants its
    /// configuration. A version other than the one this controller was
    /// built against is a fatal configuration error; the state machine
    /// stays where it is.
    pub fn firmware_ready_for_initialization(&self, version: u32) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ControllerError::ShuttingDown);
        }
        if version != EXPECTED_FIRMWARE_VERSION {
            let message = format!(
                "firmware version mismatch on module {}: expected {EXPECTED_FIRMWARE_VERSION}, got {version}",
                self.module
            );
            error!("{message}");
            return Err(ControllerError::InvalidConfiguration(message));
        }
        self.firmware_version.store(version, Ordering::Release);
        self.router.set_state(self.module, HandlerState::Configuring)?;

        let configuration = ServoModuleConfiguration::from_creature(&self.creature, self.module);
        let frame = Frame::new(self.module, configuration.to_message_with_checksum());
        self.router.send(frame).map_err(|e| {
            error!(module = %self.module, %e, "failed to send module configuration");
            e
        })?;
        info!(module = %self.module, version, "firmware configuration sent");
        Ok(())
    }

    /// The firmware finished applying its configuration and is ready to
    /// take motion commands.
    pub fn firmware_ready_to_operate(&self) {
        if self.is_shutting_down() {
            warn!(module = %self.module, "READY received while shutting down");
            return;
        }
        info!(module = %self.module, "firmware is ready to operate");
        self.ready.store(true, Ordering::Release);
        self.configured.store(true, Ordering::Release);
        if let Err(e) = self.router.set_state(self.module, HandlerState::Ready) {
            error!(module = %self.module, %e, "could not mark module ready");
        }
    }

    /// Publishes a message into the router's aggregate inbound stream.
    pub fn send_to_controller(&self, payload: impl Into<String>) {
        if self.is_shutting_down() {
            return;
        }
        self.router.received_from(Frame::new(self.module, payload));
    }

    /// Remembers when the most recent PING left, for RTT pairing.
    pub fn record_ping_sent(&self) {
        *self.lock_ping() = Some(Instant::now());
    }

    /// Time since the last recorded PING, if one is outstanding.
    pub fn ping_round_trip(&self) -> Option<Duration> {
        self.lock_ping().take().map(|sent| sent.elapsed())
    }

    fn lock_ping(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.last_ping_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct ModuleHandler {
    core: Arc<ModuleCore>,
    device_node: String,
    serial: Option<SerialLink>,
    processor: Option<Worker>,
}

impl ModuleHandler {
    /// Creates the handler, its mailboxes, and its router registration.
    /// The module starts Idle.
    pub fn new(
        module: ModuleId,
        device_node: impl Into<String>,
        router: Arc<MessageRouter>,
        server: ServerHandle,
        creature: Arc<CreatureConfig>,
    ) -> Result<ModuleHandler> {
        let device_node = device_node.into();
        info!(%module, device = %device_node, "creating module handler");

        let incoming = Arc::new(Mailbox::new());
        let outgoing = Arc::new(Mailbox::new());
        router.register(module, Arc::clone(&incoming), Arc::clone(&outgoing))?;
        router.set_state(module, HandlerState::Idle)?;

        Ok(ModuleHandler {
            core: Arc::new(ModuleCore {
                module,
                incoming,
                outgoing,
                router,
                server,
                creature,
                ready: AtomicBool::new(false),
                configured: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                firmware_version: AtomicU32::new(0),
                last_ping_sent: Mutex::new(None),
            }),
            device_node,
            serial: None,
            processor: None,
        })
    }

    pub fn core(&self) -> &Arc<ModuleCore> {
        &self.core
    }

    pub fn module(&self) -> ModuleId {
        self.core.module
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Wires the handler up: validates the serial device and arms the state
    /// machine for the firmware handshake.
    pub fn init(&mut self) -> Result<()> {
        if self.core.is_shutting_down() {
            warn!(module = %self.module(), "init called while shutting down");
            return Err(ControllerError::ShuttingDown);
        }
        serial::ensure_character_device(&self.device_node)?;
        self.core
            .router
            .set_state(self.module(), HandlerState::AwaitingConfiguration)
    }

    /// Launches the processor worker and the serial link's reader and
    /// writer.
    pub fn start(&mut self) -> Result<()> {
        if self.core.is_shutting_down() {
            warn!(module = %self.module(), "start called while shutting down");
            return Err(ControllerError::ShuttingDown);
        }

        let core = Arc::clone(&self.core);
        let name = format!("module-processor-{}", self.module());
        let processor = Worker::spawn(&name, move |stop| {
            info!(module = %core.module, "message processor running");
            while !stop.is_set() {
                let frame = match core.incoming.pop_timed(Duration::from_millis(100)) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(_) => break,
                };
                if let Err(e) = processor::dispatch(&core, &frame.payload) {
                    // Per-frame problems never take the processor down.
                    warn!(module = %core.module, %e, payload = %frame.payload, "error processing message");
                }
            }
            info!(module = %core.module, "message processor stopping");
        })
        .map_err(|e| ControllerError::Transport(e.to_string()))?;
        self.processor = Some(processor);

        let link = SerialLink::open(
            &self.device_node,
            self.module(),
            Arc::clone(&self.core.incoming),
            Arc::clone(&self.core.outgoing),
        )?;
        self.serial = Some(link);
        Ok(())
    }

    /// Submits a batch of servo targets. Rejected with `NotReady` unless
    /// the firmware handshake has completed.
    pub fn set_positions(&self, positions: &[ServoPosition]) -> Result<()> {
        if !self.core.is_ready() {
            return Err(ControllerError::NotReady(self.module().to_string()));
        }
        let mut command = PositionCommand::new();
        for position in positions {
            command.add(*position)?;
        }
        let message = command.to_message_with_checksum();
        if message.is_empty() {
            return Ok(());
        }
        self.core.router.send(Frame::new(self.module(), message))
    }

    /// Sends a PING stamped with the current wall clock and records the
    /// send instant for RTT pairing.
    pub fn ping(&self) -> Result<()> {
        let message = crate::protocol::checksum::append(&ping_now());
        self.core.record_ping_sent();
        self.core.router.send(Frame::new(self.module(), message))
    }

    /// Signals stop, drains and clears both mailboxes, then joins the
    /// workers: processor and writer first, reader after, descriptor last.
    pub fn shutdown(&mut self) {
        info!(module = %self.module(), "shutting down module handler");
        self.core.shutting_down.store(true, Ordering::Release);

        self.core.incoming.request_shutdown();
        self.core.incoming.clear();
        self.core.outgoing.request_shutdown();
        self.core.outgoing.clear();

        if let Err(e) = self.core.router.set_state(self.module(), HandlerState::Stopped) {
            warn!(module = %self.module(), %e, "could not mark module stopped");
        }

        if let Some(mut processor) = self.processor.take() {
            processor.stop(Duration::from_millis(200));
        }
        if let Some(mut serial) = self.serial.take() {
            serial.shutdown();
        }
    }
}

impl Drop for ModuleHandler {
    fn drop(&mut self) {
        if !self.core.is_shutting_down() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::server::testing::detached_handle;
    use crate::server::OutboundNotice;

    /// A handler wired to a private router and a detached server queue,
    /// ready for driving the state machine and the message handlers.
    pub struct CoreFixture {
        pub handler: ModuleHandler,
        pub router: Arc<MessageRouter>,
        pub server_queue: Arc<Mailbox<OutboundNotice>>,
    }

    impl std::ops::Deref for CoreFixture {
        type Target = ModuleCore;

        fn deref(&self) -> &ModuleCore {
            self.handler.core()
        }
    }

    pub fn test_creature() -> Arc<CreatureConfig> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "id": "test-creature",
                "audio_channel": 1,
                "uart_devices": [{ "module": "A", "device_node": "/dev/null" }],
                "servos": [
                    { "module": "A", "pin": 0, "type": "servo", "min_ticks": 1000, "max_ticks": 2000 },
                    { "module": "A", "pin": 3, "type": "dynamixel", "min_ticks": 0, "max_ticks": 8191 }
                ]
            }))
            .unwrap(),
        )
    }

    pub fn core_fixture() -> CoreFixture {
        let router = Arc::new(MessageRouter::new());
        let (server, server_queue) = detached_handle();
        let handler = ModuleHandler::new(
            ModuleId::A,
            "/dev/null",
            Arc::clone(&router),
            server,
            test_creature(),
        )
        .unwrap();
        CoreFixture {
            handler,
            router,
            server_queue,
        }
    }
}
