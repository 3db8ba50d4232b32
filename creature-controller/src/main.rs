// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use creature_controller::audio::sink::CpalSink;
use creature_controller::audio::AudioSubsystem;
use creature_controller::config::{CommandLine, CreatureConfig, UartDeviceConfig};
use creature_controller::io::router::MessageRouter;
use creature_controller::module::ModuleHandler;
use creature_controller::protocol::ModuleId;
use creature_controller::server::{LoggingTransport, ServerWriter};
use creature_controller::watchdog::Watchdog;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("welcome to the creature controller");

    let command_line = CommandLine::parse();
    let mut creature = CreatureConfig::load(&command_line.creature_config)
        .context("creature configuration is unusable")?;

    // A creature file with no UART table gets the command line device on
    // module A, matching the single-module default.
    if creature.uart_devices.is_empty() {
        creature.uart_devices.push(UartDeviceConfig {
            module: ModuleId::A,
            device_node: command_line.usb_device.clone(),
            enabled: true,
        });
    }
    let creature = Arc::new(creature);
    info!(creature = %creature.id, channel = creature.audio_channel, "configuration loaded");

    let router = Arc::new(MessageRouter::new());
    router.start().context("cannot start message router")?;

    let mut server_writer = ServerWriter::new(&creature.id, Arc::new(LoggingTransport), true);
    server_writer.start().context("cannot start server writer")?;

    // One handler per enabled module. A module that cannot come up is
    // fatal: a controller that cannot reach its motors must not run.
    let mut handlers = Vec::new();
    for device in creature.enabled_uart_devices() {
        let mut handler = ModuleHandler::new(
            device.module,
            &device.device_node,
            Arc::clone(&router),
            server_writer.handle(),
            Arc::clone(&creature),
        )
        .with_context(|| format!("cannot create handler for module {}", device.module))?;
        handler
            .init()
            .with_context(|| format!("cannot initialize module {}", device.module))?;
        handler
            .start()
            .with_context(|| format!("cannot start module {}", device.module))?;
        handlers.push(handler);
    }

    // Audio is best-effort: a controller without sound still controls.
    let mut audio = match CpalSink::open() {
        Ok(sink) => {
            match AudioSubsystem::new(
                creature.audio_channel,
                &creature.interface_ip,
                creature.rtp_port,
                Arc::new(sink),
            ) {
                Ok(mut subsystem) => match subsystem.start() {
                    Ok(()) => Some(subsystem),
                    Err(e) => {
                        error!(%e, "audio subsystem failed to start, continuing without audio");
                        None
                    }
                },
                Err(e) => {
                    error!(%e, "audio subsystem misconfigured, continuing without audio");
                    None
                }
            }
        }
        Err(e) => {
            error!(%e, "no audio output device, continuing without audio");
            None
        }
    };

    let mut watchdog = Watchdog::new(
        creature.watchdog.clone(),
        Arc::clone(&router),
        server_writer.handle(),
    );
    watchdog.start().context("cannot start watchdog")?;

    install_signal_handlers();
    info!("controller running");

    let mut estop_logged = false;
    let mut ticks: u64 = 0;
    while !SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
        ticks += 1;
        if watchdog.tripped() && !estop_logged {
            // Stay up in failsafe so the operator can see state and logs.
            warn!("emergency stop has fired; controller is in failsafe");
            estop_logged = true;
        }
        // A PING every five seconds keeps round-trip numbers in the logs
        // and proves each link is alive.
        if ticks % 50 == 0 {
            for handler in &handlers {
                if handler.is_ready() {
                    if let Err(e) = handler.ping() {
                        warn!(module = %handler.module(), %e, "ping failed");
                    }
                }
            }
        }
    }

    info!("shutdown requested, stopping subsystems");
    watchdog.shutdown();
    if let Some(audio) = audio.as_mut() {
        audio.shutdown();
    }
    for handler in &mut handlers {
        handler.shutdown();
    }
    router.shutdown();
    server_writer.shutdown();

    info!("goodbye");
    Ok(())
}
