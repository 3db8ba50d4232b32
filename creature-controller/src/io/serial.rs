// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One full-duplex serial link to a motor module.
//!
//! The port runs raw 115200 8-N-1 with no flow control. A reader worker
//! frames inbound bytes on `\n` and feeds the link's inbound mailbox; a
//! writer worker drains the outbound mailbox and appends `\n`. The link
//! philosophy is deliberate: set the port up once and, if anything goes
//! wrong afterwards, shut down cleanly instead of attempting reconnection.

use creature_common::{ControllerError, Mailbox, Result, Worker};
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags,
    LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::protocol::{Frame, ModuleId};

/// Reader wakes at least this often to notice a stop request.
const READ_POLL_TIMEOUT_MS: u16 = 100;
/// Largest chunk pulled off the port in one read.
const READ_CHUNK: usize = 255;

/// Splits every complete `\n`-terminated line out of `residual`, leaving
/// any trailing fragment in place. Trailing `\r` is stripped and empty
/// lines are dropped.
pub fn extract_lines(residual: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline) = residual.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = residual.drain(..=newline).collect();
        line.pop(); // the newline itself
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.is_empty() {
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
    }
    lines
}

/// Checks that `path` names an existing character device.
pub fn ensure_character_device(path: &str) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ControllerError::InvalidConfiguration(format!("device node {path} is not accessible: {e}"))
    })?;
    if !metadata.file_type().is_char_device() {
        return Err(ControllerError::InvalidConfiguration(format!(
            "device node {path} is not a character device"
        )));
    }
    Ok(())
}

pub struct SerialLink {
    module: ModuleId,
    device_node: String,
    fd: Option<Arc<OwnedFd>>,
    reader: Option<Worker>,
    writer: Option<Worker>,
    outbound: Arc<Mailbox<Frame>>,
}

impl SerialLink {
    /// Opens and configures the port, then spawns the reader and writer
    /// workers. Fails fast on a missing or misconfigurable device; a
    /// headless controller with no link to its module cannot safely
    /// continue, so callers treat this as fatal.
    pub fn open(
        device_node: &str,
        module: ModuleId,
        inbound: Arc<Mailbox<Frame>>,
        outbound: Arc<Mailbox<Frame>>,
    ) -> Result<SerialLink> {
        info!(%module, device = device_node, "opening serial link");
        ensure_character_device(device_node)?;

        let raw = open(
            device_node,
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_NOCTTY,
            Mode::empty(),
        )
        .map_err(|e| {
            ControllerError::Transport(format!("cannot open serial port {device_node}: {e}"))
        })?;
        // SAFETY: `open` just returned this descriptor and nothing else
        // owns it.
        let fd = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });

        configure_port(&fd, device_node)?;
        debug!(device = device_node, "serial port configured");

        let reader = spawn_reader(device_node, module, Arc::clone(&fd), inbound)?;
        let writer = spawn_writer(device_node, module, Arc::clone(&fd), Arc::clone(&outbound))?;

        Ok(SerialLink {
            module,
            device_node: device_node.to_string(),
            fd: Some(fd),
            reader: Some(reader),
            writer: Some(writer),
            outbound,
        })
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn device_node(&self) -> &str {
        &self.device_node
    }

    /// Stops the writer, then the reader, then closes the descriptor.
    pub fn shutdown(&mut self) {
        info!(module = %self.module, device = %self.device_node, "shutting down serial link");
        // The writer blocks on the outbound mailbox; wake it first.
        self.outbound.request_shutdown();
        if let Some(mut writer) = self.writer.take() {
            writer.stop(Duration::from_millis(200));
        }
        if let Some(mut reader) = self.reader.take() {
            reader.stop(Duration::from_millis(200));
        }
        // Dropping the last Arc closes the descriptor.
        self.fd = None;
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.fd.is_some() {
            self.shutdown();
        }
    }
}

/// Raw mode: 8-N-1 at 115200, receiver on, modem lines ignored, no
/// canonical processing, echo, signal characters, flow control, byte
/// translation, or output post-processing. VMIN=0/VTIME=1 keeps reads
/// short so the poll loop stays responsive.
fn configure_port(fd: &OwnedFd, device_node: &str) -> Result<()> {
    let mut tty = tcgetattr(fd.as_fd()).map_err(|e| {
        ControllerError::Transport(format!("cannot read settings for {device_node}: {e}"))
    })?;

    tty.control_flags &= !(ControlFlags::PARENB
        | ControlFlags::CSTOPB
        | ControlFlags::CSIZE
        | ControlFlags::CRTSCTS);
    tty.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;

    tty.local_flags &= !(LocalFlags::ICANON
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHONL
        | LocalFlags::ISIG);

    tty.input_flags &= !(InputFlags::IXON
        | InputFlags::IXOFF
        | InputFlags::IXANY
        | InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL);

    tty.output_flags &= !(OutputFlags::OPOST | OutputFlags::ONLCR);

    tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

    cfsetispeed(&mut tty, BaudRate::B115200).map_err(|e| {
        ControllerError::Transport(format!("cannot set input speed for {device_node}: {e}"))
    })?;
    cfsetospeed(&mut tty, BaudRate::B115200).map_err(|e| {
        ControllerError::Transport(format!("cannot set output speed for {device_node}: {e}"))
    })?;

    tcsetattr(fd.as_fd(), SetArg::TCSANOW, &tty).map_err(|e| {
        ControllerError::Transport(format!("cannot apply settings to {device_node}: {e}"))
    })
}

fn spawn_reader(
    device_node: &str,
    module: ModuleId,
    fd: Arc<OwnedFd>,
    inbound: Arc<Mailbox<Frame>>,
) -> Result<Worker> {
    let name = format!("serial-reader-{module}");
    let device = device_node.to_string();
    Worker::spawn(&name, move |stop| {
        let mut residual: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        while !stop.is_set() {
            let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
            let ready = match poll(&mut fds, PollTimeout::from(READ_POLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    error!(device = %device, %e, "poll failed, reader exiting");
                    break;
                }
            };
            if ready == 0 {
                continue;
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                error!(device = %device, ?revents, "serial port error, reader exiting");
                break;
            }
            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }

            match nix::unistd::read(fd.as_raw_fd(), &mut chunk) {
                Ok(0) => {
                    error!(device = %device, "serial port disconnected (EOF), reader exiting");
                    break;
                }
                Ok(n) => {
                    residual.extend_from_slice(&chunk[..n]);
                    for line in extract_lines(&mut residual) {
                        trace!(device = %device, payload = %line, "inbound frame");
                        inbound.push(Frame::new(module, line));
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => {
                    error!(device = %device, %e, "read failed, reader exiting");
                    break;
                }
            }
        }
        debug!(device = %device, "serial reader stopped");
    })
    .map_err(|e| ControllerError::Transport(format!("cannot spawn {name}: {e}")))
}

fn spawn_writer(
    device_node: &str,
    module: ModuleId,
    fd: Arc<OwnedFd>,
    outbound: Arc<Mailbox<Frame>>,
) -> Result<Worker> {
    let name = format!("serial-writer-{module}");
    let device = device_node.to_string();
    Worker::spawn(&name, move |stop| {
        while !stop.is_set() {
            let frame = match outbound.pop() {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let mut payload = frame.payload;
            payload.push('\n');
            trace!(device = %device, bytes = payload.len(), "writing frame");
            if let Err(e) = nix::unistd::write(fd.as_fd(), payload.as_bytes()) {
                error!(device = %device, %e, "write failed, writer exiting");
                break;
            }
        }
        debug!(device = %device, "serial writer stopped");
    })
    .map_err(|e| ControllerError::Transport(format!("cannot spawn {name}: {e}")))
}
