//! Serial CAN adapter transport.
//!
//! The adapter exchanges fixed 20-byte physical frames over a serial port.
//! A background thread reads the port, reassembles and decodes frames and
//! dispatches them into the hub; sends encode and write under a lock.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, error, info, instrument, trace, warn};

use super::hub::MessageHub;
use super::traits::{CanTransport, TransportError};
use crate::protocol::{FrameAssembler, frame};

/// Default adapter baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Read timeout of the receive thread; bounds shutdown latency.
const READ_POLL: Duration = Duration::from_millis(50);

/// serialport-based transport.
pub struct SerialTransport {
    port_name: String,
    writer: Mutex<Box<dyn SerialPort>>,
    hub: Arc<MessageHub>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open `port_name` and start the receive thread.
    #[instrument(level = "info")]
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_POLL)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| map_open_error(port_name, e))?;

        port.clear(serialport::ClearBuffer::Input).ok();

        let reader_port = port
            .try_clone()
            .map_err(|e| map_open_error(port_name, e))?;

        let hub = MessageHub::new();
        let running = Arc::new(AtomicBool::new(true));

        let reader = {
            let hub = hub.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("canflash-rx-{}", port_name))
                .spawn(move || receive_loop(reader_port, hub, running))?
        };

        info!(port = %port_name, baud = baud_rate, "Serial CAN adapter opened");

        Ok(Self {
            port_name: port_name.to_string(),
            writer: Mutex::new(port),
            hub,
            running,
            reader: Some(reader),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

/// List serial ports present on the system.
pub fn list_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::OpenFailed {
        port: "*".to_string(),
        message: e.to_string(),
    })?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

fn map_open_error(port: &str, e: serialport::Error) -> TransportError {
    let text = e.to_string().to_lowercase();
    match e.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::PortNotFound(port.to_string())
        }
        _ if text.contains("busy") || text.contains("in use") => {
            TransportError::PortBusy(port.to_string())
        }
        _ => TransportError::OpenFailed {
            port: port.to_string(),
            message: e.to_string(),
        },
    }
}

fn receive_loop(mut port: Box<dyn SerialPort>, hub: Arc<MessageHub>, running: Arc<AtomicBool>) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 256];

    while running.load(Ordering::SeqCst) {
        let n = match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Serial read failed, closing link");
                break;
            }
        };
        trace!(bytes = n, "Serial read");

        for raw in assembler.push(&buf[..n]) {
            match frame::decode(&raw) {
                Ok(msg) => hub.dispatch(msg),
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    hub.close();
    debug!(discarded = assembler.discarded(), "Receive thread stopped");
}

impl CanTransport for SerialTransport {
    #[instrument(skip(self, payload), fields(id = %format!("0x{:03X}", id), len = payload.len()))]
    fn send(&self, id: u16, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let bytes = frame::encode(id, payload)?;

        let mut port = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        port.write_all(&bytes)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!("Frame written");
        Ok(())
    }

    fn hub(&self) -> &Arc<MessageHub> {
        &self.hub
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            warn!(port = %self.port_name, "Receive thread panicked");
        }
    }
}
