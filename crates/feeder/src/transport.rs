//! Serial transport to the EiBotBoard, plus a scriptable mock.
//!
//! Writes happen inline on the dispatch task; reads happen on a dedicated
//! thread that forwards raw bytes into a tokio channel, since `serialport`
//! reads are blocking.

use std::io::{Read as _, Write as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use ebb_protocol::Cmd;
use serialport::{SerialPort, SerialPortType};
use tokio::sync::mpsc;

// The EiBotBoard's USB vendor and product ids (Microchip/SchmalzHaus).
const EBB_VID: u16 = 0x04d8;
const EBB_PID: u16 = 0xfd92;

// USB CDC ignores the line rate, but serialport wants one.
const BAUD: u32 = 9600;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub trait Transport: Send + 'static {
    fn send(&mut self, cmd: &Cmd) -> anyhow::Result<()>;
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `path` and start a reader thread that forwards incoming bytes
    /// to `incoming`. The thread exits when the port errors out or the
    /// receiver is dropped.
    pub fn open(path: &str, incoming: mpsc::Sender<Vec<u8>>) -> anyhow::Result<Self> {
        let port = serialport::new(path, BAUD).timeout(READ_TIMEOUT).open()?;
        let reader = port.try_clone()?;
        std::thread::spawn(move || read_loop(reader, incoming));
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, cmd: &Cmd) -> anyhow::Result<()> {
        let line = cmd.encode();
        log::trace!("-> {}", line.trim_end());
        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, incoming: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 256];
    loop {
        match port.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if incoming.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::warn!("serial read failed: {e}");
                break;
            }
        }
    }
    log::debug!("serial reader exiting");
}

/// Scan the serial ports for an EiBotBoard by USB vendor/product id.
pub fn find_plotter_port() -> anyhow::Result<String> {
    for p in serialport::available_ports()? {
        if let SerialPortType::UsbPort(usb) = &p.port_type {
            if usb.vid == EBB_VID && usb.pid == EBB_PID {
                log::info!("found EiBotBoard at {}", p.port_name);
                return Ok(p.port_name);
            }
        }
    }
    Err(anyhow!("no EiBotBoard found; is the plotter plugged in?"))
}

/// A transport that records every command and, when wired with an
/// `incoming` sender, acknowledges each one the way the board would.
/// Backs both `--simulate` and the dispatch tests.
pub struct MockTransport {
    pub sent: Arc<Mutex<Vec<String>>>,
    auto_ack: Option<mpsc::Sender<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            sent: Arc::new(Mutex::new(Vec::new())),
            auto_ack: None,
        }
    }

    pub fn auto_acking(incoming: mpsc::Sender<Vec<u8>>) -> Self {
        MockTransport {
            sent: Arc::new(Mutex::new(Vec::new())),
            auto_ack: Some(incoming),
        }
    }

    pub fn sent_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send(&mut self, cmd: &Cmd) -> anyhow::Result<()> {
        let line = cmd.encode();
        if let Ok(mut log) = self.sent.lock() {
            log.push(line);
        }
        if let Some(tx) = &self.auto_ack {
            // Queries are acknowledged by their status line alone.
            let reply: &[u8] = match cmd {
                Cmd::QueryGeneral => b"QG,0,0,0\r\n",
                Cmd::QueryMotors => b"QM,0,0,0,0\r\n",
                _ => b"OK\r\n",
            };
            let _ = tx.try_send(reply.to_vec());
        }
        Ok(())
    }
}
