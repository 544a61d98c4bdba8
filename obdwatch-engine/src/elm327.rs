//! ELM327 channel adapter.
//!
//! Speaks the ELM327 text protocol over any byte stream (TCP by default).
//! Owned by the channel task, so there is never more than one request on
//! the wire.

use log::{debug, info, warn};
use obdwatch_elm327_lib::{
    format_request, is_complete, parse_protocol_number, parse_response, parse_voltage,
    protocol_name, Response,
};
use smallvec::SmallVec;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::channel::{
    ChannelAdapter, Command, ConnectionStatus, DeviceStatus, Payload, Protocol, Reply,
    TransportError,
};

/// Type alias for adapter response buffers
pub type Obd2Buffer = SmallVec<[u8; 64]>;

/// Reset, echo off, linefeeds off, spaces off (compact responses), protocol auto
const INIT_COMMANDS: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATS0", "ATSP0"];

type Connector<S> = Box<dyn FnMut() -> io::Result<S> + Send>;

pub struct Elm327Channel<S> {
    connector: Connector<S>,
    address: Option<String>,
    stream: Option<S>,
    timeout: Duration,
}

impl Elm327Channel<TcpStream> {
    /// Adapter reached over TCP (WiFi dongles listen on port 35000)
    pub fn tcp(address: impl Into<String>, timeout: Duration) -> Self {
        let address = address.into();
        let target = address.clone();
        Self::with_connector(Some(address), timeout, move || connect_tcp(&target, timeout))
    }
}

fn connect_tcp(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{address} does not resolve to an address"),
        )
    })?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl<S: Read + Write + Send + 'static> Elm327Channel<S> {
    /// Build an adapter from a function that opens the underlying stream.
    ///
    /// The stream is opened lazily, on the first status query or reconnect.
    pub fn with_connector<F>(address: Option<String>, timeout: Duration, connector: F) -> Self
    where
        F: FnMut() -> io::Result<S> + Send + 'static,
    {
        Self {
            connector: Box::new(connector),
            address,
            stream: None,
            timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn address_label(&self) -> &str {
        self.address.as_deref().unwrap_or("<custom stream>")
    }

    /// Open the stream and initialize the adapter
    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.stream = None;
        info!(
            "Connecting to ELM327 at {} (timeout: {}ms)",
            self.address_label(),
            self.timeout.as_millis()
        );

        let mut stream = (self.connector)().map_err(|e| {
            warn!("Failed to connect to adapter: {e}");
            TransportError::from(e)
        })?;

        for cmd in INIT_COMMANDS {
            debug!("Sending init command: {cmd:?}");
            if let Err(e) = execute_command(&mut stream, cmd.as_bytes(), self.timeout) {
                warn!("Init command {cmd} failed: {e}");
                return Err(e);
            }
        }

        info!("Connected to ELM327");
        self.stream = Some(stream);
        Ok(())
    }

    /// Run one raw transaction, dropping the stream if the connection is gone
    ///
    /// After a timeout the late reply is read off up to its prompt. If it
    /// never completes the stream is dropped, since the next reply could no
    /// longer be matched to its request.
    fn transact(&mut self, command: &[u8]) -> Result<Obd2Buffer, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = execute_command(stream, command, self.timeout);
        match &result {
            Err(e) if e.is_connection_loss() => {
                warn!("Adapter connection lost: {e}");
                self.stream = None;
            }
            Err(TransportError::Timeout) => {
                if let Err(e) = resync(stream, self.timeout) {
                    warn!("Adapter out of sync after timeout ({e}), dropping connection");
                    self.stream = None;
                }
            }
            _ => {}
        }
        result
    }

    fn probe_protocol(&mut self) -> Option<Protocol> {
        let raw = self.transact(b"ATDPN").ok()?;
        let id = parse_protocol_number(&raw)?;
        let name = protocol_name(&id)?;
        Some(Protocol {
            id,
            name: name.to_string(),
        })
    }
}

impl<S: Read + Write + Send + 'static> ChannelAdapter for Elm327Channel<S> {
    fn execute(&mut self, command: &Command) -> Result<Reply, TransportError> {
        let request = format_request(command.mode, command.pid);
        let raw = self.transact(request.as_bytes())?;
        match parse_response(&raw, command.mode, command.pid) {
            Response::Data(bytes) => Ok(Reply::Data(Payload::from_vec(bytes))),
            Response::NoData => Ok(Reply::NoData),
            Response::Error(e) => Err(TransportError::Adapter(e.to_string())),
        }
    }

    fn device_status(&mut self) -> DeviceStatus {
        if self.stream.is_none() && self.connect().is_err() {
            return DeviceStatus::not_connected(self.address.clone());
        }

        let mut status = ConnectionStatus::AdapterConnected;

        match self.transact(b"ATRV") {
            Ok(raw) => match parse_voltage(&raw) {
                Some(volts) => {
                    debug!("Adapter reports {volts:.1}V");
                    status = ConnectionStatus::BusConnected;
                }
                None => debug!("No voltage reading from adapter"),
            },
            Err(e) if e.is_connection_loss() => {
                return DeviceStatus::not_connected(self.address.clone());
            }
            Err(e) => debug!("Voltage query failed: {e}"),
        }

        if status == ConnectionStatus::BusConnected {
            match self.execute(&Command::pids_supported(0x00)) {
                Ok(Reply::Data(_)) => status = ConnectionStatus::VehicleActive,
                Ok(Reply::NoData) => debug!("Vehicle did not answer 0100"),
                Err(e) => debug!("Vehicle probe failed: {e}"),
            }
        }

        if self.stream.is_none() {
            return DeviceStatus::not_connected(self.address.clone());
        }

        DeviceStatus {
            status,
            address: self.address.clone(),
            protocol: self.probe_protocol(),
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.connect()
    }
}

/// Execute a command on the adapter and return the raw response up to the prompt
fn execute_command<S: Read + Write>(
    stream: &mut S,
    command: &[u8],
    timeout: Duration,
) -> Result<Obd2Buffer, TransportError> {
    // Send command with carriage return
    let mut cmd_with_cr: SmallVec<[u8; 12]> = command.into();
    if !cmd_with_cr.ends_with(b"\r") {
        cmd_with_cr.push(b'\r');
    }

    debug!(
        "Sending to adapter: {:?}",
        String::from_utf8_lossy(&cmd_with_cr)
    );

    stream
        .write_all(&cmd_with_cr)
        .map_err(|e| TransportError::Io(e.to_string()))?;

    // Read response
    let mut buffer = [0u8; 64];
    let mut response = Obd2Buffer::new();
    let start = Instant::now();

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => {
                response.extend_from_slice(&buffer[..n]);
                // Check if we have a complete response (ends with >)
                if is_complete(&response) {
                    debug!(
                        "Complete response: {:?}",
                        String::from_utf8_lossy(&response)
                    );
                    break;
                }
                if start.elapsed() > timeout {
                    return Err(TransportError::Timeout);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() > timeout {
                    return Err(TransportError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(TransportError::Timeout);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
    }

    Ok(response)
}

/// Discard adapter output up to and including the next prompt
fn resync<S: Read>(stream: &mut S, timeout: Duration) -> Result<(), TransportError> {
    let mut buffer = [0u8; 64];
    let start = Instant::now();

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return Err(TransportError::Disconnected),
            Ok(n) => {
                debug!(
                    "Discarding late response: {:?}",
                    String::from_utf8_lossy(&buffer[..n])
                );
                if buffer[..n].contains(&b'>') {
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(TransportError::Timeout);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
        if start.elapsed() > timeout {
            return Err(TransportError::Timeout);
        }
    }
}
