//! The channel adapter boundary.
//!
//! A `ChannelAdapter` executes one request/response transaction at a time.
//! Byte-level framing is entirely the adapter's concern; the engine only
//! sees decoded payload bytes or a no-data indicator.

use derive_more::{Display, Error};
use smallvec::SmallVec;
use std::fmt;

/// Data bytes of a reply, after the mode/PID echo
pub type Payload = SmallVec<[u8; 8]>;

/// One OBD2 request: a mode and an optional PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub name: &'static str,
    pub mode: u8,
    pub pid: Option<u8>,
}

impl Command {
    pub const fn mode01(name: &'static str, pid: u8) -> Self {
        Self {
            name,
            mode: 0x01,
            pid: Some(pid),
        }
    }

    pub const STATUS: Self = Self::mode01("STATUS", 0x01);
    pub const FREEZE_DTC: Self = Self::mode01("FREEZE_DTC", 0x02);
    pub const FUEL_STATUS: Self = Self::mode01("FUEL_STATUS", 0x03);
    pub const ENGINE_LOAD: Self = Self::mode01("ENGINE_LOAD", 0x04);
    pub const COOLANT_TEMP: Self = Self::mode01("COOLANT_TEMP", 0x05);
    pub const FUEL_PRESSURE: Self = Self::mode01("FUEL_PRESSURE", 0x0A);
    pub const RPM: Self = Self::mode01("RPM", 0x0C);
    pub const SPEED: Self = Self::mode01("SPEED", 0x0D);
    pub const TIMING_ADVANCE: Self = Self::mode01("TIMING_ADVANCE", 0x0E);
    pub const INTAKE_TEMP: Self = Self::mode01("INTAKE_TEMP", 0x0F);
    pub const MAF: Self = Self::mode01("MAF", 0x10);
    pub const THROTTLE_POS: Self = Self::mode01("THROTTLE_POS", 0x11);
    pub const RUN_TIME: Self = Self::mode01("RUN_TIME", 0x1F);
    pub const COMMANDED_EGR: Self = Self::mode01("COMMANDED_EGR", 0x2C);
    pub const EGR_ERROR: Self = Self::mode01("EGR_ERROR", 0x2D);
    pub const EVAPORATIVE_PURGE: Self = Self::mode01("EVAPORATIVE_PURGE", 0x2E);
    pub const FUEL_LEVEL: Self = Self::mode01("FUEL_LEVEL", 0x2F);
    pub const EVAP_VAPOR_PRESSURE: Self = Self::mode01("EVAP_VAPOR_PRESSURE", 0x32);
    pub const BAROMETRIC_PRESSURE: Self = Self::mode01("BAROMETRIC_PRESSURE", 0x33);

    pub const GET_DTC: Self = Self {
        name: "GET_DTC",
        mode: 0x03,
        pid: None,
    };
    pub const CLEAR_DTC: Self = Self {
        name: "CLEAR_DTC",
        mode: 0x04,
        pid: None,
    };

    /// "PIDs supported" bitmap request for the block starting at `base`
    /// (0x00, 0x20, 0x40, ...)
    pub const fn pids_supported(base: u8) -> Self {
        Self::mode01("PIDS_SUPPORTED", base)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} ({:02X}{pid:02X})", self.name, self.mode),
            None => write!(f, "{} ({:02X})", self.name, self.mode),
        }
    }
}

/// Outcome of a completed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data(Payload),
    NoData,
}

impl Reply {
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(Payload::from_slice(bytes))
    }
}

/// A transaction that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TransportError {
    #[display("Not connected to adapter")]
    NotConnected,
    #[display("Adapter timeout")]
    Timeout,
    #[display("Adapter disconnected")]
    Disconnected,
    #[display("IO error: {_0}")]
    Io(#[error(not(source))] String),
    #[display("Adapter error: {_0}")]
    Adapter(#[error(not(source))] String),
    #[display("Protocol error: {_0}")]
    Protocol(#[error(not(source))] String),
}

impl TransportError {
    /// Whether the error means the connection itself is gone, as opposed to
    /// one transaction failing
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Disconnected | Self::Io(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// How far the link to the vehicle reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStatus {
    NotConnected,
    /// The adapter answers, but no vehicle bus is detected
    AdapterConnected,
    /// The adapter sees vehicle power, but the ECU does not answer
    BusConnected,
    /// The ECU answers requests (ignition on)
    VehicleActive,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotConnected => "Not connected",
            Self::AdapterConnected => "Adapter connected",
            Self::BusConnected => "Vehicle bus connected",
            Self::VehicleActive => "Vehicle active",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub status: ConnectionStatus,
    /// Address of the connection in use
    pub address: Option<String>,
    pub protocol: Option<Protocol>,
}

impl DeviceStatus {
    pub fn not_connected(address: Option<String>) -> Self {
        Self {
            status: ConnectionStatus::NotConnected,
            address,
            protocol: None,
        }
    }
}

/// A single request/response channel to the vehicle
///
/// Implementations block for at most their own transaction timeout.
pub trait ChannelAdapter: Send + 'static {
    fn execute(&mut self, command: &Command) -> Result<Reply, TransportError>;

    fn device_status(&mut self) -> DeviceStatus;

    /// Re-establish a lost connection
    fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: ChannelAdapter + ?Sized> ChannelAdapter for Box<T> {
    fn execute(&mut self, command: &Command) -> Result<Reply, TransportError> {
        (**self).execute(command)
    }

    fn device_status(&mut self) -> DeviceStatus {
        (**self).device_status()
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        (**self).reconnect()
    }
}
