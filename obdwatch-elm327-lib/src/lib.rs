//! ELM327 protocol implementation for OBD2 communication
//!
//! This library provides types and functions for talking to ELM327-compatible
//! OBD2 adapters (request formatting and response parsing) and for emulating
//! one (per-connection AT command state).

use std::fmt;

/// Per-connection client state (ELM327 settings)
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // These are independent ELM327 protocol flags
pub struct ClientState {
    /// Echo received characters back (ATE0/ATE1)
    pub echo_enabled: bool,
    /// Add linefeeds after carriage returns (ATL0/ATL1)
    pub linefeeds_enabled: bool,
    /// Print spaces between response bytes (ATS0/ATS1)
    pub spaces_enabled: bool,
    /// Show header bytes in responses (ATH0/ATH1)
    pub headers_enabled: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
        }
    }
}

impl ClientState {
    /// Create a new client state with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Format a line ending based on current settings
    pub fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Format a compact hex response according to client settings
    pub fn format_response(&self, response: &[u8]) -> Vec<u8> {
        if !self.spaces_enabled {
            return response.to_vec();
        }

        let mut result = Vec::with_capacity(response.len() * 3 / 2);
        let mut hex_count = 0;

        for &byte in response {
            if byte.is_ascii_hexdigit() {
                // Space before every pair of hex digits (except the first)
                if hex_count > 0 && hex_count % 2 == 0 {
                    result.push(b' ');
                }
                hex_count += 1;
            } else {
                hex_count = 0;
            }

            result.push(byte);
        }

        result
    }

    /// Handle an AT command and return the response
    /// Mutates the state if the command changes settings
    pub fn handle_at_command(&mut self, command: &str) -> String {
        let cmd = command.to_uppercase();
        let le = self.line_ending();

        let response_text = match cmd.as_str() {
            "ATZ" => {
                *self = ClientState::default();
                // Use new state's line ending for response
                let le = self.line_ending();
                return format!("{le}ELM327 v1.5{le}>");
            }
            "ATE0" => {
                self.echo_enabled = false;
                "OK"
            }
            "ATE1" => {
                self.echo_enabled = true;
                "OK"
            }
            "ATL0" => {
                self.linefeeds_enabled = false;
                "OK"
            }
            "ATL1" => {
                self.linefeeds_enabled = true;
                "OK"
            }
            "ATS0" => {
                self.spaces_enabled = false;
                "OK"
            }
            "ATS1" => {
                self.spaces_enabled = true;
                "OK"
            }
            "ATH0" => {
                self.headers_enabled = false;
                "OK"
            }
            "ATH1" => {
                self.headers_enabled = true;
                "OK"
            }
            "ATRV" => return self.voltage_reading(),
            "ATDPN" => "A6",
            "ATDP" => "AUTO, ISO 15765-4 (CAN 11/500)",
            _ if cmd.starts_with("ATSP") => "OK",
            _ if cmd.starts_with("ATST") => "OK",
            _ if cmd.starts_with("ATAT") => "OK",
            "ATI" => "ELM327 v1.5",
            "AT@1" => return self.device_description(),
            _ => "?",
        };

        // Note: for commands that change the linefeed setting, we use the OLD
        // setting since le was captured before the match
        format!("{le}{response_text}{le}>")
    }

    /// Override this to provide a custom device description for AT@1
    pub fn device_description(&self) -> String {
        let le = self.line_ending();
        format!("{le}ELM327{le}>")
    }

    /// Battery voltage answer for ATRV
    pub fn voltage_reading(&self) -> String {
        let le = self.line_ending();
        format!("{le}12.6V{le}>")
    }
}

/// Errors an ELM327 adapter reports in place of vehicle data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    UnableToConnect,
    CanError,
    BusError,
    Stopped,
    UnknownCommand,
    BufferFull,
    DataError,
    Other(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnableToConnect => write!(f, "UNABLE TO CONNECT"),
            Self::CanError => write!(f, "CAN ERROR"),
            Self::BusError => write!(f, "BUS ERROR"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::UnknownCommand => write!(f, "?"),
            Self::BufferFull => write!(f, "BUFFER FULL"),
            Self::DataError => write!(f, "DATA ERROR"),
            Self::Other(line) => write!(f, "{line}"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl AdapterError {
    /// Recognise an adapter error line (already uppercased and trimmed)
    fn from_line(line: &str) -> Option<Self> {
        let error = match line {
            "?" => Self::UnknownCommand,
            "STOPPED" => Self::Stopped,
            _ if line.contains("UNABLE TO CONNECT") => Self::UnableToConnect,
            _ if line.contains("CAN ERROR") => Self::CanError,
            _ if line.contains("BUS ERROR") || line.contains("BUS BUSY") || line.contains("FB ERROR") => {
                Self::BusError
            }
            _ if line.contains("BUFFER FULL") => Self::BufferFull,
            _ if line.contains("DATA ERROR") || line.contains("RX ERROR") => Self::DataError,
            _ if line.starts_with("ERR") || line.starts_with("ACT ALERT") || line.starts_with("LV RESET") => {
                Self::Other(line.to_string())
            }
            _ => return None,
        };
        Some(error)
    }
}

/// Outcome of one OBD2 request as seen on the ELM327 text interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Data bytes following the mode/PID echo
    Data(Vec<u8>),
    /// The vehicle did not answer, or answered with a negative response
    NoData,
    /// The adapter reported an error instead of an answer
    Error(AdapterError),
}

/// Build the request text for an OBD2 mode and optional PID, e.g. `010C` or `03`
pub fn format_request(mode: u8, pid: Option<u8>) -> String {
    match pid {
        Some(pid) => format!("{mode:02X}{pid:02X}"),
        None => format!("{mode:02X}"),
    }
}

/// Whether a response buffer has reached the `>` prompt
pub fn is_complete(buffer: &[u8]) -> bool {
    buffer.contains(&b'>')
}

/// Split a raw adapter response into meaningful lines
///
/// Drops the prompt, blank lines, and adapter progress chatter
/// (`SEARCHING...`, `BUS INIT: ...`).
fn response_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split(['\r', '\n', '>'])
        .map(|line| line.trim().to_ascii_uppercase())
        .filter(|line| {
            !line.is_empty() && !line.starts_with("SEARCHING") && !line.starts_with("BUS INIT")
        })
        .collect()
}

/// Decode a line of hex digits (with or without spaces) into bytes
fn decode_hex(line: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = line.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

/// Frame index prefix of a CAN multi-frame line (`0:`, `1:`, ... `F:`)
fn frame_prefix(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    (index.len() == 1 && index.bytes().all(|b| b.is_ascii_hexdigit())).then_some(rest)
}

/// Reassemble the message bytes of each reply found in the response
///
/// Single-frame replies produce one message per line. CAN multi-frame
/// replies (a length line followed by `0:`, `1:`, ... lines) are joined into
/// one message truncated to the announced length.
fn collect_messages(lines: &[String]) -> Vec<Vec<u8>> {
    if !lines.iter().any(|line| frame_prefix(line).is_some()) {
        return lines.iter().filter_map(|line| decode_hex(line)).collect();
    }

    let mut expected_len: Option<usize> = None;
    let mut joined = Vec::new();
    let mut singles = Vec::new();

    for line in lines {
        if let Some(rest) = frame_prefix(line) {
            if let Some(bytes) = decode_hex(rest) {
                joined.extend_from_slice(&bytes);
            }
        } else if line.len() == 3 && line.bytes().all(|b| b.is_ascii_hexdigit()) {
            expected_len = usize::from_str_radix(line, 16).ok();
        } else if let Some(bytes) = decode_hex(line) {
            singles.push(bytes);
        }
    }

    if let Some(len) = expected_len {
        joined.truncate(len);
    }
    let mut messages = vec![joined];
    messages.extend(singles);
    messages
}

/// Modes whose CAN replies lead with a DTC count byte
const DTC_MODES: [u8; 3] = [0x03, 0x07, 0x0A];

/// Parse an adapter response to a mode/PID request
///
/// The data line must echo `mode + 0x40` (and the PID when one was sent);
/// lines that do not are ignored as noise from other ECUs or garbled
/// frames. Mode-only requests (e.g. stored DTCs) concatenate the payloads
/// of every matching line since each ECU answers on its own line. A DTC
/// reply's CAN count byte is dropped per message before joining, so the
/// result is code pairs only.
pub fn parse_response(raw: &[u8], mode: u8, pid: Option<u8>) -> Response {
    let lines = response_lines(raw);

    for line in &lines {
        if line.contains("NO DATA") {
            return Response::NoData;
        }
        if let Some(error) = AdapterError::from_line(line) {
            return Response::Error(error);
        }
    }

    let expected_mode = mode.wrapping_add(0x40);
    let header_len = if pid.is_some() { 2 } else { 1 };
    let mut payload: Option<Vec<u8>> = None;

    for message in collect_messages(&lines) {
        match message.as_slice() {
            // Negative response: 7F <mode> <reason>
            [0x7F, rejected, ..] if *rejected == mode => return Response::NoData,
            [first, rest @ ..] if *first == expected_mode => {
                if let Some(pid) = pid {
                    if rest.first() != Some(&pid) {
                        continue;
                    }
                }
                let mut data = &message[header_len.min(message.len())..];
                if pid.is_none() && DTC_MODES.contains(&mode) && data.len() % 2 == 1 {
                    data = &data[1..];
                }
                match (&mut payload, pid) {
                    (None, _) => payload = Some(data.to_vec()),
                    (Some(existing), None) => existing.extend_from_slice(data),
                    (Some(_), Some(_)) => {}
                }
            }
            _ => {}
        }
    }

    payload.map_or(Response::NoData, Response::Data)
}

/// Parse the battery voltage from an `ATRV` response (e.g. `12.6V`)
pub fn parse_voltage(raw: &[u8]) -> Option<f32> {
    response_lines(raw).iter().find_map(|line| {
        let number = line.strip_suffix('V').unwrap_or(line);
        number.trim().parse::<f32>().ok()
    })
}

/// Parse the protocol number from an `ATDPN` response
///
/// The adapter prefixes `A` when the protocol was found by auto-detection;
/// the prefix is dropped.
pub fn parse_protocol_number(raw: &[u8]) -> Option<String> {
    let lines = response_lines(raw);
    let line = lines.first()?;
    let id = match line.strip_prefix('A') {
        Some(rest) if !rest.is_empty() => rest,
        _ => line.as_str(),
    };
    (id.len() == 1 && id.bytes().all(|b| b.is_ascii_hexdigit())).then(|| id.to_string())
}

/// Human-readable name of an ELM327 protocol number
pub fn protocol_name(id: &str) -> Option<&'static str> {
    let name = match id {
        "1" => "SAE J1850 PWM",
        "2" => "SAE J1850 VPW",
        "3" => "ISO 9141-2",
        "4" => "ISO 14230-4 (KWP 5BAUD)",
        "5" => "ISO 14230-4 (KWP FAST)",
        "6" => "ISO 15765-4 (CAN 11/500)",
        "7" => "ISO 15765-4 (CAN 29/500)",
        "8" => "ISO 15765-4 (CAN 11/250)",
        "9" => "ISO 15765-4 (CAN 29/250)",
        "A" => "SAE J1939 (CAN 29/250)",
        _ => return None,
    };
    Some(name)
}
