//! Mock ELM327 OBD2 adapter for testing obdwatch
//!
//! Usage: cargo run -p obdwatch-mock-elm327-server
//! Then point the dashboard at 127.0.0.1:35000

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use obdwatch_elm327_lib::ClientState;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "obdwatch-mock-elm327")]
#[command(about = "Emulate an ELM327 adapter attached to a running vehicle")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    listen: String,

    /// Stored trouble codes reported until cleared (e.g. P0133)
    #[arg(long = "dtc", default_values = ["P0133", "P0171"])]
    dtcs: Vec<String>,
}

/// Mode 01 PIDs the mock answers
const SUPPORTED_PIDS: &[u8] = &[
    0x01, 0x02, 0x03, 0x04, 0x05, 0x0A, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x1F, 0x20, 0x2C,
    0x2D, 0x2E, 0x2F, 0x32, 0x33,
];

/// Simulated vehicle shared by all client connections
struct Vehicle {
    start_time: Instant,
    dtcs: Mutex<Vec<u16>>,
}

impl Vehicle {
    fn dtcs(&self) -> Vec<u16> {
        self.dtcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_dtcs(&self) {
        self.dtcs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Parse a code like `P0133` into its two-byte encoding
fn parse_dtc(code: &str) -> Option<u16> {
    let mut chars = code.chars();
    let system: u16 = match chars.next()?.to_ascii_uppercase() {
        'P' => 0,
        'C' => 1,
        'B' => 2,
        'U' => 3,
        _ => return None,
    };
    let rest = chars.as_str();
    if rest.len() != 4 {
        return None;
    }
    let digits = u16::from_str_radix(rest, 16).ok()?;
    if digits >> 12 > 3 {
        return None;
    }
    Some((system << 14) | digits)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut dtcs = Vec::new();
    for code in &args.dtcs {
        match parse_dtc(code) {
            Some(dtc) => dtcs.push(dtc),
            None => warn!("Ignoring invalid trouble code {code:?}"),
        }
    }

    let vehicle = Arc::new(Vehicle {
        start_time: Instant::now(),
        dtcs: Mutex::new(dtcs),
    });

    info!("Mock ELM327 starting on {}...", args.listen);
    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("Mock ELM327 ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                let vehicle = vehicle.clone();
                std::thread::spawn(move || handle_client(stream, &vehicle));
            }
            Err(e) => error!("Connection error: {e}"),
        }
    }

    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // TcpStream is owned by the client thread
fn handle_client(mut stream: TcpStream, vehicle: &Vehicle) {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    let mut state = ClientState::new();

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let ch = byte[0];

                // Echo character if enabled
                if state.echo_enabled && stream.write_all(&byte).is_err() {
                    break;
                }

                // Carriage return terminates command
                if ch == b'\r' {
                    let command = String::from_utf8_lossy(&buffer).trim().to_uppercase();

                    if !command.is_empty() {
                        debug!("RX: {command}");
                        let response = process_command(&command, vehicle, &mut state);
                        // Spacing applies to vehicle data, not AT replies
                        let response = if command.starts_with("AT") {
                            response.into_bytes()
                        } else {
                            state.format_response(response.as_bytes())
                        };
                        debug!("TX: {}", String::from_utf8_lossy(&response).escape_debug());

                        if let Err(e) = stream.write_all(&response) {
                            error!("Write error: {e}");
                            break;
                        }
                    }

                    buffer.clear();
                } else if ch != b'\n' {
                    // Accumulate command (ignore linefeeds)
                    buffer.push(ch);
                }
            }
            Err(e) => {
                error!("Read error: {e}");
                break;
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // rpm stays within 800..=3500
fn get_rpm_value(start_time: &Instant) -> u32 {
    const MIN_RPM: f32 = 800.0;
    const MAX_RPM: f32 = 3500.0;
    const RAMP_TIME: f32 = 4.0;
    const HOLD_TIME: f32 = 3.0;
    const CYCLE_TIME: f32 = 2.0 * (RAMP_TIME + HOLD_TIME);

    let elapsed = start_time.elapsed().as_secs_f32();
    let phase = elapsed % CYCLE_TIME;

    let rpm = if phase < RAMP_TIME {
        MIN_RPM + (MAX_RPM - MIN_RPM) * (phase / RAMP_TIME)
    } else if phase < RAMP_TIME + HOLD_TIME {
        MAX_RPM
    } else if phase < 2.0 * RAMP_TIME + HOLD_TIME {
        let ramp_phase = phase - RAMP_TIME - HOLD_TIME;
        MAX_RPM - (MAX_RPM - MIN_RPM) * (ramp_phase / RAMP_TIME)
    } else {
        MIN_RPM
    };

    (rpm * 4.0) as u32
}

/// "PIDs supported" bitmap for the block starting at `base`
fn supported_bitmap(base: u8) -> u32 {
    SUPPORTED_PIDS
        .iter()
        .filter(|&&pid| pid > base && u32::from(pid) <= u32::from(base) + 32)
        .fold(0, |bits, &pid| bits | 1 << (32 - u32::from(pid - base)))
}

fn get_pid_response(pid: u8, vehicle: &Vehicle) -> Option<String> {
    let response = match pid {
        0x00 | 0x20 | 0x40 => format!("{:08X}", supported_bitmap(pid)),
        0x01 => {
            let dtcs = vehicle.dtcs();
            let count = u8::try_from(dtcs.len()).unwrap_or(0x7F).min(0x7F);
            let mil = if dtcs.is_empty() { 0x00 } else { 0x80 };
            // Spark ignition, base tests available and complete
            format!("{:02X}07E500", mil | count)
        }
        0x02 => format!("{:04X}", vehicle.dtcs().first().copied().unwrap_or(0)),
        0x03 => "0200".to_string(), // Fuel system 1 closed loop
        0x04 => "64".to_string(),   // Engine load: 39.2%
        0x05 => "7B".to_string(),   // Coolant temp: 83°C
        0x0A => "64".to_string(),   // Fuel pressure: 300 kPa
        0x0C => format!("{:04X}", get_rpm_value(&vehicle.start_time)),
        0x0D => "28".to_string(),   // Speed: 40 km/h
        0x0E => "8C".to_string(),   // Timing advance: 6°
        0x0F => "38".to_string(),   // Intake air temp: 16°C
        0x10 => "01F4".to_string(), // MAF: 5.00 g/s
        0x11 => "45".to_string(),   // Throttle: 27%
        0x1F => {
            let secs = vehicle.start_time.elapsed().as_secs();
            format!("{:04X}", u16::try_from(secs).unwrap_or(u16::MAX))
        }
        0x2C => "1A".to_string(),   // Commanded EGR: 10%
        0x2D => "80".to_string(),   // EGR error: 0%
        0x2E => "33".to_string(),   // Evap purge: 20%
        0x2F => "B3".to_string(),   // Fuel level: 70%
        0x32 => "FFF0".to_string(), // Evap vapor pressure: -4 Pa
        0x33 => "65".to_string(),   // Barometric pressure: 101 kPa
        _ => return None,
    };
    Some(response)
}

fn process_command(cmd: &str, vehicle: &Vehicle, state: &mut ClientState) -> String {
    let le = state.line_ending();

    // Handle AT commands using the shared library
    if cmd.starts_with("AT") {
        // Override AT@1 for mock server identification
        if cmd == "AT@1" {
            return format!("{le}Mock ELM327{le}>");
        }
        return state.handle_at_command(cmd);
    }

    match cmd {
        // Mode 03 - Show stored DTCs (CAN style, with count byte)
        "03" => {
            let dtcs = vehicle.dtcs();
            let codes: String = dtcs.iter().map(|dtc| format!("{dtc:04X}")).collect();
            format!("43{:02X}{codes}{le}{le}>", dtcs.len())
        }

        // Mode 04 - Clear DTCs
        "04" => {
            info!("Clearing {} stored DTC(s)", vehicle.dtcs().len());
            vehicle.clear_dtcs();
            format!("44{le}{le}>")
        }

        // Mode 01 - Current data, one PID per request
        c if c.starts_with("01") && c.len() == 4 && c.is_ascii() => {
            let Ok(pid) = u8::from_str_radix(&c[2..], 16) else {
                return format!("?{le}{le}>");
            };
            match get_pid_response(pid, vehicle) {
                Some(data) => format!("41{pid:02X}{data}{le}{le}>"),
                None => format!("NO DATA{le}{le}>"),
            }
        }

        // Unknown command
        _ => format!("?{le}{le}>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(dtcs: Vec<u16>) -> Vehicle {
        Vehicle {
            start_time: Instant::now(),
            dtcs: Mutex::new(dtcs),
        }
    }

    #[test]
    fn test_parse_dtc() {
        assert_eq!(parse_dtc("P0133"), Some(0x0133));
        assert_eq!(parse_dtc("c0456"), Some(0x4456));
        assert_eq!(parse_dtc("U0100"), Some(0xC100));
        assert_eq!(parse_dtc("X0100"), None);
        assert_eq!(parse_dtc("P013"), None);
        assert_eq!(parse_dtc("P4133"), None);
    }

    #[test]
    fn test_supported_bitmap() {
        assert_eq!(supported_bitmap(0x00), 0xF85F_8003);
        assert_eq!(supported_bitmap(0x20), 0x001E_6000);
        assert_eq!(supported_bitmap(0x40), 0);
    }

    #[test]
    fn test_dtc_read_and_clear() {
        let vehicle = vehicle(vec![0x0133, 0x0171]);
        let mut state = ClientState::new();
        state.handle_at_command("ATL0");

        assert_eq!(process_command("03", &vehicle, &mut state), "430201330171\r\r>");
        assert_eq!(process_command("0101", &vehicle, &mut state), "41018207E500\r\r>");
        assert_eq!(process_command("04", &vehicle, &mut state), "44\r\r>");
        assert_eq!(process_command("03", &vehicle, &mut state), "4300\r\r>");
        assert_eq!(process_command("0102", &vehicle, &mut state), "41020000\r\r>");
    }

    #[test]
    fn test_unknown_pid() {
        let vehicle = vehicle(Vec::new());
        let mut state = ClientState::new();
        state.handle_at_command("ATL0");
        assert_eq!(process_command("0142", &vehicle, &mut state), "NO DATA\r\r>");
        assert_eq!(process_command("010D", &vehicle, &mut state), "410D28\r\r>");
        assert_eq!(process_command("09", &vehicle, &mut state), "?\r\r>");
    }

    #[test]
    fn test_multi_pid_request_rejected() {
        let vehicle = vehicle(Vec::new());
        let mut state = ClientState::new();
        state.handle_at_command("ATL0");
        assert_eq!(process_command("010C0D", &vehicle, &mut state), "?\r\r>");
        assert_eq!(process_command("01ZZ", &vehicle, &mut state), "?\r\r>");
    }
}
