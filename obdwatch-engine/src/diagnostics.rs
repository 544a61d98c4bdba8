//! Decoders for the on-demand diagnostic commands (monitor status, fault
//! codes, fuel system status, supported PIDs).

use serde::Serialize;
use std::fmt;

/// Result of an on-demand query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Answer<T> {
    Value(T),
    NoData,
}

impl<T> Answer<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::NoData => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Answer<U> {
        match self {
            Self::Value(v) => Answer::Value(f(v)),
            Self::NoData => Answer::NoData,
        }
    }
}

impl<T> From<Option<T>> for Answer<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::NoData, Self::Value)
    }
}

/// A diagnostic trouble code, e.g. `P0133`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Dtc {
    pub code: u16,
}

impl Dtc {
    pub const fn from_bytes(a: u8, b: u8) -> Self {
        Self {
            code: u16::from_be_bytes([a, b]),
        }
    }

    pub const fn system(self) -> char {
        match self.code >> 14 {
            0 => 'P',
            1 => 'C',
            2 => 'B',
            _ => 'U',
        }
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:03X}",
            self.system(),
            (self.code >> 12) & 0x3,
            self.code & 0x0FFF
        )
    }
}

/// Decode the stored DTC list from a mode 03 payload
///
/// CAN adapters prefix the list with a count byte, which shows up as an odd
/// payload length. Zero pairs are padding.
pub fn decode_dtc_list(data: &[u8]) -> Vec<Dtc> {
    let data = if data.len() % 2 == 1 { &data[1..] } else { data };
    data.chunks_exact(2)
        .map(|pair| Dtc::from_bytes(pair[0], pair[1]))
        .filter(|dtc| dtc.code != 0)
        .collect()
}

/// Decode the DTC that triggered the freeze frame (mode 01 PID 02)
pub fn decode_freeze_dtc(data: &[u8]) -> Answer<Dtc> {
    match data {
        [a, b, ..] if *a != 0 || *b != 0 => Answer::Value(Dtc::from_bytes(*a, *b)),
        _ => Answer::NoData,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IgnitionType {
    Spark,
    Compression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessTest {
    pub name: &'static str,
    pub available: bool,
    pub complete: bool,
}

/// Monitor status since DTCs cleared (mode 01 PID 01)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub mil: bool,
    pub dtc_count: u8,
    pub ignition: IgnitionType,
    pub tests: Vec<ReadinessTest>,
}

const BASE_TESTS: [&str; 3] = ["Misfire", "Fuel System", "Components"];

const SPARK_TESTS: [Option<&str>; 8] = [
    Some("Catalyst"),
    Some("Heated Catalyst"),
    Some("Evaporative System"),
    Some("Secondary Air System"),
    Some("A/C Refrigerant"),
    Some("Oxygen Sensor"),
    Some("Oxygen Sensor Heater"),
    Some("EGR System"),
];

const COMPRESSION_TESTS: [Option<&str>; 8] = [
    Some("NMHC Catalyst"),
    Some("NOx/SCR Monitor"),
    None,
    Some("Boost Pressure"),
    None,
    Some("Exhaust Gas Sensor"),
    Some("PM Filter"),
    Some("EGR/VVT System"),
];

fn bit(byte: u8, n: usize) -> bool {
    byte & (1 << n) != 0
}

impl MonitorStatus {
    pub fn decode(data: &[u8]) -> Option<Self> {
        let [a, b, c, d, ..] = *data else {
            return None;
        };

        let ignition = if bit(b, 3) {
            IgnitionType::Compression
        } else {
            IgnitionType::Spark
        };

        // Completion bits are set while a test is still incomplete
        let mut tests: Vec<ReadinessTest> = BASE_TESTS
            .iter()
            .enumerate()
            .map(|(n, &name)| ReadinessTest {
                name,
                available: bit(b, n),
                complete: !bit(b, n + 4),
            })
            .collect();

        let specific = match ignition {
            IgnitionType::Spark => &SPARK_TESTS,
            IgnitionType::Compression => &COMPRESSION_TESTS,
        };
        tests.extend(specific.iter().enumerate().filter_map(|(n, name)| {
            name.map(|name| ReadinessTest {
                name,
                available: bit(c, n),
                complete: !bit(d, n),
            })
        }));

        Some(Self {
            mil: bit(a, 7),
            dtc_count: a & 0x7F,
            ignition,
            tests,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FuelSystemState {
    OpenLoopCold,
    ClosedLoop,
    OpenLoopLoad,
    OpenLoopFailure,
    ClosedLoopFault,
}

impl FuelSystemState {
    fn from_bits(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::OpenLoopCold),
            0x02 => Some(Self::ClosedLoop),
            0x04 => Some(Self::OpenLoopLoad),
            0x08 => Some(Self::OpenLoopFailure),
            0x10 => Some(Self::ClosedLoopFault),
            _ => None,
        }
    }
}

impl fmt::Display for FuelSystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::OpenLoopCold => "Open loop due to insufficient engine temperature",
            Self::ClosedLoop => "Closed loop, using oxygen sensor feedback to determine fuel mix",
            Self::OpenLoopLoad => "Open loop due to engine load OR fuel cut due to deceleration",
            Self::OpenLoopFailure => "Open loop due to system failure",
            Self::ClosedLoopFault => {
                "Closed loop, using at least one oxygen sensor but there is a fault in the feedback system"
            }
        };
        f.write_str(text)
    }
}

/// Fuel system status (mode 01 PID 03)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FuelStatus {
    pub system1: Option<FuelSystemState>,
    pub system2: Option<FuelSystemState>,
}

impl FuelStatus {
    /// `None` when neither fuel system reports a known state
    pub fn decode(data: &[u8]) -> Option<Self> {
        let system1 = data.first().copied().and_then(FuelSystemState::from_bits);
        let system2 = data.get(1).copied().and_then(FuelSystemState::from_bits);
        (system1.is_some() || system2.is_some()).then_some(Self { system1, system2 })
    }
}

/// PIDs flagged in a "PIDs supported" bitmap for the block starting at `base`
pub fn decode_supported_pids(base: u8, data: &[u8]) -> Vec<u8> {
    let bits = match data {
        [a, b, c, d, ..] => u32::from_be_bytes([*a, *b, *c, *d]),
        _ => return Vec::new(),
    };
    (0..32u8)
        .filter(|n| bits & (1 << (31 - u32::from(*n))) != 0)
        .filter_map(|n| base.checked_add(n + 1))
        .collect()
}
