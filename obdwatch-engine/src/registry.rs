//! Parameter registry: the catalogue of recurring readings and their
//! decode rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::{Command, Reply};
use crate::error::EngineError;

/// Identity of a watched parameter
///
/// The serialized form is the stable snake_case key used by snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterId {
    Rpm,
    EngineLoad,
    CoolantTemp,
    FuelPressure,
    Speed,
    TimingAdvance,
    IntakeTemp,
    AirFlowRate,
    ThrottlePosition,
    RunTime,
    CommandEgr,
    EgrError,
    EvaporativePurge,
    FuelLevel,
    EvapVaporPressure,
    BarometricPressure,
}

impl ParameterId {
    pub const fn key(self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::EngineLoad => "engine_load",
            Self::CoolantTemp => "coolant_temp",
            Self::FuelPressure => "fuel_pressure",
            Self::Speed => "speed",
            Self::TimingAdvance => "timing_advance",
            Self::IntakeTemp => "intake_temp",
            Self::AirFlowRate => "air_flow_rate",
            Self::ThrottlePosition => "throttle_position",
            Self::RunTime => "run_time",
            Self::CommandEgr => "command_egr",
            Self::EgrError => "egr_error",
            Self::EvaporativePurge => "evaporative_purge",
            Self::FuelLevel => "fuel_level",
            Self::EvapVaporPressure => "evap_vapor_pressure",
            Self::BarometricPressure => "barometric_pressure",
        }
    }

    /// Display unit of the published value
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::EngineLoad
            | Self::ThrottlePosition
            | Self::CommandEgr
            | Self::EgrError
            | Self::EvaporativePurge
            | Self::FuelLevel => "%",
            Self::CoolantTemp => "°F",
            Self::IntakeTemp => "°C",
            Self::FuelPressure | Self::BarometricPressure => "kPa",
            Self::Speed => "km/h",
            Self::TimingAdvance => "°",
            Self::AirFlowRate => "g/s",
            Self::RunTime => "s",
            Self::EvapVaporPressure => "Pa",
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

pub type DecodeFn = fn(&[u8]) -> Option<f64>;
pub type ConvertFn = fn(f64) -> f64;

/// A registered parameter. Immutable once the registry is built.
#[derive(Clone, Copy)]
pub struct Parameter {
    pub id: ParameterId,
    pub command: Command,
    pub decode: DecodeFn,
    pub convert: Option<ConvertFn>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("converted", &self.convert.is_some())
            .finish_non_exhaustive()
    }
}

impl Parameter {
    pub const fn new(id: ParameterId, command: Command, decode: DecodeFn) -> Self {
        Self {
            id,
            command,
            decode,
            convert: None,
        }
    }

    #[must_use]
    pub const fn with_conversion(mut self, convert: ConvertFn) -> Self {
        self.convert = Some(convert);
        self
    }

    /// Value to publish for a reply, or `None` when there is nothing to publish
    pub fn evaluate(&self, reply: &Reply) -> Option<f64> {
        let Reply::Data(payload) = reply else {
            return None;
        };
        let raw = (self.decode)(payload)?;
        Some(self.convert.map_or(raw, |convert| convert(raw)))
    }
}

// Decode rules (SAE J1979 mode 01 formulas). Too-short payloads decode to None.

fn a(data: &[u8]) -> Option<f64> {
    data.first().map(|&a| f64::from(a))
}

fn ab(data: &[u8]) -> Option<f64> {
    match data {
        [a, b, ..] => Some(f64::from(u16::from_be_bytes([*a, *b]))),
        _ => None,
    }
}

pub fn decode_rpm(data: &[u8]) -> Option<f64> {
    ab(data).map(|v| v / 4.0)
}

pub fn decode_percent(data: &[u8]) -> Option<f64> {
    a(data).map(|v| v * 100.0 / 255.0)
}

pub fn decode_temperature(data: &[u8]) -> Option<f64> {
    a(data).map(|v| v - 40.0)
}

pub fn decode_fuel_pressure(data: &[u8]) -> Option<f64> {
    a(data).map(|v| v * 3.0)
}

pub fn decode_byte(data: &[u8]) -> Option<f64> {
    a(data)
}

pub fn decode_timing_advance(data: &[u8]) -> Option<f64> {
    a(data).map(|v| v / 2.0 - 64.0)
}

pub fn decode_maf(data: &[u8]) -> Option<f64> {
    ab(data).map(|v| v / 100.0)
}

pub fn decode_word(data: &[u8]) -> Option<f64> {
    ab(data)
}

pub fn decode_egr_error(data: &[u8]) -> Option<f64> {
    a(data).map(|v| (v - 128.0) * 100.0 / 128.0)
}

pub fn decode_evap_vapor_pressure(data: &[u8]) -> Option<f64> {
    match data {
        [a, b, ..] => Some(f64::from(i16::from_be_bytes([*a, *b])) / 4.0),
        _ => None,
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Fixed, ordered catalogue of parameters the acquisition loop visits
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    parameters: Vec<Parameter>,
}

impl ParameterRegistry {
    /// Build a registry; duplicate ids are rejected
    pub fn new(parameters: Vec<Parameter>) -> Result<Self, EngineError> {
        for (index, parameter) in parameters.iter().enumerate() {
            if parameters[..index].iter().any(|p| p.id == parameter.id) {
                return Err(EngineError::Configuration(format!(
                    "parameter {} registered twice",
                    parameter.id
                )));
            }
        }
        Ok(Self { parameters })
    }

    /// The standard watch list, in polling order
    pub fn standard() -> Self {
        use ParameterId as Id;

        Self {
            parameters: vec![
                Parameter::new(Id::Rpm, Command::RPM, decode_rpm),
                Parameter::new(Id::EngineLoad, Command::ENGINE_LOAD, decode_percent),
                Parameter::new(Id::CoolantTemp, Command::COOLANT_TEMP, decode_temperature)
                    .with_conversion(celsius_to_fahrenheit),
                Parameter::new(Id::FuelPressure, Command::FUEL_PRESSURE, decode_fuel_pressure),
                Parameter::new(Id::Speed, Command::SPEED, decode_byte),
                Parameter::new(Id::TimingAdvance, Command::TIMING_ADVANCE, decode_timing_advance),
                Parameter::new(Id::IntakeTemp, Command::INTAKE_TEMP, decode_temperature),
                Parameter::new(Id::AirFlowRate, Command::MAF, decode_maf),
                Parameter::new(Id::ThrottlePosition, Command::THROTTLE_POS, decode_percent),
                Parameter::new(Id::RunTime, Command::RUN_TIME, decode_word),
                Parameter::new(Id::CommandEgr, Command::COMMANDED_EGR, decode_percent),
                Parameter::new(Id::EgrError, Command::EGR_ERROR, decode_egr_error),
                Parameter::new(Id::EvaporativePurge, Command::EVAPORATIVE_PURGE, decode_percent),
                Parameter::new(Id::FuelLevel, Command::FUEL_LEVEL, decode_percent),
                Parameter::new(
                    Id::EvapVaporPressure,
                    Command::EVAP_VAPOR_PRESSURE,
                    decode_evap_vapor_pressure,
                ),
                Parameter::new(Id::BarometricPressure, Command::BAROMETRIC_PRESSURE, decode_byte),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.parameters.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.parameters.iter().map(|p| p.id)
    }
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
