use chrono::NaiveDateTime;
use serde::Serialize;

/// Events delivered to the caller's sink while an iteration is running.
///
/// `Progress` values are monotonic; `maximum` may grow as more work is
/// discovered. `DeviceInfo` is emitted exactly once per `foreach`, before the
/// first dive.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<'a> {
    /// Waiting for the device to respond.
    Waiting,
    Progress {
        current: u32,
        maximum: u32,
    },
    DeviceInfo {
        model: u32,
        firmware: u32,
        serial: u32,
    },
    /// Host/device clock pair for devices with device-relative timestamps.
    Clock {
        systime: i64,
        devtime: u32,
    },
    /// Opaque version/identity blob, surfaced for archiving.
    Vendor {
        data: &'a [u8],
    },
}

/// One decoded observation inside a profile.
///
/// Within a `samples_foreach` run, events are emitted in monotonically
/// non-decreasing time order and `Time` precedes all other events sharing its
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample<'a> {
    /// Elapsed dive time in milliseconds.
    Time(u32),
    /// Depth in meters.
    Depth(f64),
    /// Water temperature in degrees Celsius.
    Temperature(f64),
    /// Tank pressure in bar.
    Pressure { tank: usize, bar: f64 },
    /// Switch to the gas mix at this index.
    GasSwitch(usize),
    Deco {
        kind: DecoKind,
        /// Remaining NDL or stop time.
        seconds: u32,
        /// Stop ceiling in meters, zero when not in deco.
        depth: f64,
    },
    Ppo2 {
        sensor: usize,
        bar: f64,
    },
    Event {
        kind: SampleEventKind,
        flags: u32,
        value: u32,
    },
    /// CNS loading as a fraction (1.0 = 100%).
    Cns(f64),
    /// Remaining bottom time in seconds.
    Rbt(u32),
    Bookmark,
    /// Raw bytes of the sample window, for binary round-tripping.
    Vendor { kind: u32, data: &'a [u8] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoKind {
    Ndl,
    Stop,
    DeepStop,
    SafetyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEventKind {
    AscentWarning,
    DecoViolation,
    SafetyStop,
    Surface,
    TankChange,
    ModeChange,
    Alarm,
}

/// Oxygen/helium fractional composition; nitrogen is the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GasMix {
    pub oxygen: f64,
    pub helium: f64,
}

impl GasMix {
    /// Build a mix from whole-percent bytes as stored by most devices.
    pub fn from_percent(o2: u8, he: u8) -> Self {
        GasMix {
            oxygen: f64::from(o2) / 100.0,
            helium: f64::from(he) / 100.0,
        }
    }

    pub fn nitrogen(&self) -> f64 {
        1.0 - self.oxygen - self.helium
    }
}

/// Dive mode reported in headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiveMode {
    OpenCircuit,
    ClosedCircuit,
    Gauge,
    Freedive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaterKind {
    Fresh,
    Salt,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Salinity {
    pub kind: WaterKind,
    /// Water density in kg/m3.
    pub density: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoModel {
    Buhlmann { gf_low: u8, gf_high: u8 },
    Rgbm,
    Dsat,
}

/// Header-level scalar selectors for [`Parser::field`](crate::parser::Parser::field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Total dive time in seconds.
    DiveTime,
    MaxDepth,
    AvgDepth,
    GasMixCount,
    GasMix(usize),
    Salinity,
    /// Surface pressure in bar.
    Atmospheric,
    DecoModel,
    DiveMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Seconds.
    Time(u32),
    /// Meters.
    Depth(f64),
    Count(u32),
    GasMix(GasMix),
    Salinity(Salinity),
    /// Bar.
    Pressure(f64),
    DecoModel(DecoModel),
    Mode(DiveMode),
}

/// A flattened per-dive summary, built from a parser run. This is the shape
/// the CLI serialises.
#[derive(Debug, Clone, Serialize)]
pub struct DiveSummary {
    pub number: u32,
    #[serde(with = "datetime_format")]
    pub datetime: NaiveDateTime,
    pub duration_seconds: u32,
    pub max_depth_m: f64,
    pub dive_mode: Option<DiveMode>,
    pub gas_mixes: Vec<GasMix>,
    pub samples: Vec<SamplePoint>,
}

/// One row of the flattened time series.
#[derive(Debug, Clone, Serialize)]
pub struct SamplePoint {
    pub time_s: u32,
    pub depth_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_bar: Option<f64>,
}

/// Collection of all downloaded dives, for JSON export.
#[derive(Debug, Serialize)]
pub struct DiveData {
    pub dives: Vec<DiveSummary>,
}

mod datetime_format {
    use chrono::NaiveDateTime;
    use serde::{self, Serializer};

    pub fn serialize<S>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = date.format("%Y-%m-%dT%H:%M:%S").to_string();
        serializer.serialize_str(&s)
    }
}
