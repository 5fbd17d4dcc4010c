//! The per-family decode contract plus the unit conversions every parser
//! shares.

use chrono::NaiveDateTime;

use crate::error::Result;
use crate::types::{DiveSummary, Field, FieldValue, Sample, SamplePoint};

/// Meters per foot.
pub const FEET: f64 = 0.3048;
/// Pascal per psi.
pub const PSI: f64 = 6894.76;
/// Pascal per bar.
pub const BAR: f64 = 100000.0;
/// Standard atmosphere in bar.
pub const ATM: f64 = 1.01325;
/// m/s^2.
pub const GRAVITY: f64 = 9.80665;
/// Salt water density in kg/m3, the default for depth conversions.
pub const DENSITY_SALT: f64 = 1025.0;
pub const DENSITY_FRESH: f64 = 1000.0;

/// Convert a hydrostatic pressure in bar to a depth in meters.
pub fn pressure_to_depth(bar: f64, density: f64) -> f64 {
    bar * BAR / (density * GRAVITY)
}

/// Decoder over one immutable dive blob.
///
/// Parsers borrow the blob for their whole lifetime and never retry: any
/// malformed byte aborts the remainder of the profile. Implementations keep
/// a lazily-populated cache of derived fields that moves `Empty` →
/// `HeaderValid` → `ProfileValid` as fields are requested.
pub trait Parser {
    /// Decode the dive start timestamp from the header.
    fn datetime(&mut self) -> Result<NaiveDateTime>;

    /// A header-level scalar, or `None` when the model does not record it.
    fn field(&mut self, field: Field) -> Result<Option<FieldValue>>;

    /// Walk the profile, invoking the callback per decoded sample event.
    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()>;

    /// Device/host clock pair for device-relative timestamps.
    fn set_clock(&mut self, devtime: u32, systime: i64) {
        let _ = (devtime, systime);
    }

    /// Surface pressure override in bar.
    fn set_atmospheric(&mut self, pressure: f64) {
        let _ = pressure;
    }

    /// Water density override in kg/m3.
    fn set_density(&mut self, density: f64) {
        let _ = density;
    }
}

/// Lazy-cache population level used by the parser implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum CacheLevel {
    Empty,
    HeaderValid,
    ProfileValid,
}

/// Run a parser over its blob and flatten the event stream into the
/// serialisable summary shape used by the CLI.
pub fn summarize(parser: &mut dyn Parser, number: u32) -> Result<DiveSummary> {
    let datetime = parser.datetime()?;

    let duration_seconds = match parser.field(Field::DiveTime)? {
        Some(FieldValue::Time(seconds)) => seconds,
        _ => 0,
    };
    let max_depth_m = match parser.field(Field::MaxDepth)? {
        Some(FieldValue::Depth(m)) => m,
        _ => 0.0,
    };
    let dive_mode = match parser.field(Field::DiveMode)? {
        Some(FieldValue::Mode(mode)) => Some(mode),
        _ => None,
    };

    let mut gas_mixes = Vec::new();
    if let Some(FieldValue::Count(n)) = parser.field(Field::GasMixCount)? {
        for i in 0..n as usize {
            if let Some(FieldValue::GasMix(mix)) = parser.field(Field::GasMix(i))? {
                gas_mixes.push(mix);
            }
        }
    }

    let mut samples: Vec<SamplePoint> = Vec::new();
    let mut pending: Option<SamplePoint> = None;
    parser.samples_foreach(&mut |sample| match sample {
        Sample::Time(ms) => {
            if let Some(point) = pending.take() {
                samples.push(point);
            }
            pending = Some(SamplePoint {
                time_s: ms / 1000,
                depth_m: 0.0,
                temp_c: None,
                pressure_bar: None,
            });
        }
        Sample::Depth(m) => {
            if let Some(point) = pending.as_mut() {
                point.depth_m = m;
            }
        }
        Sample::Temperature(c) => {
            if let Some(point) = pending.as_mut() {
                point.temp_c = Some(c);
            }
        }
        Sample::Pressure { bar, .. } => {
            if let Some(point) = pending.as_mut() {
                point.pressure_bar = Some(bar);
            }
        }
        _ => {}
    })?;
    if let Some(point) = pending.take() {
        samples.push(point);
    }

    Ok(DiveSummary {
        number,
        datetime,
        duration_seconds,
        max_depth_m,
        dive_mode,
        gas_mixes,
        samples,
    })
}
