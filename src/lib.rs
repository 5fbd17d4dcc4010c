//! Download and decode dive logs from recreational dive computers.
//!
//! A caller binds a [`Transport`] to one of the family drivers (via
//! [`open_family`] or the family module directly), optionally sets the
//! fingerprint watermark of the newest dive it already has, and calls
//! [`Device::foreach`]. Each raw dive blob handed to the callback can then be
//! fed to the matching family parser to walk its decoded samples.

pub mod ble;
pub mod codec;
mod context;
mod device;
mod error;
mod family;
mod parser;
pub mod ringbuf;
pub mod template;
pub mod transport;
mod types;

pub mod atomics;
pub mod cochran;
pub mod diverite;
pub mod eonsteel;
pub mod mares_icon;
pub mod mares_puck;
pub mod oceanic;
pub mod seac;
pub mod shearwater;
pub mod suunto;

pub use crate::context::{CancelToken, Context};
pub use crate::device::{Device, DiveCallback, Progress};
pub use crate::error::{Error, Result};
pub use crate::family::{open_family, Family};
pub use crate::parser::{summarize, Parser};
pub use crate::transport::{
    Exchange, FlowControl, FramedTransport, LineConfig, Parity, Purge, ReplayTransport, StopBits,
    Timeout, Transport,
};
pub use crate::types::{
    DecoKind, DecoModel, DiveData, DiveMode, DiveSummary, Event, Field, FieldValue, GasMix,
    Salinity, Sample, SampleEventKind, SamplePoint, WaterKind,
};
