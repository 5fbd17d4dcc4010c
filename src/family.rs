//! The supported device families and the entry point that binds a transport
//! to the right driver.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::context::Context;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::{
    atomics, cochran, diverite, eonsteel, mares_icon, mares_puck, oceanic, seac, shearwater,
    suunto,
};

/// One entry per download/parse implementation family. Model numbers within
/// a family live on the family module's own model enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Family {
    Suunto,
    SuuntoEonSteel,
    MaresIconHd,
    MaresPuck,
    AtomicsCobalt,
    Oceanic,
    Shearwater,
    CochranCommander,
    DiveriteNitekq,
    SeacScreen,
}

impl Family {
    pub const ALL: &'static [Family] = &[
        Family::Suunto,
        Family::SuuntoEonSteel,
        Family::MaresIconHd,
        Family::MaresPuck,
        Family::AtomicsCobalt,
        Family::Oceanic,
        Family::Shearwater,
        Family::CochranCommander,
        Family::DiveriteNitekq,
        Family::SeacScreen,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Family::Suunto => "suunto",
            Family::SuuntoEonSteel => "suunto-eonsteel",
            Family::MaresIconHd => "mares-iconhd",
            Family::MaresPuck => "mares-puck",
            Family::AtomicsCobalt => "atomics-cobalt",
            Family::Oceanic => "oceanic",
            Family::Shearwater => "shearwater",
            Family::CochranCommander => "cochran-commander",
            Family::DiveriteNitekq => "diverite-nitekq",
            Family::SeacScreen => "seac-screen",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Family::ALL
            .iter()
            .copied()
            .find(|family| family.name() == s)
            .ok_or(Error::InvalidArgs)
    }
}

/// Perform the family's handshake over `port` and return the bound driver.
pub fn open_family<'a, T: Transport + 'a>(
    family: Family,
    port: T,
    ctx: &'a Context,
) -> Result<Box<dyn Device + 'a>> {
    Ok(match family {
        Family::Suunto => Box::new(suunto::SuuntoDevice::open(port, ctx)?),
        Family::SuuntoEonSteel => Box::new(eonsteel::EonSteelDevice::open(port, ctx)?),
        Family::MaresIconHd => Box::new(mares_icon::MaresIconDevice::open(port, ctx)?),
        Family::MaresPuck => Box::new(mares_puck::MaresPuckDevice::open(port, ctx)?),
        Family::AtomicsCobalt => Box::new(atomics::CobaltDevice::open(port, ctx)?),
        Family::Oceanic => Box::new(oceanic::OceanicDevice::open(port, ctx)?),
        Family::Shearwater => Box::new(shearwater::ShearwaterDevice::open(port, ctx)?),
        Family::CochranCommander => Box::new(cochran::CochranDevice::open(port, ctx)?),
        Family::DiveriteNitekq => Box::new(diverite::NitekqDevice::open(port, ctx)?),
        Family::SeacScreen => Box::new(seac::SeacDevice::open(port, ctx)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for family in Family::ALL {
            assert_eq!(Family::from_str(family.name()).unwrap(), *family);
        }
        assert!(Family::from_str("garmin").is_err());
    }
}
