//! # gattkit-driver — device drivers
//!
//! Implementations of [`gattkit_protocol::DeviceDriver`]:
//!
//! - [`sim`] — A scriptable in-memory driver for tests and demos
//! - [`guard`] — Cleanup for connect attempts dropped part way
//! - `btle` — A btleplug backend (enabled with the `btleplug` feature)

pub mod guard;
pub mod sim;

#[cfg(feature = "btleplug")]
pub mod btle;

use std::str::FromStr;
use std::sync::Arc;

use gattkit_protocol::DeviceDriver;

pub use sim::{LinkDropPoint, SimPeripheral, SimulatedDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    #[default]
    Simulated,
    Btleplug,
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sim" | "simulated" => Ok(Self::Simulated),
            "btleplug" | "ble" => Ok(Self::Btleplug),
            other => anyhow::bail!("unknown driver kind `{other}` (expected `sim` or `btleplug`)"),
        }
    }
}

/// Open a driver of the requested kind.
///
/// The simulated driver comes preloaded with the demo peripherals.
pub async fn open(kind: DriverKind) -> anyhow::Result<Arc<dyn DeviceDriver>> {
    match kind {
        DriverKind::Simulated => Ok(Arc::new(SimulatedDriver::with_demo_peripherals())),
        #[cfg(feature = "btleplug")]
        DriverKind::Btleplug => Ok(Arc::new(btle::BtleplugDriver::open().await?)),
        #[cfg(not(feature = "btleplug"))]
        DriverKind::Btleplug => {
            anyhow::bail!("gattkit-driver was built without the `btleplug` feature")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_driver_kinds() {
        assert_eq!("sim".parse::<DriverKind>().unwrap(), DriverKind::Simulated);
        assert_eq!(" BTLEPLUG ".parse::<DriverKind>().unwrap(), DriverKind::Btleplug);
        assert!("serial".parse::<DriverKind>().is_err());
    }

    #[tokio::test]
    async fn opens_simulated_driver() {
        let driver = open(DriverKind::Simulated).await.unwrap();
        let link = gattkit_protocol::LinkHandle {
            id: 99,
            address: "C0:FF:EE:00:00:01".into(),
        };
        assert!(!driver.is_connected(&link));
    }
}
