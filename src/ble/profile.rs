//! GATT service profiles.
//!
//! A [`ServiceProfile`] names the primary service a session binds to and the
//! characteristics it drives inside that service: RX is written by the host,
//! TX notifies the host. Profiles are plain values so a session can be pointed
//! at a different peripheral layout without touching the state machine.

use uuid::Uuid;

use crate::ble::transport::{CharacteristicRole, PeripheralFilter};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// Service and characteristic UUIDs bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceProfile {
    name: String,
    service: Uuid,
    rx: Option<Uuid>,
    tx: Option<Uuid>,
}

impl ServiceProfile {
    /// Create a custom profile.
    ///
    /// `rx` is the characteristic the host writes to, `tx` the one the
    /// peripheral notifies on. Either may be absent; profiles without either
    /// are read-only and are driven through `Session::read`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the name is empty or the same
    /// UUID is used for the service and a characteristic.
    pub fn new(
        name: impl Into<String>,
        service: Uuid,
        rx: Option<Uuid>,
        tx: Option<Uuid>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidParameter {
                name: "name".to_string(),
                value: name,
            });
        }

        for uuid in [rx, tx].into_iter().flatten() {
            if uuid == service {
                return Err(Error::InvalidParameter {
                    name: "characteristic".to_string(),
                    value: uuid.to_string(),
                });
            }
        }

        Ok(Self {
            name,
            service,
            rx,
            tx,
        })
    }

    /// The Nordic UART Service profile used by ESP32 BLE UART firmware.
    pub fn uart() -> Self {
        Self {
            name: "uart".to_string(),
            service: UART_SERVICE_UUID,
            rx: Some(UART_RX_UUID),
            tx: Some(UART_TX_UUID),
        }
    }

    /// The standard Battery Service. The battery level is read on demand.
    pub fn battery() -> Self {
        Self {
            name: "battery".to_string(),
            service: BATTERY_SERVICE_UUID,
            rx: None,
            tx: None,
        }
    }

    /// The standard Device Information Service.
    pub fn device_information() -> Self {
        Self {
            name: "device-information".to_string(),
            service: DEVICE_INFO_SERVICE_UUID,
            rx: None,
            tx: None,
        }
    }

    /// Profile name, for logs and display.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary service UUID.
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// Write characteristic UUID, if the profile has one.
    pub fn rx(&self) -> Option<Uuid> {
        self.rx
    }

    /// Notify characteristic UUID, if the profile has one.
    pub fn tx(&self) -> Option<Uuid> {
        self.tx
    }

    /// Characteristics that must resolve before the session is ready,
    /// in resolution order.
    pub fn required_characteristics(&self) -> Vec<(Uuid, CharacteristicRole)> {
        let mut required = Vec::with_capacity(2);
        if let Some(tx) = self.tx {
            required.push((tx, CharacteristicRole::Notify));
        }
        if let Some(rx) = self.rx {
            required.push((rx, CharacteristicRole::Write));
        }
        required
    }

    /// Default peripheral filter: anything advertising the primary service.
    pub fn default_filter(&self) -> PeripheralFilter {
        PeripheralFilter::Service(self.service)
    }
}

impl Default for ServiceProfile {
    fn default() -> Self {
        Self::uart()
    }
}

impl std::fmt::Display for ServiceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.service)
    }
}
