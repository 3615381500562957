//! BLE communication module.
//!
//! This module provides the transport boundary a session is driven through,
//! the GATT service profiles it binds to, and two transports: one over
//! btleplug and one scripted in memory.

pub mod characteristics;
pub mod platform;
pub mod profile;
pub mod scripted;
pub mod transport;
pub mod uuids;

pub use characteristics::{CharacteristicChannel, CharacteristicHandles};
pub use platform::{BtleplugTransport, PeripheralCandidate, PeripheralChooser, StrongestSignal};
pub use profile::ServiceProfile;
pub use scripted::{ScriptedTransport, Step};
pub use transport::{
    CharacteristicHandle, CharacteristicRole, ConnectionHandle, ConnectionId, EventSink,
    PeripheralFilter, PeripheralHandle, ServiceRef, Transport, TransportEvent,
};
pub use uuids::*;
