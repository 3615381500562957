//! Error types for the ble-uart-session crate.

use thiserror::Error;

use crate::session::SessionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The device chooser was dismissed without picking a peripheral.
    #[error("Peripheral selection cancelled")]
    SelectionCancelled,

    /// The platform failed while looking for a peripheral.
    #[error("Peripheral selection failed: {reason}")]
    SelectionError {
        /// Description of what went wrong.
        reason: String,
    },

    /// Failed to open a GATT connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Enabling notifications on the notify characteristic failed.
    #[error("Subscription failed: {reason}")]
    SubscriptionFailed {
        /// Description of why the subscription failed.
        reason: String,
    },

    /// A write to the peripheral failed.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// Description of why the write failed.
        reason: String,
    },

    /// A read from the peripheral failed.
    #[error("Read failed: {reason}")]
    ReadFailed {
        /// Description of why the read failed.
        reason: String,
    },

    /// The link to the peripheral was lost.
    #[error("Peripheral disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// Operation requires a ready session.
    #[error("Session not ready")]
    NotReady,

    /// A connect was requested while another session is in progress.
    #[error("Session already active ({state})")]
    SessionAlreadyActive {
        /// The state the session was in when the request was rejected.
        state: SessionState,
    },

    /// The connection attempt was cancelled by a user disconnect.
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// The requested operation is not supported by the bound profile.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl Error {
    /// Whether this error ends a connection attempt.
    ///
    /// Errors raised while the connect pipeline runs unwind the session to
    /// `Disconnected`; write and read errors leave a ready session alone.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::WriteFailed { .. }
                | Self::ReadFailed { .. }
                | Self::NotReady
                | Self::NotSupported { .. }
                | Self::SessionAlreadyActive { .. }
                | Self::InvalidParameter { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
