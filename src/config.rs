//! Session and transport configuration.

use std::time::Duration;

use crate::ble::profile::ServiceProfile;
use crate::ble::transport::PeripheralFilter;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Service profile the session binds to.
    pub profile: ServiceProfile,
    /// Peripheral filter; defaults to the profile's service.
    pub filter: Option<PeripheralFilter>,
    /// Decode notification payloads as UTF-8 text.
    pub text_frames: bool,
    /// Maximum number of log entries kept, unbounded when `None`.
    pub log_capacity: Option<usize>,
    /// How long a user disconnect waits for the link-down event.
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            profile: ServiceProfile::uart(),
            filter: None,
            text_frames: true,
            log_capacity: None,
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Create a new configuration for `profile`.
    pub fn new(profile: ServiceProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    /// Set the peripheral filter
    pub fn with_filter(mut self, filter: PeripheralFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Enable or disable text decoding of frames
    pub fn with_text_frames(mut self, enabled: bool) -> Self {
        self.text_frames = enabled;
        self
    }

    /// Bound the session log
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = Some(capacity);
        self
    }

    /// Set the disconnect timeout
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Filter actually used for peripheral selection.
    pub fn effective_filter(&self) -> PeripheralFilter {
        self.filter
            .clone()
            .unwrap_or_else(|| self.profile.default_filter())
    }
}

/// Configuration for the btleplug transport.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// How long to scan before presenting candidates.
    pub scan_duration: Duration,
    /// Maximum time to wait for a GATT connection.
    pub connect_timeout: Duration,
    /// Largest payload accepted by `write`.
    pub max_write_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_write_len: 512, // ATT attribute value limit
        }
    }
}

impl TransportConfig {
    /// Set scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set maximum write length
    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }
}
