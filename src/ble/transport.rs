//! Transport abstraction over platform BLE primitives.
//!
//! The [`Transport`] trait is the only boundary between a session and the
//! Bluetooth stack. Each call may suspend; inbound traffic and link loss are
//! delivered as [`TransportEvent`]s through an [`EventSink`] handed to the
//! transport when subscribing.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Constraint applied when asking the platform for a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PeripheralFilter {
    /// Accept any peripheral.
    #[default]
    Any,
    /// Exact advertised local name.
    Name(String),
    /// Advertised local name prefix.
    NamePrefix(String),
    /// Advertised primary service.
    Service(Uuid),
}

impl PeripheralFilter {
    /// Check a peripheral's advertisement against this filter.
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        match self {
            Self::Any => true,
            Self::Name(expected) => name == Some(expected.as_str()),
            Self::NamePrefix(prefix) => name.map(|n| n.starts_with(prefix.as_str())).unwrap_or(false),
            Self::Service(uuid) => services.contains(uuid),
        }
    }

    /// Service UUID to hand to the platform scanner, if any.
    pub fn service(&self) -> Option<Uuid> {
        match self {
            Self::Service(uuid) => Some(*uuid),
            _ => None,
        }
    }
}

/// A peripheral picked by the user or the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    id: String,
    name: Option<String>,
}

impl PeripheralHandle {
    /// Name shown for peripherals that do not advertise one.
    pub const UNNAMED: &'static str = "Unnamed device";

    /// Create a handle from a platform identifier and advertised name.
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Platform identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Advertised name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Human-readable name for display.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(Self::UNNAMED)
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.display_name(), self.id)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one GATT connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// An open GATT connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peripheral: PeripheralHandle,
}

impl ConnectionHandle {
    /// Create a handle for a freshly opened connection.
    pub fn new(peripheral: PeripheralHandle) -> Self {
        Self {
            id: ConnectionId::next(),
            peripheral,
        }
    }

    /// Connection identifier carried by every event of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connected peripheral.
    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }
}

/// A primary service resolved on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// Owning connection.
    pub connection: ConnectionId,
    /// Service UUID.
    pub uuid: Uuid,
}

/// What the session uses a characteristic for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CharacteristicRole {
    /// Host writes (RX on the peripheral side).
    Write,
    /// Peripheral notifies (TX on the peripheral side).
    Notify,
    /// Read on demand.
    Read,
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => write!(f, "write"),
            Self::Notify => write!(f, "notify"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// A characteristic resolved inside a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Owning connection.
    pub connection: ConnectionId,
    /// Owning service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Role it was resolved for.
    pub role: CharacteristicRole,
}

/// Event pushed by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A notification arrived on a subscribed characteristic.
    Notification {
        /// Connection the notification arrived on.
        connection: ConnectionId,
        /// Characteristic that notified.
        characteristic: Uuid,
        /// Raw payload.
        data: Bytes,
    },
    /// The link was torn down, by either side.
    Disconnected {
        /// Connection that closed.
        connection: ConnectionId,
    },
}

impl TransportEvent {
    /// Connection the event belongs to.
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Notification { connection, .. } | Self::Disconnected { connection } => {
                *connection
            }
        }
    }
}

/// Receiver side of transport events.
///
/// Cloning is cheap; every clone feeds the same consumer. Events are handled
/// synchronously in `emit`, so the order of `emit` calls is the order the
/// consumer observes.
#[derive(Clone)]
pub struct EventSink {
    handler: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventSink {
    /// Wrap a handler.
    pub fn new(handler: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    /// Deliver an event.
    pub fn emit(&self, event: TransportEvent) {
        (self.handler)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Asynchronous BLE primitives a session is driven through.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the platform (or user) for a peripheral matching `filter`.
    ///
    /// # Errors
    ///
    /// [`Error::SelectionCancelled`](crate::Error::SelectionCancelled) when the
    /// chooser is dismissed, [`Error::SelectionError`](crate::Error::SelectionError)
    /// otherwise.
    async fn request_peripheral(&self, filter: &PeripheralFilter) -> Result<PeripheralHandle>;

    /// Open a GATT connection.
    async fn connect_gatt(&self, peripheral: &PeripheralHandle) -> Result<ConnectionHandle>;

    /// Resolve a primary service on an open connection.
    async fn resolve_service(&self, connection: &ConnectionHandle, uuid: Uuid)
        -> Result<ServiceRef>;

    /// Resolve a characteristic within a service.
    async fn resolve_characteristic(
        &self,
        service: &ServiceRef,
        uuid: Uuid,
        role: CharacteristicRole,
    ) -> Result<CharacteristicHandle>;

    /// Enable notifications; payloads are delivered to `sink`.
    async fn subscribe(&self, characteristic: &CharacteristicHandle, sink: EventSink)
        -> Result<()>;

    /// Write a payload to a characteristic.
    async fn write(&self, characteristic: &CharacteristicHandle, data: &[u8]) -> Result<()>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>>;

    /// Register the sink told about link loss.
    ///
    /// The sink receives exactly one [`TransportEvent::Disconnected`] for the
    /// connection, immediately if the link is already gone.
    fn on_disconnected(&self, connection: &ConnectionHandle, sink: EventSink);

    /// Close a connection. Closing an already closed connection is not an error.
    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<()>;
}
