//! Session lifecycle states.

/// Where a session is in its connect/ready/disconnect lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No peripheral; the only state that accepts a connect.
    #[default]
    Disconnected,
    /// Waiting for the platform to pick a peripheral.
    Requesting,
    /// Opening the GATT connection.
    ConnectingGatt,
    /// Resolving the service and its characteristics.
    DiscoveringServices,
    /// Enabling notifications.
    SubscribingNotify,
    /// Connected; sends are accepted.
    Ready,
    /// Teardown requested, waiting for the link to close.
    Disconnecting,
}

impl SessionState {
    /// Check if the session can send.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a connect pipeline is running.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::Requesting
                | Self::ConnectingGatt
                | Self::DiscoveringServices
                | Self::SubscribingNotify
        )
    }

    /// Check if anything is active (every state but `Disconnected`).
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Requesting => write!(f, "Requesting"),
            Self::ConnectingGatt => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::SubscribingNotify => write!(f, "Subscribing"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}
