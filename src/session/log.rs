//! Session log data structures.
//!
//! Contains the ordered record of frames, sent payloads and lifecycle markers
//! a presentation layer renders.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use super::frame::Frame;
use crate::utils::printable;

/// Why a session ended up disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// The user asked for it.
    UserRequested,
    /// The peripheral or adapter dropped the link.
    LinkLost,
    /// A connection attempt was abandoned before becoming ready.
    Cancelled,
    /// Teardown after a failed connection step.
    Failed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "by request"),
            Self::LinkLost => write!(f, "link lost"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "after failure"),
        }
    }
}

/// Lifecycle milestone recorded between frames.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Marker {
    /// A connect was started.
    Requesting,
    /// A peripheral was picked.
    PeripheralSelected {
        /// Display name of the peripheral.
        name: String,
    },
    /// The GATT connection opened.
    GattConnected,
    /// Notifications are enabled and sends are accepted.
    Ready,
    /// The session returned to `Disconnected`.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// A connection step failed.
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requesting => write!(f, "Requesting BLE device..."),
            Self::PeripheralSelected { name } => write!(f, "Device found: {}", name),
            Self::GattConnected => write!(f, "Connected to GATT server"),
            Self::Ready => write!(f, "Notifications enabled"),
            Self::Disconnected { reason } => write!(f, "Disconnected ({})", reason),
            Self::Error { message } => write!(f, "Error: {}", message),
        }
    }
}

/// What a log entry holds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogEntryKind {
    /// A received notification.
    Frame(Frame),
    /// A payload written to the peripheral.
    Sent(Bytes),
    /// A lifecycle milestone.
    Marker(Marker),
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogEntry {
    /// When the entry was appended.
    pub at: DateTime<Utc>,
    /// The entry itself.
    pub kind: LogEntryKind,
}

impl LogEntry {
    /// The frame, if this entry is one.
    pub fn as_frame(&self) -> Option<&Frame> {
        match &self.kind {
            LogEntryKind::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    /// The marker, if this entry is one.
    pub fn as_marker(&self) -> Option<&Marker> {
        match &self.kind {
            LogEntryKind::Marker(marker) => Some(marker),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            LogEntryKind::Frame(frame) => write!(f, "Received: {}", frame),
            LogEntryKind::Sent(data) => write!(f, "Sent: {}", printable(data)),
            LogEntryKind::Marker(marker) => write!(f, "{}", marker),
        }
    }
}

/// Append-only record of a session, in arrival order.
///
/// With a capacity set, the oldest entries are evicted once it is reached;
/// the number evicted is kept in [`evicted`](Self::evicted).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionLog {
    entries: VecDeque<LogEntry>,
    capacity: Option<usize>,
    evicted: u64,
}

impl SessionLog {
    /// Create an unbounded log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log keeping at most `capacity` entries. A capacity of zero
    /// is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: Some(capacity),
            evicted: 0,
        }
    }

    /// Append a received frame.
    pub fn push_frame(&mut self, frame: Frame) {
        let at = frame.received_at();
        self.push(LogEntry {
            at,
            kind: LogEntryKind::Frame(frame),
        });
    }

    /// Append a sent payload.
    pub fn push_sent(&mut self, data: Bytes) {
        self.push(LogEntry {
            at: Utc::now(),
            kind: LogEntryKind::Sent(data),
        });
    }

    /// Append a lifecycle marker.
    pub fn push_marker(&mut self, marker: Marker) {
        self.push(LogEntry {
            at: Utc::now(),
            kind: LogEntryKind::Marker(marker),
        });
    }

    fn push(&mut self, entry: LogEntry) {
        if let Some(capacity) = self.capacity {
            while self.entries.len() >= capacity {
                self.entries.pop_front();
                self.evicted += 1;
            }
        }
        self.entries.push_back(entry);
    }

    /// Iterate over entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Iterate over received frames only.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().filter_map(LogEntry::as_frame)
    }

    /// Iterate over markers only.
    pub fn markers(&self) -> impl Iterator<Item = &Marker> {
        self.entries.iter().filter_map(LogEntry::as_marker)
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
    }

    /// Copy of all entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retention limit, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of entries evicted to honour the capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.evicted = 0;
    }

    /// Render the log one entry per line.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(&entry.to_string());
            text.push('\n');
        }
        text
    }
}
